//! PositionLedger - running average price, quantity, fees and realized P&L
//!
//! Every mutation takes the lock, applies one fill and releases it before
//! returning. No lock is held across a broker round trip, so status reads never
//! wait on a slow exchange.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::domain::services::fees::FeeModel;
use crate::domain::services::trade_execution_error::TradeExecutionError;
use crate::domain::value_objects::pnl::PnL;

/// Quantity and average entry price held in one token
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Holding {
    pub quantity: f64,
    pub avg_price: f64,
}

/// Result of booking a buy fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuyBooking {
    pub value: f64,
    pub fee: f64,
    pub holding: Holding,
}

/// Result of booking a sell fill
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SellSettlement {
    pub avg_entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub gross_pnl: f64,
    pub entry_fee: f64,
    pub exit_fee: f64,
    pub net_pnl: PnL,
    /// Cash credited: sell value minus the exit fee
    pub proceeds: f64,
}

/// Point-in-time copy of the ledger totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub balance: f64,
    pub total_pnl: f64,
    pub trades_count: u32,
    pub wins: u32,
    pub losses: u32,
}

#[derive(Debug)]
struct LedgerState {
    balance: f64,
    holdings: HashMap<String, Holding>,
    total_pnl: f64,
    trades_count: u32,
    wins: u32,
    losses: u32,
}

pub struct PositionLedger {
    fees: FeeModel,
    state: Mutex<LedgerState>,
}

impl PositionLedger {
    pub fn new(fees: FeeModel, starting_balance: f64) -> Self {
        Self {
            fees,
            state: Mutex::new(LedgerState {
                balance: starting_balance,
                holdings: HashMap::new(),
                total_pnl: 0.0,
                trades_count: 0,
                wins: 0,
                losses: 0,
            }),
        }
    }

    /// Resume from persisted totals
    pub fn restore(fees: FeeModel, snapshot: &LedgerSnapshot) -> Self {
        Self {
            fees,
            state: Mutex::new(LedgerState {
                balance: snapshot.balance,
                holdings: HashMap::new(),
                total_pnl: snapshot.total_pnl,
                trades_count: snapshot.trades_count,
                wins: snapshot.wins,
                losses: snapshot.losses,
            }),
        }
    }

    pub fn fees(&self) -> FeeModel {
        self.fees
    }

    fn lock(&self) -> Result<MutexGuard<'_, LedgerState>, TradeExecutionError> {
        self.state.lock().map_err(|_| TradeExecutionError::Ledger {
            reason: "ledger lock poisoned".to_string(),
        })
    }

    /// Reject a buy locally when `available` does not cover value plus fee
    pub fn check_affordable(
        &self,
        available: f64,
        price: f64,
        size: f64,
    ) -> Result<f64, TradeExecutionError> {
        let required = self.fees.buy_cost(price, size);
        if available < required {
            return Err(TradeExecutionError::InsufficientBalance {
                required,
                available,
            });
        }
        Ok(required)
    }

    /// Book a confirmed buy fill
    pub fn record_buy(
        &self,
        token_id: &str,
        price: f64,
        size: f64,
    ) -> Result<BuyBooking, TradeExecutionError> {
        if size <= 0.0 || !price.is_finite() {
            return Err(TradeExecutionError::Ledger {
                reason: format!("invalid buy fill {} @ {}", size, price),
            });
        }

        let value = price * size;
        let fee = self.fees.fee(value);

        let mut state = self.lock()?;
        let holding = state
            .holdings
            .entry(token_id.to_string())
            .or_insert(Holding {
                quantity: 0.0,
                avg_price: 0.0,
            });
        let new_quantity = holding.quantity + size;
        holding.avg_price = (holding.avg_price * holding.quantity + price * size) / new_quantity;
        holding.quantity = new_quantity;
        let holding = *holding;

        state.balance -= value + fee;
        state.trades_count += 1;

        debug!(
            "Ledger buy {} {} @ {:.4}: avg {:.4}, qty {:.2}, fee {:.4}",
            token_id, size, price, holding.avg_price, holding.quantity, fee
        );

        Ok(BuyBooking {
            value,
            fee,
            holding,
        })
    }

    /// Book a confirmed sell fill against the running average entry price
    pub fn record_sell(
        &self,
        token_id: &str,
        price: f64,
        size: f64,
    ) -> Result<SellSettlement, TradeExecutionError> {
        let mut state = self.lock()?;
        let holding = state.holdings.get(token_id).copied().ok_or_else(|| {
            TradeExecutionError::Ledger {
                reason: format!("no holding in {}", token_id),
            }
        })?;

        // tolerate float residue from repeated averaging
        if size <= 0.0 || size > holding.quantity + 1e-9 {
            return Err(TradeExecutionError::Ledger {
                reason: format!(
                    "cannot sell {} of {} held in {}",
                    size, holding.quantity, token_id
                ),
            });
        }

        let avg = holding.avg_price;
        let sell_value = price * size;
        let entry_fee = self.fees.fee(avg * size);
        let exit_fee = self.fees.fee(sell_value);
        let gross_pnl = (price - avg) * size;
        let net_pnl = PnL::round_trip(avg, price, size, entry_fee, exit_fee).map_err(|e| {
            TradeExecutionError::Ledger {
                reason: e.to_string(),
            }
        })?;
        let proceeds = sell_value - exit_fee;

        let remaining = holding.quantity - size;
        if remaining <= 1e-9 {
            state.holdings.remove(token_id);
        } else if let Some(h) = state.holdings.get_mut(token_id) {
            h.quantity = remaining;
        }

        state.total_pnl += net_pnl.value();
        state.balance += proceeds;
        state.trades_count += 1;
        if net_pnl.is_profit() {
            state.wins += 1;
        } else {
            state.losses += 1;
        }

        info!(
            "Ledger sell {} {} @ {:.4} (avg {:.4}): net {} after fees {:.4}/{:.4}",
            token_id, size, price, avg, net_pnl, entry_fee, exit_fee
        );

        Ok(SellSettlement {
            avg_entry_price: avg,
            exit_price: price,
            size,
            gross_pnl,
            entry_fee,
            exit_fee,
            net_pnl,
            proceeds,
        })
    }

    /// Drop a holding that will not be sold (dust or on-chain settlement)
    pub fn write_off(&self, token_id: &str) -> Result<Option<Holding>, TradeExecutionError> {
        Ok(self.lock()?.holdings.remove(token_id))
    }

    pub fn holding(&self, token_id: &str) -> Option<Holding> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.holdings.get(token_id).copied())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        match self.state.lock() {
            Ok(state) => LedgerSnapshot {
                balance: state.balance,
                total_pnl: state.total_pnl,
                trades_count: state.trades_count,
                wins: state.wins,
                losses: state.losses,
            },
            Err(poisoned) => {
                let state = poisoned.into_inner();
                LedgerSnapshot {
                    balance: state.balance,
                    total_pnl: state.total_pnl,
                    trades_count: state.trades_count,
                    wins: state.wins,
                    losses: state.losses,
                }
            }
        }
    }
}
