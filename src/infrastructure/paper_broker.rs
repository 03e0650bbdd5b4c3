//! Paper broker: simulated fills against live prices
//!
//! Fill rules:
//! - a limit buy fills at its limit when `limit >= market - tolerance`, a limit
//!   sell when `limit <= market + tolerance`; otherwise the order rests as open
//!   until cancelled;
//! - a fill-or-kill order fills at the market price when the market is inside
//!   its bound, otherwise it is killed.
//!
//! Buys need the virtual balance to cover value plus fee.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::domain::entities::order::{OrderRequest, OrderSide, OrderSnapshot, OrderStatus, OrderType};
use crate::domain::repositories::broker_adapter::{
    BookLevel, BookSide, BrokerAdapter, BrokerError, BrokerResult,
};
use crate::domain::services::fees::FeeModel;
use crate::domain::value_objects::price::round_to_tick;
use crate::infrastructure::clob_client::ClobClient;

/// Where the paper broker reads market prices from
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price(&self, token_id: &str) -> BrokerResult<f64>;
}

#[async_trait]
impl PriceSource for ClobClient {
    async fn price(&self, token_id: &str) -> BrokerResult<f64> {
        ClobClient::price(self, token_id).await
    }
}

/// Prices set by hand, for replays and tests
#[derive(Debug, Default)]
pub struct ScriptedPrices {
    prices: Mutex<HashMap<String, f64>>,
}

impl ScriptedPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token_id: &str, price: f64) {
        if let Ok(mut prices) = self.prices.lock() {
            prices.insert(token_id.to_string(), price);
        }
    }

    pub fn clear(&self, token_id: &str) {
        if let Ok(mut prices) = self.prices.lock() {
            prices.remove(token_id);
        }
    }
}

#[async_trait]
impl PriceSource for ScriptedPrices {
    async fn price(&self, token_id: &str) -> BrokerResult<f64> {
        self.prices
            .lock()
            .map_err(|_| BrokerError::Network("price lock poisoned".to_string()))?
            .get(token_id)
            .copied()
            .ok_or_else(|| BrokerError::Network(format!("no price for {}", token_id)))
    }
}

#[derive(Debug, Clone)]
pub struct PaperConfig {
    pub starting_balance: f64,
    pub fill_tolerance: f64,
    pub tick: f64,
    pub fees: FeeModel,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_balance: 1000.0,
            fill_tolerance: 0.02,
            tick: 0.01,
            fees: FeeModel::default(),
        }
    }
}

/// Settled orders kept queryable; older ones are forgotten first, live ones never
const MAX_TRACKED_ORDERS: usize = 512;

#[derive(Debug, Clone)]
struct PaperOrder {
    seq: u64,
    request: OrderRequest,
    status: OrderStatus,
    size_matched: f64,
    fill_price: Option<f64>,
}

#[derive(Debug)]
struct PaperState {
    balance: f64,
    tokens: HashMap<String, f64>,
    orders: HashMap<String, PaperOrder>,
    next_id: u64,
}

pub struct PaperBroker {
    prices: Arc<dyn PriceSource>,
    config: PaperConfig,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(prices: Arc<dyn PriceSource>, config: PaperConfig) -> Self {
        info!(
            "Paper broker started with ${:.2} virtual balance",
            config.starting_balance
        );
        Self {
            prices,
            state: Mutex::new(PaperState {
                balance: config.starting_balance,
                tokens: HashMap::new(),
                orders: HashMap::new(),
                next_id: 1,
            }),
            config,
        }
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Network("paper state lock poisoned".to_string()))
    }

    fn prune(state: &mut PaperState) {
        let excess = state.orders.len().saturating_sub(MAX_TRACKED_ORDERS);
        if excess == 0 {
            return;
        }
        let mut settled: Vec<(u64, String)> = state
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_terminal())
            .map(|(id, o)| (o.seq, id.clone()))
            .collect();
        settled.sort_unstable();
        for (_, id) in settled.into_iter().take(excess) {
            state.orders.remove(&id);
        }
        debug!("[PAPER] pruned settled orders, {} tracked", state.orders.len());
    }

    /// Execution price for `order` against `market`, or None if it does not fill now
    fn match_price(&self, order: &OrderRequest, market: f64) -> Option<f64> {
        let limit = order.price.value();
        let tol = self.config.fill_tolerance;
        match (order.order_type, order.side) {
            (OrderType::Limit, OrderSide::Buy) if limit >= market - tol => Some(limit),
            (OrderType::Limit, OrderSide::Sell) if limit <= market + tol => Some(limit),
            (OrderType::Fok, OrderSide::Buy) if market <= limit => Some(market),
            (OrderType::Fok, OrderSide::Sell) if market >= limit => Some(market),
            _ => None,
        }
    }

    fn settle(state: &mut PaperState, fees: &FeeModel, order: &OrderRequest, price: f64) -> BrokerResult<()> {
        let value = price * order.size;
        match order.side {
            OrderSide::Buy => {
                let required = value + fees.fee(value);
                if state.balance < required {
                    return Err(BrokerError::InsufficientBalance {
                        required,
                        available: state.balance,
                    });
                }
                state.balance -= required;
                *state.tokens.entry(order.token_id.clone()).or_insert(0.0) += order.size;
            }
            OrderSide::Sell => {
                let held = state.tokens.get(&order.token_id).copied().unwrap_or(0.0);
                if held + 1e-9 < order.size {
                    return Err(BrokerError::Rejected(format!(
                        "not enough shares: {} held, {} offered",
                        held, order.size
                    )));
                }
                let remaining = held - order.size;
                if remaining <= 1e-9 {
                    state.tokens.remove(&order.token_id);
                } else {
                    state.tokens.insert(order.token_id.clone(), remaining);
                }
                state.balance += value - fees.fee(value);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    async fn get_price(&self, token_id: &str) -> BrokerResult<f64> {
        self.prices.price(token_id).await
    }

    async fn get_order_book_levels(
        &self,
        token_id: &str,
        side: BookSide,
        depth: usize,
    ) -> BrokerResult<Vec<BookLevel>> {
        let market = self.prices.price(token_id).await?;
        let tick = self.config.tick;
        Ok((0..depth)
            .map(|i| {
                let step = tick * i as f64;
                let price = match side {
                    BookSide::Asks => market + step,
                    BookSide::Bids => market - step,
                };
                round_to_tick(price, tick)
            })
            .filter(|p| *p > 0.0 && *p < 1.0)
            .map(|price| BookLevel {
                price,
                size: 1_000.0,
            })
            .collect())
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String> {
        let market = self.prices.price(&order.token_id).await?;
        let fill_price = self.match_price(order, market);

        let mut state = self.lock()?;
        let seq = state.next_id;
        let order_id = format!("paper-{}", seq);
        state.next_id += 1;

        let (status, size_matched) = match fill_price {
            Some(price) => {
                Self::settle(&mut state, &self.config.fees, order, price)?;
                info!(
                    "[PAPER] {} {} {} @ {:.4} filled (market {:.4}) as {}",
                    order.side, order.size, order.token_id, price, market, order_id
                );
                (OrderStatus::Filled, order.size)
            }
            None if order.order_type == OrderType::Fok => {
                info!(
                    "[PAPER] {} FOK {} @ {:.4} killed (market {:.4})",
                    order.side, order.token_id, order.price, market
                );
                (OrderStatus::Cancelled, 0.0)
            }
            None => {
                debug!(
                    "[PAPER] {} {} @ {:.4} resting (market {:.4})",
                    order.side, order.token_id, order.price, market
                );
                (OrderStatus::Open, 0.0)
            }
        };

        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                seq,
                request: order.clone(),
                status,
                size_matched,
                fill_price,
            },
        );
        Self::prune(&mut state);
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        let state = self.lock()?;
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))?;
        Ok(OrderSnapshot {
            order_id: order_id.to_string(),
            status: order.status,
            size_matched: order.size_matched,
            price: order.fill_price.unwrap_or(order.request.price.value()),
        })
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        let mut state = self.lock()?;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))?;
        if order.status.is_live() {
            order.status = OrderStatus::Cancelled;
            debug!("[PAPER] cancelled {}", order_id);
        }
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BrokerResult<()> {
        let mut state = self.lock()?;
        let mut cancelled = 0;
        for order in state.orders.values_mut().filter(|o| o.status.is_live()) {
            order.status = OrderStatus::Cancelled;
            cancelled += 1;
        }
        info!("[PAPER] cancel-all removed {} orders", cancelled);
        Ok(())
    }

    async fn get_balance(&self) -> BrokerResult<f64> {
        Ok(self.lock()?.balance)
    }

    async fn get_token_balance(&self, token_id: &str) -> BrokerResult<Option<f64>> {
        Ok(Some(self.lock()?.tokens.get(token_id).copied().unwrap_or(0.0)))
    }
}
