//! OrderFillEngine - retry-ladder order placement under an expiry deadline
//!
//! One invocation walks a fixed ladder of `max_attempts` submissions:
//!
//! - attempts `1..N-1` post a limit order at successively deeper levels of the
//!   opposing side of the book (a fixed increment from the reference price
//!   when the book is unavailable);
//! - attempt `N` posts a fill-or-kill order at the price ceiling (buys) or
//!   floor (sells).
//!
//! Each submission is followed by a settle delay and a status query. Order
//! status decides; the token balance delta is only logged as corroboration.
//! Unfilled orders are cancelled and the cancel is verified before the ladder
//! moves on. Only the attempt that reports success sets the fill; partial
//! matches from earlier attempts are not summed. A partial match is booked
//! once its unfilled remainder has been cancelled.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::entities::order::{OrderRequest, OrderSide, OrderSnapshot, OrderStatus, OrderType};
use crate::domain::repositories::broker_adapter::{BookSide, BrokerAdapter, BrokerError};
use crate::domain::repositories::clock::Clock;
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::services::trade_execution_error::TradeExecutionError;
use crate::domain::value_objects::price::round_to_tick;
use crate::task_runner::StopSignal;

/// Fill engine configuration
#[derive(Debug, Clone)]
pub struct OrderFillConfig {
    /// Ladder length N; the last attempt is the fill-or-kill
    pub max_attempts: u32,
    /// Wait between a submission and its status check
    pub settle_delay: Duration,
    /// Step from the reference price per attempt when the book is unavailable
    pub price_increment: f64,
    /// Aggressive bound for fill-or-kill buys
    pub buy_price_ceiling: f64,
    /// Aggressive bound for fill-or-kill sells
    pub sell_price_floor: f64,
    pub min_tick: f64,
    /// Balance moves smaller than this are noise for corroboration
    pub min_order_size: f64,
}

impl Default for OrderFillConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            settle_delay: Duration::from_millis(1000),
            price_increment: 0.01,
            buy_price_ceiling: 0.99,
            sell_price_floor: 0.01,
            min_tick: 0.01,
            min_order_size: 0.1,
        }
    }
}

/// What to fill
#[derive(Debug, Clone, PartialEq)]
pub struct FillRequest {
    pub token_id: String,
    pub side: OrderSide,
    pub reference_price: f64,
    pub size: f64,
    /// Order left by an earlier invocation whose outcome is still unknown
    pub prior_order_id: Option<String>,
    /// Skip the book levels and submit the fill-or-kill straight away
    pub aggressive: bool,
}

impl FillRequest {
    pub fn new(token_id: impl Into<String>, side: OrderSide, reference_price: f64, size: f64) -> Self {
        Self {
            token_id: token_id.into(),
            side,
            reference_price,
            size,
            prior_order_id: None,
            aggressive: false,
        }
    }

    pub fn resuming(mut self, order_id: Option<String>) -> Self {
        self.prior_order_id = order_id;
        self
    }

    pub fn aggressive(mut self) -> Self {
        self.aggressive = true;
        self
    }
}

/// Time-to-close check evaluated before every attempt
#[derive(Clone)]
pub struct DeadlineGuard {
    close_time: DateTime<Utc>,
    min_seconds_remaining: f64,
    clock: Arc<dyn Clock>,
}

impl DeadlineGuard {
    pub fn new(close_time: DateTime<Utc>, min_seconds_remaining: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            close_time,
            min_seconds_remaining,
            clock,
        }
    }

    pub fn seconds_remaining(&self) -> f64 {
        (self.close_time - self.clock.now()).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_violated(&self) -> bool {
        self.seconds_remaining() <= self.min_seconds_remaining
    }
}

impl std::fmt::Debug for DeadlineGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineGuard")
            .field("close_time", &self.close_time)
            .field("min_seconds_remaining", &self.min_seconds_remaining)
            .finish()
    }
}

/// Terminal outcome of one ladder invocation
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Filled {
        order_id: String,
        size: f64,
        price: f64,
        attempt: u32,
    },
    Failed {
        reason: TradeExecutionError,
        /// Order whose cancel could not be verified; its fate is still unknown
        unresolved_order: Option<String>,
    },
    AbortedExpiry,
}

impl FillOutcome {
    fn failed(reason: TradeExecutionError) -> Self {
        FillOutcome::Failed {
            reason,
            unresolved_order: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, FillOutcome::Filled { .. })
    }
}

/// Result of a verified cancel
#[derive(Debug, Clone, PartialEq)]
enum CancelCheck {
    Cancelled,
    /// The order filled before the cancel landed
    Filled(OrderSnapshot),
    Unverified,
}

/// Removes the (token, side) key when the ladder finishes
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<(String, OrderSide)>>,
    key: (String, OrderSide),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.in_flight.lock() {
            keys.remove(&self.key);
        }
    }
}

pub struct OrderFillEngine {
    broker: Arc<dyn BrokerAdapter>,
    ledger: Arc<PositionLedger>,
    config: OrderFillConfig,
    in_flight: Mutex<HashSet<(String, OrderSide)>>,
}

impl OrderFillEngine {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        ledger: Arc<PositionLedger>,
        config: OrderFillConfig,
    ) -> Self {
        Self {
            broker,
            ledger,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &OrderFillConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn BrokerAdapter> {
        &self.broker
    }

    fn claim(&self, token_id: &str, side: OrderSide) -> Option<InFlightGuard<'_>> {
        let key = (token_id.to_string(), side);
        let mut keys = self.in_flight.lock().ok()?;
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            key,
        })
    }

    /// Run the ladder until a fill, a failure, expiry or a stop
    pub async fn attempt_fill(
        &self,
        request: &FillRequest,
        guard: &DeadlineGuard,
        stop: &StopSignal,
    ) -> FillOutcome {
        let _claim = match self.claim(&request.token_id, request.side) {
            Some(claim) => claim,
            None => {
                warn!(
                    "Rejecting duplicate {} submission for {}",
                    request.side, request.token_id
                );
                return FillOutcome::Failed {
                    reason: TradeExecutionError::DuplicateSubmission {
                        token_id: request.token_id.clone(),
                        side: request.side.to_string(),
                    },
                    unresolved_order: request.prior_order_id.clone(),
                };
            }
        };

        if let Some(prior) = &request.prior_order_id {
            if let Some(outcome) = self.resolve_prior_order(prior, request, stop).await {
                return outcome;
            }
        }

        let available = if request.side == OrderSide::Buy {
            match self.interruptible(stop, self.broker.get_balance()).await {
                None => return FillOutcome::failed(TradeExecutionError::Stopped),
                Some(Ok(balance)) => Some(balance),
                Some(Err(e)) => {
                    warn!("Balance unavailable before {} ladder: {}", request.side, e);
                    None
                }
            }
        } else {
            None
        };

        let baseline_tokens = match self
            .interruptible(stop, self.broker.get_token_balance(&request.token_id))
            .await
        {
            None => return FillOutcome::failed(TradeExecutionError::Stopped),
            Some(result) => result.ok().flatten(),
        };

        let last = self.config.max_attempts.max(1);
        let first = if request.aggressive { last } else { 1 };
        let mut last_error: Option<TradeExecutionError> = None;

        for attempt in first..=last {
            if stop.is_stopped() {
                return FillOutcome::failed(TradeExecutionError::Stopped);
            }
            if guard.is_violated() {
                info!(
                    "Deadline reached before attempt {}/{} ({:.1}s left), aborting {} ladder for {}",
                    attempt,
                    last,
                    guard.seconds_remaining(),
                    request.side,
                    request.token_id
                );
                return FillOutcome::AbortedExpiry;
            }

            let (price, order_type) = if attempt < last {
                match self.ladder_price(request, attempt, stop).await {
                    Some(price) => (price, OrderType::Limit),
                    None => return FillOutcome::failed(TradeExecutionError::Stopped),
                }
            } else {
                (self.aggressive_bound(request.side), OrderType::Fok)
            };

            let order = match OrderRequest::new(
                request.token_id.clone(),
                request.side,
                price,
                request.size,
                order_type,
            ) {
                Ok(order) => order,
                Err(e) => {
                    return FillOutcome::failed(TradeExecutionError::InvalidOrder {
                        reason: e.to_string(),
                    })
                }
            };

            if let Some(available) = available {
                if let Err(e) = self.ledger.check_affordable(available, price, request.size) {
                    warn!("Attempt {}/{} rejected locally: {}", attempt, last, e);
                    return FillOutcome::failed(e);
                }
            }

            info!(
                "Attempt {}/{}: {} {} {} @ {:.2} ({})",
                attempt, last, request.side, order.size, request.token_id, price, order_type
            );

            let order_id = match self.interruptible(stop, self.broker.place_order(&order)).await {
                None => {
                    // placement may have reached the venue without an id coming back
                    self.reconcile_after_stop(None, &order).await;
                    return FillOutcome::failed(TradeExecutionError::Stopped);
                }
                Some(Ok(order_id)) => order_id,
                Some(Err(e)) => {
                    warn!("Attempt {}/{} placement failed: {}", attempt, last, e);
                    match e {
                        BrokerError::InsufficientBalance { .. } | BrokerError::InvalidOrder(_) => {
                            return FillOutcome::failed(e.into());
                        }
                        other => {
                            last_error = Some(other.into());
                            continue;
                        }
                    }
                }
            };

            if !stop.sleep(self.config.settle_delay).await {
                return self.reconcile_after_stop(Some(&order_id), &order).await;
            }

            let snapshot = match self
                .interruptible(stop, self.broker.get_order_status(&order_id))
                .await
            {
                None => return self.reconcile_after_stop(Some(&order_id), &order).await,
                Some(Ok(snapshot)) => Some(snapshot),
                Some(Err(e)) => {
                    warn!("Status query for {} failed: {}", order_id, e);
                    None
                }
            };

            if let Some(snapshot) = snapshot.as_ref().filter(|s| s.is_filled()) {
                let snapshot = self.pull_remainder(snapshot).await;
                return self
                    .confirm_fill(request, &snapshot, &order, attempt, baseline_tokens)
                    .await;
            }

            if attempt == last && order_type == OrderType::Fok {
                let still_live = snapshot
                    .as_ref()
                    .map(|s| s.status.is_live())
                    .unwrap_or(true);
                if !still_live {
                    info!("Fill-or-kill {} was killed", order_id);
                    break;
                }
            }

            match self.cancel_verified(&order_id).await {
                CancelCheck::Cancelled => {
                    debug!("Order {} cancelled, moving down the ladder", order_id);
                }
                CancelCheck::Filled(snapshot) => {
                    return self
                        .confirm_fill(request, &snapshot, &order, attempt, baseline_tokens)
                        .await;
                }
                CancelCheck::Unverified => {
                    return self
                        .resolve_by_balance(request, &order_id, &order, attempt, baseline_tokens)
                        .await;
                }
            }
        }

        FillOutcome::failed(last_error.unwrap_or(TradeExecutionError::LadderExhausted {
            attempts: last - first + 1,
        }))
    }

    /// Cancel an order and verify the cancel, retrying once and then escalating to cancel-all
    pub async fn cancel_and_verify(&self, order_id: &str) -> Result<Option<OrderSnapshot>, TradeExecutionError> {
        match self.cancel_verified(order_id).await {
            CancelCheck::Cancelled => Ok(None),
            CancelCheck::Filled(snapshot) => Ok(Some(snapshot)),
            CancelCheck::Unverified => Err(TradeExecutionError::CancelUnverified {
                order_id: order_id.to_string(),
            }),
        }
    }

    async fn resolve_prior_order(
        &self,
        order_id: &str,
        request: &FillRequest,
        stop: &StopSignal,
    ) -> Option<FillOutcome> {
        let snapshot = match self
            .interruptible(stop, self.broker.get_order_status(order_id))
            .await
        {
            None => {
                return Some(FillOutcome::Failed {
                    reason: TradeExecutionError::Stopped,
                    unresolved_order: Some(order_id.to_string()),
                })
            }
            Some(Ok(snapshot)) => snapshot,
            Some(Err(BrokerError::NotFound(_))) => return None,
            Some(Err(e)) => {
                // unknown status is treated as live until a cancel proves otherwise
                warn!("Prior order {} status unknown: {}", order_id, e);
                OrderSnapshot {
                    order_id: order_id.to_string(),
                    status: OrderStatus::Pending,
                    size_matched: 0.0,
                    price: 0.0,
                }
            }
        };

        if snapshot.is_filled() {
            info!(
                "Prior order {} already filled, not resubmitting",
                order_id
            );
            let snapshot = self.pull_remainder(&snapshot).await;
            return Some(FillOutcome::Filled {
                order_id: order_id.to_string(),
                size: filled_size(&snapshot, request.size),
                price: fill_price(&snapshot, request.reference_price),
                attempt: 0,
            });
        }

        if snapshot.status.is_live() {
            match self.cancel_verified(order_id).await {
                CancelCheck::Cancelled => None,
                CancelCheck::Filled(snapshot) => Some(FillOutcome::Filled {
                    order_id: order_id.to_string(),
                    size: filled_size(&snapshot, request.size),
                    price: fill_price(&snapshot, request.reference_price),
                    attempt: 0,
                }),
                CancelCheck::Unverified => Some(FillOutcome::Failed {
                    reason: TradeExecutionError::CancelUnverified {
                        order_id: order_id.to_string(),
                    },
                    unresolved_order: Some(order_id.to_string()),
                }),
            }
        } else {
            None
        }
    }

    async fn ladder_price(&self, request: &FillRequest, attempt: u32, stop: &StopSignal) -> Option<f64> {
        let depth = (self.config.max_attempts.saturating_sub(1)).max(1) as usize;
        let book_side = BookSide::opposing(request.side);
        let levels = self
            .interruptible(
                stop,
                self.broker
                    .get_order_book_levels(&request.token_id, book_side, depth),
            )
            .await?;

        let index = (attempt - 1) as usize;
        let raw = match levels {
            Ok(levels) if !levels.is_empty() => {
                let level = levels.get(index).or_else(|| levels.last());
                level.map(|l| l.price)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("Book unavailable for {}: {}", request.token_id, e);
                None
            }
        };

        let price = raw.unwrap_or_else(|| {
            let step = self.config.price_increment * attempt as f64;
            match request.side {
                OrderSide::Buy => request.reference_price + step,
                OrderSide::Sell => request.reference_price - step,
            }
        });

        Some(self.clamp_price(price))
    }

    fn aggressive_bound(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => self.clamp_price(self.config.buy_price_ceiling),
            OrderSide::Sell => self.clamp_price(self.config.sell_price_floor),
        }
    }

    fn clamp_price(&self, price: f64) -> f64 {
        round_to_tick(price, self.config.min_tick)
            .clamp(self.config.sell_price_floor, self.config.buy_price_ceiling)
    }

    async fn confirm_fill(
        &self,
        request: &FillRequest,
        snapshot: &OrderSnapshot,
        order: &OrderRequest,
        attempt: u32,
        baseline_tokens: Option<f64>,
    ) -> FillOutcome {
        let size = filled_size(snapshot, order.size);
        let price = fill_price(snapshot, order.price.value());

        info!(
            "Filled {} {} {} @ {:.4} on attempt {} (order {})",
            request.side, size, request.token_id, price, attempt, snapshot.order_id
        );

        self.corroborate(request, size, baseline_tokens).await;

        FillOutcome::Filled {
            order_id: snapshot.order_id.clone(),
            size,
            price,
            attempt,
        }
    }

    /// Log when the token balance disagrees with a status-confirmed fill
    async fn corroborate(&self, request: &FillRequest, size: f64, baseline: Option<f64>) {
        let Some(before) = baseline else {
            return;
        };
        let after = match self.broker.get_token_balance(&request.token_id).await {
            Ok(Some(after)) => after,
            _ => return,
        };
        let delta = match request.side {
            OrderSide::Buy => after - before,
            OrderSide::Sell => before - after,
        };
        if (delta - size).abs() >= self.config.min_order_size {
            warn!(
                "Balance delta {:.4} for {} disagrees with reported fill {:.4}; trusting order status",
                delta, request.token_id, size
            );
        }
    }

    /// Cancel still unverified: the token balance decides whether the order went through
    async fn resolve_by_balance(
        &self,
        request: &FillRequest,
        order_id: &str,
        order: &OrderRequest,
        attempt: u32,
        baseline: Option<f64>,
    ) -> FillOutcome {
        let unresolved = || FillOutcome::Failed {
            reason: TradeExecutionError::CancelUnverified {
                order_id: order_id.to_string(),
            },
            unresolved_order: Some(order_id.to_string()),
        };

        let (Some(before), Ok(Some(after))) = (
            baseline,
            self.broker.get_token_balance(&request.token_id).await,
        ) else {
            warn!("Cancel unverified and no balance to resolve it for {}", request.token_id);
            return unresolved();
        };

        let delta = match request.side {
            OrderSide::Buy => after - before,
            OrderSide::Sell => before - after,
        };

        if delta >= self.config.min_order_size {
            warn!(
                "Cancel unverified but balance moved by {:.4}; treating attempt {} as filled",
                delta, attempt
            );
            FillOutcome::Filled {
                order_id: order_id.to_string(),
                size: delta.min(order.size),
                price: order.price.value(),
                attempt,
            }
        } else {
            unresolved()
        }
    }

    /// A partial fill is only booked once the unfilled remainder is off the book
    async fn pull_remainder(&self, snapshot: &OrderSnapshot) -> OrderSnapshot {
        if !snapshot.status.is_live() {
            return snapshot.clone();
        }
        info!(
            "Order {} partially filled ({:.4}), cancelling the remainder",
            snapshot.order_id, snapshot.size_matched
        );
        match self.cancel_verified(&snapshot.order_id).await {
            CancelCheck::Filled(settled) if settled.size_matched >= snapshot.size_matched => settled,
            CancelCheck::Filled(_) | CancelCheck::Cancelled => snapshot.clone(),
            CancelCheck::Unverified => {
                warn!(
                    "Remainder of {} may still be live; booking the {:.4} matched so far",
                    snapshot.order_id, snapshot.size_matched
                );
                snapshot.clone()
            }
        }
    }

    async fn cancel_verified(&self, order_id: &str) -> CancelCheck {
        for round in 1..=2 {
            if let Err(e) = self.broker.cancel_order(order_id).await {
                warn!("Cancel {} (try {}) failed: {}", order_id, round, e);
            }
            match self.check_cancelled(order_id).await {
                Some(check) => return check,
                None => debug!("Order {} still live after cancel try {}", order_id, round),
            }
        }

        warn!("Cancel of {} inconclusive, escalating to cancel-all", order_id);
        if let Err(e) = self.broker.cancel_all_orders().await {
            warn!("Cancel-all failed: {}", e);
        }
        self.check_cancelled(order_id)
            .await
            .unwrap_or(CancelCheck::Unverified)
    }

    async fn check_cancelled(&self, order_id: &str) -> Option<CancelCheck> {
        match self.broker.get_order_status(order_id).await {
            Ok(snapshot) if snapshot.status.is_live() => None,
            Ok(snapshot) if snapshot.is_filled() => Some(CancelCheck::Filled(snapshot)),
            Ok(_) => Some(CancelCheck::Cancelled),
            Err(BrokerError::NotFound(_)) => Some(CancelCheck::Cancelled),
            Err(_) => None,
        }
    }

    /// Stop arrived mid-attempt: pull the outstanding order before unwinding
    async fn reconcile_after_stop(&self, order_id: Option<&str>, order: &OrderRequest) -> FillOutcome {
        let Some(order_id) = order_id else {
            if let Err(e) = self.broker.cancel_all_orders().await {
                warn!("Cancel-all during stop failed: {}", e);
            }
            return FillOutcome::failed(TradeExecutionError::Stopped);
        };

        info!("Stop requested, cancelling outstanding order {}", order_id);
        match self.cancel_verified(order_id).await {
            CancelCheck::Filled(snapshot) => FillOutcome::Filled {
                order_id: order_id.to_string(),
                size: filled_size(&snapshot, order.size),
                price: fill_price(&snapshot, order.price.value()),
                attempt: 0,
            },
            CancelCheck::Cancelled => FillOutcome::failed(TradeExecutionError::Stopped),
            CancelCheck::Unverified => FillOutcome::Failed {
                reason: TradeExecutionError::Stopped,
                unresolved_order: Some(order_id.to_string()),
            },
        }
    }

    async fn interruptible<T>(&self, stop: &StopSignal, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = stop.stopped() => None,
            out = fut => Some(out),
        }
    }
}

fn filled_size(snapshot: &OrderSnapshot, requested: f64) -> f64 {
    if snapshot.size_matched > 0.0 {
        snapshot.size_matched
    } else {
        requested
    }
}

fn fill_price(snapshot: &OrderSnapshot, fallback: f64) -> f64 {
    if snapshot.price > 0.0 {
        snapshot.price
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderStatus;
    use crate::domain::repositories::broker_adapter::{BookLevel, BrokerResult};
    use crate::domain::repositories::clock::ManualClock;
    use crate::domain::services::fees::FeeModel;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    /// Broker that fills on a chosen attempt and records every call
    #[derive(Default)]
    struct ScriptedBroker {
        fill_on_attempt: Option<usize>,
        book: Option<Vec<f64>>,
        sticky_cancel: bool,
        /// (attempt, matched) reported as a resting partial fill
        partial_on_attempt: Option<(usize, f64)>,
        /// Fills report neither matched size nor execution price
        unreported_fill: bool,
        /// Triggered as soon as an order is placed
        stop_on_place: Option<StopSignal>,
        balance: f64,
        placed: Mutex<Vec<OrderRequest>>,
        cancels: Mutex<Vec<String>>,
        cancel_all_calls: Mutex<u32>,
        statuses: Mutex<std::collections::HashMap<String, OrderSnapshot>>,
    }

    impl ScriptedBroker {
        fn placed(&self) -> Vec<OrderRequest> {
            self.placed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerAdapter for ScriptedBroker {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn get_price(&self, _token_id: &str) -> BrokerResult<f64> {
            Ok(0.76)
        }

        async fn get_order_book_levels(
            &self,
            _token_id: &str,
            _side: BookSide,
            depth: usize,
        ) -> BrokerResult<Vec<BookLevel>> {
            match &self.book {
                Some(prices) => Ok(prices
                    .iter()
                    .take(depth)
                    .map(|p| BookLevel { price: *p, size: 500.0 })
                    .collect()),
                None => Err(BrokerError::Network("book down".to_string())),
            }
        }

        async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String> {
            let mut placed = self.placed.lock().unwrap();
            placed.push(order.clone());
            let attempt = placed.len();
            let order_id = format!("ord-{}", attempt);
            let filled = self.fill_on_attempt == Some(attempt);
            let partial = self
                .partial_on_attempt
                .filter(|(on, _)| *on == attempt)
                .map(|(_, matched)| matched);
            let (status, size_matched) = if filled {
                let matched = if self.unreported_fill { 0.0 } else { order.size };
                (OrderStatus::Filled, matched)
            } else if let Some(matched) = partial {
                (OrderStatus::PartiallyFilled, matched)
            } else if order.order_type == OrderType::Fok {
                (OrderStatus::Cancelled, 0.0)
            } else {
                (OrderStatus::Open, 0.0)
            };
            let price = if filled && self.unreported_fill { 0.0 } else { order.price.value() };
            self.statuses.lock().unwrap().insert(
                order_id.clone(),
                OrderSnapshot {
                    order_id: order_id.clone(),
                    status,
                    size_matched,
                    price,
                },
            );
            if let Some(stop) = &self.stop_on_place {
                stop.trigger();
            }
            Ok(order_id)
        }

        async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
            self.statuses
                .lock()
                .unwrap()
                .get(order_id)
                .cloned()
                .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))
        }

        async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
            self.cancels.lock().unwrap().push(order_id.to_string());
            if !self.sticky_cancel {
                if let Some(s) = self.statuses.lock().unwrap().get_mut(order_id) {
                    if s.status.is_live() {
                        s.status = OrderStatus::Cancelled;
                    }
                }
            }
            Ok(())
        }

        async fn cancel_all_orders(&self) -> BrokerResult<()> {
            *self.cancel_all_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn get_balance(&self) -> BrokerResult<f64> {
            Ok(self.balance)
        }

        async fn get_token_balance(&self, _token_id: &str) -> BrokerResult<Option<f64>> {
            Ok(Some(0.0))
        }
    }

    fn config() -> OrderFillConfig {
        OrderFillConfig {
            settle_delay: Duration::from_millis(0),
            ..OrderFillConfig::default()
        }
    }

    fn engine(broker: Arc<ScriptedBroker>) -> OrderFillEngine {
        let ledger = Arc::new(PositionLedger::new(FeeModel::default(), 1000.0));
        OrderFillEngine::new(broker, ledger, config())
    }

    fn guard(seconds_left: i64) -> DeadlineGuard {
        let now = Utc::now();
        DeadlineGuard::new(
            now + ChronoDuration::seconds(seconds_left),
            10.0,
            Arc::new(ManualClock::new(now)),
        )
    }

    #[tokio::test]
    async fn test_fills_on_first_level() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.76, 0.77, 0.78, 0.79]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 100.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;

        assert_eq!(
            outcome,
            FillOutcome::Filled {
                order_id: "ord-1".to_string(),
                size: 100.0,
                price: 0.76,
                attempt: 1
            }
        );
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_walks_book_then_fok_at_ceiling() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(5),
            book: Some(vec![0.76, 0.77, 0.78, 0.79]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 10.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(outcome.is_filled());

        let placed = broker.placed();
        let prices: Vec<f64> = placed.iter().map(|o| o.price.value()).collect();
        assert_eq!(prices, vec![0.76, 0.77, 0.78, 0.79, 0.99]);
        assert_eq!(placed[4].order_type, OrderType::Fok);
        assert!(placed[..4].iter().all(|o| o.order_type == OrderType::Limit));
        // every unfilled limit order was cancelled before the next attempt
        assert_eq!(broker.cancels.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fallback_increment_when_book_unavailable() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(2),
            book: None,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Sell, 0.60, 10.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(outcome.is_filled());

        let prices: Vec<f64> = broker.placed().iter().map(|o| o.price.value()).collect();
        assert_eq!(prices, vec![0.59, 0.58]);
    }

    #[tokio::test]
    async fn test_sell_fok_at_floor_and_exhaustion() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: None,
            book: Some(vec![0.60, 0.59, 0.58, 0.57]),
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Sell, 0.60, 10.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(matches!(
            outcome,
            FillOutcome::Failed {
                reason: TradeExecutionError::LadderExhausted { attempts: 5 },
                ..
            }
        ));
        let placed = broker.placed();
        assert_eq!(placed.len(), 5);
        assert_eq!(placed[4].price.value(), 0.01);
    }

    #[tokio::test]
    async fn test_aggressive_goes_straight_to_fok() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.60]),
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Sell, 0.60, 10.0).aggressive();

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(outcome.is_filled());
        let placed = broker.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Fok);
    }

    #[tokio::test]
    async fn test_deadline_aborts_before_submission() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.76]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 10.0);

        let outcome = engine.attempt_fill(&request, &guard(5), &StopSignal::new()).await;
        assert_eq!(outcome, FillOutcome::AbortedExpiry);
        assert!(broker.placed().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected_locally() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.76]),
            balance: 50.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 100.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(matches!(
            outcome,
            FillOutcome::Failed {
                reason: TradeExecutionError::InsufficientBalance { .. },
                ..
            }
        ));
        assert!(broker.placed().is_empty());
    }

    #[tokio::test]
    async fn test_prior_filled_order_short_circuits() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.76]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let first = engine
            .attempt_fill(
                &FillRequest::new("111", OrderSide::Buy, 0.76, 10.0),
                &guard(120),
                &StopSignal::new(),
            )
            .await;
        assert!(first.is_filled());

        let again = FillRequest::new("111", OrderSide::Buy, 0.76, 10.0)
            .resuming(Some("ord-1".to_string()));
        let outcome = engine.attempt_fill(&again, &guard(120), &StopSignal::new()).await;

        assert!(matches!(outcome, FillOutcome::Filled { attempt: 0, .. }));
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_rejected() {
        let broker = Arc::new(ScriptedBroker::default());
        let engine = engine(broker);
        let _held = engine.claim("111", OrderSide::Buy).unwrap();

        let outcome = engine
            .attempt_fill(
                &FillRequest::new("111", OrderSide::Buy, 0.76, 10.0),
                &guard(120),
                &StopSignal::new(),
            )
            .await;
        assert!(matches!(
            outcome,
            FillOutcome::Failed {
                reason: TradeExecutionError::DuplicateSubmission { .. },
                ..
            }
        ));
        // other side of the same token is independent
        assert!(engine.claim("111", OrderSide::Sell).is_some());
    }

    #[tokio::test]
    async fn test_claim_released_after_ladder() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.76]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker);
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 10.0);
        engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(engine.claim("111", OrderSide::Buy).is_some());
    }

    #[tokio::test]
    async fn test_sticky_cancel_escalates_to_cancel_all() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: None,
            book: Some(vec![0.76, 0.77]),
            sticky_cancel: true,
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 10.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;
        assert!(matches!(
            outcome,
            FillOutcome::Failed {
                reason: TradeExecutionError::CancelUnverified { .. },
                ..
            }
        ));
        // cancel, one retry, then the blanket cancel
        assert_eq!(broker.cancels.lock().unwrap().len(), 2);
        assert_eq!(*broker.cancel_all_calls.lock().unwrap(), 1);
        // the ladder did not continue past the ambiguous order
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_sticky_prior_order_stays_unresolved_without_resubmitting() {
        let broker = Arc::new(ScriptedBroker {
            book: Some(vec![0.60]),
            sticky_cancel: true,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let first = engine
            .attempt_fill(
                &FillRequest::new("111", OrderSide::Sell, 0.60, 10.0),
                &guard(120),
                &StopSignal::new(),
            )
            .await;
        assert!(matches!(
            &first,
            FillOutcome::Failed { unresolved_order: Some(id), .. } if id == "ord-1"
        ));

        let again = FillRequest::new("111", OrderSide::Sell, 0.60, 10.0)
            .resuming(Some("ord-1".to_string()));
        let outcome = engine.attempt_fill(&again, &guard(120), &StopSignal::new()).await;

        assert!(matches!(
            &outcome,
            FillOutcome::Failed { unresolved_order: Some(id), .. } if id == "ord-1"
        ));
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_start_submits_nothing() {
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            book: Some(vec![0.76]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let stop = StopSignal::new();
        stop.trigger();

        let outcome = engine
            .attempt_fill(&FillRequest::new("111", OrderSide::Buy, 0.76, 10.0), &guard(120), &stop)
            .await;
        assert!(matches!(
            outcome,
            FillOutcome::Failed {
                reason: TradeExecutionError::Stopped,
                ..
            }
        ));
        assert!(broker.placed().is_empty());
    }

    #[tokio::test]
    async fn test_partial_fill_cancels_remainder_before_booking() {
        let broker = Arc::new(ScriptedBroker {
            partial_on_attempt: Some((1, 40.0)),
            book: Some(vec![0.76, 0.77]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 100.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;

        assert_eq!(
            outcome,
            FillOutcome::Filled {
                order_id: "ord-1".to_string(),
                size: 40.0,
                price: 0.76,
                attempt: 1
            }
        );
        assert_eq!(*broker.cancels.lock().unwrap(), vec!["ord-1".to_string()]);
        let statuses = broker.statuses.lock().unwrap();
        assert!(statuses.values().all(|s| !s.status.is_live()));
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_fill_with_sticky_remainder_still_books_matched() {
        let broker = Arc::new(ScriptedBroker {
            partial_on_attempt: Some((1, 40.0)),
            book: Some(vec![0.76]),
            sticky_cancel: true,
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 100.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &StopSignal::new()).await;

        assert!(matches!(outcome, FillOutcome::Filled { size, .. } if size == 40.0));
        assert_eq!(*broker.cancel_all_calls.lock().unwrap(), 1);
        assert_eq!(broker.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_after_unreported_fill_uses_order_size_and_price() {
        let stop = StopSignal::new();
        let broker = Arc::new(ScriptedBroker {
            fill_on_attempt: Some(1),
            unreported_fill: true,
            stop_on_place: Some(stop.clone()),
            book: Some(vec![0.76]),
            balance: 1000.0,
            ..Default::default()
        });
        let engine = engine(broker.clone());
        let request = FillRequest::new("111", OrderSide::Buy, 0.76, 10.0);

        let outcome = engine.attempt_fill(&request, &guard(120), &stop).await;

        assert_eq!(
            outcome,
            FillOutcome::Filled {
                order_id: "ord-1".to_string(),
                size: 10.0,
                price: 0.76,
                attempt: 0
            }
        );
    }

    #[test]
    fn test_deadline_guard() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let guard = DeadlineGuard::new(now + ChronoDuration::seconds(30), 10.0, clock.clone());
        assert!(!guard.is_violated());
        clock.advance(ChronoDuration::seconds(20));
        assert!(guard.is_violated());
    }
}
