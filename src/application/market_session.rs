//! Market Session
//!
//! Drives one [`TradingSession`] through its window, one cycle at a time:
//!
//! 1. refresh the current window from the feed; an expired or superseded
//!    window resets the session,
//! 2. with no position, gate and evaluate an entry and run the buy ladder,
//! 3. with a pending entry, resume it or cancel it near the close,
//! 4. with an open position, ask the risk monitor and run the sell ladder.
//!
//! Every failure ends the cycle without trading; the next poll starts fresh.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::entities::market_window::MarketWindow;
use crate::domain::entities::order::OrderSide;
use crate::domain::entities::position::{ExitReason, PendingEntry, Position, PositionState};
use crate::domain::entities::trading_session::TradingSession;
use crate::domain::errors::ValidationError;
use crate::domain::repositories::broker_adapter::BrokerAdapter;
use crate::domain::repositories::clock::Clock;
use crate::domain::repositories::market_feed::{FeedError, MarketFeed};
use crate::domain::repositories::session_store::{
    ClosedPositionRecord, EngineStateRecord, FillRecord, SessionStore,
};
use crate::domain::services::entry_signal::{
    EntryDecision, EntrySignalEvaluator, RejectReason, TokenQuote,
};
use crate::domain::services::order_fill_engine::{
    DeadlineGuard, FillOutcome, FillRequest, OrderFillEngine,
};
use crate::domain::services::position_ledger::PositionLedger;
use crate::domain::services::risk_exit_monitor::{RiskAction, RiskExitMonitor};
use crate::domain::services::trade_execution_error::TradeExecutionError;
use crate::domain::value_objects::price::{floor_size, Price};
use crate::task_runner::StopSignal;

/// Session loop settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub order_size: f64,
    pub max_positions: u32,
    pub min_order_size: f64,
    pub no_buy_threshold_secs: f64,
    pub force_close_threshold_secs: f64,
    /// Poll interval while a window is being traded
    pub position_check_interval: Duration,
    /// Poll interval while waiting for a window
    pub market_scan_interval: Duration,
    /// Upper bound on each teardown step of `stop()`
    pub stop_reconcile_timeout: Duration,
    pub paper_trading: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            order_size: 100.0,
            max_positions: 3,
            min_order_size: 0.1,
            no_buy_threshold_secs: 10.0,
            force_close_threshold_secs: 5.0,
            position_check_interval: Duration::from_secs(2),
            market_scan_interval: Duration::from_secs(10),
            stop_reconcile_timeout: Duration::from_secs(10),
            paper_trading: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No tradable window
    #[default]
    Scanning,
    Active,
    /// Inside the no-buy window; only exits run
    Expiring,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Scanning => write!(f, "scanning"),
            SessionPhase::Active => write!(f, "active"),
            SessionPhase::Expiring => write!(f, "expiring"),
        }
    }
}

/// Read-only view published after every cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub market_id: Option<String>,
    pub close_time: Option<DateTime<Utc>>,
    pub position_state: String,
    pub position: Option<Position>,
    pub pending_order: Option<String>,
    pub positions_taken: u32,
    pub last_action: Option<String>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Trade(#[from] TradeExecutionError),

    #[error(transparent)]
    Transition(#[from] ValidationError),
}

impl CycleError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CycleError::Feed(_) => "ERR_FEED",
            CycleError::Trade(e) => e.error_code(),
            CycleError::Transition(_) => "ERR_STATE",
        }
    }
}

/// Collaborators a session trades through, built once at process start
#[derive(Clone)]
pub struct SessionDeps {
    pub broker: Arc<dyn BrokerAdapter>,
    pub feed: Arc<dyn MarketFeed>,
    pub clock: Arc<dyn Clock>,
    pub ledger: Arc<PositionLedger>,
    pub fill_engine: Arc<OrderFillEngine>,
    pub risk: RiskExitMonitor,
    pub entry: EntrySignalEvaluator,
    pub store: Arc<dyn SessionStore>,
}

pub struct MarketSession {
    deps: SessionDeps,
    config: SessionConfig,
    /// Market requested at start; dropped once that window closes
    pinned: Option<String>,
    session: Option<TradingSession>,
    phase: SessionPhase,
    last_action: Option<String>,
    /// Reason of the latest exit attempt, used when a later balance check confirms it
    last_exit: Option<ExitReason>,
    view: Arc<Mutex<SessionView>>,
}

impl MarketSession {
    pub fn new(deps: SessionDeps, config: SessionConfig, pinned: Option<String>) -> Self {
        Self {
            deps,
            config,
            pinned,
            session: None,
            phase: SessionPhase::Scanning,
            last_action: None,
            last_exit: None,
            view: Arc::new(Mutex::new(SessionView {
                position_state: "idle".to_string(),
                ..SessionView::default()
            })),
        }
    }

    pub fn view_handle(&self) -> Arc<Mutex<SessionView>> {
        self.view.clone()
    }

    pub fn view(&self) -> SessionView {
        let session = self.session.as_ref();
        SessionView {
            phase: self.phase,
            market_id: session.map(|s| s.window().id.clone()),
            close_time: session.map(|s| s.window().close_time),
            position_state: session
                .map(|s| s.state.name())
                .unwrap_or("idle")
                .to_string(),
            position: session.and_then(|s| s.state.position().cloned()),
            pending_order: session.and_then(|s| match &s.state {
                PositionState::PendingFill(entry) => entry.order_id.clone(),
                _ => None,
            }),
            positions_taken: session.map(|s| s.positions_taken()).unwrap_or(0),
            last_action: self.last_action.clone(),
        }
    }

    pub fn session(&self) -> Option<&TradingSession> {
        self.session.as_ref()
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn last_action(&self) -> Option<&str> {
        self.last_action.as_deref()
    }

    /// One cycle; returns how long to wait before the next
    pub async fn run_cycle(&mut self, stop: &StopSignal) -> Result<Duration, String> {
        let result = self.cycle(stop).await;
        if let Err(e) = &result {
            warn!("[{}] {} - no trade this cycle", e.error_code(), e);
            self.last_action = Some(format!("error: {}", e));
        }
        self.publish();
        self.persist(true).await;
        result.map_err(|e| e.to_string())
    }

    async fn cycle(&mut self, stop: &StopSignal) -> Result<Duration, CycleError> {
        let listed = match self.deps.feed.current_window(self.pinned.as_deref()).await {
            Ok(listed) => listed,
            Err(FeedError::Malformed(reason)) => {
                warn!("Skipping cycle, malformed market data: {}", reason);
                self.last_action = Some(format!("skipped: malformed market ({})", reason));
                return Ok(self.config.market_scan_interval);
            }
            Err(e) => return Err(e.into()),
        };
        let now = self.deps.clock.now();

        if self
            .session
            .as_ref()
            .map(|s| s.window().is_expired(now))
            .unwrap_or(false)
        {
            self.expire_session().await;
        }

        let window = match listed {
            Some(window) if !window.is_expired(now) => window,
            Some(window) => {
                if self.pinned.as_deref() == Some(window.id.as_str()) {
                    info!("Pinned market {} has closed, following the schedule", window.id);
                    self.pinned = None;
                }
                self.set_phase(SessionPhase::Scanning);
                return Ok(self.config.market_scan_interval);
            }
            None => {
                debug!("No tradable window listed");
                self.set_phase(SessionPhase::Scanning);
                return Ok(self.config.market_scan_interval);
            }
        };

        self.adopt_window(window).await;

        let (state, secs) = {
            let session = self.current()?;
            (session.state.clone(), session.window().seconds_to_close(now))
        };
        self.set_phase(if secs <= self.config.no_buy_threshold_secs {
            SessionPhase::Expiring
        } else {
            SessionPhase::Active
        });

        match state {
            PositionState::Idle => self.try_enter(secs, stop).await?,
            PositionState::PendingFill(entry) => self.manage_pending(entry, secs, stop).await?,
            PositionState::Open(position) => self.manage_open(position, secs, stop).await?,
            PositionState::Closing { reason, .. } => {
                warn!("Found position still closing ({}), reopening for re-check", reason);
                self.current_mut()?.state.exit_failed()?;
            }
        }

        Ok(self.config.position_check_interval)
    }

    fn current(&self) -> Result<&TradingSession, CycleError> {
        self.session.as_ref().ok_or_else(no_session)
    }

    fn current_mut(&mut self) -> Result<&mut TradingSession, CycleError> {
        self.session.as_mut().ok_or_else(no_session)
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            info!("Session {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    async fn adopt_window(&mut self, window: MarketWindow) {
        let rotated = match self.session.as_ref() {
            None => None,
            Some(session) if session.window().id != window.id => Some(session.window().id.clone()),
            Some(_) => return,
        };

        match rotated {
            None => {
                info!(
                    "Trading market {} ({}), closes {}",
                    window.id, window.question, window.close_time
                );
                self.session = Some(TradingSession::new(window, self.config.max_positions));
            }
            Some(previous) => {
                info!("Window rotated {} -> {}, resetting session", previous, window.id);
                self.release_position().await;
                if let Some(session) = self.session.as_mut() {
                    session.rotate(window);
                }
            }
        }
        self.last_exit = None;
    }

    async fn expire_session(&mut self) {
        self.release_position().await;
        if let Some(session) = self.session.take() {
            info!(
                "Market {} expired after {} positions, resetting",
                session.window().id,
                session.positions_taken()
            );
        }
        self.last_exit = None;
        self.set_phase(SessionPhase::Scanning);
    }

    /// Let go of whatever the old window still holds
    async fn release_position(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        match session.state.clone() {
            PositionState::Idle => {}
            PositionState::Open(position) | PositionState::Closing { position, .. } => {
                if let Some(order_id) = &position.exit_order_id {
                    match self.deps.fill_engine.cancel_and_verify(order_id).await {
                        Ok(None) => info!("Leftover sell {} cancelled at window end", order_id),
                        Ok(Some(snapshot)) => warn!(
                            "Leftover sell {} matched {} before the window closed",
                            order_id, snapshot.size_matched
                        ),
                        Err(e) => error!("[{}] {}", e.error_code(), e),
                    }
                }
                warn!(
                    "Position {} {} @ {} still open at window end, left to settle on-chain",
                    position.outcome, position.size, position.entry_price
                );
                if let Err(e) = self.deps.ledger.write_off(&position.token_id) {
                    error!("[{}] {}", e.error_code(), e);
                }
                self.last_action = Some(format!("{} position left to settle", position.outcome));
            }
            PositionState::PendingFill(entry) => {
                let Some(order_id) = entry.order_id else {
                    return;
                };
                match self.deps.fill_engine.cancel_and_verify(&order_id).await {
                    Ok(None) => info!("Pending entry {} cancelled at window end", order_id),
                    Ok(Some(snapshot)) => {
                        let size = if snapshot.size_matched > 0.0 {
                            snapshot.size_matched
                        } else {
                            entry.size
                        };
                        warn!(
                            "Entry {} filled {} at window end, left to settle on-chain",
                            order_id, size
                        );
                        self.last_action = Some(format!("{} entry filled at close", entry.outcome));
                    }
                    Err(e) => error!("[{}] {}", e.error_code(), e),
                }
            }
        }
    }

    async fn quotes(&self, window: &MarketWindow) -> Vec<TokenQuote> {
        let mut quotes = Vec::with_capacity(2);
        for token in window.tokens() {
            let price = match self.deps.broker.get_price(&token.token_id).await {
                Ok(price) => Some(price),
                Err(e) => {
                    debug!("No price for {} ({}): {}", token.outcome, token.token_id, e);
                    None
                }
            };
            quotes.push(TokenQuote {
                token_id: token.token_id.clone(),
                outcome: token.outcome.clone(),
                price,
            });
        }
        quotes
    }

    fn entry_guard(&self, window: &MarketWindow) -> DeadlineGuard {
        DeadlineGuard::new(
            window.close_time,
            self.config.no_buy_threshold_secs,
            self.deps.clock.clone(),
        )
    }

    async fn try_enter(&mut self, secs: f64, stop: &StopSignal) -> Result<(), CycleError> {
        let session = self.current()?;
        // time and count gates first so a rejected cycle costs no price requests
        if let EntryDecision::Reject(reason) = self.deps.entry.evaluate(session, &[], secs) {
            if reason != RejectReason::NoSignal {
                debug!("Entry gated: {:?} ({:.1}s to close)", reason, secs);
                return Ok(());
            }
        }

        let window = session.window().clone();
        let quotes = self.quotes(&window).await;
        let (token_id, outcome, price) =
            match self.deps.entry.evaluate(self.current()?, &quotes, secs) {
                EntryDecision::Enter {
                    token_id,
                    outcome,
                    price,
                } => (token_id, outcome, price),
                EntryDecision::Reject(reason) => {
                    debug!("No entry: {:?} {:?}", reason, quotes);
                    return Ok(());
                }
            };

        let size = floor_size(self.config.order_size);
        let now = self.deps.clock.now();
        self.current_mut()?.state.begin_entry(PendingEntry {
            token_id: token_id.clone(),
            outcome: outcome.clone(),
            reference_price: Price::new(price)?,
            size,
            order_id: None,
            submitted_at: now,
        })?;
        info!(
            "Entry signal {} @ {:.4} with {:.1}s to close, buying {}",
            outcome, price, secs, size
        );
        self.publish();

        let request = FillRequest::new(token_id, OrderSide::Buy, price, size);
        let outcome = self
            .deps
            .fill_engine
            .attempt_fill(&request, &self.entry_guard(&window), stop)
            .await;
        self.settle_entry(outcome).await
    }

    async fn manage_pending(
        &mut self,
        entry: PendingEntry,
        secs: f64,
        stop: &StopSignal,
    ) -> Result<(), CycleError> {
        let action = self.deps.risk.evaluate(&self.current()?.state, None, secs);
        if action == RiskAction::CancelPendingEntry {
            return self.cancel_pending(entry).await;
        }

        let window = self.current()?.window().clone();
        info!(
            "Resuming pending entry {} (order {:?})",
            entry.outcome, entry.order_id
        );
        let request = FillRequest::new(
            entry.token_id.clone(),
            OrderSide::Buy,
            entry.reference_price.value(),
            entry.size,
        )
        .resuming(entry.order_id.clone());
        let outcome = self
            .deps
            .fill_engine
            .attempt_fill(&request, &self.entry_guard(&window), stop)
            .await;
        self.settle_entry(outcome).await
    }

    async fn cancel_pending(&mut self, entry: PendingEntry) -> Result<(), CycleError> {
        let Some(order_id) = entry.order_id.clone() else {
            self.current_mut()?.state.abandon_entry()?;
            self.last_action = Some("entry cancelled: window closing".to_string());
            return Ok(());
        };

        match self.deps.fill_engine.cancel_and_verify(&order_id).await {
            Ok(None) => {
                self.current_mut()?.state.abandon_entry()?;
                info!("Pending entry {} cancelled before the close", order_id);
                self.last_action = Some("entry cancelled: window closing".to_string());
                Ok(())
            }
            Ok(Some(snapshot)) => {
                let size = if snapshot.size_matched > 0.0 {
                    snapshot.size_matched
                } else {
                    entry.size
                };
                info!("Pending entry {} filled before its cancel", order_id);
                self.confirm_entry(&order_id, size, snapshot.price).await
            }
            Err(e) => {
                warn!("[{}] {}; entry stays pending", e.error_code(), e);
                self.last_action = Some(format!("entry cancel unverified: {}", order_id));
                Ok(())
            }
        }
    }

    async fn settle_entry(&mut self, outcome: FillOutcome) -> Result<(), CycleError> {
        match outcome {
            FillOutcome::Filled {
                order_id,
                size,
                price,
                attempt,
            } => {
                debug!("Entry ladder filled on attempt {}", attempt);
                self.confirm_entry(&order_id, size, price).await
            }
            FillOutcome::AbortedExpiry => {
                let entry = self.current_mut()?.state.abandon_entry()?;
                info!("Entry {} aborted: window closing", entry.outcome);
                self.last_action = Some("entry aborted: window closing".to_string());
                Ok(())
            }
            FillOutcome::Failed {
                reason,
                unresolved_order: Some(order_id),
            } => {
                warn!(
                    "[{}] Entry order {} unresolved ({}), keeping entry pending",
                    reason.error_code(),
                    order_id,
                    reason
                );
                self.current_mut()?.state.track_entry_order(&order_id);
                self.last_action = Some(format!("entry pending: {}", reason));
                Ok(())
            }
            FillOutcome::Failed {
                reason,
                unresolved_order: None,
            } => {
                let entry = self.current_mut()?.state.abandon_entry()?;
                warn!(
                    "[{}] Entry {} failed: {}",
                    reason.error_code(),
                    entry.outcome,
                    reason
                );
                self.last_action = Some(format!("entry failed: {}", reason));
                Ok(())
            }
        }
    }

    async fn confirm_entry(&mut self, order_id: &str, size: f64, price: f64) -> Result<(), CycleError> {
        let (entry, market_id) = {
            let session = self.current()?;
            match &session.state {
                PositionState::PendingFill(entry) => (entry.clone(), session.window().id.clone()),
                other => {
                    return Err(ValidationError::InvalidTransition(format!(
                        "fill confirmed while {}",
                        other.name()
                    ))
                    .into())
                }
            }
        };

        let fill_price = if price > 0.0 {
            price
        } else {
            entry.reference_price.value()
        };
        let entry_price = Price::new(fill_price)?;
        let stoploss = self.deps.risk.stoploss_price(entry_price)?;
        let now = self.deps.clock.now();

        self.current_mut()?
            .state
            .confirm_fill(entry_price, size, stoploss, order_id, now)?;
        let booking = self.deps.ledger.record_buy(&entry.token_id, fill_price, size)?;

        info!(
            "Position open: {} {} @ {}, stoploss {}",
            entry.outcome, size, entry_price, stoploss
        );
        self.last_action = Some(format!("BUY {} {:.2} @ {:.4}", entry.outcome, size, fill_price));

        self.record_fill(FillRecord {
            market_id,
            token_id: entry.token_id,
            outcome: entry.outcome,
            side: OrderSide::Buy,
            price: fill_price,
            size,
            fee: booking.fee,
            order_id: order_id.to_string(),
            paper: self.config.paper_trading,
            executed_at: now,
        })
        .await;
        Ok(())
    }

    async fn manage_open(&mut self, position: Position, secs: f64, stop: &StopSignal) -> Result<(), CycleError> {
        let price = match self.deps.broker.get_price(&position.token_id).await {
            Ok(price) => Some(price),
            Err(e) => {
                warn!("Price for {} unavailable: {}", position.token_id, e);
                None
            }
        };

        if position.sell_attempted {
            if let Ok(Some(balance)) = self.deps.broker.get_token_balance(&position.token_id).await {
                if balance < self.config.min_order_size {
                    let reason = self.last_exit.unwrap_or(ExitReason::Stoploss);
                    let exit_price = self.deps.risk.exit_reference_price(reason, price);
                    info!(
                        "Balance {:.4} confirms the earlier {} sell of {}",
                        balance, reason, position.outcome
                    );
                    self.current_mut()?.state.begin_exit(reason)?;
                    return self
                        .close_sold(&position, None, position.size, exit_price)
                        .await;
                }
            }
        }

        match self.deps.risk.evaluate(&self.current()?.state, price, secs) {
            RiskAction::Exit(reason) => self.exit_position(position, reason, price, stop).await,
            _ => {
                debug!(
                    "Holding {} @ {:?} (entry {}, stoploss {}), {:.1}s to close",
                    position.outcome, price, position.entry_price, position.stoploss_price, secs
                );
                Ok(())
            }
        }
    }

    async fn exit_position(
        &mut self,
        position: Position,
        reason: ExitReason,
        price: Option<f64>,
        stop: &StopSignal,
    ) -> Result<(), CycleError> {
        let size = match self.deps.broker.get_token_balance(&position.token_id).await {
            Ok(Some(balance)) => floor_size(balance),
            Ok(None) => position.size,
            Err(e) => {
                warn!("Token balance for {} unavailable, selling position size: {}", position.token_id, e);
                position.size
            }
        };
        if size < self.config.min_order_size {
            return self.close_dust(&position, size).await;
        }

        let mut reason = reason;
        self.last_exit = Some(reason);
        self.current_mut()?.state.begin_exit(reason)?;
        info!(
            "{} exit: selling {} {} (price {:?})",
            reason, size, position.outcome, price
        );

        let mut outcome = self.sell(&position, reason, size, price, stop).await?;
        if outcome == FillOutcome::AbortedExpiry
            && reason != ExitReason::ForceClose
            && !stop.is_stopped()
        {
            warn!("{} exit ran into the close, switching to force-close", reason);
            reason = ExitReason::ForceClose;
            self.last_exit = Some(reason);
            let state = &mut self.current_mut()?.state;
            state.exit_failed()?;
            state.begin_exit(reason)?;
            outcome = self.sell(&position, reason, size, price, stop).await?;
        }

        match outcome {
            FillOutcome::Filled {
                order_id,
                size: sold,
                price: fill_price,
                ..
            } => {
                let fill_price = if fill_price > 0.0 {
                    fill_price
                } else {
                    self.deps.risk.exit_reference_price(reason, price)
                };
                self.close_sold(&position, Some(&order_id), sold, fill_price).await
            }
            FillOutcome::AbortedExpiry => {
                let state = &mut self.current_mut()?.state;
                state.track_exit_order(None);
                state.exit_failed()?;
                warn!("{} exit aborted at the close", reason);
                self.last_action = Some(format!("{} exit aborted", reason));
                Ok(())
            }
            FillOutcome::Failed {
                reason: error,
                unresolved_order,
            } => {
                let state = &mut self.current_mut()?.state;
                state.track_exit_order(unresolved_order.as_deref());
                state.exit_failed()?;
                if let Some(order_id) = &unresolved_order {
                    warn!("Sell order {} left unresolved, resolving it before the next sell", order_id);
                }
                warn!("[{}] {} exit failed: {}", error.error_code(), reason, error);
                self.last_action = Some(format!("{} exit failed: {}", reason, error));
                Ok(())
            }
        }
    }

    async fn sell(
        &self,
        position: &Position,
        reason: ExitReason,
        size: f64,
        price: Option<f64>,
        stop: &StopSignal,
    ) -> Result<FillOutcome, CycleError> {
        let close_time = self.current()?.window().close_time;
        let reference = self.deps.risk.exit_reference_price(reason, price);
        let mut request = FillRequest::new(position.token_id.clone(), OrderSide::Sell, reference, size)
            .resuming(position.exit_order_id.clone());

        // a force-close goes straight to fill-or-kill and runs until the close itself
        let min_secs = if reason == ExitReason::ForceClose {
            request = request.aggressive();
            0.0
        } else {
            self.config.force_close_threshold_secs
        };
        let guard = DeadlineGuard::new(close_time, min_secs, self.deps.clock.clone());
        Ok(self.deps.fill_engine.attempt_fill(&request, &guard, stop).await)
    }

    /// Book a confirmed sell and close the position held in `Closing`
    async fn close_sold(
        &mut self,
        position: &Position,
        order_id: Option<&str>,
        size: f64,
        price: f64,
    ) -> Result<(), CycleError> {
        let settlement = match self.deps.ledger.holding(&position.token_id) {
            Some(holding) => Some(self.deps.ledger.record_sell(
                &position.token_id,
                price,
                size.min(holding.quantity),
            )?),
            None => {
                warn!("No ledger holding for {}, closing without P&L", position.token_id);
                None
            }
        };
        if let Some(residue) = self.deps.ledger.write_off(&position.token_id)? {
            debug!("Dropped {:.4} residual shares of {}", residue.quantity, position.token_id);
        }

        let market_id = self.current()?.window().id.clone();
        let (closed, reason) = self.current_mut()?.complete_exit()?;
        let positions_taken = self.current()?.positions_taken();
        let now = self.deps.clock.now();
        let net_pnl = settlement.as_ref().map(|s| s.net_pnl.value()).unwrap_or(0.0);

        info!(
            "Position closed ({}): {} {} @ {} -> {:.4}, net {:.4}, positions taken {}",
            reason, closed.outcome, size, closed.entry_price, price, net_pnl, positions_taken
        );
        self.last_action = Some(format!(
            "SELL {} {:.2} @ {:.4} ({}) net {:.4}",
            closed.outcome, size, price, reason, net_pnl
        ));

        if let (Some(order_id), Some(settlement)) = (order_id, settlement.as_ref()) {
            self.record_fill(FillRecord {
                market_id: market_id.clone(),
                token_id: closed.token_id.clone(),
                outcome: closed.outcome.clone(),
                side: OrderSide::Sell,
                price,
                size: settlement.size,
                fee: settlement.exit_fee,
                order_id: order_id.to_string(),
                paper: self.config.paper_trading,
                executed_at: now,
            })
            .await;
        }
        self.record_closed(ClosedPositionRecord {
            market_id,
            token_id: closed.token_id,
            outcome: closed.outcome,
            entry_price: closed.entry_price.value(),
            exit_price: Some(price),
            size,
            net_pnl,
            exit_reason: reason,
            opened_at: closed.opened_at,
            closed_at: now,
        })
        .await;
        Ok(())
    }

    async fn close_dust(&mut self, position: &Position, remaining: f64) -> Result<(), CycleError> {
        info!(
            "Remaining {:.4} shares of {} are below the minimum order, closing as dust",
            remaining, position.outcome
        );
        self.current_mut()?.state.begin_exit(ExitReason::Dust)?;
        self.deps.ledger.write_off(&position.token_id)?;

        let market_id = self.current()?.window().id.clone();
        let (closed, reason) = self.current_mut()?.complete_exit()?;
        let now = self.deps.clock.now();
        self.last_action = Some(format!("{} closed as dust", closed.outcome));

        self.record_closed(ClosedPositionRecord {
            market_id,
            token_id: closed.token_id,
            outcome: closed.outcome,
            entry_price: closed.entry_price.value(),
            exit_price: None,
            size: remaining,
            net_pnl: 0.0,
            exit_reason: reason,
            opened_at: closed.opened_at,
            closed_at: now,
        })
        .await;
        Ok(())
    }

    /// Teardown after the cycle task has stopped: resolve an unconfirmed entry
    /// and reopen a position whose exit was cut short
    pub async fn reconcile_on_stop(&mut self) {
        let state = match self.session.as_ref() {
            Some(session) => session.state.clone(),
            None => return,
        };
        let result = match state {
            PositionState::PendingFill(entry) => self.cancel_pending(entry).await,
            PositionState::Closing { .. } => self
                .current_mut()
                .and_then(|s| s.state.exit_failed().map_err(CycleError::from)),
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("[{}] Reconciliation on stop failed: {}", e.error_code(), e);
        }
        self.publish();
    }

    fn publish(&self) {
        let view = self.view();
        if let Ok(mut published) = self.view.lock() {
            *published = view;
        }
    }

    pub async fn persist(&self, is_running: bool) {
        let state = EngineStateRecord {
            is_running,
            current_market_id: self.session.as_ref().map(|s| s.window().id.clone()),
            last_action: self.last_action.clone(),
            positions_taken: self.session.as_ref().map(|s| s.positions_taken()).unwrap_or(0),
            ledger: self.deps.ledger.snapshot(),
            paper_trading: self.config.paper_trading,
        };
        if let Err(e) = self.deps.store.save_state(&state).await {
            error!("Failed to persist session state: {}", e);
        }
    }

    async fn record_fill(&self, fill: FillRecord) {
        if let Err(e) = self.deps.store.record_fill(&fill).await {
            error!("Failed to record {} fill {}: {}", fill.side, fill.order_id, e);
        }
    }

    async fn record_closed(&self, record: ClosedPositionRecord) {
        if let Err(e) = self.deps.store.record_closed_position(&record).await {
            error!("Failed to record closed position on {}: {}", record.market_id, e);
        }
    }
}

fn no_session() -> CycleError {
    ValidationError::InvalidTransition("no active session".to_string()).into()
}
