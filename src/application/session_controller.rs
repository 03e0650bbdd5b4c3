//! Session Controller
//!
//! Control surface over the market session task: `start`, `stop` and `status`.
//! One session runs at a time. Stopping fires the stop signal, waits for the
//! in-flight cycle to unwind (the fill ladder cancels its own outstanding
//! order), cancels every remaining order, reconciles the session and persists
//! the final state. Each teardown step is bounded by the reconcile timeout.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::market_session::{
    MarketSession, SessionConfig, SessionDeps, SessionPhase, SessionView,
};
use crate::domain::entities::position::Position;
use crate::task_runner::{run_cycles, BackoffConfig, StopSignal};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    #[error("Session already running")]
    AlreadyRunning,

    #[error("Session is not running")]
    NotRunning,
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub is_running: bool,
    pub session_state: SessionPhase,
    pub current_market_id: Option<String>,
    pub time_to_close: Option<f64>,
    pub position_state: String,
    pub position: Option<Position>,
    pub pending_order: Option<String>,
    pub positions_taken: u32,
    pub last_action: Option<String>,
    pub total_pnl: f64,
    pub trades_count: u32,
    pub wins: u32,
    pub losses: u32,
    pub balance: f64,
    pub paper_trading: bool,
}

struct RunningSession {
    stop: StopSignal,
    handle: JoinHandle<()>,
    session: Arc<tokio::sync::Mutex<MarketSession>>,
    view: Arc<Mutex<SessionView>>,
}

pub struct SessionController {
    deps: SessionDeps,
    config: SessionConfig,
    running: tokio::sync::Mutex<Option<RunningSession>>,
    /// View of the last session after it stopped
    last_view: Mutex<SessionView>,
}

impl SessionController {
    pub fn new(deps: SessionDeps, config: SessionConfig) -> Self {
        Self {
            deps,
            config,
            running: tokio::sync::Mutex::new(None),
            last_view: Mutex::new(SessionView {
                position_state: "idle".to_string(),
                ..SessionView::default()
            }),
        }
    }

    /// Start trading, optionally pinned to one market id
    pub async fn start(&self, market_id: Option<String>) -> Result<(), ControlError> {
        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
        {
            return Err(ControlError::AlreadyRunning);
        }

        let session = MarketSession::new(self.deps.clone(), self.config.clone(), market_id.clone());
        session.persist(true).await;
        let view = session.view_handle();
        let session = Arc::new(tokio::sync::Mutex::new(session));
        let stop = StopSignal::new();

        let backoff = BackoffConfig {
            initial_retry_delay: self.config.position_check_interval,
            max_retry_delay: self.config.market_scan_interval * 6,
        };
        let task_session = session.clone();
        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            let cycle_stop = task_stop.clone();
            run_cycles("market-session", backoff, task_stop, move || {
                let session = task_session.clone();
                let stop = cycle_stop.clone();
                async move { session.lock().await.run_cycle(&stop).await }
            })
            .await;
        });

        match &market_id {
            Some(id) => info!("Session started on pinned market {}", id),
            None => info!("Session started, following the window schedule"),
        }
        *running = Some(RunningSession {
            stop,
            handle,
            session,
            view,
        });
        Ok(())
    }

    /// Stop the session and reconcile before returning
    pub async fn stop(&self) -> Result<(), ControlError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(ControlError::NotRunning);
        };
        let timeout = self.config.stop_reconcile_timeout;
        info!("Stopping session");
        running.stop.trigger();

        let mut handle = running.handle;
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!("Session task did not unwind within {:?}, aborting it", timeout);
            handle.abort();
        }

        match tokio::time::timeout(timeout, self.deps.broker.cancel_all_orders()).await {
            Ok(Ok(())) => info!("Outstanding orders cancelled"),
            Ok(Err(e)) => warn!("Cancel-all on stop failed: {}", e),
            Err(_) => warn!("Cancel-all on stop timed out after {:?}", timeout),
        }

        let mut session = running.session.lock().await;
        if tokio::time::timeout(timeout, session.reconcile_on_stop())
            .await
            .is_err()
        {
            warn!("Reconciliation on stop timed out after {:?}", timeout);
        }
        session.persist(false).await;

        if let Ok(mut last) = self.last_view.lock() {
            *last = session.view();
        }
        info!("Session stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| !r.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn status(&self) -> SessionStatus {
        let (is_running, view) = {
            let running = self.running.lock().await;
            match running.as_ref() {
                Some(r) => (
                    !r.handle.is_finished(),
                    r.view.lock().map(|v| v.clone()).unwrap_or_default(),
                ),
                None => (
                    false,
                    self.last_view.lock().map(|v| v.clone()).unwrap_or_default(),
                ),
            }
        };

        let ledger = self.deps.ledger.snapshot();
        let now = self.deps.clock.now();
        let time_to_close = view
            .close_time
            .map(|close| ((close - now).num_milliseconds() as f64 / 1000.0).max(0.0));

        SessionStatus {
            is_running,
            session_state: view.phase,
            current_market_id: view.market_id,
            time_to_close,
            position_state: view.position_state,
            position: view.position,
            pending_order: view.pending_order,
            positions_taken: view.positions_taken,
            last_action: view.last_action,
            total_pnl: ledger.total_pnl,
            trades_count: ledger.trades_count,
            wins: ledger.wins,
            losses: ledger.losses,
            balance: ledger.balance,
            paper_trading: self.config.paper_trading,
        }
    }
}
