//! Shared fixtures for the session integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use updown_engine::application::market_session::{MarketSession, SessionConfig, SessionDeps};
use updown_engine::domain::entities::market_window::{MarketWindow, OutcomeToken};
use updown_engine::domain::entities::order::{OrderRequest, OrderSnapshot, OrderStatus};
use updown_engine::domain::repositories::broker_adapter::{
    BookLevel, BookSide, BrokerAdapter, BrokerError, BrokerResult,
};
use updown_engine::domain::repositories::clock::{Clock, ManualClock};
use updown_engine::domain::repositories::market_feed::{FeedError, MarketFeed};
use updown_engine::domain::repositories::session_store::{
    ClosedPositionRecord, EngineStateRecord, FillRecord, SessionStore, StoreError,
};
use updown_engine::domain::services::entry_signal::{EntrySignalConfig, EntrySignalEvaluator};
use updown_engine::domain::services::fees::FeeModel;
use updown_engine::domain::services::order_fill_engine::{OrderFillConfig, OrderFillEngine};
use updown_engine::domain::services::position_ledger::PositionLedger;
use updown_engine::domain::services::risk_exit_monitor::{RiskExitConfig, RiskExitMonitor};

pub const TOKEN_UP: &str = "1111";
pub const TOKEN_DOWN: &str = "2222";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 18, 14, 5, 0).unwrap()
}

pub fn window(id: &str, close_time: DateTime<Utc>) -> MarketWindow {
    MarketWindow::new(
        id,
        "Bitcoin Up or Down",
        close_time,
        OutcomeToken::new(TOKEN_UP, "Up"),
        OutcomeToken::new(TOKEN_DOWN, "Down"),
    )
    .unwrap()
}

/// Feed returning whatever window the test put in it
#[derive(Default)]
pub struct ScriptedFeed {
    window: Mutex<Option<MarketWindow>>,
    pub requests: Mutex<Vec<Option<String>>>,
}

impl ScriptedFeed {
    pub fn with(window: MarketWindow) -> Self {
        let feed = Self::default();
        feed.set(Some(window));
        feed
    }

    pub fn set(&self, window: Option<MarketWindow>) {
        *self.window.lock().unwrap() = window;
    }
}

#[async_trait]
impl MarketFeed for ScriptedFeed {
    async fn current_window(&self, pinned: Option<&str>) -> Result<Option<MarketWindow>, FeedError> {
        self.requests.lock().unwrap().push(pinned.map(str::to_string));
        Ok(self.window.lock().unwrap().clone())
    }
}

/// Store keeping everything in memory
#[derive(Default)]
pub struct MemoryStore {
    pub state: Mutex<Option<EngineStateRecord>>,
    pub fills: Mutex<Vec<FillRecord>>,
    pub closed: Mutex<Vec<ClosedPositionRecord>>,
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_state(&self) -> Result<Option<EngineStateRecord>, StoreError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save_state(&self, state: &EngineStateRecord) -> Result<(), StoreError> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn record_fill(&self, fill: &FillRecord) -> Result<(), StoreError> {
        self.fills.lock().unwrap().push(fill.clone());
        Ok(())
    }

    async fn record_closed_position(&self, position: &ClosedPositionRecord) -> Result<(), StoreError> {
        self.closed.lock().unwrap().push(position.clone());
        Ok(())
    }
}

/// Broker whose orders rest on the book and never fill on their own
///
/// Cancels land unless `sticky` is set. Each placement can advance the clock
/// and wait, to simulate a slow venue.
pub struct RestingBroker {
    clock: Arc<ManualClock>,
    price: Mutex<f64>,
    pub advance_per_order: chrono::Duration,
    pub place_delay: Duration,
    pub sticky: AtomicBool,
    tokens: Mutex<f64>,
    orders: Mutex<HashMap<String, OrderSnapshot>>,
    next_id: AtomicU64,
    pub placed: AtomicUsize,
    pub cancel_all_calls: AtomicUsize,
}

impl RestingBroker {
    pub fn new(clock: Arc<ManualClock>, price: f64) -> Self {
        Self {
            clock,
            price: Mutex::new(price),
            advance_per_order: chrono::Duration::zero(),
            place_delay: Duration::ZERO,
            sticky: AtomicBool::new(false),
            tokens: Mutex::new(0.0),
            orders: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            placed: AtomicUsize::new(0),
            cancel_all_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = price;
    }

    /// Outcome-token balance reported for every token
    pub fn set_tokens(&self, tokens: f64) {
        *self.tokens.lock().unwrap() = tokens;
    }

    /// Venue-side fill of a resting order
    pub fn fill(&self, order_id: &str) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            order.status = OrderStatus::Filled;
            order.size_matched = 100.0;
        }
    }

    pub fn live_orders(&self) -> usize {
        self.orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status.is_live())
            .count()
    }

    pub fn last_order_id(&self) -> Option<String> {
        let n = self.next_id.load(Ordering::SeqCst);
        (n > 1).then(|| format!("rest-{}", n - 1))
    }
}

#[async_trait]
impl BrokerAdapter for RestingBroker {
    fn name(&self) -> &str {
        "resting"
    }

    async fn get_price(&self, _token_id: &str) -> BrokerResult<f64> {
        Ok(*self.price.lock().unwrap())
    }

    async fn get_order_book_levels(
        &self,
        _token_id: &str,
        _side: BookSide,
        _depth: usize,
    ) -> BrokerResult<Vec<BookLevel>> {
        Err(BrokerError::Network("book unavailable".to_string()))
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String> {
        if !self.place_delay.is_zero() {
            tokio::time::sleep(self.place_delay).await;
        }
        let id = format!("rest-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.orders.lock().unwrap().insert(
            id.clone(),
            OrderSnapshot {
                order_id: id.clone(),
                status: OrderStatus::Open,
                size_matched: 0.0,
                price: order.price.value(),
            },
        );
        self.placed.fetch_add(1, Ordering::SeqCst);
        self.clock.advance(self.advance_per_order);
        Ok(id)
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        if self.sticky.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            if order.status.is_live() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BrokerResult<()> {
        self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
        if self.sticky.load(Ordering::SeqCst) {
            return Ok(());
        }
        for order in self.orders.lock().unwrap().values_mut() {
            if order.status.is_live() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn get_balance(&self) -> BrokerResult<f64> {
        Ok(1000.0)
    }

    async fn get_token_balance(&self, _token_id: &str) -> BrokerResult<Option<f64>> {
        Ok(Some(*self.tokens.lock().unwrap()))
    }
}

pub fn fill_config() -> OrderFillConfig {
    OrderFillConfig {
        settle_delay: Duration::ZERO,
        ..OrderFillConfig::default()
    }
}

pub fn session_config(max_positions: u32) -> SessionConfig {
    SessionConfig {
        max_positions,
        position_check_interval: Duration::from_millis(5),
        market_scan_interval: Duration::from_millis(5),
        stop_reconcile_timeout: Duration::from_secs(2),
        ..SessionConfig::default()
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub feed: Arc<ScriptedFeed>,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<PositionLedger>,
    pub deps: SessionDeps,
}

/// Wire the strategy services over `broker` with production defaults
pub fn harness(
    broker: Arc<dyn BrokerAdapter>,
    clock: Arc<ManualClock>,
    feed: Arc<ScriptedFeed>,
    fill: OrderFillConfig,
) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let ledger = Arc::new(PositionLedger::new(FeeModel::default(), 1000.0));
    let fill_engine = Arc::new(OrderFillEngine::new(broker.clone(), ledger.clone(), fill));
    let as_clock: Arc<dyn Clock> = clock.clone();

    let deps = SessionDeps {
        broker,
        feed: feed.clone(),
        clock: as_clock,
        ledger: ledger.clone(),
        fill_engine,
        risk: RiskExitMonitor::new(RiskExitConfig::default()),
        entry: EntrySignalEvaluator::new(EntrySignalConfig::default()),
        store: store.clone(),
    };

    Harness {
        clock,
        feed,
        store,
        ledger,
        deps,
    }
}

impl Harness {
    pub fn session(&self, max_positions: u32) -> MarketSession {
        MarketSession::new(self.deps.clone(), session_config(max_positions), None)
    }
}
