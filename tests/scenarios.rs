//! End-to-end session scenarios over the paper broker and a manual clock

mod common;

use chrono::Duration as ChronoDuration;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use updown_engine::application::market_session::{MarketSession, SessionPhase};
use updown_engine::application::session_controller::{ControlError, SessionController};
use updown_engine::domain::entities::order::OrderSide;
use updown_engine::domain::entities::position::{ExitReason, PositionState};
use updown_engine::domain::repositories::clock::ManualClock;
use updown_engine::domain::services::order_fill_engine::{
    DeadlineGuard, FillOutcome, FillRequest, OrderFillConfig,
};
use updown_engine::domain::services::trade_execution_error::TradeExecutionError;
use updown_engine::infrastructure::paper_broker::{PaperBroker, PaperConfig, ScriptedPrices};
use updown_engine::task_runner::StopSignal;

struct PaperRig {
    h: Harness,
    prices: Arc<ScriptedPrices>,
}

impl PaperRig {
    fn new(close_in_secs: i64) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let feed = Arc::new(ScriptedFeed::with(window(
            "m1",
            t0() + ChronoDuration::seconds(close_in_secs),
        )));
        let prices = Arc::new(ScriptedPrices::new());
        let broker = Arc::new(PaperBroker::new(prices.clone(), PaperConfig::default()));
        Self {
            h: harness(broker, clock, feed, fill_config()),
            prices,
        }
    }

    /// Quote the Up token at `up`; Down is its complement
    fn quote(&self, up: f64) {
        self.prices.set(TOKEN_UP, up);
        self.prices.set(TOKEN_DOWN, ((1.0 - up) * 100.0).round() / 100.0);
    }
}

async fn cycle(session: &mut MarketSession) {
    let stop = StopSignal::new();
    session.run_cycle(&stop).await.expect("cycle failed");
}

fn state(session: &MarketSession) -> PositionState {
    session.session().expect("no session").state.clone()
}

fn taken(session: &MarketSession) -> u32 {
    session.session().map(|s| s.positions_taken()).unwrap_or(0)
}

#[tokio::test]
async fn scenario_a_trigger_then_stoploss() {
    let rig = PaperRig::new(120);
    let mut session = rig.h.session(3);

    rig.quote(0.60);
    cycle(&mut session).await;
    assert!(state(&session).is_idle());
    assert_eq!(session.phase(), SessionPhase::Active);

    rig.quote(0.76);
    cycle(&mut session).await;
    let position = state(&session).position().cloned().expect("position open");
    assert_eq!(position.token_id, TOKEN_UP);
    assert_eq!(position.entry_price.value(), 0.76);
    assert_eq!(position.stoploss_price.value(), 0.61);
    assert_eq!(taken(&session), 0);

    rig.quote(0.60);
    cycle(&mut session).await;
    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 1);

    let ledger = rig.h.ledger.snapshot();
    assert!((ledger.total_pnl - (-16.136)).abs() < 1e-6);
    assert_eq!(ledger.losses, 1);
    assert_eq!(ledger.wins, 0);

    let closed = rig.h.store.closed.lock().unwrap().clone();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::Stoploss);
    assert_eq!(closed[0].exit_price, Some(0.60));
    assert!((closed[0].net_pnl - (-16.136)).abs() < 1e-6);

    let fills = rig.h.store.fills.lock().unwrap().clone();
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].side, OrderSide::Buy);
    assert_eq!(fills[1].side, OrderSide::Sell);
}

#[tokio::test]
async fn scenario_b_target_exit() {
    let rig = PaperRig::new(120);
    let mut session = rig.h.session(3);

    rig.quote(0.76);
    cycle(&mut session).await;
    assert_eq!(state(&session).name(), "open");

    rig.quote(0.99);
    cycle(&mut session).await;
    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 1);

    let ledger = rig.h.ledger.snapshot();
    assert!((ledger.total_pnl - 22.825).abs() < 1e-6);
    assert_eq!(ledger.wins, 1);

    let closed = rig.h.store.closed.lock().unwrap().clone();
    assert_eq!(closed[0].exit_reason, ExitReason::Target);
    assert_eq!(closed[0].exit_price, Some(0.99));
}

#[tokio::test]
async fn scenario_c_entry_aborted_when_ladder_runs_into_close() {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(ScriptedFeed::with(window("m1", t0() + ChronoDuration::seconds(15))));
    let mut resting = RestingBroker::new(clock.clone(), 0.76);
    resting.advance_per_order = ChronoDuration::seconds(3);
    let broker = Arc::new(resting);
    let h = harness(broker.clone(), clock, feed, fill_config());
    let mut session = h.session(3);

    cycle(&mut session).await;

    // 15s -> 12s -> 9s: the third attempt never goes out
    assert_eq!(broker.placed.load(Ordering::SeqCst), 2);
    assert_eq!(broker.live_orders(), 0);
    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 0);
    assert!(session.last_action().unwrap().contains("aborted"));
    assert!(h.store.fills.lock().unwrap().is_empty());
}

#[tokio::test]
async fn scenario_c_unconfirmed_entry_cancelled_near_close() {
    let clock = Arc::new(ManualClock::new(t0()));
    let close = t0() + ChronoDuration::seconds(30);
    let feed = Arc::new(ScriptedFeed::with(window("m1", close)));
    let broker = Arc::new(RestingBroker::new(clock.clone(), 0.76));
    broker.sticky.store(true, Ordering::SeqCst);
    let h = harness(broker.clone(), clock.clone(), feed, fill_config());
    let mut session = h.session(3);

    cycle(&mut session).await;
    let pending = broker.last_order_id().unwrap();
    assert_eq!(state(&session).name(), "pending_fill");
    assert_eq!(session.view().pending_order, Some(pending.clone()));
    assert!(broker.cancel_all_calls.load(Ordering::SeqCst) >= 1);

    broker.sticky.store(false, Ordering::SeqCst);
    clock.set(close - ChronoDuration::seconds(8));
    cycle(&mut session).await;

    assert!(state(&session).is_idle());
    assert_eq!(session.phase(), SessionPhase::Expiring);
    assert_eq!(taken(&session), 0);
    assert_eq!(broker.live_orders(), 0);
    assert_eq!(broker.placed.load(Ordering::SeqCst), 1);
    assert!(h.ledger.holding(TOKEN_UP).is_none());
}

#[tokio::test]
async fn scenario_d_position_limit_until_rotation() {
    let rig = PaperRig::new(200);
    let mut session = rig.h.session(3);

    for round in 1..=3 {
        rig.quote(0.80);
        cycle(&mut session).await;
        assert_eq!(state(&session).name(), "open", "round {}", round);
        rig.quote(0.99);
        cycle(&mut session).await;
        assert_eq!(taken(&session), round);
    }

    rig.quote(0.80);
    cycle(&mut session).await;
    cycle(&mut session).await;
    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 3);
    assert_eq!(rig.h.store.fills.lock().unwrap().len(), 6);

    rig.h.feed.set(Some(window("m2", t0() + ChronoDuration::seconds(290))));
    cycle(&mut session).await;
    assert_eq!(session.view().market_id.as_deref(), Some("m2"));
    assert_eq!(taken(&session), 0);
    assert_eq!(state(&session).name(), "open");
}

#[tokio::test]
async fn reentry_requires_price_below_reentry_max() {
    let rig = PaperRig::new(120);
    let mut session = rig.h.session(3);

    rig.quote(0.76);
    cycle(&mut session).await;
    rig.quote(0.99);
    cycle(&mut session).await;
    assert_eq!(taken(&session), 1);

    rig.quote(0.92);
    cycle(&mut session).await;
    assert!(state(&session).is_idle());

    rig.quote(0.85);
    cycle(&mut session).await;
    assert_eq!(state(&session).name(), "open");
}

#[tokio::test]
async fn rejected_entry_leaves_counter_untouched() {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(ScriptedFeed::with(window("m1", t0() + ChronoDuration::seconds(120))));
    let prices = Arc::new(ScriptedPrices::new());
    let broker = Arc::new(PaperBroker::new(
        prices.clone(),
        PaperConfig {
            starting_balance: 10.0,
            ..PaperConfig::default()
        },
    ));
    let h = harness(broker, clock, feed, fill_config());
    let mut session = h.session(3);

    prices.set(TOKEN_UP, 0.76);
    prices.set(TOKEN_DOWN, 0.24);
    cycle(&mut session).await;

    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 0);
    assert!(session.last_action().unwrap().contains("entry failed"));
    assert!(h.store.closed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn force_close_counts_one_position() {
    let rig = PaperRig::new(60);
    let mut session = rig.h.session(3);

    rig.quote(0.80);
    cycle(&mut session).await;
    assert_eq!(state(&session).name(), "open");

    rig.h.clock.advance(ChronoDuration::seconds(56));
    cycle(&mut session).await;

    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 1);
    assert_eq!(session.phase(), SessionPhase::Expiring);
    let closed = rig.h.store.closed.lock().unwrap().clone();
    assert_eq!(closed[0].exit_reason, ExitReason::ForceClose);
    // fill-or-kill sells fill at the market, not at the floor
    assert_eq!(closed[0].exit_price, Some(0.80));
}

#[tokio::test]
async fn open_position_at_expiry_is_left_to_settle() {
    let rig = PaperRig::new(30);
    let mut session = rig.h.session(3);

    rig.quote(0.80);
    cycle(&mut session).await;
    assert_eq!(state(&session).name(), "open");

    // price feed goes quiet, nothing can exit
    rig.prices.clear(TOKEN_UP);
    rig.prices.clear(TOKEN_DOWN);
    rig.h.clock.advance(ChronoDuration::seconds(31));
    cycle(&mut session).await;

    assert!(session.session().is_none());
    assert_eq!(session.phase(), SessionPhase::Scanning);
    assert!(rig.h.ledger.holding(TOKEN_UP).is_none());
    assert!(rig.h.store.closed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn filled_prior_order_is_not_resubmitted() {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(ScriptedFeed::with(window("m1", t0() + ChronoDuration::seconds(120))));
    let broker = Arc::new(RestingBroker::new(clock.clone(), 0.76));
    broker.sticky.store(true, Ordering::SeqCst);
    let h = harness(broker.clone(), clock, feed, fill_config());
    let mut session = h.session(3);

    cycle(&mut session).await;
    assert_eq!(state(&session).name(), "pending_fill");
    let order_id = broker.last_order_id().unwrap();

    broker.fill(&order_id);
    cycle(&mut session).await;

    let position = state(&session).position().cloned().expect("position open");
    assert_eq!(position.entry_order_id, order_id);
    assert_eq!(broker.placed.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.fills.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unresolved_sell_is_resumed_instead_of_stacking_new_sells() {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(ScriptedFeed::with(window("m1", t0() + ChronoDuration::seconds(120))));
    let broker = Arc::new(RestingBroker::new(clock.clone(), 0.76));
    broker.sticky.store(true, Ordering::SeqCst);
    let h = harness(broker.clone(), clock, feed, fill_config());
    let mut session = h.session(3);

    cycle(&mut session).await;
    let entry_order = broker.last_order_id().unwrap();
    broker.fill(&entry_order);
    broker.set_tokens(100.0);
    cycle(&mut session).await;
    assert_eq!(state(&session).name(), "open");

    // the stoploss sell rests and its cancel never lands
    broker.set_price(0.60);
    cycle(&mut session).await;
    let position = state(&session).position().cloned().expect("position open");
    let sell_order = broker.last_order_id().unwrap();
    assert!(position.sell_attempted);
    assert_eq!(position.exit_order_id.as_deref(), Some(sell_order.as_str()));
    assert_eq!(broker.placed.load(Ordering::SeqCst), 2);
    assert_eq!(broker.live_orders(), 1);

    // next exit retries the same order rather than laddering a second sell
    cycle(&mut session).await;
    let position = state(&session).position().cloned().expect("position open");
    assert_eq!(position.exit_order_id.as_deref(), Some(sell_order.as_str()));
    assert_eq!(broker.placed.load(Ordering::SeqCst), 2);
    assert_eq!(broker.live_orders(), 1);

    broker.fill(&sell_order);
    cycle(&mut session).await;
    assert!(state(&session).is_idle());
    assert_eq!(taken(&session), 1);
    assert_eq!(broker.placed.load(Ordering::SeqCst), 2);

    let closed = h.store.closed.lock().unwrap().clone();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::Stoploss);
}

#[tokio::test]
async fn concurrent_fill_for_same_token_and_side_is_rejected() {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(ScriptedFeed::default());
    let mut resting = RestingBroker::new(clock.clone(), 0.76);
    resting.place_delay = Duration::from_millis(20);
    let broker = Arc::new(resting);
    let h = harness(broker.clone(), clock.clone(), feed, fill_config());

    let engine = h.deps.fill_engine.clone();
    let guard = DeadlineGuard::new(t0() + ChronoDuration::seconds(120), 10.0, h.deps.clock.clone());
    let stop = StopSignal::new();
    let request = FillRequest::new(TOKEN_UP, OrderSide::Buy, 0.76, 100.0);

    let (first, second) = tokio::join!(engine.attempt_fill(&request, &guard, &stop), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.attempt_fill(&request, &guard, &stop).await
    });

    assert!(matches!(first, FillOutcome::Failed { .. }));
    assert!(matches!(
        second,
        FillOutcome::Failed {
            reason: TradeExecutionError::DuplicateSubmission { .. },
            ..
        }
    ));
    assert_eq!(broker.placed.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn stop_cancels_in_flight_entry_and_persists() {
    let clock = Arc::new(ManualClock::new(t0()));
    let feed = Arc::new(ScriptedFeed::with(window("m1", t0() + ChronoDuration::seconds(120))));
    let broker = Arc::new(RestingBroker::new(clock.clone(), 0.76));
    let slow_fill = OrderFillConfig {
        settle_delay: Duration::from_millis(500),
        ..OrderFillConfig::default()
    };
    let h = harness(broker.clone(), clock, feed, slow_fill);
    let controller = SessionController::new(h.deps.clone(), session_config(3));

    assert_eq!(controller.stop().await, Err(ControlError::NotRunning));
    controller.start(None).await.unwrap();
    assert_eq!(controller.start(None).await, Err(ControlError::AlreadyRunning));
    assert!(controller.is_running().await);

    for _ in 0..100 {
        if broker.placed.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.placed.load(Ordering::SeqCst), 1);

    controller.stop().await.unwrap();

    assert!(!controller.is_running().await);
    assert_eq!(broker.live_orders(), 0);
    assert!(broker.cancel_all_calls.load(Ordering::SeqCst) >= 1);

    let status = controller.status().await;
    assert!(!status.is_running);
    assert_eq!(status.position_state, "idle");
    assert_eq!(status.positions_taken, 0);
    assert_eq!(status.current_market_id.as_deref(), Some("m1"));

    let persisted = h.store.state.lock().unwrap().clone().unwrap();
    assert!(!persisted.is_running);
    assert_eq!(persisted.positions_taken, 0);
}

#[tokio::test]
async fn controller_reports_open_position_and_restarts() {
    let rig = PaperRig::new(120);
    rig.quote(0.76);
    let controller = SessionController::new(rig.h.deps.clone(), session_config(3));

    controller.start(Some("m1".to_string())).await.unwrap();
    let mut status = controller.status().await;
    for _ in 0..100 {
        status = controller.status().await;
        if status.position_state == "open" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status.position_state, "open");
    assert!(status.is_running);
    assert_eq!(status.time_to_close, Some(120.0));
    assert_eq!(rig.h.feed.requests.lock().unwrap()[0].as_deref(), Some("m1"));

    controller.stop().await.unwrap();
    let stopped = controller.status().await;
    assert_eq!(stopped.position_state, "open");
    assert!(stopped.position.is_some());

    controller.start(None).await.unwrap();
    assert!(controller.is_running().await);
    controller.stop().await.unwrap();
}
