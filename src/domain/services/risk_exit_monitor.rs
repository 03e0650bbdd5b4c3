use crate::domain::entities::position::{ExitReason, Position, PositionState};
use crate::domain::errors::ValidationError;
use crate::domain::value_objects::price::{round_to_tick, Price};

/// Exit thresholds
#[derive(Debug, Clone)]
pub struct RiskExitConfig {
    pub target_price: f64,
    /// Distance below the entry price at which the stoploss sits
    pub stoploss_offset: f64,
    pub min_tick: f64,
    /// Exit unconditionally at or below this many seconds to close
    pub force_close_threshold_secs: f64,
    /// Give up on an unconfirmed entry at or below this many seconds to close
    pub cancel_threshold_secs: f64,
}

impl Default for RiskExitConfig {
    fn default() -> Self {
        Self {
            target_price: 0.99,
            stoploss_offset: 0.15,
            min_tick: 0.01,
            force_close_threshold_secs: 5.0,
            cancel_threshold_secs: 10.0,
        }
    }
}

/// What the session should do with its position this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskAction {
    Hold,
    Exit(ExitReason),
    /// Entry order still unconfirmed and the window is closing
    CancelPendingEntry,
}

/// Decides exits for the open position of a session
///
/// Checks run in a fixed order: force-close, target, stoploss and finally the
/// cancel of an unconfirmed entry. The first match wins.
#[derive(Debug, Clone)]
pub struct RiskExitMonitor {
    config: RiskExitConfig,
}

impl RiskExitMonitor {
    pub fn new(config: RiskExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskExitConfig {
        &self.config
    }

    /// `max(entry - offset, min_tick)`, rounded to the tick grid
    pub fn stoploss_price(&self, entry_price: Price) -> Result<Price, ValidationError> {
        stoploss_price(entry_price.value(), self.config.stoploss_offset, self.config.min_tick)
    }

    pub fn evaluate(
        &self,
        state: &PositionState,
        current_price: Option<f64>,
        seconds_to_close: f64,
    ) -> RiskAction {
        match state {
            PositionState::Open(position) => {
                self.evaluate_open(position, current_price, seconds_to_close)
            }
            PositionState::PendingFill(_) if seconds_to_close <= self.config.cancel_threshold_secs => {
                RiskAction::CancelPendingEntry
            }
            _ => RiskAction::Hold,
        }
    }

    fn evaluate_open(
        &self,
        position: &Position,
        current_price: Option<f64>,
        seconds_to_close: f64,
    ) -> RiskAction {
        if seconds_to_close <= self.config.force_close_threshold_secs {
            return RiskAction::Exit(ExitReason::ForceClose);
        }

        // without a price only the time-based exit can fire
        let Some(price) = current_price else {
            return RiskAction::Hold;
        };

        if price >= self.config.target_price {
            RiskAction::Exit(ExitReason::Target)
        } else if price <= position.stoploss_price.value() {
            RiskAction::Exit(ExitReason::Stoploss)
        } else {
            RiskAction::Hold
        }
    }

    /// Reference price handed to the sell ladder for an exit
    pub fn exit_reference_price(&self, reason: ExitReason, current_price: Option<f64>) -> f64 {
        match (reason, current_price) {
            (ExitReason::Target, _) => self.config.target_price,
            (_, Some(price)) => price,
            (_, None) => self.config.min_tick,
        }
    }
}

pub fn stoploss_price(entry: f64, offset: f64, min_tick: f64) -> Result<Price, ValidationError> {
    let raw = round_to_tick(entry - offset, min_tick);
    Price::new(raw.max(min_tick))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::PendingEntry;
    use chrono::Utc;

    fn monitor() -> RiskExitMonitor {
        RiskExitMonitor::new(RiskExitConfig::default())
    }

    fn open_at(entry: f64) -> PositionState {
        let monitor = monitor();
        let entry_price = Price::new(entry).unwrap();
        PositionState::Open(Position {
            token_id: "111".to_string(),
            outcome: "Up".to_string(),
            entry_price,
            size: 100.0,
            stoploss_price: monitor.stoploss_price(entry_price).unwrap(),
            entry_order_id: "ord-1".to_string(),
            opened_at: Utc::now(),
            sell_attempted: false,
            exit_order_id: None,
        })
    }

    #[test]
    fn test_stoploss_price() {
        assert_eq!(stoploss_price(0.76, 0.15, 0.01).unwrap().value(), 0.61);
        assert_eq!(stoploss_price(0.10, 0.15, 0.01).unwrap().value(), 0.01);
        assert_eq!(stoploss_price(0.16, 0.15, 0.01).unwrap().value(), 0.01);
    }

    #[test]
    fn test_force_close_wins_over_price() {
        let state = open_at(0.76);
        assert_eq!(
            monitor().evaluate(&state, Some(0.99), 5.0),
            RiskAction::Exit(ExitReason::ForceClose)
        );
        assert_eq!(
            monitor().evaluate(&state, None, 3.0),
            RiskAction::Exit(ExitReason::ForceClose)
        );
    }

    #[test]
    fn test_target_and_stoploss() {
        let state = open_at(0.76);
        let m = monitor();
        assert_eq!(m.evaluate(&state, Some(0.99), 60.0), RiskAction::Exit(ExitReason::Target));
        assert_eq!(m.evaluate(&state, Some(0.61), 60.0), RiskAction::Exit(ExitReason::Stoploss));
        assert_eq!(m.evaluate(&state, Some(0.60), 60.0), RiskAction::Exit(ExitReason::Stoploss));
        assert_eq!(m.evaluate(&state, Some(0.80), 60.0), RiskAction::Hold);
        assert_eq!(m.evaluate(&state, None, 60.0), RiskAction::Hold);
    }

    #[test]
    fn test_pending_entry_cancelled_near_close() {
        let state = PositionState::PendingFill(PendingEntry {
            token_id: "111".to_string(),
            outcome: "Up".to_string(),
            reference_price: Price::new(0.76).unwrap(),
            size: 100.0,
            order_id: Some("ord-1".to_string()),
            submitted_at: Utc::now(),
        });
        let m = monitor();
        assert_eq!(m.evaluate(&state, Some(0.76), 30.0), RiskAction::Hold);
        assert_eq!(m.evaluate(&state, Some(0.76), 10.0), RiskAction::CancelPendingEntry);
    }

    #[test]
    fn test_idle_holds() {
        assert_eq!(monitor().evaluate(&PositionState::Idle, Some(0.5), 1.0), RiskAction::Hold);
    }

    #[test]
    fn test_exit_reference_price() {
        let m = monitor();
        assert_eq!(m.exit_reference_price(ExitReason::Target, Some(0.995)), 0.99);
        assert_eq!(m.exit_reference_price(ExitReason::Stoploss, Some(0.58)), 0.58);
        assert_eq!(m.exit_reference_price(ExitReason::ForceClose, None), 0.01);
    }
}
