//! Per-window trading session

use crate::domain::entities::market_window::MarketWindow;
use crate::domain::entities::position::{ExitReason, Position, PositionState};
use crate::domain::errors::ValidationError;

/// Session scoped to one market window
///
/// Holds at most one position (pending, open or closing) through
/// [`PositionState`] and counts completed round trips in `positions_taken`.
#[derive(Debug, Clone)]
pub struct TradingSession {
    window: MarketWindow,
    positions_taken: u32,
    max_positions: u32,
    pub state: PositionState,
}

impl TradingSession {
    pub fn new(window: MarketWindow, max_positions: u32) -> Self {
        Self {
            window,
            positions_taken: 0,
            max_positions,
            state: PositionState::Idle,
        }
    }

    pub fn window(&self) -> &MarketWindow {
        &self.window
    }

    pub fn positions_taken(&self) -> u32 {
        self.positions_taken
    }

    pub fn max_positions(&self) -> u32 {
        self.max_positions
    }

    pub fn is_reentry(&self) -> bool {
        self.positions_taken > 0
    }

    pub fn limit_reached(&self) -> bool {
        self.positions_taken >= self.max_positions
    }

    /// Closes the position held in `Closing`, counting exactly one round trip
    pub fn complete_exit(&mut self) -> Result<(Position, ExitReason), ValidationError> {
        let closed = self.state.finish_exit()?;
        self.positions_taken += 1;
        Ok(closed)
    }

    /// Replace the window and reset every per-window counter
    pub fn rotate(&mut self, window: MarketWindow) {
        self.window = window;
        self.positions_taken = 0;
        self.state = PositionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market_window::OutcomeToken;
    use crate::domain::entities::position::PendingEntry;
    use crate::domain::value_objects::price::Price;
    use chrono::Utc;

    fn window(id: &str) -> MarketWindow {
        MarketWindow::new(
            id,
            "q",
            Utc::now(),
            OutcomeToken::new("111", "Up"),
            OutcomeToken::new("222", "Down"),
        )
        .unwrap()
    }

    fn run_round_trip(session: &mut TradingSession) {
        session
            .state
            .begin_entry(PendingEntry {
                token_id: "111".to_string(),
                outcome: "Up".to_string(),
                reference_price: Price::new(0.76).unwrap(),
                size: 10.0,
                order_id: None,
                submitted_at: Utc::now(),
            })
            .unwrap();
        session
            .state
            .confirm_fill(
                Price::new(0.76).unwrap(),
                10.0,
                Price::new(0.61).unwrap(),
                "o",
                Utc::now(),
            )
            .unwrap();
        session.state.begin_exit(ExitReason::Target).unwrap();
        session.complete_exit().unwrap();
    }

    #[test]
    fn test_round_trip_counts_once() {
        let mut session = TradingSession::new(window("w1"), 3);
        run_round_trip(&mut session);
        assert_eq!(session.positions_taken(), 1);
        assert!(session.is_reentry());
        assert!(!session.limit_reached());
    }

    #[test]
    fn test_failed_completion_does_not_count() {
        let mut session = TradingSession::new(window("w1"), 3);
        assert!(session.complete_exit().is_err());
        assert_eq!(session.positions_taken(), 0);
    }

    #[test]
    fn test_limit_and_rotation() {
        let mut session = TradingSession::new(window("w1"), 2);
        run_round_trip(&mut session);
        run_round_trip(&mut session);
        assert!(session.limit_reached());

        session.rotate(window("w2"));
        assert_eq!(session.positions_taken(), 0);
        assert_eq!(session.window().id, "w2");
        assert!(session.state.is_idle());
    }
}
