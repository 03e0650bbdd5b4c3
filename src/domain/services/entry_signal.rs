//! Entry gating for one market window

use tracing::debug;

use crate::domain::entities::trading_session::TradingSession;

#[derive(Debug, Clone)]
pub struct EntrySignalConfig {
    pub trigger_price: f64,
    pub target_price: f64,
    /// Re-entries within a window must be strictly below this price
    pub reentry_max_price: f64,
    pub no_buy_threshold_secs: f64,
    /// No entries while more than this many seconds remain
    pub early_window_threshold_secs: f64,
}

impl Default for EntrySignalConfig {
    fn default() -> Self {
        Self {
            trigger_price: 0.75,
            target_price: 0.99,
            reentry_max_price: 0.90,
            no_buy_threshold_secs: 10.0,
            early_window_threshold_secs: 300.0,
        }
    }
}

/// Latest price of one outcome token
#[derive(Debug, Clone, PartialEq)]
pub struct TokenQuote {
    pub token_id: String,
    pub outcome: String,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// A position is already pending, open or closing
    PositionActive,
    TooCloseToExpiry,
    TooEarly,
    PositionLimit,
    NoSignal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Enter { token_id: String, outcome: String, price: f64 },
    Reject(RejectReason),
}

#[derive(Debug, Clone)]
pub struct EntrySignalEvaluator {
    config: EntrySignalConfig,
}

impl EntrySignalEvaluator {
    pub fn new(config: EntrySignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EntrySignalConfig {
        &self.config
    }

    /// Evaluate quotes in the order given; the first acceptable token wins
    pub fn evaluate(
        &self,
        session: &TradingSession,
        quotes: &[TokenQuote],
        seconds_to_close: f64,
    ) -> EntryDecision {
        if !session.state.is_idle() {
            return EntryDecision::Reject(RejectReason::PositionActive);
        }
        if seconds_to_close <= self.config.no_buy_threshold_secs {
            return EntryDecision::Reject(RejectReason::TooCloseToExpiry);
        }
        if seconds_to_close > self.config.early_window_threshold_secs {
            return EntryDecision::Reject(RejectReason::TooEarly);
        }
        if session.limit_reached() {
            return EntryDecision::Reject(RejectReason::PositionLimit);
        }

        let reentry = session.is_reentry();
        for quote in quotes {
            let Some(price) = quote.price else {
                continue;
            };
            if self.accepts(price, reentry) {
                debug!(
                    "Entry signal on {} ({}) at {:.4}, reentry={}",
                    quote.outcome, quote.token_id, price, reentry
                );
                return EntryDecision::Enter {
                    token_id: quote.token_id.clone(),
                    outcome: quote.outcome.clone(),
                    price,
                };
            }
        }

        EntryDecision::Reject(RejectReason::NoSignal)
    }

    pub fn accepts(&self, price: f64, reentry: bool) -> bool {
        let in_band = self.config.trigger_price <= price && price < self.config.target_price;
        in_band && (!reentry || price < self.config.reentry_max_price)
    }
}
