//! Five-minute up/down market window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

/// One side of a binary market
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeToken {
    pub token_id: String,
    /// Outcome label as listed by the venue ("Up", "Down", "Yes", "No")
    pub outcome: String,
    /// Last price quoted by the listing, informational only
    pub listed_price: Option<f64>,
}

impl OutcomeToken {
    pub fn new(token_id: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            outcome: outcome.into(),
            listed_price: None,
        }
    }
}

/// A market window: identifier, settlement time and its two complementary tokens
///
/// Windows are immutable once observed. A new window (different `id`) supersedes
/// the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketWindow {
    pub id: String,
    pub slug: Option<String>,
    pub question: String,
    pub close_time: DateTime<Utc>,
    pub token_a: OutcomeToken,
    pub token_b: OutcomeToken,
}

impl MarketWindow {
    pub fn new(
        id: impl Into<String>,
        question: impl Into<String>,
        close_time: DateTime<Utc>,
        token_a: OutcomeToken,
        token_b: OutcomeToken,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::InvalidMarketWindow(
                "market id is empty".to_string(),
            ));
        }
        if token_a.token_id.is_empty() || token_b.token_id.is_empty() {
            return Err(ValidationError::InvalidMarketWindow(format!(
                "market {} is missing an outcome token",
                id
            )));
        }
        if token_a.token_id == token_b.token_id {
            return Err(ValidationError::InvalidMarketWindow(format!(
                "market {} lists the same token twice",
                id
            )));
        }

        Ok(Self {
            id,
            slug: None,
            question: question.into(),
            close_time,
            token_a,
            token_b,
        })
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    /// Seconds until settlement; negative once the window has closed
    pub fn seconds_to_close(&self, now: DateTime<Utc>) -> f64 {
        (self.close_time - now).num_milliseconds() as f64 / 1000.0
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.seconds_to_close(now) <= 0.0
    }

    /// Tokens in evaluation order (A before B)
    pub fn tokens(&self) -> [&OutcomeToken; 2] {
        [&self.token_a, &self.token_b]
    }

    pub fn token(&self, token_id: &str) -> Option<&OutcomeToken> {
        self.tokens().into_iter().find(|t| t.token_id == token_id)
    }
}
