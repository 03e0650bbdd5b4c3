use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::market_window::MarketWindow;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("Market feed unreachable: {0}")]
    Network(String),

    #[error("Malformed market data: {0}")]
    Malformed(String),
}

/// Pull source for the market window currently open for trading
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Fetch the current window. `pinned` asks for a specific market id.
    /// `Ok(None)` means no tradable window is listed right now.
    async fn current_window(&self, pinned: Option<&str>) -> Result<Option<MarketWindow>, FeedError>;
}
