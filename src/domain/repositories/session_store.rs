use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::OrderSide;
use crate::domain::entities::position::ExitReason;
use crate::domain::services::position_ledger::LedgerSnapshot;

/// Confirmed fill as it is written to the trade log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillRecord {
    pub market_id: String,
    pub token_id: String,
    pub outcome: String,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub order_id: String,
    pub paper: bool,
    pub executed_at: DateTime<Utc>,
}

/// Round trip written when a position closes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPositionRecord {
    pub market_id: String,
    pub token_id: String,
    pub outcome: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub size: f64,
    pub net_pnl: f64,
    pub exit_reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Engine-wide state persisted after every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStateRecord {
    pub is_running: bool,
    pub current_market_id: Option<String>,
    pub last_action: Option<String>,
    pub positions_taken: u32,
    pub ledger: LedgerSnapshot,
    pub paper_trading: bool,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("Store error: {0}")]
pub struct StoreError(pub String);

/// Durable record of what the engine did; each call is one short transaction
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_state(&self) -> Result<Option<EngineStateRecord>, StoreError>;

    async fn save_state(&self, state: &EngineStateRecord) -> Result<(), StoreError>;

    async fn record_fill(&self, fill: &FillRecord) -> Result<(), StoreError>;

    async fn record_closed_position(&self, position: &ClosedPositionRecord) -> Result<(), StoreError>;
}
