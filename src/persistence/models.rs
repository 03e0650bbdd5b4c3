//! Database Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The single bot_state row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BotStateRecord {
    pub id: i64,
    pub is_running: bool,
    pub current_market_id: Option<String>,
    pub last_action: Option<String>,
    pub positions_taken: i64,
    pub balance: f64,
    pub total_pnl: f64,
    pub trades_count: i64,
    pub wins: i64,
    pub losses: i64,
    pub paper_trading: bool,
    pub updated_at: DateTime<Utc>,
}

/// Trade record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub market_id: String,
    pub token_id: String,
    pub outcome: String,
    pub side: String, // "BUY" or "SELL"
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub order_id: String,
    pub paper: bool,
    pub executed_at: DateTime<Utc>,
}

/// Closed position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: i64,
    pub market_id: String,
    pub token_id: String,
    pub outcome: String,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub size: f64,
    pub net_pnl: f64,
    pub exit_reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}
