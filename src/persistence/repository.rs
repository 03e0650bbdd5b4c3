//! Database Repository
//!
//! Data access for the bot state row, the fill log and closed positions.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error};

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::repositories::session_store::{
    ClosedPositionRecord, EngineStateRecord, FillRecord, SessionStore, StoreError,
};
use crate::domain::services::position_ledger::LedgerSnapshot;

/// Repository for the single-row bot_state table
pub struct BotStateRepository {
    pool: DbPool,
}

impl BotStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Fetch the state row, creating it with defaults on first use
    pub async fn get_or_create(&self, paper_trading: bool, balance: f64) -> Result<BotStateRecord, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO bot_state (id, is_running, positions_taken, balance, paper_trading, updated_at)
            VALUES (1, 0, 0, ?1, ?2, ?3)
            "#,
        )
        .bind(balance)
        .bind(paper_trading)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create bot state: {}", e);
            DatabaseError::QueryError(format!("Failed to create bot state: {}", e))
        })?;

        let record = sqlx::query_as::<_, BotStateRecord>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                error!("Failed to load bot state: {}", e);
                DatabaseError::QueryError(format!("Failed to load bot state: {}", e))
            })?;

        tx.commit().await?;
        Ok(record)
    }

    pub async fn get(&self) -> Result<Option<BotStateRecord>, DatabaseError> {
        sqlx::query_as::<_, BotStateRecord>("SELECT * FROM bot_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load bot state: {}", e);
                DatabaseError::QueryError(format!("Failed to load bot state: {}", e))
            })
    }

    pub async fn save(&self, state: &EngineStateRecord) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO bot_state (
                id, is_running, current_market_id, last_action, positions_taken,
                balance, total_pnl, trades_count, wins, losses, paper_trading, updated_at
            )
            VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                is_running = excluded.is_running,
                current_market_id = excluded.current_market_id,
                last_action = excluded.last_action,
                positions_taken = excluded.positions_taken,
                balance = excluded.balance,
                total_pnl = excluded.total_pnl,
                trades_count = excluded.trades_count,
                wins = excluded.wins,
                losses = excluded.losses,
                paper_trading = excluded.paper_trading,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.is_running)
        .bind(&state.current_market_id)
        .bind(&state.last_action)
        .bind(state.positions_taken as i64)
        .bind(state.ledger.balance)
        .bind(state.ledger.total_pnl)
        .bind(state.ledger.trades_count as i64)
        .bind(state.ledger.wins as i64)
        .bind(state.ledger.losses as i64)
        .bind(state.paper_trading)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to save bot state: {}", e);
            DatabaseError::QueryError(format!("Failed to save bot state: {}", e))
        })?;

        tx.commit().await?;
        debug!("Saved bot state (running={})", state.is_running);
        Ok(())
    }
}

/// Trade repository
pub struct TradeRepository {
    pool: DbPool,
}

impl TradeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, fill: &FillRecord) -> Result<TradeRecord, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, TradeRecord>(
            r#"
            INSERT INTO trades (
                market_id, token_id, outcome, side, price, size, fee, order_id, paper, executed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING *
            "#,
        )
        .bind(&fill.market_id)
        .bind(&fill.token_id)
        .bind(&fill.outcome)
        .bind(fill.side.to_string())
        .bind(fill.price)
        .bind(fill.size)
        .bind(fill.fee)
        .bind(&fill.order_id)
        .bind(fill.paper)
        .bind(fill.executed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create trade: {}", e);
            DatabaseError::QueryError(format!("Failed to create trade: {}", e))
        })?;

        tx.commit().await?;
        debug!("Created trade: {} {} {}", record.id, record.side, record.token_id);
        Ok(record)
    }

    pub async fn get_by_market(&self, market_id: &str) -> Result<Vec<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>(
            "SELECT * FROM trades WHERE market_id = ?1 ORDER BY executed_at ASC, id ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get trades for {}: {}", market_id, e);
            DatabaseError::QueryError(format!("Failed to get trades: {}", e))
        })
    }

    pub async fn get_recent(&self, limit: i64) -> Result<Vec<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>("SELECT * FROM trades ORDER BY id DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get recent trades: {}", e);
                DatabaseError::QueryError(format!("Failed to get recent trades: {}", e))
            })
    }
}

/// Closed position repository
pub struct PositionRepository {
    pool: DbPool,
}

impl PositionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, position: &ClosedPositionRecord) -> Result<PositionRecord, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, PositionRecord>(
            r#"
            INSERT INTO positions (
                market_id, token_id, outcome, entry_price, exit_price, size,
                net_pnl, exit_reason, opened_at, closed_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            RETURNING *
            "#,
        )
        .bind(&position.market_id)
        .bind(&position.token_id)
        .bind(&position.outcome)
        .bind(position.entry_price)
        .bind(position.exit_price)
        .bind(position.size)
        .bind(position.net_pnl)
        .bind(position.exit_reason.to_string())
        .bind(position.opened_at)
        .bind(position.closed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to record closed position: {}", e);
            DatabaseError::QueryError(format!("Failed to record closed position: {}", e))
        })?;

        tx.commit().await?;
        debug!("Recorded closed position {} ({})", record.id, record.exit_reason);
        Ok(record)
    }

    pub async fn get_by_market(&self, market_id: &str) -> Result<Vec<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE market_id = ?1 ORDER BY closed_at ASC, id ASC",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get positions for {}: {}", market_id, e);
            DatabaseError::QueryError(format!("Failed to get positions: {}", e))
        })
    }

    pub async fn count(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM positions")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DatabaseError::QueryError(format!("Failed to count positions: {}", e)))?;
        Ok(row.0)
    }
}

/// [`SessionStore`] backed by the SQLite repositories
pub struct SqliteSessionStore {
    state: BotStateRepository,
    trades: TradeRepository,
    positions: PositionRepository,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            state: BotStateRepository::new(pool.clone()),
            trades: TradeRepository::new(pool.clone()),
            positions: PositionRepository::new(pool),
        }
    }
}

fn store_error(e: DatabaseError) -> StoreError {
    StoreError(e.to_string())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load_state(&self) -> Result<Option<EngineStateRecord>, StoreError> {
        let record = self.state.get().await.map_err(store_error)?;
        Ok(record.map(|r| EngineStateRecord {
            is_running: r.is_running,
            current_market_id: r.current_market_id,
            last_action: r.last_action,
            positions_taken: r.positions_taken.max(0) as u32,
            ledger: LedgerSnapshot {
                balance: r.balance,
                total_pnl: r.total_pnl,
                trades_count: r.trades_count.max(0) as u32,
                wins: r.wins.max(0) as u32,
                losses: r.losses.max(0) as u32,
            },
            paper_trading: r.paper_trading,
        }))
    }

    async fn save_state(&self, state: &EngineStateRecord) -> Result<(), StoreError> {
        self.state.save(state).await.map_err(store_error)
    }

    async fn record_fill(&self, fill: &FillRecord) -> Result<(), StoreError> {
        self.trades.create(fill).await.map(|_| ()).map_err(store_error)
    }

    async fn record_closed_position(&self, position: &ClosedPositionRecord) -> Result<(), StoreError> {
        self.positions
            .create(position)
            .await
            .map(|_| ())
            .map_err(store_error)
    }
}
