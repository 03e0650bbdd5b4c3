//! Broker Adapter Trait
//!
//! `BrokerAdapter` is the one contract the strategy components trade through.
//! A live exchange connection and the paper simulator both implement it, so the
//! signal evaluator, fill engine and risk monitor never know which one they
//! are driving.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::order::{OrderRequest, OrderSide, OrderSnapshot};

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur during broker operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Insufficient balance: required {required:.4}, available {available:.4}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("Order not found: {0}")]
    NotFound(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl BrokerError {
    /// Retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Network(_) | BrokerError::Malformed(_))
    }
}

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bids,
    Asks,
}

impl BookSide {
    /// The side a taker on `side` trades against
    pub fn opposing(side: OrderSide) -> BookSide {
        match side {
            OrderSide::Buy => BookSide::Asks,
            OrderSide::Sell => BookSide::Bids,
        }
    }
}

/// A priced quantity resting on the book
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Current price of an outcome token
    async fn get_price(&self, token_id: &str) -> BrokerResult<f64>;

    /// Top `depth` levels of one side of the book, best level first
    async fn get_order_book_levels(
        &self,
        token_id: &str,
        side: BookSide,
        depth: usize,
    ) -> BrokerResult<Vec<BookLevel>>;

    /// Submit an order and return the broker-assigned order id
    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String>;

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderSnapshot>;

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()>;

    /// Cancel every open order on the account
    async fn cancel_all_orders(&self) -> BrokerResult<()>;

    /// Available collateral balance
    async fn get_balance(&self) -> BrokerResult<f64>;

    /// Shares held of an outcome token; `None` when the broker cannot tell
    async fn get_token_balance(&self, token_id: &str) -> BrokerResult<Option<f64>>;

    async fn is_healthy(&self) -> bool {
        true
    }
}
