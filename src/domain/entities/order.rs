use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;
use crate::domain::value_objects::price::Price;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Time in force of a submitted order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Good-til-cancelled limit order, rests on the book until filled or cancelled
    Limit,
    /// Fill-or-kill: executes completely and immediately or not at all
    Fok,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Limit => write!(f, "GTC"),
            OrderType::Fok => write!(f, "FOK"),
        }
    }
}

/// Order lifecycle as reported by a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    /// No further state change is expected from the venue
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Open => write!(f, "open"),
            OrderStatus::PartiallyFilled => write!(f, "partially_filled"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An order about to be submitted for one fill attempt
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub token_id: String,
    pub side: OrderSide,
    pub price: Price,
    pub size: f64,
    pub order_type: OrderType,
}

impl OrderRequest {
    pub fn new(
        token_id: impl Into<String>,
        side: OrderSide,
        price: f64,
        size: f64,
        order_type: OrderType,
    ) -> Result<Self, ValidationError> {
        let token_id = token_id.into();
        if token_id.is_empty() {
            return Err(ValidationError::InvalidSize(
                "order has no token".to_string(),
            ));
        }
        if !size.is_finite() || size <= 0.0 {
            return Err(ValidationError::InvalidSize(format!(
                "size must be positive, got {}",
                size
            )));
        }
        let price = Price::new(price)?;

        Ok(Self {
            token_id,
            side,
            price,
            size,
            order_type,
        })
    }

    pub fn notional(&self) -> f64 {
        self.price.notional(self.size)
    }
}

/// Broker's view of an order at query time
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub status: OrderStatus,
    /// Shares matched so far
    pub size_matched: f64,
    /// Execution price when known, otherwise the order's limit price
    pub price: f64,
}

impl OrderSnapshot {
    /// A filled status or any matched size counts as a fill
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled || self.size_matched > 0.0
    }
}
