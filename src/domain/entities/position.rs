//! Position entity and the unified position state machine
//!
//! `PositionState` is the single source of truth for what a session holds:
//!
//! ```text
//! Idle --begin_entry--> PendingFill --confirm_fill--> Open --begin_exit--> Closing
//!  ^                        |                          ^                     |
//!  |                   abandon_entry                   +----exit_failed------+
//!  +------------------------+<-------------------finish_exit-----------------+
//! ```
//!
//! The same machine serves live and paper trading; the broker behind it is the
//! only difference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;
use crate::domain::value_objects::price::Price;

/// Why a position was exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Target,
    Stoploss,
    ForceClose,
    /// Remaining token balance was below the minimum order size
    Dust,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Target => write!(f, "TARGET"),
            ExitReason::Stoploss => write!(f, "STOPLOSS"),
            ExitReason::ForceClose => write!(f, "FORCE_CLOSE"),
            ExitReason::Dust => write!(f, "DUST"),
        }
    }
}

/// A confirmed holding of one outcome token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub token_id: String,
    pub outcome: String,
    pub entry_price: Price,
    pub size: f64,
    /// Fixed once at fill confirmation
    pub stoploss_price: Price,
    pub entry_order_id: String,
    pub opened_at: DateTime<Utc>,
    /// Set after an exit attempt whose outcome was not confirmed
    pub sell_attempted: bool,
    /// Sell order whose cancel could not be verified; resolved before any new sell
    #[serde(default)]
    pub exit_order_id: Option<String>,
}

/// Entry order submitted but not yet confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub token_id: String,
    pub outcome: String,
    pub reference_price: Price,
    pub size: f64,
    /// Last order id the fill engine submitted for this entry, if any
    pub order_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PositionState {
    Idle,
    PendingFill(PendingEntry),
    Open(Position),
    Closing {
        position: Position,
        reason: ExitReason,
    },
}

impl Default for PositionState {
    fn default() -> Self {
        PositionState::Idle
    }
}

impl PositionState {
    pub fn name(&self) -> &'static str {
        match self {
            PositionState::Idle => "idle",
            PositionState::PendingFill(_) => "pending_fill",
            PositionState::Open(_) => "open",
            PositionState::Closing { .. } => "closing",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, PositionState::Idle)
    }

    /// Token currently committed to, whether pending, open or closing
    pub fn token_id(&self) -> Option<&str> {
        match self {
            PositionState::Idle => None,
            PositionState::PendingFill(entry) => Some(&entry.token_id),
            PositionState::Open(position) => Some(&position.token_id),
            PositionState::Closing { position, .. } => Some(&position.token_id),
        }
    }

    pub fn position(&self) -> Option<&Position> {
        match self {
            PositionState::Open(position) => Some(position),
            PositionState::Closing { position, .. } => Some(position),
            _ => None,
        }
    }

    pub fn begin_entry(&mut self, entry: PendingEntry) -> Result<(), ValidationError> {
        match self {
            PositionState::Idle => {
                *self = PositionState::PendingFill(entry);
                Ok(())
            }
            other => Err(ValidationError::InvalidTransition(format!(
                "cannot begin entry while {}",
                other.name()
            ))),
        }
    }

    /// Record the order id of the latest submission for the pending entry
    pub fn track_entry_order(&mut self, order_id: &str) {
        if let PositionState::PendingFill(entry) = self {
            entry.order_id = Some(order_id.to_string());
        }
    }

    pub fn confirm_fill(
        &mut self,
        entry_price: Price,
        size: f64,
        stoploss_price: Price,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<&Position, ValidationError> {
        let entry = match self {
            PositionState::PendingFill(entry) => entry.clone(),
            other => {
                return Err(ValidationError::InvalidTransition(format!(
                    "cannot confirm fill while {}",
                    other.name()
                )))
            }
        };

        *self = PositionState::Open(Position {
            token_id: entry.token_id,
            outcome: entry.outcome,
            entry_price,
            size,
            stoploss_price,
            entry_order_id: order_id.to_string(),
            opened_at: now,
            sell_attempted: false,
            exit_order_id: None,
        });

        match self {
            PositionState::Open(position) => Ok(position),
            _ => Err(ValidationError::InvalidTransition(
                "position vanished after confirmation".to_string(),
            )),
        }
    }

    /// Drop an unconfirmed entry; no position was created
    pub fn abandon_entry(&mut self) -> Result<PendingEntry, ValidationError> {
        match std::mem::take(self) {
            PositionState::PendingFill(entry) => Ok(entry),
            other => {
                let name = other.name();
                *self = other;
                Err(ValidationError::InvalidTransition(format!(
                    "cannot abandon entry while {}",
                    name
                )))
            }
        }
    }

    pub fn begin_exit(&mut self, reason: ExitReason) -> Result<(), ValidationError> {
        match std::mem::take(self) {
            PositionState::Open(position) => {
                *self = PositionState::Closing { position, reason };
                Ok(())
            }
            other => {
                let name = other.name();
                *self = other;
                Err(ValidationError::InvalidTransition(format!(
                    "cannot begin exit while {}",
                    name
                )))
            }
        }
    }

    /// Remember (or forget) the sell order an exit left behind
    pub fn track_exit_order(&mut self, order_id: Option<&str>) {
        if let PositionState::Closing { position, .. } = self {
            position.exit_order_id = order_id.map(str::to_string);
        }
    }

    /// Exit did not complete; the position stays open and is re-checked next cycle
    pub fn exit_failed(&mut self) -> Result<(), ValidationError> {
        match std::mem::take(self) {
            PositionState::Closing { mut position, .. } => {
                position.sell_attempted = true;
                *self = PositionState::Open(position);
                Ok(())
            }
            other => {
                let name = other.name();
                *self = other;
                Err(ValidationError::InvalidTransition(format!(
                    "cannot fail exit while {}",
                    name
                )))
            }
        }
    }

    pub fn finish_exit(&mut self) -> Result<(Position, ExitReason), ValidationError> {
        match std::mem::take(self) {
            PositionState::Closing { position, reason } => Ok((position, reason)),
            other => {
                let name = other.name();
                *self = other;
                Err(ValidationError::InvalidTransition(format!(
                    "cannot finish exit while {}",
                    name
                )))
            }
        }
    }
}
