//! Trade execution errors with detailed context

use std::fmt;
use thiserror::Error;

use crate::domain::repositories::broker_adapter::BrokerError;

/// Detailed error type for entry/exit execution failures
///
/// None of these are fatal to the process: the session controller logs them
/// and ends the cycle without trading.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeExecutionError {
    /// Balance does not cover price x size plus the taker fee
    #[error("Insufficient balance: required {required:.4}, available {available:.4}")]
    InsufficientBalance { required: f64, available: f64 },

    /// Another fill for the same token and side is already in flight
    #[error("Duplicate submission for {token_id} {side}")]
    DuplicateSubmission { token_id: String, side: String },

    /// Broker refused or failed to accept the order
    #[error("Order placement failed: {reason}")]
    OrderPlacementFailed { reason: String },

    /// Order still reported live after cancel, retry and cancel-all
    #[error("Cancel of order {order_id} could not be verified")]
    CancelUnverified { order_id: String },

    /// Every ladder attempt finished without a fill
    #[error("No fill after {attempts} attempts")]
    LadderExhausted { attempts: u32 },

    /// No usable price for a token
    #[error("Price unavailable for {token_id}: {reason}")]
    PriceUnavailable { token_id: String, reason: String },

    /// Market listing is missing a token or a close time
    #[error("Malformed market: {reason}")]
    MalformedMarket { reason: String },

    /// Session was stopped while the fill was in progress
    #[error("Stopped while executing")]
    Stopped,

    /// Order parameters failed local validation
    #[error("Invalid order: {reason}")]
    InvalidOrder { reason: String },

    /// Ledger refused a mutation that would break its accounting
    #[error("Ledger error: {reason}")]
    Ledger { reason: String },
}

impl TradeExecutionError {
    /// Get the severity level of this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TradeExecutionError::DuplicateSubmission { .. } => ErrorSeverity::Minor,
            TradeExecutionError::PriceUnavailable { .. } => ErrorSeverity::Minor,
            TradeExecutionError::Stopped => ErrorSeverity::Minor,
            TradeExecutionError::InsufficientBalance { .. } => ErrorSeverity::Moderate,
            TradeExecutionError::LadderExhausted { .. } => ErrorSeverity::Moderate,
            TradeExecutionError::MalformedMarket { .. } => ErrorSeverity::Moderate,
            TradeExecutionError::InvalidOrder { .. } => ErrorSeverity::Moderate,
            TradeExecutionError::OrderPlacementFailed { .. } => ErrorSeverity::Critical,
            TradeExecutionError::CancelUnverified { .. } => ErrorSeverity::Critical,
            TradeExecutionError::Ledger { .. } => ErrorSeverity::Critical,
        }
    }

    /// Check if this error is recoverable (retrying next cycle might help)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TradeExecutionError::OrderPlacementFailed { .. } => true,
            TradeExecutionError::LadderExhausted { .. } => true,
            TradeExecutionError::PriceUnavailable { .. } => true,
            TradeExecutionError::MalformedMarket { .. } => true,
            TradeExecutionError::DuplicateSubmission { .. } => true,
            TradeExecutionError::CancelUnverified { .. } => true,

            TradeExecutionError::InsufficientBalance { .. } => false,
            TradeExecutionError::Stopped => false,
            TradeExecutionError::InvalidOrder { .. } => false,
            TradeExecutionError::Ledger { .. } => false,
        }
    }

    /// Get a short error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            TradeExecutionError::InsufficientBalance { .. } => "ERR_INSUFFICIENT_BALANCE",
            TradeExecutionError::DuplicateSubmission { .. } => "ERR_DUPLICATE_SUBMISSION",
            TradeExecutionError::OrderPlacementFailed { .. } => "ERR_ORDER_PLACEMENT",
            TradeExecutionError::CancelUnverified { .. } => "ERR_CANCEL_UNVERIFIED",
            TradeExecutionError::LadderExhausted { .. } => "ERR_LADDER_EXHAUSTED",
            TradeExecutionError::PriceUnavailable { .. } => "ERR_PRICE_UNAVAILABLE",
            TradeExecutionError::MalformedMarket { .. } => "ERR_MALFORMED_MARKET",
            TradeExecutionError::Stopped => "ERR_STOPPED",
            TradeExecutionError::InvalidOrder { .. } => "ERR_INVALID_ORDER",
            TradeExecutionError::Ledger { .. } => "ERR_LEDGER",
        }
    }
}

impl From<BrokerError> for TradeExecutionError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::InsufficientBalance {
                required,
                available,
            } => TradeExecutionError::InsufficientBalance {
                required,
                available,
            },
            BrokerError::InvalidOrder(reason) => TradeExecutionError::InvalidOrder { reason },
            other => TradeExecutionError::OrderPlacementFailed {
                reason: other.to_string(),
            },
        }
    }
}

/// Severity levels for trade execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected to occur occasionally
    Minor,
    /// Indicates a problem worth looking at
    Moderate,
    /// Needs immediate attention
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Minor => write!(f, "Minor"),
            ErrorSeverity::Moderate => write!(f, "Moderate"),
            ErrorSeverity::Critical => write!(f, "Critical"),
        }
    }
}

impl From<TradeExecutionError> for String {
    fn from(error: TradeExecutionError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_balance_error() {
        let error = TradeExecutionError::InsufficientBalance {
            required: 76.076,
            available: 50.0,
        };
        assert_eq!(
            error.to_string(),
            "Insufficient balance: required 76.0760, available 50.0000"
        );
        assert_eq!(error.severity(), ErrorSeverity::Moderate);
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_duplicate_submission_error() {
        let error = TradeExecutionError::DuplicateSubmission {
            token_id: "111".to_string(),
            side: "BUY".to_string(),
        };
        assert_eq!(error.to_string(), "Duplicate submission for 111 BUY");
        assert_eq!(error.error_code(), "ERR_DUPLICATE_SUBMISSION");
        assert_eq!(error.severity(), ErrorSeverity::Minor);
    }

    #[test]
    fn test_cancel_unverified_is_critical() {
        let error = TradeExecutionError::CancelUnverified {
            order_id: "0xabc".to_string(),
        };
        assert_eq!(error.severity(), ErrorSeverity::Critical);
        assert!(error.is_recoverable());
    }

    #[test]
    fn test_ladder_exhausted_error() {
        let error = TradeExecutionError::LadderExhausted { attempts: 5 };
        assert_eq!(error.to_string(), "No fill after 5 attempts");
        assert_eq!(error.error_code(), "ERR_LADDER_EXHAUSTED");
    }

    #[test]
    fn test_from_broker_error() {
        let error: TradeExecutionError = BrokerError::InsufficientBalance {
            required: 10.0,
            available: 1.0,
        }
        .into();
        assert!(matches!(
            error,
            TradeExecutionError::InsufficientBalance { .. }
        ));

        let error: TradeExecutionError = BrokerError::Network("timeout".to_string()).into();
        assert_eq!(error.error_code(), "ERR_ORDER_PLACEMENT");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Minor < ErrorSeverity::Moderate);
        assert!(ErrorSeverity::Moderate < ErrorSeverity::Critical);
    }

    #[test]
    fn test_error_to_string_conversion() {
        let message: String = TradeExecutionError::Stopped.into();
        assert_eq!(message, "Stopped while executing");
    }
}
