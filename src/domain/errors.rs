use thiserror::Error;

/// Errors raised when constructing domain value objects and entities
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid size: {0}")]
    InvalidSize(String),

    #[error("Invalid market window: {0}")]
    InvalidMarketWindow(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Value must be finite")]
    MustBeFinite,
}

impl From<ValidationError> for String {
    fn from(error: ValidationError) -> Self {
        error.to_string()
    }
}
