use crate::domain::errors::ValidationError;

/// Realized profit and loss of a closed position, net of fees
///
/// Negative values are losses. Only finite values are representable.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct PnL(f64);

impl PnL {
    /// # Errors
    /// Returns ValidationError::MustBeFinite if the value is NaN or infinite
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        Ok(PnL(value))
    }

    /// Get the raw value
    pub fn value(&self) -> f64 {
        self.0
    }

    /// A strictly positive result counts as a win; breakeven counts as a loss
    pub fn is_profit(&self) -> bool {
        self.0 > 0.0
    }

    pub fn is_loss(&self) -> bool {
        self.0 < 0.0
    }

    /// Create a zero PnL (breakeven)
    pub fn zero() -> Self {
        PnL(0.0)
    }

    /// Net P&L of a round trip: gross move minus the fee charged on each leg
    pub fn round_trip(
        entry_price: f64,
        exit_price: f64,
        size: f64,
        entry_fee: f64,
        exit_fee: f64,
    ) -> Result<Self, ValidationError> {
        PnL::new((exit_price - entry_price) * size - entry_fee - exit_fee)
    }
}

impl std::fmt::Display for PnL {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= 0.0 {
            write!(f, "+${:.2}", self.0)
        } else {
            write!(f, "-${:.2}", self.0.abs())
        }
    }
}

impl std::ops::Add for PnL {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        PnL(self.0 + other.0)
    }
}

impl std::ops::Sub for PnL {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        PnL(self.0 - other.0)
    }
}
