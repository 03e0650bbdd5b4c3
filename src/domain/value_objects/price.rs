use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

/// Price of an outcome token, bounded to the probability range [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64")]
pub struct Price(f64);

impl TryFrom<f64> for Price {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Price::new(value)
    }
}

impl Price {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::MustBeFinite);
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(ValidationError::InvalidPrice(format!(
                "{} is outside [0, 1]",
                value
            )));
        }
        Ok(Price(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Round to the nearest multiple of `tick`
    pub fn round_to_tick(&self, tick: f64) -> Price {
        Price(round_to_tick(self.0, tick).clamp(0.0, 1.0))
    }

    /// Notional value of `size` shares at this price
    pub fn notional(&self, size: f64) -> f64 {
        self.0 * size
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.0)
    }
}

/// Round `value` to the nearest multiple of `tick` (ticks are positive)
pub fn round_to_tick(value: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return value;
    }
    let steps = (value / tick).round();
    // strip binary noise such as 0.6100000000000001
    (steps * tick * 1e6).round() / 1e6
}

/// Floor a share size to two decimals so it never exceeds what is held
pub fn floor_size(size: f64) -> f64 {
    ((size * 100.0) + 1e-9).floor() / 100.0
}
