/// Taker fee schedule: `fee(value) = max(value * rate, min_fee)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeModel {
    pub rate: f64,
    pub min_fee: f64,
}

impl FeeModel {
    pub fn new(rate: f64, min_fee: f64) -> Self {
        Self { rate, min_fee }
    }

    pub fn fee(&self, value: f64) -> f64 {
        (value * self.rate).max(self.min_fee)
    }

    /// Cash needed to buy `size` shares at `price`, fee included
    pub fn buy_cost(&self, price: f64, size: f64) -> f64 {
        let value = price * size;
        value + self.fee(value)
    }
}

impl Default for FeeModel {
    fn default() -> Self {
        Self::new(0.001, 0.001)
    }
}
