pub mod pnl;
pub mod price;
