pub mod market_window;
pub mod order;
pub mod position;
pub mod trading_session;
