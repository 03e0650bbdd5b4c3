pub mod broker_adapter;
pub mod clock;
pub mod market_feed;
pub mod session_store;
