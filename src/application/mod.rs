pub mod handlers;
pub mod market_session;
pub mod session_controller;
