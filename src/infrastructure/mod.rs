pub mod clob_client;
pub mod gamma_feed;
pub mod live_broker;
pub mod order_signing;
pub mod paper_broker;
