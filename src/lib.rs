//! Up/Down Engine Library
//!
//! Core components for trading five-minute up/down binary markets: entry
//! signals, the order fill ladder, risk exits, the position ledger and the
//! session loop that ties them together over a live or paper broker.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod task_runner;
