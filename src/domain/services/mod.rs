pub mod entry_signal;
pub mod fees;
pub mod order_fill_engine;
pub mod position_ledger;
pub mod risk_exit_monitor;
pub mod trade_execution_error;
