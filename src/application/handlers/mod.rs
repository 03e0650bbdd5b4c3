pub mod control_handler;
