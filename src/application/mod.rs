pub mod bootstrap;
pub mod commands;
pub mod error;
pub mod mode_cycle;
pub mod rollover;
pub mod session_service;
pub mod watchdog;
