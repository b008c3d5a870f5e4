pub mod backend;
pub mod config;
pub mod idempotency;
pub mod logging;
