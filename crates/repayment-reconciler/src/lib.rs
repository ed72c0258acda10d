pub mod config;
pub mod error;
pub mod reconciliation;
pub mod telemetry;
