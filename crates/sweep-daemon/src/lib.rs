//! HTTP boundary for the storage deletion reconciler.

mod audit;
pub mod server;
pub mod telemetry;
