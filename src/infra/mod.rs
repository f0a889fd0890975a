//! Infrastructure adapters and runtime bootstrap.

pub mod breaker;
pub mod db;
pub mod error;
pub mod eventlog;
pub mod http;
pub mod substrate;
pub mod telemetry;
