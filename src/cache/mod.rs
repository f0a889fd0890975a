//! Staffetta cache subsystem.
//!
//! Cache-aside over a shared key/value substrate:
//!
//! - **Jittered TTLs**: every write lands with `ttl ± 15%` so entries never
//!   expire in lockstep.
//! - **Negative entries**: a `:neg` sibling with a short TTL marks a key as
//!   known absent and suppresses repeated origin lookups.
//! - **Single-flight**: concurrent loads for one key collapse to a single
//!   loader invocation.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! base_ttl_secs = 300
//! negative_ttl_secs = 30
//! jitter_pct = 0.15
//! ```

mod config;
mod engine;
mod flight;
pub mod keys;
mod lock;

pub use config::CacheConfig;
pub use engine::{CacheEngine, CacheError, CacheStatus, Fetched, Lookup};
pub use flight::FlightGroup;

pub(crate) use lock::RecoverableRwLock;
