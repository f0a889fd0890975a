//! Staffetta: a cache-first, event-driven middleware core.
//!
//! Four cooperating subsystems: the cache engine (single-flight, jittered
//! TTLs, negative entries), the transactional outbox with its relay, the
//! command ingress with its worker pool, and the distributed real-time hub.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod realtime;
