//! Application services: ingress, workers, relay, updater, reads.

pub mod entities;
pub mod error;
pub mod ingress;
pub mod relay;
pub mod repos;
pub mod shutdown;
pub mod updater;
pub mod validation;
pub mod worker;
