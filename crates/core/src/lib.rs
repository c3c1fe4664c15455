//! `jobsync-core`: queue and sync domain primitives.
//!
//! This crate contains **pure domain** types (no database, no network, no clock).

pub mod error;
pub mod id;
pub mod priority;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, StreamId, WorkerId};
pub use priority::PriorityTier;
