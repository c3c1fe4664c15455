//! Infrastructure layer: job queue, workers, incremental sync, DB wiring.

pub mod config;
pub mod db;
pub mod jobs;
pub mod sync;
pub mod workers;
