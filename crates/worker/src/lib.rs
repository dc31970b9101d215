//! The processing side of the tallyd pipeline: long-running worker
//! loops that claim jobs from the store, aggregate their events, and
//! commit results or retry decisions.

pub mod executor;

pub use executor::{StatsSnapshot, Worker, WorkerConfig, WorkerHandle};
