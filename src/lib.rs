pub mod catalog;
pub mod config;
pub mod error;
pub mod progress;
pub mod ratings;
pub mod reconcile;
pub mod scheduler;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use error::{SyncError, ValidationError};
pub use reconcile::{run_sync, RunFailure, SyncSummary};
