//! Utility modules for results-ingest

pub mod backoff;
pub mod db_retry;

pub use backoff::Backoff;
pub use db_retry::retry_on_lock;
