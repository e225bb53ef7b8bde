//! # Results Common Library
//!
//! Shared code for the election results services including:
//! - Error type and result alias
//! - Service configuration loading
//! - Database initialization and schema
//! - Ingestion event types and the event bus

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;

pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use events::{CycleState, CycleTrigger, EventBus, IngestionEvent};
