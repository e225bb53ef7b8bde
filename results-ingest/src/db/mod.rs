//! Database access for results-ingest

pub mod cycles;
pub mod records;

pub use records::ResultStore;
