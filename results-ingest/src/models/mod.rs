//! Domain models for the results pipeline

pub mod cycle;
pub mod delta;
pub mod record;
pub mod view;

pub use cycle::{CycleId, CycleOutcome, CycleStatus};
pub use delta::{ChangedRecord, Delta, Regression};
pub use record::{IngestionSnapshot, PartyPreference, RecordKey, ResultRecord, SnapshotMeta};
pub use view::{affected_view_keys, view_key, AggregateView, CandidateTotal, ContestTotals, JurisdictionResult, PartyTotal, ViewBody, ViewFilters, ViewKind, ViewSummary};
