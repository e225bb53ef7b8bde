//! Ingestion cycle status

use chrono::{DateTime, Utc};
use results_common::events::{CycleState, CycleTrigger};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier returned by `trigger_ingestion`
pub type CycleId = Uuid;

/// How a cycle that did not fail ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Feed answered 304 Not Modified
    NotModified { current_version: Option<u64> },
    /// Feed changed bytes but no record differs from the committed snapshot
    NoChanges { current_version: Option<u64> },
    /// New version committed
    Committed {
        version: u64,
        added: usize,
        changed: usize,
        invalidated_keys: usize,
    },
}

impl CycleOutcome {
    /// Version current after the cycle
    pub fn version(&self) -> Option<u64> {
        match self {
            CycleOutcome::NotModified { current_version }
            | CycleOutcome::NoChanges { current_version } => *current_version,
            CycleOutcome::Committed { version, .. } => Some(*version),
        }
    }
}

/// Status of one ingestion cycle, as reported by `ingestion_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStatus {
    pub cycle_id: CycleId,
    pub trigger: CycleTrigger,
    pub state: CycleState,
    /// Committed version when `state` is completed, current version otherwise
    pub version: Option<u64>,
    pub added: usize,
    pub changed: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CycleStatus {
    pub fn new(cycle_id: CycleId, trigger: CycleTrigger, current_version: Option<u64>) -> Self {
        Self {
            cycle_id,
            trigger,
            state: CycleState::Fetching,
            version: current_version,
            added: 0,
            changed: 0,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record a successful end
    pub fn finish(&mut self, outcome: &CycleOutcome) {
        self.state = match outcome {
            CycleOutcome::Committed { added, changed, .. } => {
                self.added = *added;
                self.changed = *changed;
                CycleState::Completed
            }
            _ => CycleState::Unchanged,
        };
        self.version = outcome.version();
        self.ended_at = Some(Utc::now());
    }

    /// Record a failure; `version` is left for the caller to confirm
    pub fn fail(&mut self, error: String) {
        self.state = CycleState::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }
}
