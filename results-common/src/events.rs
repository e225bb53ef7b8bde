//! Ingestion event types and event bus
//!
//! The scheduler publishes one event per state transition of an ingestion
//! cycle. Subscribers (status pages, alerting hooks, tests) receive every
//! event emitted after they subscribe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Ingestion cycle state
///
/// `Idle -> Fetching -> Normalizing -> Reconciling -> Committing -> Syncing -> Idle`.
/// A finished cycle records how it ended as one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Fetching,
    Normalizing,
    Reconciling,
    Committing,
    Syncing,
    /// New version committed and cache synchronized
    Completed,
    /// Feed unchanged (304, or no record differences)
    Unchanged,
    /// Cycle aborted; previous version still current
    Failed,
}

impl CycleState {
    /// True for the states a finished cycle ends in
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleState::Completed | CycleState::Unchanged | CycleState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Fetching => "fetching",
            CycleState::Normalizing => "normalizing",
            CycleState::Reconciling => "reconciling",
            CycleState::Committing => "committing",
            CycleState::Syncing => "syncing",
            CycleState::Completed => "completed",
            CycleState::Unchanged => "unchanged",
            CycleState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CycleState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "idle" => CycleState::Idle,
            "fetching" => CycleState::Fetching,
            "normalizing" => CycleState::Normalizing,
            "reconciling" => CycleState::Reconciling,
            "committing" => CycleState::Committing,
            "syncing" => CycleState::Syncing,
            "completed" => CycleState::Completed,
            "unchanged" => CycleState::Unchanged,
            "failed" => CycleState::Failed,
            other => {
                return Err(crate::Error::InvalidInput(format!(
                    "Unknown cycle state: {}",
                    other
                )))
            }
        })
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    Scheduled,
    Manual,
}

impl CycleTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleTrigger::Scheduled => "scheduled",
            CycleTrigger::Manual => "manual",
        }
    }
}

impl std::str::FromStr for CycleTrigger {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(CycleTrigger::Scheduled),
            "manual" => Ok(CycleTrigger::Manual),
            other => Err(crate::Error::InvalidInput(format!(
                "Unknown cycle trigger: {}",
                other
            ))),
        }
    }
}

/// Events emitted by the ingestion scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestionEvent {
    CycleStarted {
        cycle_id: Uuid,
        trigger: CycleTrigger,
        timestamp: DateTime<Utc>,
    },
    StageChanged {
        cycle_id: Uuid,
        old_state: CycleState,
        new_state: CycleState,
        timestamp: DateTime<Utc>,
    },
    CycleCompleted {
        cycle_id: Uuid,
        version: u64,
        added: usize,
        changed: usize,
        timestamp: DateTime<Utc>,
    },
    /// Feed not modified or no record differences; no version created
    CycleSkipped {
        cycle_id: Uuid,
        current_version: Option<u64>,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    CycleFailed {
        cycle_id: Uuid,
        failed_in: CycleState,
        error: String,
        /// Needs operator attention (integrity, regression, out-of-order feed)
        alert: bool,
        timestamp: DateTime<Utc>,
    },
    CacheInvalidated {
        version: u64,
        keys: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for ingestion events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestionEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestionEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestionEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
