//! Ingestion scheduler
//!
//! A single actor task owns the cycle state. Callers talk to it through
//! `SchedulerHandle`; the running cycle reports stage changes and its result
//! back over a channel, so no state is shared between tasks.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use results_common::config::ServiceConfig;
use results_common::events::{CycleState, CycleTrigger, EventBus, IngestionEvent};

use crate::db::cycles::save_cycle;
use crate::error::{IngestError, SchedulerError};
use crate::models::{CycleId, CycleOutcome, CycleStatus};
use crate::services::pipeline::IngestionPipeline;

/// Finished cycles kept in memory
const HISTORY_LIMIT: usize = 64;

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// `None` disables periodic polling (manual triggers only)
    pub poll_interval: Option<Duration>,
    pub cycle_deadline: Duration,
}

impl SchedulerConfig {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            poll_interval: Some(Duration::from_secs(config.poll_interval_secs)),
            cycle_deadline: Duration::from_secs(config.cycle_deadline_secs),
        }
    }

    pub fn manual_only(mut self) -> Self {
        self.poll_interval = None;
        self
    }
}

enum Command {
    Trigger {
        reply: oneshot::Sender<CycleId>,
    },
    Status {
        cycle_id: CycleId,
        reply: oneshot::Sender<Option<CycleStatus>>,
    },
    Wait {
        cycle_id: CycleId,
        reply: oneshot::Sender<Option<CycleStatus>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages from a running cycle task back to the actor
enum Progress {
    Stage {
        cycle_id: CycleId,
        state: CycleState,
    },
    Finished {
        cycle_id: CycleId,
        result: Result<CycleOutcome, IngestError>,
    },
}

struct RunningCycle {
    status: CycleStatus,
    task: JoinHandle<()>,
    waiters: Vec<oneshot::Sender<Option<CycleStatus>>>,
}

/// Cloneable handle to the scheduler actor
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Start a cycle, or join the one already running. Returns its id.
    pub async fn trigger(&self) -> Result<CycleId, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Trigger { reply }).await?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Status of a running or recently finished cycle
    pub async fn status(&self, cycle_id: CycleId) -> Result<Option<CycleStatus>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { cycle_id, reply }).await?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Wait until `cycle_id` finishes. `None` if the scheduler does not
    /// know the cycle.
    pub async fn wait(&self, cycle_id: CycleId) -> Result<Option<CycleStatus>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Wait { cycle_id, reply }).await?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Abort any running cycle and stop the actor
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    async fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::Stopped)
    }
}

pub struct Scheduler {
    pipeline: Arc<IngestionPipeline>,
    pool: SqlitePool,
    events: EventBus,
    config: SchedulerConfig,
    commands: mpsc::Receiver<Command>,
    progress_tx: mpsc::UnboundedSender<Progress>,
    progress_rx: mpsc::UnboundedReceiver<Progress>,
    running: Option<RunningCycle>,
    history: VecDeque<CycleStatus>,
    current_version: Option<u64>,
}

impl Scheduler {
    /// Spawn the actor task
    pub fn spawn(
        pipeline: Arc<IngestionPipeline>,
        events: EventBus,
        config: SchedulerConfig,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            pool: pipeline.store().pool().clone(),
            pipeline,
            events,
            config,
            commands,
            progress_tx,
            progress_rx,
            running: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            current_version: None,
        };

        let task = tokio::spawn(scheduler.run());
        (SchedulerHandle { tx }, task)
    }

    async fn run(mut self) {
        match self.pipeline.current_version().await {
            Ok(version) => self.current_version = version,
            Err(e) => tracing::warn!(error = %e, "Could not read current version at startup"),
        }

        let mut ticker = self.config.poll_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        tracing::info!(
            poll_interval_secs = self.config.poll_interval.map(|p| p.as_secs()),
            deadline_secs = self.config.cycle_deadline.as_secs(),
            version = ?self.current_version,
            "Ingestion scheduler started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            self.abort_running().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(Command::Trigger { reply }) => {
                            let _ = reply.send(self.trigger());
                        }
                        Some(Command::Status { cycle_id, reply }) => {
                            let _ = reply.send(self.find_status(cycle_id));
                        }
                        Some(Command::Wait { cycle_id, reply }) => self.wait(cycle_id, reply),
                        // every handle dropped
                        None => {
                            self.abort_running().await;
                            break;
                        }
                    }
                }
                _ = next_tick(&mut ticker) => {
                    if self.running.is_some() {
                        tracing::debug!("Tick while a cycle is running, ignored");
                    } else {
                        self.start_cycle(CycleTrigger::Scheduled);
                    }
                }
                Some(progress) = self.progress_rx.recv() => {
                    self.handle_progress(progress).await;
                }
            }
        }

        tracing::info!("Ingestion scheduler stopped");
    }

    fn trigger(&mut self) -> CycleId {
        match &self.running {
            Some(running) => {
                tracing::debug!(cycle_id = %running.status.cycle_id, "Trigger coalesced into running cycle");
                running.status.cycle_id
            }
            None => self.start_cycle(CycleTrigger::Manual),
        }
    }

    fn wait(&mut self, cycle_id: CycleId, reply: oneshot::Sender<Option<CycleStatus>>) {
        if let Some(running) = self
            .running
            .as_mut()
            .filter(|r| r.status.cycle_id == cycle_id)
        {
            running.waiters.push(reply);
            return;
        }
        let _ = reply.send(self.find_status(cycle_id));
    }

    fn find_status(&self, cycle_id: CycleId) -> Option<CycleStatus> {
        if let Some(running) = &self.running {
            if running.status.cycle_id == cycle_id {
                return Some(running.status.clone());
            }
        }
        self.history
            .iter()
            .rev()
            .find(|s| s.cycle_id == cycle_id)
            .cloned()
    }

    fn start_cycle(&mut self, trigger: CycleTrigger) -> CycleId {
        let cycle_id = Uuid::new_v4();
        let status = CycleStatus::new(cycle_id, trigger, self.current_version);

        tracing::info!(%cycle_id, trigger = trigger.as_str(), "Ingestion cycle started");
        self.events.emit_lossy(IngestionEvent::CycleStarted {
            cycle_id,
            trigger,
            timestamp: Utc::now(),
        });

        let pipeline = Arc::clone(&self.pipeline);
        let progress = self.progress_tx.clone();
        let deadline = self.config.cycle_deadline;

        let task = tokio::spawn(async move {
            let stage_tx = progress.clone();
            let on_stage = move |state: CycleState| {
                let _ = stage_tx.send(Progress::Stage { cycle_id, state });
            };

            let result = pipeline.run_cycle(deadline, &on_stage).await;
            let _ = progress.send(Progress::Finished { cycle_id, result });
        });

        self.running = Some(RunningCycle {
            status,
            task,
            waiters: Vec::new(),
        });
        cycle_id
    }

    async fn handle_progress(&mut self, progress: Progress) {
        match progress {
            Progress::Stage { cycle_id, state } => {
                let Some(running) = self.running.as_mut() else {
                    return;
                };
                if running.status.cycle_id != cycle_id || running.status.state == state {
                    return;
                }
                let old_state = running.status.state;
                running.status.state = state;
                tracing::debug!(%cycle_id, from = %old_state, to = %state, "Cycle stage changed");
                self.events.emit_lossy(IngestionEvent::StageChanged {
                    cycle_id,
                    old_state,
                    new_state: state,
                    timestamp: Utc::now(),
                });
            }
            Progress::Finished { cycle_id, result } => {
                let is_current = self
                    .running
                    .as_ref()
                    .is_some_and(|r| r.status.cycle_id == cycle_id);
                if !is_current {
                    return;
                }
                if let Some(running) = self.running.take() {
                    self.finish(running, result).await;
                }
            }
        }
    }

    async fn finish(&mut self, running: RunningCycle, result: Result<CycleOutcome, IngestError>) {
        let RunningCycle {
            mut status,
            waiters,
            ..
        } = running;
        let cycle_id = status.cycle_id;

        match result {
            Ok(outcome) => {
                status.finish(&outcome);
                self.current_version = outcome.version();
                match &outcome {
                    CycleOutcome::Committed {
                        version,
                        added,
                        changed,
                        invalidated_keys,
                    } => {
                        tracing::info!(
                            %cycle_id,
                            version,
                            added,
                            changed,
                            invalidated_keys,
                            "Ingestion cycle committed"
                        );
                        self.events.emit_lossy(IngestionEvent::CycleCompleted {
                            cycle_id,
                            version: *version,
                            added: *added,
                            changed: *changed,
                            timestamp: Utc::now(),
                        });
                    }
                    CycleOutcome::NotModified { current_version } => {
                        self.skipped(cycle_id, *current_version, "feed not modified");
                    }
                    CycleOutcome::NoChanges { current_version } => {
                        self.skipped(cycle_id, *current_version, "no record changes");
                    }
                }
            }
            Err(error) => {
                let failed_in = status.state;
                let alert = error.is_alert_worthy();
                if alert {
                    tracing::error!(%cycle_id, stage = %failed_in, error = %error, "Ingestion cycle failed, operator attention needed");
                } else {
                    tracing::warn!(%cycle_id, stage = %failed_in, error = %error, "Ingestion cycle failed, will retry next tick");
                }
                status.fail(error.to_string());
                self.refresh_version().await;
                status.version = self.current_version;
                self.events.emit_lossy(IngestionEvent::CycleFailed {
                    cycle_id,
                    failed_in,
                    error: error.to_string(),
                    alert,
                    timestamp: Utc::now(),
                });
            }
        }

        self.record(status, waiters).await;
    }

    async fn abort_running(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let RunningCycle {
            mut status,
            task,
            waiters,
        } = running;
        task.abort();
        let _ = task.await;

        let failed_in = status.state;
        tracing::warn!(cycle_id = %status.cycle_id, stage = %failed_in, "Running cycle aborted by shutdown");
        status.fail("Scheduler shut down".to_string());
        self.refresh_version().await;
        status.version = self.current_version;
        self.events.emit_lossy(IngestionEvent::CycleFailed {
            cycle_id: status.cycle_id,
            failed_in,
            error: "Scheduler shut down".to_string(),
            alert: false,
            timestamp: Utc::now(),
        });
        self.record(status, waiters).await;
    }

    /// Re-read the committed version after a failed or aborted cycle
    async fn refresh_version(&mut self) {
        match self.pipeline.current_version().await {
            Ok(version) => self.current_version = version,
            Err(e) => tracing::warn!(error = %e, "Could not refresh current version"),
        }
    }

    fn skipped(&self, cycle_id: CycleId, current_version: Option<u64>, reason: &str) {
        tracing::info!(%cycle_id, version = ?current_version, reason, "Ingestion cycle skipped");
        self.events.emit_lossy(IngestionEvent::CycleSkipped {
            cycle_id,
            current_version,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Persist a finished cycle, keep it in history and wake waiters
    async fn record(&mut self, status: CycleStatus, waiters: Vec<oneshot::Sender<Option<CycleStatus>>>) {
        if let Err(e) = save_cycle(&self.pool, &status).await {
            tracing::error!(cycle_id = %status.cycle_id, error = %e, "Failed to persist cycle status");
        }

        for waiter in waiters {
            let _ = waiter.send(Some(status.clone()));
        }

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(status);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
