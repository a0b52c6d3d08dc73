use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink};
use crate::domain::{AuthScheme, Observation, ObservationId, TaskId};
use crate::error::PipelineError;
use crate::labelstudio::{LabelStudioClient, TaskData};
use crate::sampler::StopReason;
use crate::store::ObservationStore;

pub const DEFAULT_ITEM_RETRIES: u32 = 2;

/// Where the credential-scheme negotiation stands for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Untried,
    PrimaryRejected { primary: AuthScheme },
    Resolved(AuthScheme),
    Failed,
}

/// Finds the header scheme the annotation service accepts.
///
/// The primary scheme is tried first; only an auth-class rejection moves on
/// to the alternate, and only once. Any other failure leaves the state
/// untouched so a later call may try again.
#[derive(Debug)]
pub struct AuthNegotiator {
    primary: AuthScheme,
    state: AuthState,
}

impl AuthNegotiator {
    pub fn new(primary: AuthScheme) -> Self {
        Self {
            primary,
            state: AuthState::Untried,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn resolve<L: LabelStudioClient>(&mut self, client: &L) -> Result<AuthScheme, PipelineError> {
        loop {
            match self.state {
                AuthState::Resolved(scheme) => return Ok(scheme),
                AuthState::Failed => return Err(PipelineError::Auth),
                AuthState::Untried => match client.project(self.primary) {
                    Ok(project) => {
                        tracing::info!(
                            scheme = %self.primary,
                            project = project.id,
                            title = project.title.as_deref().unwrap_or("-"),
                            "connected to annotation project"
                        );
                        self.state = AuthState::Resolved(self.primary);
                    }
                    Err(err) if err.is_auth() => {
                        tracing::debug!(scheme = %self.primary, "primary auth scheme rejected");
                        self.state = AuthState::PrimaryRejected {
                            primary: self.primary,
                        };
                    }
                    Err(err) => return Err(err),
                },
                AuthState::PrimaryRejected { primary } => {
                    let fallback = primary.alternate();
                    match client.project(fallback) {
                        Ok(project) => {
                            tracing::info!(
                                scheme = %fallback,
                                project = project.id,
                                title = project.title.as_deref().unwrap_or("-"),
                                "annotation service accepted fallback scheme"
                            );
                            self.state = AuthState::Resolved(fallback);
                        }
                        Err(err) if err.is_auth() => self.state = AuthState::Failed,
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub limit: Option<usize>,
    pub skip_duplicates: bool,
    /// Extra attempts per item when the service is unavailable.
    pub item_retries: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            limit: None,
            skip_duplicates: false,
            item_retries: DEFAULT_ITEM_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub considered: usize,
    pub created: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub rejected: usize,
    pub scheme: Option<AuthScheme>,
    pub stop: StopReason,
    pub tasks: Vec<SyncedItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncedItem {
    pub observation_id: ObservationId,
    pub task_id: TaskId,
}

enum ItemOutcome {
    Created(TaskId),
    Existing(TaskId),
    Rejected,
    Unavailable,
}

pub struct SyncAgent<'a, L: LabelStudioClient> {
    store: &'a ObservationStore,
    client: &'a L,
    image_root: String,
    primary_scheme: AuthScheme,
    delay: Duration,
}

impl<'a, L: LabelStudioClient> SyncAgent<'a, L> {
    pub fn new(
        store: &'a ObservationStore,
        client: &'a L,
        image_root: impl Into<String>,
        primary_scheme: AuthScheme,
        delay: Duration,
    ) -> Self {
        Self {
            store,
            client,
            image_root: image_root.into(),
            primary_scheme,
            delay,
        }
    }

    /// Auth failure before the first item is returned as an error; later
    /// auth failures stop the run and are reported in the summary.
    pub fn run(
        &self,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, PipelineError> {
        let pending = self.store.unsynced(options.limit)?;
        let mut report = SyncReport {
            considered: pending.len(),
            created: 0,
            skipped_duplicate: 0,
            failed: 0,
            rejected: 0,
            scheme: None,
            stop: StopReason::Completed,
            tasks: Vec::new(),
        };
        if pending.is_empty() {
            tracing::info!("nothing to sync");
            return Ok(report);
        }

        sink.event(ProgressEvent {
            message: "phase=Resolve; negotiating annotation service auth".to_string(),
            elapsed: None,
        });
        let mut negotiator = AuthNegotiator::new(self.primary_scheme);
        let scheme = negotiator.resolve(self.client)?;
        report.scheme = Some(scheme);

        let existing = if options.skip_duplicates {
            let index = self.existing_index(scheme)?;
            tracing::info!(tasks = index.len(), "loaded existing annotation tasks");
            Some(index)
        } else {
            None
        };

        for (position, observation) in pending.iter().enumerate() {
            if position > 0 && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            let id = observation.id;
            let outcome = match existing.as_ref().and_then(|index| index.get(&id)) {
                Some(task_id) => Ok(ItemOutcome::Existing(*task_id)),
                None => self.submit(scheme, observation, options.item_retries),
            };
            match outcome {
                Ok(ItemOutcome::Created(task_id)) => {
                    self.store.mark_synced(id, task_id)?;
                    report.created += 1;
                    report.tasks.push(SyncedItem {
                        observation_id: id,
                        task_id,
                    });
                    sink.event(ProgressEvent {
                        message: format!("phase=Store; observation {id} -> task {task_id}"),
                        elapsed: None,
                    });
                }
                Ok(ItemOutcome::Existing(task_id)) => {
                    tracing::info!(%id, task_id, "task already exists, skipping");
                    self.store.mark_synced(id, task_id)?;
                    report.skipped_duplicate += 1;
                }
                Ok(ItemOutcome::Rejected) => report.rejected += 1,
                Ok(ItemOutcome::Unavailable) => report.failed += 1,
                Err(err) => {
                    tracing::error!(%id, error = %err, "aborting sync run");
                    report.stop = StopReason::Aborted {
                        message: err.to_string(),
                        class: err.class(),
                    };
                    break;
                }
            }
        }

        tracing::info!(
            created = report.created,
            skipped = report.skipped_duplicate,
            failed = report.failed,
            rejected = report.rejected,
            "sync run finished"
        );
        Ok(report)
    }

    fn existing_index(
        &self,
        scheme: AuthScheme,
    ) -> Result<HashMap<ObservationId, TaskId>, PipelineError> {
        let tasks = self.client.list_tasks(scheme)?;
        let mut index = HashMap::new();
        for task in tasks {
            if let Some(id) = task.observation_id {
                index.entry(id).or_insert(task.task_id);
            }
        }
        Ok(index)
    }

    fn submit(
        &self,
        scheme: AuthScheme,
        observation: &Observation,
        retries: u32,
    ) -> Result<ItemOutcome, PipelineError> {
        let data = TaskData::from_observation(observation, &self.image_root);
        let mut attempt = 0;
        loop {
            match self.client.create_task(scheme, &data) {
                Ok(task_id) => return Ok(ItemOutcome::Created(task_id)),
                Err(PipelineError::ServiceUnavailable(message)) => {
                    if attempt >= retries {
                        tracing::warn!(id = %observation.id, %message, "annotation service unavailable, giving up on item");
                        return Ok(ItemOutcome::Unavailable);
                    }
                    attempt += 1;
                    tracing::debug!(id = %observation.id, attempt, "retrying task creation");
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
                Err(err @ PipelineError::PayloadRejected { .. }) => {
                    tracing::warn!(id = %observation.id, error = %err, "task payload rejected");
                    return Ok(ItemOutcome::Rejected);
                }
                Err(err) => return Err(err),
            }
        }
    }
}
