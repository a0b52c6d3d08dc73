use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;
use serde::Serialize;

use crate::config::AnnotationSettings;
use crate::error::PipelineError;
use crate::images::ImageFetcher;
use crate::inat::CatalogClient;
use crate::labelstudio::LabelStudioClient;
use crate::sampler::{FetchReport, FetchRequest, Sampler};
use crate::store::{ObservationStore, StageCount};
use crate::sync::{SyncAgent, SyncOptions, SyncReport};

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub database_path: String,
    pub image_dir: String,
    pub observations: u64,
    pub synced: u64,
    pub unsynced: u64,
    pub image_files: u64,
    pub labels: Vec<StageCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeResult {
    pub observations: u64,
    pub labels: u64,
    pub synced_tasks: u64,
    pub images_removed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResult {
    pub database_path: String,
    pub image_dir: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Where the store lives and how fast the pipeline may talk to remote services.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub database_path: Utf8PathBuf,
    pub image_dir: Utf8PathBuf,
    pub request_delay: Duration,
}

pub struct App<C: CatalogClient, F: ImageFetcher> {
    store: ObservationStore,
    workspace: Workspace,
    catalog: C,
    fetcher: F,
}

impl<C: CatalogClient, F: ImageFetcher> App<C, F> {
    pub fn new(store: ObservationStore, workspace: Workspace, catalog: C, fetcher: F) -> Self {
        Self {
            store,
            workspace,
            catalog,
            fetcher,
        }
    }

    pub fn store(&self) -> &ObservationStore {
        &self.store
    }

    pub fn fetch(
        &self,
        request: FetchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<FetchReport, PipelineError> {
        self.fetch_with_rng(request, &mut rand::rng(), sink)
    }

    pub fn fetch_with_rng<R: Rng>(
        &self,
        request: FetchRequest,
        rng: &mut R,
        sink: &dyn ProgressSink,
    ) -> Result<FetchReport, PipelineError> {
        let sampler = Sampler::new(
            &self.catalog,
            &self.fetcher,
            &self.store,
            self.workspace.request_delay,
        );
        sampler.run(request, rng, sink)
    }

    pub fn sync<L: LabelStudioClient>(
        &self,
        client: &L,
        annotation: &AnnotationSettings,
        options: SyncOptions,
        sink: &dyn ProgressSink,
    ) -> Result<SyncReport, PipelineError> {
        let agent = SyncAgent::new(
            &self.store,
            client,
            annotation.image_root.clone(),
            annotation.primary_scheme,
            self.workspace.request_delay,
        );
        agent.run(options, sink)
    }

    pub fn status(&self, sink: &dyn ProgressSink) -> Result<StatusResult, PipelineError> {
        sink.event(ProgressEvent {
            message: "phase=Resolve; counting stored rows".to_string(),
            elapsed: None,
        });
        let counts = self.store.counts()?;
        let image_files = image_files(&self.workspace.image_dir)?.len() as u64;
        Ok(StatusResult {
            database_path: self.workspace.database_path.to_string(),
            image_dir: self.workspace.image_dir.to_string(),
            observations: counts.observations,
            synced: counts.synced,
            unsynced: counts.observations.saturating_sub(counts.synced),
            image_files,
            labels: counts.labels,
        })
    }

    /// Empties every table and deletes the downloaded images.
    pub fn purge(&self, sink: &dyn ProgressSink) -> Result<PurgeResult, PipelineError> {
        sink.event(ProgressEvent {
            message: "phase=Store; purging database".to_string(),
            elapsed: None,
        });
        let counts = self.store.purge()?;
        let mut images_removed = 0;
        for path in image_files(&self.workspace.image_dir)? {
            fs::remove_file(path.as_std_path())
                .map_err(|err| PipelineError::Filesystem(format!("{path}: {err}")))?;
            images_removed += 1;
        }
        tracing::info!(
            observations = counts.observations,
            images_removed,
            "purged store"
        );
        Ok(PurgeResult {
            observations: counts.observations,
            labels: counts.labels,
            synced_tasks: counts.synced_tasks,
            images_removed,
        })
    }

    pub fn init(&self, sink: &dyn ProgressSink) -> Result<InitResult, PipelineError> {
        sink.event(ProgressEvent {
            message: "phase=Prepare; creating schema and image directory".to_string(),
            elapsed: None,
        });
        self.store.migrate()?;
        fs::create_dir_all(self.workspace.image_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        Ok(InitResult {
            database_path: self.workspace.database_path.to_string(),
            image_dir: self.workspace.image_dir.to_string(),
        })
    }
}

/// `*.jpg` files directly inside `dir`; a missing directory has none.
fn image_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, PipelineError> {
    if !dir.as_std_path().exists() {
        return Ok(Vec::new());
    }
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| PipelineError::Filesystem(format!("{dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let path = entry.path();
        if path.extension() == Some("jpg") && path.is_file() {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
