#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use serde_json::json;

use monarch_pipeline::domain::{AuthScheme, Observation, ObservationId, TaskId};
use monarch_pipeline::error::PipelineError;
use monarch_pipeline::images::{FetchedImage, ImageFetcher, image_path};
use monarch_pipeline::inat::{CatalogClient, CatalogPage, CatalogRecord, PagePosition, PageRequest};
use monarch_pipeline::labelstudio::{ExistingTask, LabelStudioClient, ProjectInfo, TaskData};

pub fn id(value: i64) -> ObservationId {
    ObservationId::new(value).unwrap()
}

pub fn record(value: i64) -> CatalogRecord {
    CatalogRecord {
        id: id(value),
        uri: Some(format!("https://www.inaturalist.org/observations/{value}")),
        observed_on: NaiveDate::from_ymd_opt(2024, 7, 14),
        observer_login: Some("lepidopterist".to_string()),
        observer_name: None,
        latitude: Some(29.76),
        longitude: Some(-95.37),
        place_guess: Some("Houston, TX".to_string()),
        photo_url: Some(format!("https://static.example.org/photos/{value}/medium.jpg")),
        quality_grade: Some("research".to_string()),
        agreements: 2,
        disagreements: 0,
        license: Some("cc-by-nc".to_string()),
        raw: json!({ "id": value }),
    }
}

pub fn observation(value: i64) -> Observation {
    record(value).into_observation(Utf8PathBuf::from(format!("data/images/{value}.jpg")))
}

pub fn temp_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap()
}

/// Serves a fixed record list by page number or offset.
#[derive(Default)]
pub struct MockCatalog {
    pub records: Vec<CatalogRecord>,
    pub transient_calls: HashSet<usize>,
    pub malformed_calls: HashSet<usize>,
    pub requests: Mutex<Vec<PageRequest>>,
}

impl MockCatalog {
    pub fn with_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            records: ids.into_iter().map(record).collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl CatalogClient for MockCatalog {
    fn fetch_page(&self, request: &PageRequest) -> Result<CatalogPage, PipelineError> {
        let call = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(*request);
            requests.len() - 1
        };
        if self.transient_calls.contains(&call) {
            return Err(PipelineError::TransientFetch("connection reset".to_string()));
        }
        if self.malformed_calls.contains(&call) {
            return Err(PipelineError::MalformedResponse("missing results".to_string()));
        }
        let per_page = request.per_page as usize;
        let start = match request.position {
            PagePosition::Page(page) => (page.max(1) as usize - 1) * per_page,
            PagePosition::Offset(offset) => offset as usize,
        };
        let results = self
            .records
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        Ok(CatalogPage {
            total_results: self.records.len() as u64,
            results,
        })
    }
}

/// Writes a small placeholder file per id into `dir`.
pub struct MockFetcher {
    pub dir: Utf8PathBuf,
    pub failing: HashSet<ObservationId>,
    pub calls: Mutex<Vec<ObservationId>>,
}

impl MockFetcher {
    pub fn new(dir: Utf8PathBuf) -> Self {
        Self {
            dir,
            failing: HashSet::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn called(&self) -> Vec<ObservationId> {
        self.calls.lock().unwrap().clone()
    }
}

impl ImageFetcher for MockFetcher {
    fn fetch(&self, url: &str, id: ObservationId) -> Result<FetchedImage, PipelineError> {
        self.calls.lock().unwrap().push(id);
        if self.failing.contains(&id) {
            return Err(PipelineError::Transfer {
                url: url.to_string(),
                message: "status 404".to_string(),
            });
        }
        let path = image_path(&self.dir, id);
        if path.as_std_path().exists() {
            return Ok(FetchedImage::AlreadyPresent(path));
        }
        fs::create_dir_all(self.dir.as_std_path()).unwrap();
        fs::write(path.as_std_path(), b"\xff\xd8\xff").unwrap();
        Ok(FetchedImage::Downloaded(path))
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CreateFailure {
    Unavailable,
    Rejected,
    AuthRejected,
}

/// Accepts only the listed schemes and records every call.
pub struct MockLabelStudio {
    pub accepted: Vec<AuthScheme>,
    pub existing: Vec<ExistingTask>,
    pub failures: Mutex<HashMap<String, VecDeque<CreateFailure>>>,
    pub tried: Mutex<Vec<AuthScheme>>,
    pub listings: Mutex<usize>,
    pub created: Mutex<Vec<(AuthScheme, TaskData)>>,
}

impl MockLabelStudio {
    pub fn accepting(accepted: &[AuthScheme]) -> Self {
        Self {
            accepted: accepted.to_vec(),
            existing: Vec::new(),
            failures: Mutex::new(HashMap::new()),
            tried: Mutex::new(Vec::new()),
            listings: Mutex::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_create(&self, observation: i64, failures: &[CreateFailure]) {
        self.failures
            .lock()
            .unwrap()
            .insert(observation.to_string(), failures.iter().copied().collect());
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(_, data)| data.observation_id.clone())
            .collect()
    }

    fn check(&self, scheme: AuthScheme) -> Result<(), PipelineError> {
        if self.accepted.contains(&scheme) {
            Ok(())
        } else {
            Err(PipelineError::AuthRejected { status: 401 })
        }
    }
}

impl LabelStudioClient for MockLabelStudio {
    fn project(&self, scheme: AuthScheme) -> Result<ProjectInfo, PipelineError> {
        self.tried.lock().unwrap().push(scheme);
        self.check(scheme)?;
        Ok(ProjectInfo {
            id: 1,
            title: Some("Monarch life stages".to_string()),
        })
    }

    fn list_tasks(&self, scheme: AuthScheme) -> Result<Vec<ExistingTask>, PipelineError> {
        self.check(scheme)?;
        *self.listings.lock().unwrap() += 1;
        Ok(self.existing.clone())
    }

    fn create_task(&self, scheme: AuthScheme, data: &TaskData) -> Result<TaskId, PipelineError> {
        self.check(scheme)?;
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&data.observation_id)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(CreateFailure::Unavailable) => {
                return Err(PipelineError::ServiceUnavailable("status 503".to_string()));
            }
            Some(CreateFailure::Rejected) => {
                return Err(PipelineError::PayloadRejected {
                    status: 400,
                    message: "invalid data".to_string(),
                });
            }
            Some(CreateFailure::AuthRejected) => {
                return Err(PipelineError::AuthRejected { status: 401 });
            }
            None => {}
        }
        let mut created = self.created.lock().unwrap();
        created.push((scheme, data.clone()));
        Ok(1000 + created.len() as TaskId)
    }
}
