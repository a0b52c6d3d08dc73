use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AnnotationSettings;
use crate::domain::{AuthScheme, Observation, ObservationId, TaskId};
use crate::error::PipelineError;
use crate::http;

const TASK_PAGE_SIZE: usize = 100;
const MAX_TASK_PAGES: u32 = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub id: u64,
    pub title: Option<String>,
}

/// A task already present in the annotation project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingTask {
    pub task_id: TaskId,
    pub observation_id: Option<ObservationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskData {
    pub image: String,
    pub observation_id: String,
    pub inat_url: String,
    pub observed_on: String,
    pub observer: String,
    pub location: String,
}

impl TaskData {
    pub fn from_observation(observation: &Observation, image_root: &str) -> Self {
        let inat_url = if observation.inat_url.trim().is_empty() {
            "N/A".to_string()
        } else {
            format!(
                r#"<a href="{}" target="_blank">View on iNaturalist</a>"#,
                observation.inat_url
            )
        };
        Self {
            image: format!(
                "{}/{}",
                image_root.trim_end_matches('/'),
                observation.id.image_file_name()
            ),
            observation_id: observation.id.to_string(),
            inat_url,
            observed_on: observation
                .observed_on
                .map(|date| date.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "Unknown".to_string()),
            observer: observation
                .observer_login
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            location: observation
                .location
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

/// Annotation-service operations; every call names the header scheme to present.
pub trait LabelStudioClient {
    fn project(&self, scheme: AuthScheme) -> Result<ProjectInfo, PipelineError>;
    fn list_tasks(&self, scheme: AuthScheme) -> Result<Vec<ExistingTask>, PipelineError>;
    fn create_task(&self, scheme: AuthScheme, data: &TaskData) -> Result<TaskId, PipelineError>;
}

#[derive(Clone)]
pub struct LabelStudioHttpClient {
    client: Client,
    settings: AnnotationSettings,
}

impl LabelStudioHttpClient {
    pub fn new(settings: AnnotationSettings) -> Result<Self, PipelineError> {
        let client = http::build_client(Duration::from_secs(30))
            .map_err(|err| PipelineError::ServiceUnavailable(err.to_string()))?;
        Ok(Self { client, settings })
    }

    fn authorized(&self, builder: RequestBuilder, scheme: AuthScheme) -> RequestBuilder {
        builder.header(AUTHORIZATION, scheme.header_value(&self.settings.api_token))
    }

    fn send<F>(&self, make_req: F) -> Result<Response, PipelineError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let response = http::send_with_retries(make_req)
            .map_err(|err| PipelineError::ServiceUnavailable(err.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = http::error_message(response, "annotation service request failed");
        Err(classify_status(status, message))
    }
}

impl LabelStudioClient for LabelStudioHttpClient {
    fn project(&self, scheme: AuthScheme) -> Result<ProjectInfo, PipelineError> {
        let url = format!(
            "{}/api/projects/{}",
            self.settings.base_url, self.settings.project_id
        );
        let response = self.send(|| self.authorized(self.client.get(&url), scheme))?;
        let body: Value = response
            .json()
            .map_err(|err| PipelineError::AnnotationResponse(err.to_string()))?;
        Ok(ProjectInfo {
            id: body
                .get("id")
                .and_then(Value::as_u64)
                .unwrap_or(self.settings.project_id),
            title: body
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn list_tasks(&self, scheme: AuthScheme) -> Result<Vec<ExistingTask>, PipelineError> {
        let url = format!(
            "{}/api/projects/{}/tasks",
            self.settings.base_url, self.settings.project_id
        );
        let mut tasks = Vec::new();
        for page in 1..=MAX_TASK_PAGES {
            let result = self.send(|| {
                self.authorized(self.client.get(&url), scheme).query(&[
                    ("page", page.to_string()),
                    ("page_size", TASK_PAGE_SIZE.to_string()),
                ])
            });
            let response = match result {
                Ok(response) => response,
                // Paging past the last page answers 404.
                Err(PipelineError::PayloadRejected { status: 404, .. }) if page > 1 => break,
                Err(err) => return Err(err),
            };
            let body = response
                .text()
                .map_err(|err| PipelineError::ServiceUnavailable(err.to_string()))?;
            let batch = parse_task_listing(&body)?;
            let fetched = batch.len();
            tasks.extend(batch);
            if fetched < TASK_PAGE_SIZE {
                break;
            }
        }
        Ok(tasks)
    }

    fn create_task(&self, scheme: AuthScheme, data: &TaskData) -> Result<TaskId, PipelineError> {
        let url = format!("{}/api/tasks", self.settings.base_url);
        let body = CreateTaskRequest {
            data,
            project: self.settings.project_id,
        };
        let response = self.send(|| self.authorized(self.client.post(&url), scheme).json(&body))?;
        let created: CreatedTask = response
            .json()
            .map_err(|err| PipelineError::AnnotationResponse(err.to_string()))?;
        Ok(created.id)
    }
}

#[derive(Serialize)]
struct CreateTaskRequest<'a> {
    data: &'a TaskData,
    project: u64,
}

#[derive(Deserialize)]
struct CreatedTask {
    id: TaskId,
}

#[derive(Deserialize)]
struct RawTask {
    id: TaskId,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskListing {
    Bare(Vec<RawTask>),
    Wrapped { tasks: Vec<RawTask> },
}

/// Accepts both the bare-list and `{ "tasks": [...] }` listing shapes.
pub fn parse_task_listing(body: &str) -> Result<Vec<ExistingTask>, PipelineError> {
    let listing: TaskListing = serde_json::from_str(body)
        .map_err(|err| PipelineError::AnnotationResponse(err.to_string()))?;
    let raw = match listing {
        TaskListing::Bare(tasks) | TaskListing::Wrapped { tasks } => tasks,
    };
    Ok(raw
        .into_iter()
        .map(|task| ExistingTask {
            task_id: task.id,
            observation_id: observation_id_from_task(&task.data),
        })
        .collect())
}

/// Recovers the observation a task was created for, from its explicit field
/// or from the `{id}.jpg` image reference.
pub fn observation_id_from_task(data: &Value) -> Option<ObservationId> {
    let explicit: Option<ObservationId> = match data.get("observation_id") {
        Some(Value::String(value)) => value.parse().ok(),
        Some(Value::Number(value)) => value.as_i64().and_then(|id| ObservationId::new(id).ok()),
        _ => None,
    };
    explicit.or_else(|| {
        data.get("image")
            .and_then(Value::as_str)
            .and_then(observation_id_from_image_ref)
    })
}

pub fn observation_id_from_image_ref(image: &str) -> Option<ObservationId> {
    static IMAGE_ID: OnceLock<Regex> = OnceLock::new();
    let re = IMAGE_ID.get_or_init(|| {
        Regex::new(r"(?:^|[/=])(\d+)\.jpe?g(?:$|[?#])").expect("static image id pattern")
    });
    re.captures(image)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn classify_status(status: u16, message: String) -> PipelineError {
    match status {
        401 | 403 => PipelineError::AuthRejected { status },
        408 | 429 | 500..=599 => PipelineError::ServiceUnavailable(format!("status {status}: {message}")),
        _ => PipelineError::PayloadRejected { status, message },
    }
}
