use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// Identifier assigned by iNaturalist; also the image file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(i64);

impl ObservationId {
    pub fn new(value: i64) -> Result<Self, PipelineError> {
        if value <= 0 {
            return Err(PipelineError::InvalidObservationId(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn image_file_name(self) -> String {
        format!("{}.jpg", self.0)
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObservationId {
    type Err = PipelineError;

    /// Accepts a bare id or an observation URL such as
    /// `https://www.inaturalist.org/observations/12345`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_end_matches('/');
        let tail = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let parsed = tail
            .parse::<i64>()
            .map_err(|_| PipelineError::InvalidObservationId(value.to_string()))?;
        Self::new(parsed).map_err(|_| PipelineError::InvalidObservationId(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifeStage {
    Egg,
    Larva,
    Pupa,
    Adult,
    Unknown,
}

impl LifeStage {
    pub const ALL: [LifeStage; 5] = [
        LifeStage::Egg,
        LifeStage::Larva,
        LifeStage::Pupa,
        LifeStage::Adult,
        LifeStage::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifeStage::Egg => "Egg",
            LifeStage::Larva => "Larva",
            LifeStage::Pupa => "Pupa",
            LifeStage::Adult => "Adult",
            LifeStage::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for LifeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifeStage {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "egg" => Ok(LifeStage::Egg),
            "larva" | "caterpillar" => Ok(LifeStage::Larva),
            "pupa" | "chrysalis" => Ok(LifeStage::Pupa),
            "adult" => Ok(LifeStage::Adult),
            "unknown" => Ok(LifeStage::Unknown),
            _ => Err(PipelineError::InvalidLifeStage(value.to_string())),
        }
    }
}

/// Prefix presented before the annotation-service credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScheme {
    Token,
    Bearer,
}

impl AuthScheme {
    pub fn alternate(self) -> Self {
        match self {
            AuthScheme::Token => AuthScheme::Bearer,
            AuthScheme::Bearer => AuthScheme::Token,
        }
    }

    pub fn header_value(self, credential: &str) -> String {
        format!("{self} {credential}")
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Token => write!(f, "Token"),
            AuthScheme::Bearer => write!(f, "Bearer"),
        }
    }
}

impl FromStr for AuthScheme {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "token" => Ok(AuthScheme::Token),
            "bearer" => Ok(AuthScheme::Bearer),
            _ => Err(PipelineError::InvalidAuthScheme(value.to_string())),
        }
    }
}

/// Annotation-service task identifier.
pub type TaskId = i64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub id: ObservationId,
    pub inat_url: String,
    pub observed_on: Option<NaiveDate>,
    pub observer_login: Option<String>,
    pub observer_name: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location: Option<String>,
    pub image_url: Option<String>,
    pub image_local_path: Utf8PathBuf,
    pub quality_grade: Option<String>,
    pub num_identification_agreements: i64,
    pub num_identification_disagreements: i64,
    pub license: Option<String>,
    #[serde(skip)]
    pub raw_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Label {
    pub label_id: i64,
    pub observation_id: ObservationId,
    pub life_stage: LifeStage,
    pub annotator: Option<String>,
    pub annotation_date: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub annotation_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewLabel {
    pub observation_id: ObservationId,
    pub life_stage: LifeStage,
    pub annotator: Option<String>,
    pub task_id: Option<TaskId>,
    pub annotation_id: Option<i64>,
}
