use std::collections::HashSet;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::domain::{Label, LifeStage, NewLabel, Observation, ObservationId, TaskId};
use crate::error::PipelineError;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS observations (
    observation_id INTEGER PRIMARY KEY,
    inat_url TEXT NOT NULL,
    observed_on TEXT,
    observer_login TEXT,
    observer_name TEXT,
    latitude REAL,
    longitude REAL,
    location TEXT,
    image_url TEXT,
    image_local_path TEXT NOT NULL,
    quality_grade TEXT,
    num_identification_agreements INTEGER NOT NULL DEFAULT 0,
    num_identification_disagreements INTEGER NOT NULL DEFAULT 0,
    license TEXT,
    raw_data TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS labels (
    label_id INTEGER PRIMARY KEY AUTOINCREMENT,
    observation_id INTEGER NOT NULL,
    life_stage TEXT NOT NULL CHECK (life_stage IN ('Egg', 'Larva', 'Pupa', 'Adult', 'Unknown')),
    annotator TEXT,
    annotation_date TEXT NOT NULL,
    label_studio_task_id INTEGER,
    label_studio_annotation_id INTEGER,
    FOREIGN KEY (observation_id) REFERENCES observations(observation_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS synced_tasks (
    observation_id INTEGER PRIMARY KEY,
    task_id INTEGER NOT NULL,
    synced_at TEXT NOT NULL,
    FOREIGN KEY (observation_id) REFERENCES observations(observation_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_labels_observation_id ON labels(observation_id);
CREATE INDEX IF NOT EXISTS idx_labels_life_stage ON labels(life_stage);
CREATE INDEX IF NOT EXISTS idx_observations_created_at ON observations(created_at);

CREATE VIEW IF NOT EXISTS observations_with_labels AS
SELECT
    o.observation_id,
    o.inat_url,
    o.observed_on,
    o.observer_login,
    o.observer_name,
    o.latitude,
    o.longitude,
    o.location,
    o.image_url,
    o.image_local_path,
    o.quality_grade,
    l.life_stage,
    l.annotator,
    l.annotation_date,
    l.label_studio_task_id
FROM observations o
LEFT JOIN labels l ON o.observation_id = l.observation_id;
"#;

const OBSERVATION_COLUMNS: &str = "o.observation_id, o.inat_url, o.observed_on, o.observer_login, \
     o.observer_name, o.latitude, o.longitude, o.location, o.image_url, o.image_local_path, \
     o.quality_grade, o.num_identification_agreements, o.num_identification_disagreements, \
     o.license, o.raw_data, o.created_at";

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounts {
    pub observations: u64,
    pub synced: u64,
    pub labels: Vec<StageCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageCount {
    pub life_stage: LifeStage,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeCounts {
    pub observations: u64,
    pub labels: u64,
    pub synced_tasks: u64,
}

/// Relational store for observations, labels and synced tasks.
///
/// The observation primary key is the authoritative duplicate guard: a second
/// insert of the same id fails with [`PipelineError::DuplicateObservation`]
/// no matter which process attempts it.
pub struct ObservationStore {
    conn: Connection,
}

impl ObservationStore {
    pub fn open(path: &Utf8Path) -> Result<Self, PipelineError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path.as_std_path())
            .map_err(|_| PipelineError::DatabaseOpen(path.to_path_buf()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, PipelineError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PipelineError> {
        conn.execute("PRAGMA foreign_keys=ON;", [])?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Creates missing tables and brings older `observations` tables up to date.
    pub fn migrate(&self) -> Result<(), PipelineError> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        if !self.has_column("observations", "raw_data")? {
            tracing::info!("adding raw_data column to observations");
            self.conn
                .execute("ALTER TABLE observations ADD COLUMN raw_data TEXT", [])?;
        }
        Ok(())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, PipelineError> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({table})"))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names.iter().any(|name| name == column))
    }

    pub fn contains(&self, id: ObservationId) -> Result<bool, PipelineError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM observations WHERE observation_id = ?1",
                params![id.get()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn known_ids(&self) -> Result<HashSet<ObservationId>, PipelineError> {
        let mut stmt = self.conn.prepare("SELECT observation_id FROM observations")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter().map(ObservationId::new).collect()
    }

    pub fn insert_observation(&self, observation: &Observation) -> Result<(), PipelineError> {
        let raw = observation
            .raw_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| PipelineError::Serialization(err.to_string()))?;
        let result = self.conn.execute(
            "INSERT INTO observations (
                observation_id, inat_url, observed_on, observer_login, observer_name,
                latitude, longitude, location, image_url, image_local_path,
                quality_grade, num_identification_agreements, num_identification_disagreements,
                license, raw_data, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                observation.id.get(),
                observation.inat_url,
                observation.observed_on.map(|date| date.format("%Y-%m-%d").to_string()),
                observation.observer_login,
                observation.observer_name,
                observation.latitude,
                observation.longitude,
                observation.location,
                observation.image_url,
                observation.image_local_path.as_str(),
                observation.quality_grade,
                observation.num_identification_agreements,
                observation.num_identification_disagreements,
                observation.license,
                raw,
                format_timestamp(observation.created_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(PipelineError::DuplicateObservation(observation.id.get()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, id: ObservationId) -> Result<Option<Observation>, PipelineError> {
        let sql = format!("SELECT {OBSERVATION_COLUMNS} FROM observations o WHERE o.observation_id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id.get()], ObservationRow::from_row)
            .optional()?;
        row.map(ObservationRow::into_observation).transpose()
    }

    /// Observations with no recorded task, newest first.
    pub fn unsynced(&self, limit: Option<usize>) -> Result<Vec<Observation>, PipelineError> {
        let sql = format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations o
             LEFT JOIN synced_tasks s ON s.observation_id = o.observation_id
             WHERE s.observation_id IS NULL
             ORDER BY o.created_at DESC, o.observation_id DESC
             LIMIT ?1"
        );
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], ObservationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(ObservationRow::into_observation).collect()
    }

    pub fn mark_synced(&self, id: ObservationId, task_id: TaskId) -> Result<(), PipelineError> {
        self.conn.execute(
            "INSERT INTO synced_tasks (observation_id, task_id, synced_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(observation_id) DO UPDATE SET task_id = excluded.task_id, synced_at = excluded.synced_at",
            params![id.get(), task_id, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    pub fn synced_task(&self, id: ObservationId) -> Result<Option<TaskId>, PipelineError> {
        Ok(self
            .conn
            .query_row(
                "SELECT task_id FROM synced_tasks WHERE observation_id = ?1",
                params![id.get()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?)
    }

    pub fn insert_label(&self, label: &NewLabel) -> Result<i64, PipelineError> {
        self.conn.execute(
            "INSERT INTO labels (
                observation_id, life_stage, annotator, annotation_date,
                label_studio_task_id, label_studio_annotation_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                label.observation_id.get(),
                label.life_stage.as_str(),
                label.annotator,
                format_timestamp(Utc::now()),
                label.task_id,
                label.annotation_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn labels_for(&self, id: ObservationId) -> Result<Vec<Label>, PipelineError> {
        let mut stmt = self.conn.prepare(
            "SELECT label_id, life_stage, annotator, annotation_date,
                    label_studio_task_id, label_studio_annotation_id
             FROM labels WHERE observation_id = ?1 ORDER BY label_id",
        )?;
        let rows = stmt
            .query_map(params![id.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(
                |(label_id, stage, annotator, date, task_id, annotation_id)| -> Result<Label, PipelineError> {
                Ok(Label {
                    label_id,
                    observation_id: id,
                    life_stage: stage.parse()?,
                    annotator,
                    annotation_date: parse_timestamp(&date)?,
                    task_id,
                    annotation_id,
                })
            })
            .collect()
    }

    /// Removes one observation; its labels and synced task go with it.
    pub fn delete_observation(&self, id: ObservationId) -> Result<bool, PipelineError> {
        let deleted = self.conn.execute(
            "DELETE FROM observations WHERE observation_id = ?1",
            params![id.get()],
        )?;
        Ok(deleted > 0)
    }

    pub fn counts(&self) -> Result<StoreCounts, PipelineError> {
        let observations = self.count("SELECT COUNT(*) FROM observations")?;
        let synced = self.count("SELECT COUNT(*) FROM synced_tasks")?;
        let mut labels = Vec::with_capacity(LifeStage::ALL.len());
        for stage in LifeStage::ALL {
            let count: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM labels WHERE life_stage = ?1",
                params![stage.as_str()],
                |row| row.get(0),
            )?;
            labels.push(StageCount {
                life_stage: stage,
                count: count as u64,
            });
        }
        Ok(StoreCounts {
            observations,
            synced,
            labels,
        })
    }

    /// Deletes every row in one transaction.
    pub fn purge(&self) -> Result<PurgeCounts, PipelineError> {
        let tx = self.conn.unchecked_transaction()?;
        let labels = tx.execute("DELETE FROM labels", [])? as u64;
        let synced_tasks = tx.execute("DELETE FROM synced_tasks", [])? as u64;
        let observations = tx.execute("DELETE FROM observations", [])? as u64;
        tx.commit()?;
        Ok(PurgeCounts {
            observations,
            labels,
            synced_tasks,
        })
    }

    fn count(&self, sql: &str) -> Result<u64, PipelineError> {
        let value: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(value as u64)
    }
}

struct ObservationRow {
    id: i64,
    inat_url: String,
    observed_on: Option<String>,
    observer_login: Option<String>,
    observer_name: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    location: Option<String>,
    image_url: Option<String>,
    image_local_path: String,
    quality_grade: Option<String>,
    agreements: i64,
    disagreements: i64,
    license: Option<String>,
    raw_data: Option<String>,
    created_at: String,
}

impl ObservationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            inat_url: row.get(1)?,
            observed_on: row.get(2)?,
            observer_login: row.get(3)?,
            observer_name: row.get(4)?,
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            location: row.get(7)?,
            image_url: row.get(8)?,
            image_local_path: row.get(9)?,
            quality_grade: row.get(10)?,
            agreements: row.get(11)?,
            disagreements: row.get(12)?,
            license: row.get(13)?,
            raw_data: row.get(14)?,
            created_at: row.get(15)?,
        })
    }

    fn into_observation(self) -> Result<Observation, PipelineError> {
        Ok(Observation {
            id: ObservationId::new(self.id)?,
            inat_url: self.inat_url,
            observed_on: self
                .observed_on
                .as_deref()
                .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()),
            observer_login: self.observer_login,
            observer_name: self.observer_name,
            latitude: self.latitude,
            longitude: self.longitude,
            location: self.location,
            image_url: self.image_url,
            image_local_path: Utf8PathBuf::from(self.image_local_path),
            quality_grade: self.quality_grade,
            num_identification_agreements: self.agreements,
            num_identification_disagreements: self.disagreements,
            license: self.license,
            raw_data: self
                .raw_data
                .as_deref()
                .and_then(|value| serde_json::from_str(value).ok()),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.extended_code,
            rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        ),
        _ => false,
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PipelineError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|err| PipelineError::CorruptRow(format!("bad timestamp {value}: {err}")))
}
