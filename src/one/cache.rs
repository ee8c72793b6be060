use std::fs::File;
use std::io::Read;

use camino::Utf8Path;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::CacheError;
use crate::one::alf::{ints_to_uuid, uuid_to_ints};

/// One row of the sessions table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub lab: String,
    pub subject: String,
    pub date: NaiveDate,
    pub number: u32,
    pub task_protocol: Option<String>,
    pub project: Option<String>,
}

/// One row of the datasets table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetRecord {
    /// Identifies this revision of the file.
    pub id: Uuid,
    pub eid: Option<Uuid>,
    /// `<lab>/Subjects/<subject>/<date>/<number>`
    pub session_path: String,
    /// Path of the file relative to the session folder.
    pub rel_path: String,
    pub file_size: Option<u64>,
    pub hash: Option<String>,
    pub exists: bool,
}

impl DatasetRecord {
    pub fn new(id: Uuid, session_path: impl Into<String>, rel_path: impl Into<String>) -> Self {
        Self {
            id,
            eid: None,
            session_path: session_path.into(),
            rel_path: rel_path.into(),
            file_size: None,
            hash: None,
            exists: true,
        }
    }

    /// Session-relative file path, `<session_path>/<rel_path>`.
    pub fn relative_file(&self) -> camino::Utf8PathBuf {
        Utf8Path::new(&self.session_path).join(&self.rel_path)
    }

    pub fn id_ints(&self) -> [i64; 2] {
        uuid_to_ints(&self.id)
    }
}

/// Raw identifier columns: either a UUID string or a packed integer pair.
struct IdColumns {
    text: Option<String>,
    lo: Option<i64>,
    hi: Option<i64>,
}

impl IdColumns {
    fn resolve(&self) -> Result<Option<Uuid>, String> {
        match (&self.text, self.lo, self.hi) {
            (Some(text), _, _) if !text.is_empty() => Uuid::try_parse(text)
                .map(Some)
                .map_err(|e| format!("invalid UUID '{text}': {e}")),
            (_, Some(lo), Some(hi)) => Ok(Some(ints_to_uuid([lo, hi]))),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    #[serde(default, alias = "eid")]
    id: Option<String>,
    #[serde(default, alias = "eid_0")]
    id_0: Option<i64>,
    #[serde(default, alias = "eid_1")]
    id_1: Option<i64>,
    lab: String,
    subject: String,
    date: NaiveDate,
    number: u32,
    #[serde(default)]
    task_protocol: Option<String>,
    #[serde(default)]
    project: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatasetRow {
    #[serde(default, alias = "dset_id")]
    id: Option<String>,
    #[serde(default, alias = "dset_id_0")]
    id_0: Option<i64>,
    #[serde(default, alias = "dset_id_1")]
    id_1: Option<i64>,
    #[serde(default)]
    eid: Option<String>,
    #[serde(default)]
    eid_0: Option<i64>,
    #[serde(default)]
    eid_1: Option<i64>,
    session_path: String,
    rel_path: String,
    #[serde(default)]
    file_size: Option<u64>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default = "default_exists", deserialize_with = "deserialize_flag")]
    exists: bool,
}

fn default_exists() -> bool {
    true
}

/// Accepts `true`/`false` in any case as well as `1`/`0`.
fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let text = String::deserialize(deserializer)?;
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid flag '{other}'"))),
    }
}

/// In-memory copy of the sessions and datasets tables.
///
/// Read-only once loaded.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    sessions: Vec<SessionRecord>,
    datasets: Vec<DatasetRecord>,
}

impl Cache {
    pub fn new(sessions: Vec<SessionRecord>, datasets: Vec<DatasetRecord>) -> Self {
        Self { sessions, datasets }
    }

    /// Load `sessions.csv` and `datasets.csv` from a cache directory.
    pub fn load(dir: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        let sessions = File::open(dir.join("sessions.csv"))?;
        let datasets = File::open(dir.join("datasets.csv"))?;

        let cache = Self::from_readers(sessions, datasets)?;
        tracing::info!(
            "loaded {} sessions and {} datasets from {}",
            cache.sessions.len(),
            cache.datasets.len(),
            dir
        );
        Ok(cache)
    }

    pub fn from_readers(sessions: impl Read, datasets: impl Read) -> Result<Self, CacheError> {
        Ok(Self {
            sessions: read_sessions(sessions)?,
            datasets: read_datasets(datasets)?,
        })
    }

    pub fn sessions(&self) -> &[SessionRecord] {
        &self.sessions
    }

    pub fn datasets(&self) -> &[DatasetRecord] {
        &self.datasets
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Datasets of a session that are flagged as missing from the local cache.
    pub fn missing_datasets(&self) -> Vec<DatasetRecord> {
        self.datasets.iter().filter(|d| !d.exists).cloned().collect()
    }
}

fn read_sessions(reader: impl Read) -> Result<Vec<SessionRecord>, CacheError> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut sessions = Vec::new();

    for (row, result) in reader.deserialize::<SessionRow>().enumerate() {
        let raw = result?;
        let ids = IdColumns {
            text: raw.id,
            lo: raw.id_0,
            hi: raw.id_1,
        };
        let id = ids
            .resolve()
            .and_then(|id| id.ok_or_else(|| "no session id".to_string()))
            .map_err(|reason| CacheError::Row {
                table: "sessions",
                row,
                reason,
            })?;

        sessions.push(SessionRecord {
            id,
            lab: raw.lab,
            subject: raw.subject,
            date: raw.date,
            number: raw.number,
            task_protocol: raw.task_protocol.filter(|s| !s.is_empty()),
            project: raw.project.filter(|s| !s.is_empty()),
        });
    }

    Ok(sessions)
}

fn read_datasets(reader: impl Read) -> Result<Vec<DatasetRecord>, CacheError> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut datasets = Vec::new();

    for (row, result) in reader.deserialize::<DatasetRow>().enumerate() {
        let raw = result?;
        let row_error = |reason| CacheError::Row {
            table: "datasets",
            row,
            reason,
        };

        let id = IdColumns {
            text: raw.id,
            lo: raw.id_0,
            hi: raw.id_1,
        }
        .resolve()
        .and_then(|id| id.ok_or_else(|| "no dataset id".to_string()))
        .map_err(row_error)?;

        let eid = IdColumns {
            text: raw.eid,
            lo: raw.eid_0,
            hi: raw.eid_1,
        }
        .resolve()
        .map_err(row_error)?;

        datasets.push(DatasetRecord {
            id,
            eid,
            session_path: raw.session_path.replace('\\', "/"),
            rel_path: raw.rel_path.replace('\\', "/"),
            file_size: raw.file_size,
            hash: raw.hash.filter(|s| !s.is_empty()),
            exists: raw.exists,
        });
    }

    Ok(datasets)
}
