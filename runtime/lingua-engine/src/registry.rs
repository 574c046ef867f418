//! Dataset registry: the `dataset` catalog table and the creation flow that
//! pairs each row with its backing table.

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::ingest::{Ingestor, UploadedFile};

/// Longest accepted `name` / `authors`, in characters.
pub const MAX_LABEL_CHARS: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(pub i64);

impl DatasetId {
    pub fn raw(self) -> i64 {
        self.0
    }

    /// Name of the backing table holding this dataset's rows.
    pub fn table_name(self) -> String {
        format!("dataset_{}", self.0)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<i64>() {
            Ok(id) if id > 0 => Ok(DatasetId(id)),
            _ => Err(EngineError::InvalidBody),
        }
    }
}

/// Lifecycle of a dataset's backing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Pending,
    Ready,
    Failed,
}

impl DatasetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DatasetStatus::Pending => "pending",
            DatasetStatus::Ready => "ready",
            DatasetStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(DatasetStatus::Pending),
            "ready" => Some(DatasetStatus::Ready),
            "failed" => Some(DatasetStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    pub authors: String,
    pub status: DatasetStatus,
}

/// Creation request as received; every part is optional until validated.
#[derive(Clone, Debug, Default)]
pub struct NewDataset {
    pub name: Option<String>,
    pub authors: Option<String>,
    pub file: Option<UploadedFile>,
}

/// Outcome of [`create`]. The dataset row exists even when ingestion failed.
#[derive(Clone, Debug, PartialEq)]
pub struct Created {
    pub dataset: Dataset,
    pub ingest_error: Option<EngineError>,
}

struct ValidDataset {
    name: String,
    authors: String,
    file: UploadedFile,
}

fn label(raw: Option<String>) -> Option<String> {
    let raw = raw?;
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_LABEL_CHARS {
        return None;
    }
    Some(trimmed.to_string())
}

impl NewDataset {
    fn validate(self) -> EngineResult<ValidDataset> {
        let name = label(self.name).ok_or(EngineError::InvalidBody)?;
        let authors = label(self.authors).ok_or(EngineError::InvalidBody)?;
        let file = self
            .file
            .filter(|file| !file.contents.is_empty())
            .ok_or(EngineError::InvalidBody)?;
        Ok(ValidDataset {
            name,
            authors,
            file,
        })
    }
}

fn row_to_dataset(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dataset> {
    let status: String = row.get(3)?;
    Ok(Dataset {
        id: DatasetId(row.get(0)?),
        name: row.get(1)?,
        authors: row.get(2)?,
        status: DatasetStatus::parse(&status).unwrap_or(DatasetStatus::Failed),
    })
}

/// Registers a dataset and ingests its upload into `dataset_<id>`.
///
/// Validation and catalog failures abort before anything is stored. An
/// ingestion failure leaves the row in place, marked failed, and is reported
/// through [`Created::ingest_error`]. A status that cannot be recorded is a
/// connection error; the row then stays `pending`.
pub fn create(conn: &Connection, request: NewDataset, ingestor: &Ingestor) -> EngineResult<Created> {
    let valid = request.validate()?;

    conn.execute(
        "INSERT INTO dataset (name, authors, status) VALUES (?1, ?2, ?3)",
        params![valid.name, valid.authors, DatasetStatus::Pending.as_str()],
    )
    .map_err(|err| {
        tracing::error!(error = %err, "failed to insert dataset row");
        EngineError::Connection
    })?;
    let id = DatasetId(conn.last_insert_rowid());
    tracing::info!(dataset = id.raw(), name = %valid.name, "registered dataset");

    let (status, ingest_error) = match ingestor.ingest(conn, id, &valid.file) {
        Ok(rows) => {
            tracing::info!(dataset = id.raw(), rows, "ingested dataset");
            (DatasetStatus::Ready, None)
        }
        Err(err) => {
            tracing::error!(dataset = id.raw(), file = %valid.file.file_name, error = %err, "ingestion failed");
            (DatasetStatus::Failed, Some(EngineError::SavingFile))
        }
    };
    set_status(conn, id, status).map_err(|err| {
        tracing::error!(dataset = id.raw(), status = status.as_str(), error = %err, "failed to record dataset status");
        EngineError::Connection
    })?;

    Ok(Created {
        dataset: Dataset {
            id,
            name: valid.name,
            authors: valid.authors,
            status,
        },
        ingest_error,
    })
}

pub fn set_status(conn: &Connection, id: DatasetId, status: DatasetStatus) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE dataset SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id.raw()],
    )?;
    Ok(())
}

/// Every dataset in ascending id order.
pub fn list_all(conn: &Connection) -> EngineResult<Vec<Dataset>> {
    let query = || -> rusqlite::Result<Vec<Dataset>> {
        let mut stmt = conn.prepare("SELECT id, name, authors, status FROM dataset ORDER BY id")?;
        stmt.query_map([], row_to_dataset)?.collect()
    };
    query().map_err(|err| {
        tracing::error!(error = %err, "failed to list datasets");
        EngineError::Connection
    })
}

pub fn get(conn: &Connection, id: DatasetId) -> EngineResult<Dataset> {
    conn.query_row(
        "SELECT id, name, authors, status FROM dataset WHERE id = ?1",
        params![id.raw()],
        row_to_dataset,
    )
    .optional()
    .map_err(|err| {
        tracing::error!(dataset = id.raw(), error = %err, "failed to read dataset");
        EngineError::Connection
    })?
    .ok_or(EngineError::NotFound("dataset"))
}
