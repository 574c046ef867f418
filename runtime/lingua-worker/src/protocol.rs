//! Request and response payloads for each worker entry.
//!
//! Path parameters (`id`, `record_id`, `page`, `items`) arrive loosely typed
//! so that a malformed id maps to the operation's own error class rather
//! than to a body decoding failure.

use lingua_engine::{Dataset, DatasetContent, Field, Record};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// A path or query parameter as sent by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_text(&self) -> String {
        match self {
            ParamValue::Int(value) => value.to_string(),
            ParamValue::Float(value) => value.to_string(),
            ParamValue::Text(value) => value.clone(),
        }
    }
}

/// Parameters common to the dataset-scoped entries; other keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct PathParams {
    #[serde(default)]
    pub id: Option<ParamValue>,
    #[serde(default)]
    pub record_id: Option<ParamValue>,
    #[serde(default)]
    pub page: Option<ParamValue>,
    #[serde(default)]
    pub items: Option<ParamValue>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CreateDatasetRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file: Option<ByteBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDatasetResponse {
    #[serde(flatten)]
    pub dataset: Dataset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingest_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddFieldsBody {
    pub fields: Vec<Field>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateRecordBody {
    pub values: Record,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetsResponse {
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FieldsResponse {
    pub fields: Vec<Field>,
}

pub type RecordsResponse = DatasetContent;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub pool_in_flight: usize,
    pub pool_idle: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: u64,
}
