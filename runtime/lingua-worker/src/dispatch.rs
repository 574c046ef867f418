//! Maps worker entries onto engine operations and builds response envelopes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use lingua_engine::{
    DatasetId, Engine, EngineError, NewDataset, Pagination, UploadedFile,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_bytes::ByteBuf;

use crate::protocol::{
    AddFieldsBody, CancelRequest, CreateDatasetRequest, CreateDatasetResponse, DatasetsResponse,
    FieldsResponse, HealthResponse, ParamValue, PathParams, UpdateRecordBody,
};
use crate::wire::{
    DecodedRequest, RequestEnvelope, ResponseEnvelope, WireCodec, decode_payload, encode_payload,
    extract_payload,
};

pub type CancelSet = Arc<Mutex<HashSet<u64>>>;

/// Entries served besides the `__`-prefixed control entries.
pub const ENTRIES: &[&str] = &[
    "create_dataset",
    "list_datasets",
    "get_dataset",
    "add_fields",
    "list_fields",
    "list_records",
    "get_record",
    "update_record",
    "health",
];

const DEFAULT_UPLOAD_NAME: &str = "upload.csv";

#[derive(Debug)]
pub struct ExecError {
    pub status: &'static str,
    pub message: String,
}

impl From<EngineError> for ExecError {
    fn from(err: EngineError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl ExecError {
    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: "InvalidInput",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: "InternalError",
            message: message.into(),
        }
    }
}

pub fn is_cancelled(cancelled: &CancelSet, request_id: u64) -> bool {
    cancelled
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&request_id)
}

pub fn mark_cancelled(cancelled: &CancelSet, request_id: u64) {
    cancelled
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(request_id);
}

pub fn handle_cancel_request(
    envelope: &RequestEnvelope,
    cancelled: &CancelSet,
) -> Result<(), ExecError> {
    let payload =
        extract_payload(envelope).map_err(|err| ExecError::invalid_input(err.to_string()))?;
    let cancel = decode_payload::<CancelRequest>(&payload, &envelope.codec)
        .map_err(|err| ExecError::invalid_input(err.to_string()))?;
    mark_cancelled(cancelled, cancel.request_id);
    tracing::debug!(target_request = cancel.request_id, "request marked cancelled");
    Ok(())
}

/// Decodes a request body; any failure is reported as an invalid body.
fn decode_body<T: DeserializeOwned>(payload: &[u8], codec: &str) -> Result<T, ExecError> {
    decode_payload(payload, codec).map_err(|err| {
        tracing::debug!(error = %err, "request body rejected");
        ExecError::from(EngineError::InvalidBody)
    })
}

fn dataset_id(param: Option<&ParamValue>, class: EngineError) -> Result<DatasetId, ExecError> {
    param
        .and_then(|id| id.as_text().parse::<DatasetId>().ok())
        .ok_or_else(|| class.into())
}

fn row_number(param: Option<&ParamValue>, class: EngineError) -> Result<i64, ExecError> {
    param
        .and_then(|row| row.as_text().trim().parse::<i64>().ok())
        .filter(|row| *row >= 1)
        .ok_or_else(|| class.into())
}

fn response_codec(codec: &str) -> &'static str {
    match codec {
        "msgpack" => "msgpack",
        _ => "json",
    }
}

fn encode<T: Serialize>(value: &T, codec: &str) -> Result<(String, Vec<u8>), ExecError> {
    let codec = response_codec(codec);
    let encoded = encode_payload(value, codec).map_err(|err| ExecError::internal(err.to_string()))?;
    Ok((codec.to_string(), encoded))
}

fn create_dataset(engine: &Engine, payload: &[u8], codec: &str) -> Result<(String, Vec<u8>), ExecError> {
    let request: CreateDatasetRequest = decode_body(payload, codec)?;
    let file = request.file.map(|bytes| UploadedFile {
        file_name: request
            .file_name
            .clone()
            .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string()),
        contents: bytes.into_vec(),
    });
    let created = engine.create_dataset(NewDataset {
        name: request.name,
        authors: request.authors,
        file,
    })?;
    encode(
        &CreateDatasetResponse {
            dataset: created.dataset,
            ingest_error: created.ingest_error.map(|err| err.to_string()),
        },
        codec,
    )
}

pub fn execute_entry(
    engine: &Engine,
    envelope: &RequestEnvelope,
) -> Result<(String, Vec<u8>), ExecError> {
    let payload =
        extract_payload(envelope).map_err(|err| ExecError::invalid_input(err.to_string()))?;
    let codec = envelope.codec.as_str();
    match envelope.entry.as_str() {
        "__ping__" => Ok(("raw".to_string(), Vec::new())),
        "health" => {
            let pool = engine.pool();
            encode(
                &HealthResponse {
                    ok: true,
                    pool_in_flight: pool.in_flight(),
                    pool_idle: pool.idle_count(),
                },
                codec,
            )
        }
        "create_dataset" => create_dataset(engine, &payload, codec),
        "list_datasets" => encode(
            &DatasetsResponse {
                datasets: engine.list_datasets()?,
            },
            codec,
        ),
        "get_dataset" => {
            let params: PathParams = decode_body(&payload, codec)?;
            let id = dataset_id(params.id.as_ref(), EngineError::GetDataset)?;
            encode(&engine.get_dataset(id)?, codec)
        }
        "add_fields" => {
            let params: PathParams = decode_body(&payload, codec)?;
            let id = dataset_id(params.id.as_ref(), EngineError::GetDataset)?;
            let body: AddFieldsBody = decode_body(&payload, codec)?;
            encode(
                &FieldsResponse {
                    fields: engine.add_fields(id, &body.fields)?,
                },
                codec,
            )
        }
        "list_fields" => {
            let params: PathParams = decode_body(&payload, codec)?;
            let id = dataset_id(params.id.as_ref(), EngineError::GetDataset)?;
            encode(
                &FieldsResponse {
                    fields: engine.list_fields(id)?,
                },
                codec,
            )
        }
        "list_records" => {
            let params: PathParams = decode_body(&payload, codec)?;
            let id = dataset_id(params.id.as_ref(), EngineError::GetDataset)?;
            let page = params.page.as_ref().map(ParamValue::as_text);
            let items = params.items.as_ref().map(ParamValue::as_text);
            let pagination = Pagination::parse(page.as_deref(), items.as_deref());
            encode(&engine.get_page(id, pagination)?, codec)
        }
        "get_record" => {
            let params: PathParams = decode_body(&payload, codec)?;
            let id = dataset_id(params.id.as_ref(), EngineError::GetRecord)?;
            let row = row_number(params.record_id.as_ref(), EngineError::GetRecord)?;
            encode(&engine.get_record(id, row)?, codec)
        }
        "update_record" => {
            let params: PathParams = decode_body(&payload, codec)?;
            let id = dataset_id(params.id.as_ref(), EngineError::UpdateRecord)?;
            let row = row_number(params.record_id.as_ref(), EngineError::UpdateRecord)?;
            let body: UpdateRecordBody = decode_body(&payload, codec)?;
            encode(&engine.update_record(id, row, &body.values)?, codec)
        }
        other => Err(ExecError::invalid_input(format!("Unknown entry '{other}'."))),
    }
}

fn millis(elapsed: Duration) -> u64 {
    elapsed.as_millis().min(u128::from(u64::MAX)) as u64
}

pub fn handle_request(
    engine: &Engine,
    request: DecodedRequest,
    queue_depth: usize,
    cancelled: &CancelSet,
) -> (WireCodec, ResponseEnvelope) {
    let wire = request.wire;
    let envelope = request.envelope;
    let request_id = envelope.request_id;
    let exec_start = Instant::now();
    let pool = engine.pool();

    let mut metrics = HashMap::new();
    metrics.insert(
        "queue_ms".to_string(),
        millis(exec_start.duration_since(request.queued_at)),
    );
    metrics.insert("queue_depth".to_string(), queue_depth as u64);
    metrics.insert("pool_in_flight".to_string(), pool.in_flight() as u64);
    metrics.insert("pool_idle".to_string(), pool.idle_count() as u64);

    let respond = |status: &str,
                   codec: String,
                   payload: Option<Vec<u8>>,
                   error: Option<String>,
                   metrics: HashMap<String, u64>| ResponseEnvelope {
        request_id,
        status: status.to_string(),
        codec,
        payload: payload.map(ByteBuf::from),
        metrics: Some(metrics),
        error,
        entry: Some(envelope.entry.clone()),
    };

    if is_cancelled(cancelled, request_id) {
        tracing::debug!(request_id, entry = %envelope.entry, "skipping cancelled request");
        return (
            wire,
            respond("Cancelled", "raw".into(), None, Some("Request cancelled".into()), metrics),
        );
    }
    if !envelope.entry.starts_with("__") && !ENTRIES.contains(&envelope.entry.as_str()) {
        return (
            wire,
            respond(
                "InvalidInput",
                "raw".into(),
                None,
                Some(format!("Unknown entry '{}'", envelope.entry)),
                metrics,
            ),
        );
    }

    let timeout = (envelope.timeout_ms != 0)
        .then(|| Duration::from_millis(u64::from(envelope.timeout_ms)));
    let result = execute_entry(engine, &envelope);
    let elapsed = exec_start.elapsed();
    metrics.insert("exec_ms".to_string(), millis(elapsed));

    if timeout.is_some_and(|limit| elapsed > limit) {
        tracing::warn!(request_id, entry = %envelope.entry, exec_ms = millis(elapsed), "request timed out");
        return (
            wire,
            respond("Timeout", "raw".into(), None, Some("Request timed out".into()), metrics),
        );
    }

    match result {
        Ok((codec, payload)) => {
            tracing::debug!(request_id, entry = %envelope.entry, exec_ms = millis(elapsed), "request served");
            (wire, respond("Ok", codec, Some(payload), None, metrics))
        }
        Err(err) => {
            tracing::debug!(request_id, entry = %envelope.entry, status = err.status, error = %err.message, "request failed");
            (
                wire,
                respond(err.status, "raw".into(), None, Some(err.message), metrics),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingua_engine::{DatasetContent, EngineConfig, Field, Value};
    use tempfile::TempDir;

    fn engine() -> (Engine, TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            database_path: dir.path().join("lingua.db"),
            staging_dir: dir.path().join("staging"),
            ..EngineConfig::default()
        };
        (Engine::open(config).expect("engine"), dir)
    }

    fn request(request_id: u64, entry: &str, payload: serde_json::Value) -> DecodedRequest {
        DecodedRequest {
            envelope: RequestEnvelope {
                request_id,
                entry: entry.to_string(),
                timeout_ms: 0,
                codec: "json".to_string(),
                payload: Some(ByteBuf::from(serde_json::to_vec(&payload).expect("json"))),
                payload_b64: None,
            },
            wire: WireCodec::Json,
            queued_at: Instant::now(),
        }
    }

    fn call(engine: &Engine, entry: &str, payload: serde_json::Value) -> ResponseEnvelope {
        handle_request(engine, request(1, entry, payload), 0, &CancelSet::default()).1
    }

    fn body<T: DeserializeOwned>(response: &ResponseEnvelope) -> T {
        let payload = response.payload.as_ref().expect("payload");
        serde_json::from_slice(payload).expect("decode")
    }

    fn create(engine: &Engine, csv: &str) -> i64 {
        let response = call(
            engine,
            "create_dataset",
            serde_json::json!({"name": "birds", "authors": "club", "file": csv}),
        );
        assert_eq!(response.status, "Ok", "{:?}", response.error);
        let created: CreateDatasetResponse = body(&response);
        assert!(created.ingest_error.is_none());
        created.dataset.id.raw()
    }

    #[test]
    fn create_then_page_through_records() {
        let (engine, _dir) = engine();
        let id = create(&engine, "species,count\nwren,3\nrobin,5\nowl,1\n");

        let response = call(
            &engine,
            "list_records",
            serde_json::json!({"id": id.to_string(), "page": "2", "items": 2}),
        );
        assert_eq!(response.status, "Ok");
        let content: DatasetContent = body(&response);
        assert_eq!(content.total_items, 3);
        assert_eq!(content.content.len(), 1);
        assert_eq!(content.content[0]["species"], Value::from("owl"));
        let metrics = response.metrics.expect("metrics");
        assert!(metrics.contains_key("exec_ms"));
        assert!(metrics.contains_key("pool_idle"));
    }

    #[test]
    fn malformed_ids_use_operation_classes() {
        let (engine, _dir) = engine();
        let fields = call(&engine, "list_fields", serde_json::json!({"id": "abc"}));
        assert_eq!(fields.status, "InternalError");
        assert_eq!(fields.error.as_deref(), Some("couldn't get dataset"));

        let record = call(
            &engine,
            "get_record",
            serde_json::json!({"id": "1", "record_id": "first"}),
        );
        assert_eq!(record.error.as_deref(), Some("couldn't get record"));
    }

    #[test]
    fn bad_bodies_are_invalid_input() {
        let (engine, _dir) = engine();
        let id = create(&engine, "a\n1\n");
        let response = call(
            &engine,
            "add_fields",
            serde_json::json!({"id": id, "fields": "notes"}),
        );
        assert_eq!(response.status, "InvalidInput");
        assert_eq!(response.error.as_deref(), Some("invalid body"));

        let missing_file = call(
            &engine,
            "create_dataset",
            serde_json::json!({"name": "x", "authors": "y"}),
        );
        assert_eq!(missing_file.error.as_deref(), Some("invalid body"));
    }

    #[test]
    fn fields_and_updates_through_entries() {
        let (engine, _dir) = engine();
        let id = create(&engine, "a\n1\n2\n");
        let added = call(
            &engine,
            "add_fields",
            serde_json::json!({"id": id, "fields": [{"name": "tag", "options": ["x", "y"]}]}),
        );
        assert_eq!(added.status, "Ok", "{:?}", added.error);
        let fields: FieldsResponse = body(&added);
        let tag = fields.fields.last().expect("tag");
        assert_eq!(tag, &Field {
            name: "tag".into(),
            options: vec!["x".into(), "y".into()],
            annotate: true,
            column_type: String::new(),
        });

        let updated = call(
            &engine,
            "update_record",
            serde_json::json!({"id": id, "record_id": "2", "values": {"tag": "y"}}),
        );
        assert_eq!(updated.status, "Ok", "{:?}", updated.error);
        let record: lingua_engine::Record = body(&updated);
        assert_eq!(record["tag"], Value::from("y"));

        let missing = call(
            &engine,
            "update_record",
            serde_json::json!({"id": id, "record_id": 9, "values": {"tag": "y"}}),
        );
        assert_eq!(missing.status, "NotFound");
    }

    #[test]
    fn cancelled_requests_are_skipped() {
        let (engine, _dir) = engine();
        let cancelled = CancelSet::default();
        let cancel = request(99, "__cancel__", serde_json::json!({"request_id": 5}));
        handle_cancel_request(&cancel.envelope, &cancelled).expect("cancel");

        let (_, response) = handle_request(
            &engine,
            request(5, "list_datasets", serde_json::json!({})),
            0,
            &cancelled,
        );
        assert_eq!(response.status, "Cancelled");
        assert!(!is_cancelled(&cancelled, 5));
    }

    #[test]
    fn unknown_entries_are_rejected() {
        let (engine, _dir) = engine();
        let response = call(&engine, "drop_everything", serde_json::json!({}));
        assert_eq!(response.status, "InvalidInput");
        assert_eq!(response.codec, "raw");

        let ping = call(&engine, "__ping__", serde_json::json!({}));
        assert_eq!(ping.status, "Ok");
        assert_eq!(ping.codec, "raw");
    }
}
