//! Ingestion pipeline: stage the upload, number its rows, hand it to a
//! converter that materializes `dataset_<id>`.
//!
//! Staging directories are scoped to one ingestion and removed on every exit
//! path, including failures.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use csv::StringRecord;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use tempfile::TempDir;
use thiserror::Error;

use crate::catalog::{ROW_NUMBER_COLUMN, TableSchema, quote_ident};
use crate::registry::DatasetId;

const CONVERTER_POLL: Duration = Duration::from_millis(10);

/// Raw bytes of an uploaded tabular file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("staging failed: {0}")]
    Stage(#[from] io::Error),
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("upload has no header row")]
    MissingHeader,
    #[error("numbered file does not start with the line_number column")]
    MissingRowNumber,
    #[error("record {record} has an invalid row number")]
    InvalidRowNumber { record: usize },
    #[error("record {record} has {found} fields, header has {expected}")]
    RaggedRow {
        record: usize,
        found: usize,
        expected: usize,
    },
    #[error("import failed: {0}")]
    Import(#[from] rusqlite::Error),
    #[error("converter {program} could not start: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("converter i/o failed: {0}")]
    Converter(#[source] io::Error),
    #[error("converter exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
    #[error("converter timed out after {0:?}")]
    Timeout(Duration),
    #[error("converter left no {table} table with a leading line_number column")]
    Unmaterialized { table: String },
}

/// Turns a row-numbered CSV into a populated table.
///
/// The first CSV column is [`ROW_NUMBER_COLUMN`]; the created table must keep
/// it as an integer column and add one column per remaining CSV field.
pub trait TableConverter: Send + Sync {
    fn convert(&self, conn: &Connection, numbered_csv: &Path, table: &str)
    -> Result<(), IngestError>;
}

/// Per-ingestion scratch directory under the staging root.
pub struct StagingArea {
    dataset: DatasetId,
    dir: TempDir,
}

impl StagingArea {
    pub fn acquire(root: &Path, dataset: DatasetId) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let prefix = format!("{}_", dataset.table_name());
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?;
        Ok(Self { dataset, dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input_path(&self) -> PathBuf {
        self.path().join("input.csv")
    }

    pub fn numbered_path(&self) -> PathBuf {
        self.path()
            .join(format!("{}.csv", self.dataset.table_name()))
    }

    pub fn write_upload(&self, upload: &UploadedFile) -> io::Result<PathBuf> {
        let path = self.input_path();
        let mut file = File::create(&path)?;
        io::copy(&mut upload.contents.as_slice(), &mut file)?;
        file.flush()?;
        Ok(path)
    }

    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Makes CSV headers usable as distinct column names.
///
/// Blank headers become `column_<n>`; repeats (compared case-insensitively,
/// including against the row-number column) get `_2`, `_3`, ... suffixes.
pub fn normalize_headers(headers: &StringRecord) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(ROW_NUMBER_COLUMN.to_string());
    headers
        .iter()
        .enumerate()
        .map(|(idx, raw)| {
            let trimmed = raw.trim();
            let base = if trimmed.is_empty() {
                format!("column_{}", idx + 1)
            } else {
                trimmed.to_string()
            };
            let mut name = base.clone();
            let mut suffix = 2;
            while !seen.insert(name.to_lowercase()) {
                name = format!("{base}_{suffix}");
                suffix += 1;
            }
            name
        })
        .collect()
}

/// Copies `input` to `output` with a 1-based row-number column prepended.
/// Returns the number of data rows.
pub fn number_rows(input: &Path, output: &Path) -> Result<usize, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(input)?;
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(IngestError::MissingHeader);
    }
    let columns = normalize_headers(&headers);

    // Short rows pass through as-is; padding or rejection is up to the converter.
    let mut writer = csv::WriterBuilder::new().flexible(true).from_path(output)?;
    writer.write_record(
        std::iter::once(ROW_NUMBER_COLUMN).chain(columns.iter().map(String::as_str)),
    )?;
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record?;
        rows += 1;
        let number = rows.to_string();
        writer.write_record(std::iter::once(number.as_str()).chain(record.iter()))?;
    }
    writer.flush()?;
    Ok(rows)
}

/// Default converter: imports into the engine's own database, every field
/// stored as TEXT.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteImporter;

impl TableConverter for SqliteImporter {
    fn convert(
        &self,
        conn: &Connection,
        numbered_csv: &Path,
        table: &str,
    ) -> Result<(), IngestError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(numbered_csv)?;
        let headers = reader.headers()?.clone();
        if headers.get(0) != Some(ROW_NUMBER_COLUMN) {
            return Err(IngestError::MissingRowNumber);
        }
        let width = headers.len();

        let mut ddl = format!(
            "CREATE TABLE {} ({} INTEGER PRIMARY KEY",
            quote_ident(table),
            quote_ident(ROW_NUMBER_COLUMN)
        );
        for column in headers.iter().skip(1) {
            ddl.push_str(", ");
            ddl.push_str(&quote_ident(column));
            ddl.push_str(" TEXT");
        }
        ddl.push(')');

        let placeholders = (1..=width)
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!("INSERT INTO {} VALUES ({placeholders})", quote_ident(table));

        let tx = conn.unchecked_transaction()?;
        tx.execute(&ddl, [])?;
        let mut imported = 0usize;
        {
            let mut stmt = tx.prepare(&insert)?;
            for (idx, record) in reader.records().enumerate() {
                let record = record?;
                let position = idx + 1;
                if record.len() > width {
                    return Err(IngestError::RaggedRow {
                        record: position,
                        found: record.len(),
                        expected: width,
                    });
                }
                let number: i64 = record
                    .get(0)
                    .and_then(|raw| raw.trim().parse().ok())
                    .ok_or(IngestError::InvalidRowNumber { record: position })?;
                let values = std::iter::once(SqlValue::Integer(number)).chain((1..width).map(
                    |col| match record.get(col) {
                        Some(cell) => SqlValue::Text(cell.to_string()),
                        None => SqlValue::Null,
                    },
                ));
                stmt.execute(params_from_iter(values))?;
                imported += 1;
            }
        }
        tx.commit()?;
        tracing::debug!(table, rows = imported, columns = width, "imported csv");
        Ok(())
    }
}

/// Shells out to an external import tool.
#[derive(Clone, Debug)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    database: PathBuf,
    timeout: Duration,
}

impl CommandConverter {
    pub fn new(program: String, args: Vec<String>, database: PathBuf, timeout: Duration) -> Self {
        Self {
            program,
            args,
            database,
            timeout,
        }
    }

    fn expand_args(&self, numbered_csv: &Path, table: &str) -> Vec<String> {
        let input = numbered_csv.display().to_string();
        let database = self.database.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{table}", table)
                    .replace("{database}", &database)
            })
            .collect()
    }
}

impl TableConverter for CommandConverter {
    fn convert(
        &self,
        _conn: &Connection,
        numbered_csv: &Path,
        table: &str,
    ) -> Result<(), IngestError> {
        let args = self.expand_args(numbered_csv, table);
        tracing::debug!(program = %self.program, ?args, "running converter");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| IngestError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drained on a side thread so a chatty converter cannot block on a full pipe.
        let stderr = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().map_err(IngestError::Converter)? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_reader.join();
                return Err(IngestError::Timeout(self.timeout));
            }
            thread::sleep(CONVERTER_POLL);
        };
        let stderr = stderr_reader.join().unwrap_or_default();
        if !status.success() {
            return Err(IngestError::Exit {
                status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Checks that `table` exists and keeps the row number as its first column.
fn verify_materialized(conn: &Connection, table: &str) -> Result<(), IngestError> {
    let leading = TableSchema::load(conn, table)?.and_then(|schema| {
        schema
            .columns
            .into_iter()
            .find(|column| column.ordinal == 0)
    });
    match leading {
        Some(column) if column.name.eq_ignore_ascii_case(ROW_NUMBER_COLUMN) => Ok(()),
        _ => Err(IngestError::Unmaterialized {
            table: table.to_string(),
        }),
    }
}

/// Runs staging, row numbering and conversion for one dataset.
pub struct Ingestor {
    staging_root: PathBuf,
    converter: Box<dyn TableConverter>,
}

impl Ingestor {
    pub fn new(staging_root: PathBuf, converter: Box<dyn TableConverter>) -> Self {
        Self {
            staging_root,
            converter,
        }
    }

    /// Materializes `dataset_<id>`; returns the number of ingested rows.
    pub fn ingest(
        &self,
        conn: &Connection,
        dataset: DatasetId,
        upload: &UploadedFile,
    ) -> Result<usize, IngestError> {
        let staging = StagingArea::acquire(&self.staging_root, dataset)?;
        let input = staging.write_upload(upload)?;
        let numbered = staging.numbered_path();
        let rows = number_rows(&input, &numbered)?;
        let table = dataset.table_name();
        self.converter.convert(conn, &numbered, &table)?;
        verify_materialized(conn, &table)?;
        if let Err(err) = staging.close() {
            tracing::warn!(dataset = dataset.raw(), error = %err, "failed to remove staging directory");
        }
        Ok(rows)
    }
}
