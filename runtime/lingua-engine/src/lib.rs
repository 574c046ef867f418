//! Lingua dataset engine: CSV ingestion into per-dataset tables, schema
//! evolution with user-defined columns, and typed record queries.

pub mod catalog;
pub mod config;
pub mod decode;
mod engine;
pub mod error;
pub mod ingest;
pub mod project;
pub mod records;
pub mod registry;
pub mod schema;
pub mod value;

pub use config::{ConfigError, ConverterConfig, EngineConfig};
pub use decode::{DecoderRegistry, ValueKind};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use ingest::{CommandConverter, IngestError, SqliteImporter, TableConverter, UploadedFile};
pub use records::{DatasetContent, Pagination};
pub use registry::{Created, Dataset, DatasetId, DatasetStatus, NewDataset};
pub use schema::Field;
pub use value::{Record, Value};
