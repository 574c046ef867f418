//! Entry point tying the pool, decoder registry and ingestion together.

use std::sync::Arc;

use lingua_db::{Pool, Pooled, SqliteConn, sqlite_pool};

use crate::catalog::migrate;
use crate::config::{ConverterConfig, EngineConfig};
use crate::decode::{DecoderRegistry, ValueKind};
use crate::error::{EngineError, EngineResult};
use crate::ingest::{CommandConverter, Ingestor, SqliteImporter, TableConverter};
use crate::records::{self, DatasetContent, Pagination};
use crate::registry::{self, Created, Dataset, DatasetId, NewDataset};
use crate::schema::{self, Field};
use crate::value::Record;

pub struct Engine {
    pool: Arc<Pool<SqliteConn>>,
    config: EngineConfig,
    decoders: DecoderRegistry,
    ingestor: Ingestor,
}

fn converter_from_config(config: &EngineConfig) -> Box<dyn TableConverter> {
    match &config.converter {
        ConverterConfig::InProcess => Box::new(SqliteImporter),
        ConverterConfig::Command {
            program,
            args,
            timeout_ms,
        } => Box::new(CommandConverter::new(
            program.clone(),
            args.clone(),
            config.database_path.clone(),
            std::time::Duration::from_millis(*timeout_ms),
        )),
    }
}

impl Engine {
    /// Opens the database, applies catalog migrations and picks the
    /// configured converter.
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let converter = converter_from_config(&config);
        Self::with_converter(config, converter)
    }

    pub fn with_converter(
        config: EngineConfig,
        converter: Box<dyn TableConverter>,
    ) -> EngineResult<Self> {
        let pool = sqlite_pool(&config.database_path, config.pool_size.max(1));
        let ingestor = Ingestor::new(config.staging_dir.clone(), converter);
        let engine = Self {
            pool,
            config,
            decoders: DecoderRegistry::default(),
            ingestor,
        };

        let mut conn = engine.connection()?;
        let applied = migrate(conn.as_mut().connection_mut()).map_err(|err| {
            tracing::error!(error = %err, "catalog migration failed");
            EngineError::Connection
        })?;
        drop(conn);
        tracing::info!(
            database = %engine.config.database_path.display(),
            pool_size = engine.config.pool_size,
            migrations = applied,
            "engine ready"
        );
        Ok(engine)
    }

    /// Maps an additional declared type name to a value kind.
    pub fn register_type(&mut self, type_name: &str, kind: ValueKind) {
        self.decoders.register(type_name, kind);
    }

    pub fn pool(&self) -> &Arc<Pool<SqliteConn>> {
        &self.pool
    }

    fn connection(&self) -> EngineResult<Pooled<SqliteConn>> {
        self.pool
            .acquire(Some(self.config.acquire_timeout()))
            .map_err(|err| {
                tracing::error!(error = %err, in_flight = self.pool.in_flight(), "could not acquire connection");
                EngineError::Connection
            })
    }

    pub fn create_dataset(&self, request: NewDataset) -> EngineResult<Created> {
        let conn = self.connection()?;
        registry::create(conn.as_ref().connection(), request, &self.ingestor)
    }

    pub fn list_datasets(&self) -> EngineResult<Vec<Dataset>> {
        let conn = self.connection()?;
        registry::list_all(conn.as_ref().connection())
    }

    pub fn get_dataset(&self, id: DatasetId) -> EngineResult<Dataset> {
        let conn = self.connection()?;
        registry::get(conn.as_ref().connection(), id)
    }

    pub fn add_fields(&self, id: DatasetId, fields: &[Field]) -> EngineResult<Vec<Field>> {
        let conn = self.connection()?;
        schema::add_fields(conn.as_ref().connection(), id, fields)
    }

    pub fn list_fields(&self, id: DatasetId) -> EngineResult<Vec<Field>> {
        let conn = self.connection()?;
        schema::list_fields(conn.as_ref().connection(), id)
    }

    pub fn get_page(&self, id: DatasetId, pagination: Pagination) -> EngineResult<DatasetContent> {
        let conn = self.connection()?;
        records::get_page(conn.as_ref().connection(), &self.decoders, id, pagination)
    }

    pub fn get_record(&self, id: DatasetId, row_number: i64) -> EngineResult<Record> {
        let conn = self.connection()?;
        records::get_by_row_number(conn.as_ref().connection(), &self.decoders, id, row_number)
    }

    pub fn update_record(
        &self,
        id: DatasetId,
        row_number: i64,
        patch: &Record,
    ) -> EngineResult<Record> {
        let conn = self.connection()?;
        records::update_record(
            conn.as_ref().connection(),
            &self.decoders,
            id,
            row_number,
            patch,
        )
    }
}
