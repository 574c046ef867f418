//! Record queries: paginated reads, point lookup and single-row updates.

use rusqlite::types::ToSql;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::catalog::{ROW_NUMBER_COLUMN, TableSchema, quote_ident};
use crate::decode::DecoderRegistry;
use crate::error::{EngineError, EngineResult};
use crate::project::{ProjectError, project};
use crate::registry::{self, Dataset, DatasetId};
use crate::schema::{enum_constraints, list_fields};
use crate::value::{Record, Value};

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_ITEMS_PER_PAGE: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pagination {
    pub page: i64,
    pub items_per_page: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: DEFAULT_PAGE,
            items_per_page: DEFAULT_ITEMS_PER_PAGE,
        }
    }
}

fn positive(raw: Option<&str>) -> Option<i64> {
    raw?.trim().parse::<i64>().ok().filter(|value| *value >= 1)
}

impl Pagination {
    /// Absent, unparsable or non-positive inputs fall back to the defaults.
    pub fn parse(page: Option<&str>, items: Option<&str>) -> Self {
        Self {
            page: positive(page).unwrap_or(DEFAULT_PAGE),
            items_per_page: positive(items).unwrap_or(DEFAULT_ITEMS_PER_PAGE),
        }
    }

    pub fn offset(self) -> i64 {
        (self.page - 1).saturating_mul(self.items_per_page)
    }
}

/// One page of a dataset together with its catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetContent {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub total_items: i64,
    pub content: Vec<Record>,
}

fn backing_schema(conn: &Connection, dataset: &Dataset, fallback: EngineError) -> EngineResult<TableSchema> {
    match TableSchema::load(conn, &dataset.id.table_name()) {
        Ok(Some(schema)) => Ok(schema),
        Ok(None) => {
            tracing::warn!(dataset = dataset.id.raw(), status = dataset.status.as_str(), "dataset has no backing table");
            Err(fallback)
        }
        Err(err) => {
            tracing::error!(dataset = dataset.id.raw(), error = %err, "failed to read table columns");
            Err(fallback)
        }
    }
}

fn lookup(conn: &Connection, id: DatasetId, fallback: EngineError) -> EngineResult<Dataset> {
    registry::get(conn, id).map_err(|err| match err {
        EngineError::NotFound(_) => err,
        _ => fallback,
    })
}

pub fn get_page(
    conn: &Connection,
    decoders: &DecoderRegistry,
    id: DatasetId,
    pagination: Pagination,
) -> EngineResult<DatasetContent> {
    let dataset = lookup(conn, id, EngineError::GetDataset)?;
    let schema = backing_schema(conn, &dataset, EngineError::GetDataset)?;
    let table = quote_ident(&schema.table);

    let total_items: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .map_err(|err| {
            tracing::error!(dataset = id.raw(), error = %err, "failed to count rows");
            EngineError::GetDataset
        })?;

    let page = || -> Result<Vec<Record>, ProjectError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {table} ORDER BY {} LIMIT ?1 OFFSET ?2",
            quote_ident(ROW_NUMBER_COLUMN)
        ))?;
        project(
            &mut stmt,
            params![pagination.items_per_page, pagination.offset()],
            &schema,
            decoders,
        )
    };
    let content = page().map_err(|err| {
        tracing::error!(dataset = id.raw(), page = pagination.page, error = %err, "failed to read page");
        EngineError::GetDataset
    })?;

    Ok(DatasetContent {
        dataset,
        total_items,
        content,
    })
}

fn select_row(
    conn: &Connection,
    decoders: &DecoderRegistry,
    schema: &TableSchema,
    row_number: i64,
) -> Result<Option<Record>, ProjectError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_ident(&schema.table),
        quote_ident(ROW_NUMBER_COLUMN)
    ))?;
    Ok(project(&mut stmt, params![row_number], schema, decoders)?
        .into_iter()
        .next())
}

pub fn get_by_row_number(
    conn: &Connection,
    decoders: &DecoderRegistry,
    id: DatasetId,
    row_number: i64,
) -> EngineResult<Record> {
    let dataset = lookup(conn, id, EngineError::GetRecord)?;
    let schema = backing_schema(conn, &dataset, EngineError::GetRecord)?;
    select_row(conn, decoders, &schema, row_number)
        .map_err(|err| {
            tracing::error!(dataset = id.raw(), row = row_number, error = %err, "failed to read record");
            EngineError::GetRecord
        })?
        .ok_or(EngineError::NotFound("record"))
}

/// Overwrites the patched columns of one row and returns the row as stored.
pub fn update_record(
    conn: &Connection,
    decoders: &DecoderRegistry,
    id: DatasetId,
    row_number: i64,
    patch: &Record,
) -> EngineResult<Record> {
    if patch.is_empty() {
        return Err(EngineError::Validation("empty patch".into()));
    }
    let dataset = lookup(conn, id, EngineError::UpdateRecord)?;
    let fields = list_fields(conn, id).map_err(|_| EngineError::UpdateRecord)?;
    let enums = enum_constraints(&fields);

    let mut assignments = Vec::with_capacity(patch.len());
    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(patch.len() + 1);
    for (key, value) in patch {
        if key.eq_ignore_ascii_case(ROW_NUMBER_COLUMN) {
            return Err(EngineError::Validation(format!(
                "{ROW_NUMBER_COLUMN} cannot be changed"
            )));
        }
        let field = fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(key))
            .ok_or_else(|| EngineError::Validation(format!("unknown column {key}")))?;
        if let Some(options) = enums.get(&field.name.to_ascii_lowercase()) {
            let allowed = matches!(value, Value::Text(text) if options.contains(text));
            if !allowed {
                return Err(EngineError::Validation(format!(
                    "{value} is not an option of {}",
                    field.name
                )));
            }
        }
        values.push(value);
        assignments.push(format!("{} = ?{}", quote_ident(&field.name), values.len()));
    }
    values.push(&row_number);

    let apply = || -> Result<Option<Record>, ProjectError> {
        let tx = conn.unchecked_transaction()?;
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET {} WHERE {} = ?{}",
                quote_ident(&dataset.id.table_name()),
                assignments.join(", "),
                quote_ident(ROW_NUMBER_COLUMN),
                values.len()
            ),
            &values[..],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let Some(schema) = TableSchema::load(&tx, &dataset.id.table_name())? else {
            return Ok(None);
        };
        let updated = select_row(&tx, decoders, &schema, row_number)?;
        tx.commit()?;
        Ok(updated)
    };
    let updated = apply().map_err(|err| {
        tracing::error!(dataset = id.raw(), row = row_number, error = %err, "failed to update record");
        EngineError::UpdateRecord
    })?;
    match updated {
        Some(record) => {
            tracing::info!(dataset = id.raw(), row = row_number, columns = patch.len(), "updated record");
            Ok(record)
        }
        None => Err(EngineError::NotFound("record")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_silently() {
        assert_eq!(Pagination::parse(None, None), Pagination::default());
        assert_eq!(Pagination::parse(Some("abc"), Some("-4")), Pagination::default());
        assert_eq!(Pagination::parse(Some("0"), Some("0")), Pagination::default());
        assert_eq!(
            Pagination::parse(Some("3"), Some(" 25 ")),
            Pagination {
                page: 3,
                items_per_page: 25
            }
        );
    }

    #[test]
    fn offsets_skip_whole_pages() {
        assert_eq!(Pagination::default().offset(), 0);
        assert_eq!(Pagination::parse(Some("2"), Some("5")).offset(), 5);
        assert_eq!(
            Pagination {
                page: i64::MAX,
                items_per_page: i64::MAX
            }
            .offset(),
            i64::MAX
        );
    }
}
