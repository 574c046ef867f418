//! Projects query rows into records using the table's declared column types.

use rusqlite::{Params, Statement};
use thiserror::Error;

use crate::catalog::TableSchema;
use crate::decode::{DecodeError, DecoderRegistry, ValueKind};
use crate::value::Record;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("could not read dataset rows: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("could not read dataset column {column}: {source}")]
    Decode {
        column: String,
        #[source]
        source: DecodeError,
    },
}

/// Runs `stmt` and decodes every row. Column kinds are resolved once from
/// `schema`; result columns missing from the schema decode as text. The first
/// undecodable cell aborts the whole projection.
pub fn project<P: Params>(
    stmt: &mut Statement<'_>,
    params: P,
    schema: &TableSchema,
    registry: &DecoderRegistry,
) -> Result<Vec<Record>, ProjectError> {
    let columns: Vec<(String, ValueKind)> = stmt
        .column_names()
        .into_iter()
        .map(|name| {
            let kind = registry.resolve(schema.declared_type(name));
            (name.to_string(), kind)
        })
        .collect();

    let mut rows = stmt.query(params)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (idx, (name, kind)) in columns.iter().enumerate() {
            let value = kind
                .decode(row.get_ref(idx)?)
                .map_err(|source| ProjectError::Decode {
                    column: name.clone(),
                    source,
                })?;
            record.insert(name.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use rusqlite::Connection;

    fn fixture() -> (Connection, TableSchema) {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE dataset_1 (line_number INTEGER PRIMARY KEY, name TEXT, active BOOL, score REAL);
             INSERT INTO dataset_1 VALUES (1, 'ada', 1, 2.5);
             INSERT INTO dataset_1 VALUES (2, NULL, NULL, NULL);",
        )
        .expect("seed");
        let schema = TableSchema::load(&conn, "dataset_1")
            .expect("load")
            .expect("exists");
        (conn, schema)
    }

    #[test]
    fn rows_decode_by_declared_type() {
        let (conn, schema) = fixture();
        let mut stmt = conn
            .prepare("SELECT * FROM dataset_1 ORDER BY line_number")
            .expect("prepare");
        let records = project(&mut stmt, [], &schema, &DecoderRegistry::default()).expect("rows");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["line_number"], Value::Int(1));
        assert_eq!(records[0]["name"], Value::from("ada"));
        assert_eq!(records[0]["active"], Value::Bool(true));
        assert_eq!(records[0]["score"], Value::Float(2.5));

        assert_eq!(records[1]["name"], Value::from(""));
        assert_eq!(records[1]["active"], Value::Bool(false));
        assert_eq!(records[1]["score"], Value::Float(0.0));
    }

    #[test]
    fn undecodable_cell_fails_the_projection() {
        let (conn, schema) = fixture();
        conn.execute("UPDATE dataset_1 SET active = 'maybe' WHERE line_number = 2", [])
            .expect("update");
        let mut stmt = conn.prepare("SELECT * FROM dataset_1").expect("prepare");
        let err = project(&mut stmt, [], &schema, &DecoderRegistry::default()).unwrap_err();
        match err {
            ProjectError::Decode { column, .. } => assert_eq!(column, "active"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_registry_reads_everything_as_text() {
        let (conn, schema) = fixture();
        let mut stmt = conn
            .prepare("SELECT line_number, active FROM dataset_1 WHERE line_number = ?1")
            .expect("prepare");
        let records = project(&mut stmt, [1], &schema, &DecoderRegistry::empty()).expect("rows");
        assert_eq!(records[0]["line_number"], Value::from("1"));
        assert_eq!(records[0]["active"], Value::from("1"));
    }
}
