//! Schema evolution: user-defined columns on a dataset's backing table.

use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::catalog::{ROW_NUMBER_COLUMN, TableSchema, quote_ident, quote_literal};
use crate::decode::normalize_type_name;
use crate::error::{EngineError, EngineResult};
use crate::registry::DatasetId;

/// Storage type of a free-text user-defined column.
pub const TEXT_COLUMN_TYPE: &str = "VARCHAR(4000)";

const MAX_IDENTIFIER_LEN: usize = 64;

/// Column descriptor exchanged with callers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Allowed values of an enumerated column, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Set on columns added after ingestion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub annotate: bool,
    #[serde(skip)]
    pub column_type: String,
}

impl Field {
    pub fn text(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn enumerated<I, S>(name: &str, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            options: options.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// Column identifier for an external field name: spaces become underscores;
/// the result must be a plain ASCII identifier.
pub fn column_identifier(name: &str) -> EngineResult<String> {
    let ident = name.trim().replace(' ', "_");
    let valid = !ident.is_empty()
        && ident.len() <= MAX_IDENTIFIER_LEN
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !ident.starts_with(|c: char| c.is_ascii_digit())
        && !ident.eq_ignore_ascii_case(ROW_NUMBER_COLUMN);
    if valid {
        Ok(ident)
    } else {
        Err(EngineError::Validation(format!("invalid field name {name:?}")))
    }
}

/// `ENUM('a','b')` with embedded quotes doubled.
pub fn enum_type(options: &[String]) -> String {
    let literals: Vec<String> = options.iter().map(|opt| quote_literal(opt)).collect();
    format!("ENUM({})", literals.join(","))
}

/// Inverse of [`enum_type`]. Returns an empty list for any other type.
pub fn parse_enum_options(column_type: &str) -> Vec<String> {
    if normalize_type_name(column_type) != "ENUM" {
        return Vec::new();
    }
    let (Some(open), Some(close)) = (column_type.find('('), column_type.rfind(')')) else {
        return Vec::new();
    };
    if close <= open {
        return Vec::new();
    }

    let mut options = Vec::new();
    let mut chars = column_type[open + 1..close].chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.next() != Some('\'') {
            break;
        }
        let mut option = String::new();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.next_if_eq(&'\'').is_some() {
                    option.push('\'');
                    continue;
                }
                break;
            }
            option.push(c);
        }
        options.push(option);
    }
    options
}

struct PlannedColumn {
    ident: String,
    declared: String,
    ddl: String,
}

fn plan(schema: &TableSchema, fields: &[Field]) -> EngineResult<Vec<PlannedColumn>> {
    let mut seen = HashSet::new();
    fields
        .iter()
        .map(|field| {
            let ident = column_identifier(&field.name)?;
            if schema.contains(&ident) || !seen.insert(ident.to_ascii_lowercase()) {
                return Err(EngineError::Validation(format!(
                    "field {ident} already exists"
                )));
            }
            let mut distinct = HashSet::new();
            if let Some(dup) = field.options.iter().find(|opt| !distinct.insert(*opt)) {
                return Err(EngineError::Validation(format!(
                    "field {ident} repeats option {dup:?}"
                )));
            }

            let quoted = quote_ident(&ident);
            let (declared, ddl) = if field.options.is_empty() {
                (
                    TEXT_COLUMN_TYPE.to_string(),
                    format!("{quoted} {TEXT_COLUMN_TYPE}"),
                )
            } else {
                let allowed: Vec<String> =
                    field.options.iter().map(|opt| quote_literal(opt)).collect();
                (
                    enum_type(&field.options),
                    format!("{quoted} TEXT CHECK ({quoted} IN ({}))", allowed.join(", ")),
                )
            };
            Ok(PlannedColumn {
                ident,
                declared,
                ddl,
            })
        })
        .collect()
}

fn load_schema(conn: &Connection, id: DatasetId) -> EngineResult<TableSchema> {
    TableSchema::load(conn, &id.table_name())
        .map_err(|err| {
            tracing::error!(dataset = id.raw(), error = %err, "failed to read table columns");
            EngineError::GetDataset
        })?
        .ok_or_else(|| {
            tracing::warn!(dataset = id.raw(), "backing table does not exist");
            EngineError::GetDataset
        })
}

/// Adds every field to `dataset_<id>` in one transaction and returns the full
/// column set afterwards.
pub fn add_fields(conn: &Connection, id: DatasetId, fields: &[Field]) -> EngineResult<Vec<Field>> {
    if fields.is_empty() {
        return Err(EngineError::InvalidBody);
    }
    let schema = load_schema(conn, id)?;
    let planned = plan(&schema, fields)?;
    let table = quote_ident(&schema.table);

    let apply = || -> rusqlite::Result<()> {
        let tx = conn.unchecked_transaction()?;
        for column in &planned {
            tx.execute(&format!("ALTER TABLE {table} ADD COLUMN {}", column.ddl), [])?;
            tx.execute(
                "INSERT INTO dataset_field (dataset_id, column_name, column_type, user_defined)
                 VALUES (?1, ?2, ?3, 1)",
                params![id.raw(), column.ident, column.declared],
            )?;
        }
        tx.commit()
    };
    apply().map_err(|err| {
        tracing::error!(dataset = id.raw(), error = %err, "failed to add fields");
        EngineError::CreateField
    })?;
    tracing::info!(dataset = id.raw(), added = planned.len(), "added user-defined fields");

    list_fields(conn, id)
}

/// Backing-table columns in storage order.
pub fn list_fields(conn: &Connection, id: DatasetId) -> EngineResult<Vec<Field>> {
    let schema = load_schema(conn, id)?;

    let catalog = || -> rusqlite::Result<HashMap<String, String>> {
        let mut stmt = conn.prepare(
            "SELECT column_name, column_type FROM dataset_field
             WHERE dataset_id = ?1 AND user_defined = 1",
        )?;
        stmt.query_map(params![id.raw()], |row| {
            let name: String = row.get(0)?;
            Ok((name.to_ascii_lowercase(), row.get(1)?))
        })?
        .collect()
    };
    let user_defined = catalog().map_err(|err| {
        tracing::error!(dataset = id.raw(), error = %err, "failed to read field catalog");
        EngineError::GetDataset
    })?;

    Ok(schema
        .columns
        .into_iter()
        .map(|column| {
            let recorded = user_defined.get(&column.name.to_ascii_lowercase());
            let column_type = recorded
                .cloned()
                .or(column.declared_type)
                .unwrap_or_default();
            Field {
                options: parse_enum_options(&column_type),
                annotate: recorded.is_some(),
                name: column.name,
                column_type,
            }
        })
        .collect())
}

/// Allowed values of each enumerated user-defined column, keyed by lowercase
/// column name.
pub(crate) fn enum_constraints(fields: &[Field]) -> HashMap<String, &[String]> {
    fields
        .iter()
        .filter(|field| !field.options.is_empty())
        .map(|field| (field.name.to_ascii_lowercase(), field.options.as_slice()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::migrate;
    use crate::ingest::{Ingestor, SqliteImporter, UploadedFile};
    use crate::registry::{self, NewDataset};

    fn seeded(csv: &str) -> (Connection, DatasetId, tempfile::TempDir) {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        let staging = tempfile::tempdir().expect("tempdir");
        let ingestor = Ingestor::new(staging.path().to_path_buf(), Box::new(SqliteImporter));
        let created = registry::create(
            &conn,
            NewDataset {
                name: Some("survey".into()),
                authors: Some("lab".into()),
                file: Some(UploadedFile {
                    file_name: "survey.csv".into(),
                    contents: csv.as_bytes().to_vec(),
                }),
            },
            &ingestor,
        )
        .expect("create");
        (conn, created.dataset.id, staging)
    }

    #[test]
    fn identifiers_replace_spaces() {
        assert_eq!(column_identifier("review status").as_deref(), Ok("review_status"));
        assert!(column_identifier("drop\"table").is_err());
        assert!(column_identifier("1st").is_err());
        assert!(column_identifier("LINE_NUMBER").is_err());
        assert!(column_identifier("  ").is_err());
    }

    #[test]
    fn enum_types_round_trip() {
        let options = vec!["a".to_string(), "it's".to_string(), "x,y".to_string()];
        let declared = enum_type(&options);
        assert_eq!(declared, "ENUM('a','it''s','x,y')");
        assert_eq!(parse_enum_options(&declared), options);
        assert!(parse_enum_options(TEXT_COLUMN_TYPE).is_empty());
    }

    #[test]
    fn added_fields_are_annotated() {
        let (conn, id, _staging) = seeded("city,pop\nOslo,1\n");
        let fields = add_fields(
            &conn,
            id,
            &[
                Field::text("notes"),
                Field::enumerated("review status", ["a", "b", "c"]),
            ],
        )
        .expect("add");

        let summary: Vec<_> = fields
            .iter()
            .map(|f| (f.name.as_str(), f.annotate, f.options.len()))
            .collect();
        assert_eq!(
            summary,
            [
                ("line_number", false, 0),
                ("city", false, 0),
                ("pop", false, 0),
                ("notes", true, 0),
                ("review_status", true, 3),
            ]
        );
        assert_eq!(fields[4].options, ["a", "b", "c"]);
        assert_eq!(fields[3].column_type, TEXT_COLUMN_TYPE);
        assert_eq!(list_fields(&conn, id).expect("list"), fields);
    }

    #[test]
    fn enum_columns_reject_other_values() {
        let (conn, id, _staging) = seeded("city\nOslo\n");
        add_fields(&conn, id, &[Field::enumerated("grade", ["low", "high"])]).expect("add");
        let table = id.table_name();
        conn.execute(&format!("UPDATE {table} SET grade = 'high'"), [])
            .expect("allowed value");
        assert!(
            conn.execute(&format!("UPDATE {table} SET grade = 'medium'"), [])
                .is_err()
        );
    }

    #[test]
    fn invalid_batches_change_nothing() {
        let (conn, id, _staging) = seeded("city\nOslo\n");
        let before = list_fields(&conn, id).expect("before");

        assert_eq!(add_fields(&conn, id, &[]), Err(EngineError::InvalidBody));
        assert!(matches!(
            add_fields(&conn, id, &[Field::text("ok"), Field::text("City")]),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            add_fields(&conn, id, &[Field::text("a b"), Field::text("a_b")]),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            add_fields(&conn, id, &[Field::enumerated("g", ["x", "x"])]),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(list_fields(&conn, id).expect("after"), before);
    }

    #[test]
    fn missing_table_is_get_dataset() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        assert_eq!(list_fields(&conn, DatasetId(5)), Err(EngineError::GetDataset));
        assert_eq!(
            add_fields(&conn, DatasetId(5), &[Field::text("x")]),
            Err(EngineError::GetDataset)
        );
    }

    #[test]
    fn field_json_omits_internal_type() {
        let field = Field {
            name: "grade".into(),
            options: vec!["a".into()],
            annotate: true,
            column_type: "ENUM('a')".into(),
        };
        assert_eq!(
            serde_json::to_string(&field).expect("encode"),
            r#"{"name":"grade","options":["a"],"annotate":true}"#
        );
        assert_eq!(
            serde_json::to_string(&Field::text("city")).expect("encode"),
            r#"{"name":"city"}"#
        );
    }
}
