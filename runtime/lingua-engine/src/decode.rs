//! Maps declared column types to value kinds and decodes raw cells.
//!
//! Lookup is keyed on the normalized type name (`varchar(4000)` becomes
//! `VARCHAR`). Unknown or missing types decode as text.

use std::collections::HashMap;

use rusqlite::types::ValueRef;
use thiserror::Error;

use crate::value::Value;

/// Target representation for a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Text,
    Bool,
    Int,
    Float,
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("cannot decode {found} as {expected:?}")]
    Mismatch {
        expected: ValueKind,
        found: &'static str,
    },
    #[error("cannot parse {text:?} as {expected:?}")]
    Parse { expected: ValueKind, text: String },
}

impl ValueKind {
    /// Value reported for SQL NULL.
    pub fn zero(self) -> Value {
        match self {
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Float => Value::Float(0.0),
        }
    }

    pub fn decode(self, raw: ValueRef<'_>) -> Result<Value, DecodeError> {
        match raw {
            ValueRef::Null => Ok(self.zero()),
            ValueRef::Integer(value) => self.decode_integer(value),
            ValueRef::Real(value) => self.decode_real(value),
            ValueRef::Text(bytes) => self.decode_text(&String::from_utf8_lossy(bytes)),
            ValueRef::Blob(bytes) => match self {
                ValueKind::Text => Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
                _ => Err(DecodeError::Mismatch {
                    expected: self,
                    found: "blob",
                }),
            },
        }
    }

    fn decode_integer(self, value: i64) -> Result<Value, DecodeError> {
        Ok(match self {
            ValueKind::Text => Value::Text(value.to_string()),
            ValueKind::Bool => Value::Bool(value != 0),
            ValueKind::Int => Value::Int(value),
            ValueKind::Float => Value::Float(value as f64),
        })
    }

    fn decode_real(self, value: f64) -> Result<Value, DecodeError> {
        match self {
            ValueKind::Text => Ok(Value::Text(value.to_string())),
            ValueKind::Bool => Ok(Value::Bool(value != 0.0)),
            ValueKind::Int => {
                if value.fract() == 0.0 && value >= i64::MIN as f64 && value <= i64::MAX as f64 {
                    Ok(Value::Int(value as i64))
                } else {
                    Err(DecodeError::Parse {
                        expected: self,
                        text: value.to_string(),
                    })
                }
            }
            ValueKind::Float => Ok(Value::Float(value)),
        }
    }

    fn decode_text(self, text: &str) -> Result<Value, DecodeError> {
        let parse_error = || DecodeError::Parse {
            expected: self,
            text: text.to_string(),
        };
        match self {
            ValueKind::Text => Ok(Value::Text(text.to_string())),
            ValueKind::Bool => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "f" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(parse_error()),
            },
            ValueKind::Int => text
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| parse_error()),
            ValueKind::Float => text
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| parse_error()),
        }
    }
}

/// Upper-cases a declared type and strips its parameter list.
pub fn normalize_type_name(declared: &str) -> String {
    let base = match declared.find('(') {
        Some(idx) => &declared[..idx],
        None => declared,
    };
    base.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase()
}

/// Registry of declared type names and the kind they decode to.
#[derive(Clone, Debug)]
pub struct DecoderRegistry {
    kinds: HashMap<String, ValueKind>,
}

impl DecoderRegistry {
    /// A registry with no entries; everything decodes as text.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn register(&mut self, type_name: &str, kind: ValueKind) {
        self.kinds.insert(normalize_type_name(type_name), kind);
    }

    pub fn resolve(&self, declared: Option<&str>) -> ValueKind {
        declared
            .and_then(|name| self.kinds.get(&normalize_type_name(name)).copied())
            .unwrap_or(ValueKind::Text)
    }

    pub fn decode(&self, declared: Option<&str>, raw: ValueRef<'_>) -> Result<Value, DecodeError> {
        self.resolve(declared).decode(raw)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for name in [
            "VARCHAR",
            "TEXT",
            "CHAR",
            "CLOB",
            "UUID",
            "TIMESTAMP",
            "DATE",
            "DATETIME",
            "ENUM",
        ] {
            registry.register(name, ValueKind::Text);
        }
        for name in ["BOOL", "BOOLEAN"] {
            registry.register(name, ValueKind::Bool);
        }
        for name in [
            "INT", "INT2", "INT4", "INT8", "INTEGER", "BIGINT", "SMALLINT", "TINYINT",
        ] {
            registry.register(name, ValueKind::Int);
        }
        for name in [
            "REAL",
            "FLOAT",
            "FLOAT4",
            "FLOAT8",
            "DOUBLE",
            "DOUBLE PRECISION",
            "NUMERIC",
            "DECIMAL",
        ] {
            registry.register(name, ValueKind::Float);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_are_normalized() {
        assert_eq!(normalize_type_name("varchar(4000)"), "VARCHAR");
        assert_eq!(normalize_type_name(" double   precision "), "DOUBLE PRECISION");
        assert_eq!(normalize_type_name("ENUM('a','b')"), "ENUM");
        assert_eq!(normalize_type_name("Int4"), "INT4");
    }

    #[test]
    fn default_registry_dispatch() {
        let registry = DecoderRegistry::default();
        assert_eq!(registry.resolve(Some("VARCHAR(4000)")), ValueKind::Text);
        assert_eq!(registry.resolve(Some("bool")), ValueKind::Bool);
        assert_eq!(registry.resolve(Some("INT4")), ValueKind::Int);
        assert_eq!(registry.resolve(Some("decimal(10,2)")), ValueKind::Float);
        assert_eq!(registry.resolve(Some("GEOMETRY")), ValueKind::Text);
        assert_eq!(registry.resolve(None), ValueKind::Text);
    }

    #[test]
    fn registry_is_extensible() {
        let mut registry = DecoderRegistry::default();
        assert_eq!(registry.resolve(Some("MEDIUMINT")), ValueKind::Text);
        registry.register("mediumint", ValueKind::Int);
        assert_eq!(
            registry.decode(Some("MEDIUMINT(8)"), ValueRef::Integer(9)),
            Ok(Value::Int(9))
        );
    }

    #[test]
    fn null_decodes_to_zero_value() {
        let registry = DecoderRegistry::default();
        assert_eq!(
            registry.decode(Some("TEXT"), ValueRef::Null),
            Ok(Value::Text(String::new()))
        );
        assert_eq!(
            registry.decode(Some("BOOL"), ValueRef::Null),
            Ok(Value::Bool(false))
        );
        assert_eq!(
            registry.decode(Some("INTEGER"), ValueRef::Null),
            Ok(Value::Int(0))
        );
        assert_eq!(
            registry.decode(Some("REAL"), ValueRef::Null),
            Ok(Value::Float(0.0))
        );
        assert_eq!(
            registry.decode(Some("SOMETHING"), ValueRef::Null),
            Ok(Value::Text(String::new()))
        );
    }

    #[test]
    fn booleans_never_decode_as_strings() {
        let kind = ValueKind::Bool;
        assert_eq!(kind.decode(ValueRef::Integer(1)), Ok(Value::Bool(true)));
        assert_eq!(kind.decode(ValueRef::Integer(0)), Ok(Value::Bool(false)));
        assert_eq!(kind.decode(ValueRef::Text(b"TRUE")), Ok(Value::Bool(true)));
        assert_eq!(kind.decode(ValueRef::Text(b"no")), Ok(Value::Bool(false)));
        assert!(kind.decode(ValueRef::Text(b"maybe")).is_err());
    }

    #[test]
    fn cross_class_conversions() {
        assert_eq!(
            ValueKind::Text.decode(ValueRef::Integer(12)),
            Ok(Value::Text("12".into()))
        );
        assert_eq!(
            ValueKind::Int.decode(ValueRef::Text(b" 42 ")),
            Ok(Value::Int(42))
        );
        assert_eq!(ValueKind::Int.decode(ValueRef::Real(3.0)), Ok(Value::Int(3)));
        assert!(ValueKind::Int.decode(ValueRef::Real(3.5)).is_err());
        assert_eq!(
            ValueKind::Float.decode(ValueRef::Text(b"2.5")),
            Ok(Value::Float(2.5))
        );
        assert_eq!(
            ValueKind::Int.decode(ValueRef::Blob(&[1, 2])),
            Err(DecodeError::Mismatch {
                expected: ValueKind::Int,
                found: "blob",
            })
        );
    }
}
