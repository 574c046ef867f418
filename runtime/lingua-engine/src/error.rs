//! Caller-facing error classes.
//!
//! Every variant carries a fixed message. Causes are logged where they are
//! detected and never leak into the message, except for validation detail.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid body")]
    InvalidBody,
    #[error("connection error")]
    Connection,
    #[error("error saving file")]
    SavingFile,
    #[error("couldn't get dataset")]
    GetDataset,
    #[error("couldn't create field")]
    CreateField,
    #[error("couldn't get record")]
    GetRecord,
    #[error("couldn't update record")]
    UpdateRecord,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("validation error: {0}")]
    Validation(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Status string reported by the worker protocol.
    pub fn status(&self) -> &'static str {
        match self {
            EngineError::InvalidBody | EngineError::Validation(_) => "InvalidInput",
            EngineError::NotFound(_) => "NotFound",
            EngineError::Connection => "Unavailable",
            _ => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_fixed() {
        assert_eq!(EngineError::InvalidBody.to_string(), "invalid body");
        assert_eq!(EngineError::Connection.to_string(), "connection error");
        assert_eq!(EngineError::SavingFile.to_string(), "error saving file");
        assert_eq!(EngineError::GetDataset.to_string(), "couldn't get dataset");
        assert_eq!(EngineError::CreateField.to_string(), "couldn't create field");
        assert_eq!(EngineError::NotFound("record").to_string(), "record not found");
    }

    #[test]
    fn statuses_group_by_class() {
        assert_eq!(EngineError::InvalidBody.status(), "InvalidInput");
        assert_eq!(
            EngineError::Validation("bad".into()).status(),
            "InvalidInput"
        );
        assert_eq!(EngineError::NotFound("dataset").status(), "NotFound");
        assert_eq!(EngineError::Connection.status(), "Unavailable");
        assert_eq!(EngineError::SavingFile.status(), "InternalError");
    }
}
