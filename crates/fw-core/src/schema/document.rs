//! Versioned envelope around the todo array
//!
//! Current layout is `{"schema_version": 1, "todos": [...]}` with the
//! version marker first. A bare array is the pre-envelope layout and is read
//! as version 0. Decoding is all-or-nothing: one bad record fails the whole
//! document.

use crate::schema::todo::Todo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SCHEMA_VERSION: u32 = 1;

/// Record count at which `auto` switches from pretty to compact JSON
pub const PRETTY_THRESHOLD: usize = 100;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported schema_version {0}")]
    UnsupportedVersion(serde_json::Value),

    #[error("unexpected document shape: {0}")]
    UnexpectedShape(&'static str),

    #[error("invalid todo at index {index}: {source}")]
    InvalidRecord {
        index: usize,
        source: serde_json::Error,
    },
}

/// Output encoding of the todo file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonFormat {
    /// Pretty below [`PRETTY_THRESHOLD`] records, compact at or above
    #[default]
    Auto,
    Compact,
    Pretty,
}

impl JsonFormat {
    pub fn is_pretty_for(&self, records: usize) -> bool {
        match self {
            JsonFormat::Auto => records < PRETTY_THRESHOLD,
            JsonFormat::Compact => false,
            JsonFormat::Pretty => true,
        }
    }
}

impl FromStr for JsonFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(JsonFormat::Auto),
            "compact" => Ok(JsonFormat::Compact),
            "pretty" => Ok(JsonFormat::Pretty),
            other => Err(format!("unknown json format '{other}' (expected auto, compact or pretty)")),
        }
    }
}

impl fmt::Display for JsonFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JsonFormat::Auto => "auto",
            JsonFormat::Compact => "compact",
            JsonFormat::Pretty => "pretty",
        })
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    schema_version: u32,
    todos: &'a [Todo],
}

/// Result of decoding a todo file
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedDocument {
    /// Version found on disk; 0 for the bare-array layout
    pub version: u32,
    pub todos: Vec<Todo>,
}

pub fn encode(todos: &[Todo], format: JsonFormat) -> Result<Vec<u8>, SchemaError> {
    let doc = DocumentRef {
        schema_version: SCHEMA_VERSION,
        todos,
    };
    let bytes = if format.is_pretty_for(todos.len()) {
        serde_json::to_vec_pretty(&doc)?
    } else {
        serde_json::to_vec(&doc)?
    };
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<DecodedDocument, SchemaError> {
    let root: serde_json::Value = serde_json::from_slice(bytes)?;

    let (version, records) = match root {
        serde_json::Value::Array(records) => (0, records),
        serde_json::Value::Object(mut map) => {
            let version = match map.remove("schema_version") {
                Some(v) if v.as_u64() == Some(u64::from(SCHEMA_VERSION)) => SCHEMA_VERSION,
                Some(v) => return Err(SchemaError::UnsupportedVersion(v)),
                None => return Err(SchemaError::UnexpectedShape("object without schema_version")),
            };
            match map.remove("todos") {
                Some(serde_json::Value::Array(records)) => (version, records),
                Some(_) => return Err(SchemaError::UnexpectedShape("'todos' is not an array")),
                None => return Err(SchemaError::UnexpectedShape("missing 'todos' array")),
            }
        }
        _ => return Err(SchemaError::UnexpectedShape("root must be an object or array")),
    };

    let todos = records
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            let mut todo: Todo = serde_json::from_value(value)
                .map_err(|source| SchemaError::InvalidRecord { index, source })?;
            todo.fill_timestamps();
            Ok(todo)
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;

    Ok(DecodedDocument { version, todos })
}
