//! Todo record schema

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// One todo item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: u64,

    pub text: String,

    /// Accepts `true`/`false` and the legacy `0`/`1`
    #[serde(default, deserialize_with = "deserialize_done")]
    pub done: bool,

    /// `YYYY-MM-DD`; format is not checked here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,

    /// RFC 3339 UTC timestamp
    #[serde(default)]
    pub created_at: String,

    #[serde(default)]
    pub updated_at: String,

    /// Unknown fields for forward compatibility
    #[serde(flatten)]
    pub unknown_fields: HashMap<String, serde_json::Value>,
}

fn utc_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn deserialize_done<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Done {
        Bool(bool),
        Int(i64),
    }

    match Done::deserialize(deserializer)? {
        Done::Bool(b) => Ok(b),
        Done::Int(0) => Ok(false),
        Done::Int(1) => Ok(true),
        Done::Int(other) => Err(serde::de::Error::custom(format!(
            "invalid value for 'done': {other}; expected true/false or 0/1"
        ))),
    }
}

impl Todo {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        let now = utc_now();
        Self {
            id,
            text: text.into(),
            done: false,
            due_date: None,
            created_at: now.clone(),
            updated_at: now,
            unknown_fields: HashMap::new(),
        }
    }

    pub fn mark_done(&mut self) {
        self.done = true;
        self.updated_at = utc_now();
    }

    pub fn mark_undone(&mut self) {
        self.done = false;
        self.updated_at = utc_now();
    }

    // Legacy records may lack timestamps.
    pub(crate) fn fill_timestamps(&mut self) {
        if self.created_at.is_empty() {
            self.created_at = utc_now();
        }
        if self.updated_at.is_empty() {
            self.updated_at = self.created_at.clone();
        }
    }
}

/// Smallest positive id not used by any of `todos`
pub fn next_id(todos: &[Todo]) -> u64 {
    let mut used: Vec<u64> = todos.iter().map(|t| t.id).filter(|id| *id > 0).collect();
    used.sort_unstable();
    used.dedup();

    let mut candidate = 1;
    for id in used {
        if id != candidate {
            break;
        }
        candidate += 1;
    }
    candidate
}
