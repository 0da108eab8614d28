use crate::error::Error;
use crate::hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of execution a statistic was captured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatKind {
    Query,
    RawExecution,
}

impl StatKind {
    /// Label stored in the `kind` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatKind::Query => "query",
            StatKind::RawExecution => "raw",
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "query" => Ok(StatKind::Query),
            "raw" | "raw-execution" => Ok(StatKind::RawExecution),
            _ => anyhow::bail!("unknown stat kind {s:?}"),
        }
    }
}

/// One frame of application code that issued a query.
///
/// Field order is the serialization order, which the caller hash depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// A single completed execution.
#[derive(Clone, Debug, PartialEq)]
pub struct Stat {
    pub timestamp: DateTime<Utc>,
    pub kind: StatKind,
    /// Statement text as executed, in placeholder form.
    pub statement: String,
    pub statement_hash: String,
    pub param_count: i32,
    /// Elapsed time in fractional milliseconds.
    pub took_ms: f64,
    pub rows: i64,
    pub error: bool,
    pub callers: Vec<CallerFrame>,
    pub caller_hash: Option<String>,
    pub caller_json: Vec<u8>,
}

impl Stat {
    pub fn new(kind: StatKind, statement: impl Into<String>, took_ms: f64, rows: i64, error: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            statement: statement.into(),
            statement_hash: String::new(),
            param_count: 0,
            took_ms,
            rows,
            error,
            callers: Vec::new(),
            caller_hash: None,
            caller_json: Vec::new(),
        }
    }

    pub fn with_params(mut self, param_count: usize) -> Self {
        self.param_count = i32::try_from(param_count).unwrap_or(i32::MAX);
        self
    }

    pub fn with_callers(mut self, callers: Vec<CallerFrame>) -> Self {
        self.callers = callers;
        self
    }

    /// Assigns the statement hash and, when caller tracking is on, the serialized caller chain and its hash.
    ///
    /// Must run before the record is handed to the ingestion channel.
    pub fn seal(&mut self, track_callers: bool) -> Result<(), Error> {
        if self.statement.is_empty() {
            return Err(Error::EmptyInput);
        }
        self.statement_hash = hash::hash(&self.statement);
        self.caller_hash = None;
        self.caller_json.clear();
        if track_callers && !self.callers.is_empty() {
            // serializing a Vec of plain structs cannot fail, but a missing caller hash is harmless anyway
            if let Ok(json) = serde_json::to_vec(&self.callers) {
                self.caller_hash = Some(hash::hash_bytes(&json));
                self.caller_json = json;
            }
        }
        Ok(())
    }
}
