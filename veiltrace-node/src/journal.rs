//! JSON-lines operation log.
//!
//! Each non-blank line is one entry: `caller`, `at-ms` and the operation
//! fields, tagged by `op`. Besides every registry operation the journal knows
//! `deliver-decryption`, which asks the simulated oracle to answer a pending
//! request.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use veiltrace_core::{CorrelationId, Operation, Principal};

pub const DELIVER_DECRYPTION: &str = "deliver-decryption";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("unable to read journal {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("journal line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("journal line {line}: at-ms {at_ms} precedes {previous}")]
    OutOfOrder {
        line: usize,
        at_ms: u64,
        previous: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalAction {
    Apply(Operation),
    DeliverDecryption {
        correlation_id: CorrelationId,
        tamper: bool,
    },
}

impl JournalAction {
    pub fn name(&self) -> &'static str {
        match self {
            JournalAction::Apply(operation) => operation.name(),
            JournalAction::DeliverDecryption { .. } => DELIVER_DECRYPTION,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    /// 1-based line number in the source file.
    pub line: usize,
    pub caller: Principal,
    pub at_ms: u64,
    pub action: JournalAction,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawEntry {
    caller: Principal,
    at_ms: u64,
    #[serde(flatten)]
    body: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeliverBody {
    #[allow(dead_code)]
    op: String,
    correlation_id: CorrelationId,
    #[serde(default)]
    tamper: bool,
}

fn parse_entry(line: usize, text: &str) -> Result<JournalEntry, serde_json::Error> {
    let raw: RawEntry = serde_json::from_str(text)?;
    let is_delivery = raw.body.get("op").and_then(Value::as_str) == Some(DELIVER_DECRYPTION);
    let body = Value::Object(raw.body);
    let action = if is_delivery {
        let deliver: DeliverBody = serde_json::from_value(body)?;
        JournalAction::DeliverDecryption {
            correlation_id: deliver.correlation_id,
            tamper: deliver.tamper,
        }
    } else {
        JournalAction::Apply(serde_json::from_value(body)?)
    };
    Ok(JournalEntry {
        line,
        caller: raw.caller,
        at_ms: raw.at_ms,
        action,
    })
}

/// Parses a whole journal. Timestamps must not go backwards.
pub fn parse_journal(contents: &str) -> Result<Vec<JournalEntry>, JournalError> {
    let mut entries: Vec<JournalEntry> = Vec::new();
    for (index, text) in contents.lines().enumerate() {
        let line = index + 1;
        if text.trim().is_empty() {
            continue;
        }
        let entry = parse_entry(line, text).map_err(|source| JournalError::Parse { line, source })?;
        if let Some(previous) = entries.last() {
            if entry.at_ms < previous.at_ms {
                return Err(JournalError::OutOfOrder {
                    line,
                    at_ms: entry.at_ms,
                    previous: previous.at_ms,
                });
            }
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>, JournalError> {
    let contents = fs::read_to_string(path).map_err(|source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_journal(&contents)
}
