// Core domain types shared across ctxsync crates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-file line buffers of one workspace, keyed by file name.
pub type FileBuffers = BTreeMap<String, Vec<String>>;

/// Cumulative, append-only change history per file.
pub type ChangeLog = BTreeMap<String, Vec<ChangeRecord>>;

/// One client submission: ordered change records per file.
pub type ChangeBatch = BTreeMap<String, Vec<ChangeRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Update,
    Remove,
}

impl ChangeType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

/// A single line-range edit against a file buffer.
///
/// `[start_line, end_line)` is half-open and zero-based. `new_lines` is
/// ignored for removals and `end_line` is ignored for inserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_type: ChangeType,
    pub start_line: i64,
    pub end_line: i64,
    #[serde(default)]
    pub new_lines: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("start_line {start} must not be negative")]
    NegativeStart { start: i64 },

    #[error("end_line {end} must not precede start_line {start}")]
    EndBeforeStart { start: i64, end: i64 },
}

impl ChangeRecord {
    pub fn insert(start_line: i64, new_lines: Vec<String>) -> Self {
        Self { change_type: ChangeType::Insert, start_line, end_line: start_line, new_lines }
    }

    pub fn update(start_line: i64, end_line: i64, new_lines: Vec<String>) -> Self {
        Self { change_type: ChangeType::Update, start_line, end_line, new_lines }
    }

    pub fn remove(start_line: i64, end_line: i64) -> Self {
        Self { change_type: ChangeType::Remove, start_line, end_line, new_lines: Vec::new() }
    }

    /// Rejects ranges the patcher cannot interpret.
    pub fn validate(&self) -> Result<(), RangeError> {
        if self.start_line < 0 {
            return Err(RangeError::NegativeStart { start: self.start_line });
        }
        if self.end_line < self.start_line {
            return Err(RangeError::EndBeforeStart {
                start: self.start_line,
                end: self.end_line,
            });
        }
        Ok(())
    }

    /// Highest line index this record touches, used to size unknown files.
    pub fn reach(&self) -> usize {
        let bound = match self.change_type {
            ChangeType::Insert => self.start_line,
            ChangeType::Update | ChangeType::Remove => self.end_line,
        };
        to_index(bound)
    }
}

pub(crate) fn to_index(line: i64) -> usize {
    usize::try_from(line).unwrap_or(0)
}
