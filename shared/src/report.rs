//! Accumulated batch-import errors.
//!
//! Row-local and batch-local problems never abort an import; they are
//! collected here and surfaced to the caller once the whole batch has been
//! examined. Entries are kept most-recently-added-first, so the latest
//! findings surface at the top of the report.

use serde::{Deserialize, Serialize};

/// One reported problem: the sorted 1-based source lines it applies to and
/// the formatted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub lines: Vec<u32>,
    pub message: String,
}

#[derive(Debug, Default, Clone)]
pub struct ErrorList {
    entries: Vec<ErrorEntry>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_at_line(&mut self, line_no: u32, message: impl Into<String>) {
        self.error_at_lines(vec![line_no], message);
    }

    pub fn error_at_lines(&mut self, mut lines: Vec<u32>, message: impl Into<String>) {
        lines.sort_unstable();
        self.entries.insert(
            0,
            ErrorEntry {
                lines,
                message: message.into(),
            },
        );
    }

    /// Append errors recorded before `self` (e.g. parse errors preceding
    /// pipeline errors); they surface after the newer entries.
    pub fn absorb_older(&mut self, older: ErrorList) {
        self.entries.extend(older.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    pub fn into_report(self) -> BatchReport {
        BatchReport {
            success: self.entries.is_empty(),
            errors: self.entries,
        }
    }
}

/// The caller-facing outcome of a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub success: bool,
    pub errors: Vec<ErrorEntry>,
}
