//! Per-run failure accumulation.

use std::fmt;

use listwatch_storage::FetchError;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-success response from the listing source.
    Transport,
    /// Any other fetch-time failure.
    Request,
    Persistence,
    Delivery,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Transport => "transport",
            FailureKind::Request => "request",
            FailureKind::Persistence => "persistence",
            FailureKind::Delivery => "delivery",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub alias: String,
    pub kind: FailureKind,
    pub code: Option<u16>,
    pub detail: String,
}

impl FailureEntry {
    pub fn code_label(&self) -> String {
        self.code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "N/A".to_string())
    }
}

/// Failure log for a single batch run. Built fresh for every run and drained
/// at its end; nothing survives into the next invocation.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    entries: Vec<FailureEntry>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        alias: &str,
        kind: FailureKind,
        code: Option<u16>,
        detail: impl Into<String>,
    ) {
        let entry = FailureEntry {
            alias: alias.to_string(),
            kind,
            code,
            detail: detail.into(),
        };
        warn!(
            alias = %entry.alias,
            kind = %entry.kind,
            code = %entry.code_label(),
            detail = %entry.detail,
            "search step failed"
        );
        self.entries.push(entry);
    }

    /// A status failure is reported both as the transport error itself and as
    /// the request failure wrapping it.
    pub fn record_fetch_failure(&mut self, alias: &str, err: &FetchError) {
        if let Some(status) = err.status() {
            self.record(alias, FailureKind::Transport, Some(status), err.to_string());
        }
        self.record(alias, FailureKind::Request, None, err.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<FailureEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// Operator-facing digest, one line per failure. `None` when the run was clean.
pub fn format_failure_digest(entries: &[FailureEntry]) -> Option<String> {
    if entries.is_empty() {
        return None;
    }
    let mut lines = vec![format!("Failed searches in this run ({}):", entries.len())];
    lines.extend(
        entries
            .iter()
            .map(|e| format!("{} - {} - {}", e.alias, e.kind, e.code_label())),
    );
    Some(lines.join("\n"))
}
