// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Session log and run summary
//!
//! Every run appends JSON lines to its own file under the log directory:
//! a start event with the configuration, one line per plan and per outcome,
//! warnings, and a finish event carrying the [`SessionSummary`].

pub mod undo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::SortConfig;
use crate::error::ErrorKind;
use crate::executor::{OperationResult, OperationStatus};
use crate::planner::PlacementPlan;
use crate::{Result, SorterError};

const LOG_PREFIX: &str = "sort_";
const LOG_EXTENSION: &str = "jsonl";

/// What a run did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    SortByModel,
    SortByColor,
    Search,
    Flatten,
    Cleanup,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunKind::SortByModel => "sort by model",
            RunKind::SortByColor => "sort by color",
            RunKind::Search => "metadata search",
            RunKind::Flatten => "flatten",
            RunKind::Cleanup => "filename cleanup",
        };
        f.write_str(name)
    }
}

/// One failed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub source: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

/// Aggregate of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub run_id: String,
    pub run: RunKind,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duplicates_renamed: usize,
    pub directories_removed: usize,
    pub bucket_counts: BTreeMap<String, usize>,
    pub failures: Vec<FailureEntry>,
    pub warnings: Vec<String>,
    /// Progress events lost to a full channel
    pub progress_dropped: u64,
}

impl SessionSummary {
    pub fn new(run_id: impl Into<String>, run: RunKind, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.into(),
            run,
            started_at,
            elapsed_ms: 0,
            cancelled: false,
            total: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            duplicates_renamed: 0,
            directories_removed: 0,
            bucket_counts: BTreeMap::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
            progress_dropped: 0,
        }
    }

    /// Count one file's outcome
    pub fn record(&mut self, result: &OperationResult) {
        self.total += 1;
        *self.bucket_counts.entry(result.bucket.clone()).or_insert(0) += 1;
        match &result.status {
            OperationStatus::Succeeded => {
                self.succeeded += 1;
                if result.renamed {
                    self.duplicates_renamed += 1;
                }
            }
            OperationStatus::Skipped { .. } => self.skipped += 1,
            OperationStatus::Failed { kind, message } => {
                self.failed += 1;
                self.failures.push(FailureEntry {
                    source: result.source.clone(),
                    kind: *kind,
                    message: message.clone(),
                });
            }
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// One line of the session log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    RunStarted {
        run_id: String,
        timestamp: DateTime<Utc>,
        run: RunKind,
        source: PathBuf,
        destination: Option<PathBuf>,
        config: Box<SortConfig>,
    },
    Planned {
        plan: PlacementPlan,
    },
    Outcome {
        result: OperationResult,
    },
    Warning {
        timestamp: DateTime<Utc>,
        path: Option<PathBuf>,
        message: String,
    },
    RunFinished {
        timestamp: DateTime<Utc>,
        summary: SessionSummary,
    },
    /// Appended by each undo that reverted something
    Undone {
        timestamp: DateTime<Utc>,
        reverted: usize,
        /// Destinations whose operations were reverted
        #[serde(default)]
        destinations: Vec<PathBuf>,
    },
}

/// Append-only JSON-lines log for one run
pub struct SessionLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SessionLog {
    /// Create the run's log file; an unusable log directory is a configuration error
    pub fn create(log_dir: &Path, run_id: &str, started_at: DateTime<Utc>) -> Result<Self> {
        fs::create_dir_all(log_dir).map_err(|e| {
            SorterError::Config(format!("log directory {:?} is not writable: {}", log_dir, e))
        })?;

        let short_id: String = run_id.chars().take(8).collect();
        let name = format!(
            "{}{}_{}.{}",
            LOG_PREFIX,
            started_at.format("%Y%m%d_%H%M%S"),
            short_id,
            LOG_EXTENSION
        );
        let path = log_dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SorterError::Config(format!("cannot open session log {:?}: {}", path, e)))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Append an event and flush it, so a crash leaves a readable prefix
    pub fn append(&mut self, event: &SessionEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", json).map_err(|e| SorterError::io(&self.path, e))?;
        self.writer.flush().map_err(|e| SorterError::io(&self.path, e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read all events of a session log
pub fn read_all(path: &Path) -> Result<Vec<SessionEvent>> {
    let file = File::open(path).map_err(|e| SorterError::io(path, e))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| SorterError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                tracing::warn!("Failed to parse session log line in {:?}: {}", path, e);
            }
        }
    }

    Ok(events)
}

/// Session logs in a directory, newest first
pub fn list_logs(log_dir: &Path) -> Result<Vec<PathBuf>> {
    if !log_dir.exists() {
        return Ok(Vec::new());
    }
    let mut logs: Vec<PathBuf> = fs::read_dir(log_dir)
        .map_err(|e| SorterError::io(log_dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.starts_with(LOG_PREFIX) && name.ends_with(LOG_EXTENSION)
        })
        .collect();
    // The timestamp prefix makes name order chronological
    logs.sort();
    logs.reverse();
    Ok(logs)
}

/// Export a run's failures as CSV, one row per failed file
pub fn write_failures_csv(summary: &SessionSummary, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| SorterError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut row = |fields: [&str; 4]| -> Result<()> {
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        writeln!(writer, "{}", line.join(",")).map_err(|e| SorterError::io(path, e))
    };

    row(["run_id", "kind", "message", "file"])?;
    for failure in &summary.failures {
        let kind = failure.kind.to_string();
        let file = failure.source.display().to_string();
        row([&summary.run_id, &kind, &failure.message, &file])?;
    }
    writer.flush().map_err(|e| SorterError::io(path, e))?;
    Ok(())
}

/// Quote a field when it holds a delimiter, quote or line break
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Summary of a finished run, if the log has one
pub fn summary_of(events: &[SessionEvent]) -> Option<&SessionSummary> {
    events.iter().rev().find_map(|event| match event {
        SessionEvent::RunFinished { summary, .. } => Some(summary),
        _ => None,
    })
}
