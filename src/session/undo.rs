// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Reverse a run from its session log
//!
//! Committed operations are reverted newest first. Moved files go back to
//! their original path unless something now occupies it; copies and sidecars
//! are deleted. Each undo records the destinations it reverted, so a partial
//! undo can be continued later.

use chrono::Utc;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{read_all, SessionEvent};
use crate::config::OperationKind;
use crate::executor::{self, OperationResult};
use crate::{Result, SorterError};

/// What undo did, or would do in a dry run, for one operation
#[derive(Debug, Clone, PartialEq)]
pub enum UndoAction {
    Restored { from: PathBuf, to: PathBuf },
    Deleted { path: PathBuf },
    Skipped { path: PathBuf, reason: String },
    Failed { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct UndoReport {
    pub actions: Vec<UndoAction>,
    pub dry_run: bool,
}

impl UndoReport {
    pub fn reverted(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, UndoAction::Restored { .. } | UndoAction::Deleted { .. }))
            .count()
    }

    pub fn skipped_or_failed(&self) -> usize {
        self.actions.len() - self.reverted()
    }
}

/// Destinations already reverted by earlier undo runs
fn reverted_destinations(events: &[SessionEvent]) -> HashSet<&Path> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Undone { destinations, .. } => Some(destinations),
            _ => None,
        })
        .flatten()
        .map(PathBuf::as_path)
        .collect()
}

/// Committed operations of a log not yet reverted, newest first
pub fn undoable(events: &[SessionEvent]) -> Vec<&OperationResult> {
    let reverted = reverted_destinations(events);
    events
        .iter()
        .rev()
        .filter_map(|event| match event {
            SessionEvent::Outcome { result } if result.is_success() && result.operation.is_some() => {
                match &result.destination {
                    Some(dest) if !reverted.contains(dest.as_path()) => Some(result),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect()
}

/// An undo ran and nothing is left to revert
pub fn is_undone(events: &[SessionEvent]) -> bool {
    events.iter().any(|e| matches!(e, SessionEvent::Undone { .. })) && undoable(events).is_empty()
}

/// Revert up to `count` operations (0 = all) recorded in `log_path`
pub fn undo(log_path: &Path, count: usize, dry_run: bool) -> Result<UndoReport> {
    let events = read_all(log_path)?;
    if is_undone(&events) {
        return Err(SorterError::Config(format!(
            "session {:?} has already been undone",
            log_path
        )));
    }

    let operations = undoable(&events);
    let count = if count == 0 {
        operations.len()
    } else {
        count.min(operations.len())
    };

    let mut report = UndoReport {
        actions: Vec::with_capacity(count),
        dry_run,
    };
    let mut destinations = Vec::new();
    for result in operations.into_iter().take(count) {
        let actions = revert(result, dry_run);
        if let Some(dest) = &result.destination {
            if actions.iter().any(|a| reverts(a, dest)) {
                destinations.push(dest.clone());
            }
        }
        report.actions.extend(actions);
    }

    if !dry_run && report.reverted() > 0 {
        mark_undone(log_path, report.reverted(), destinations)?;
        info!("Reverted {} operation(s) from {:?}", report.reverted(), log_path);
    }
    Ok(report)
}

/// Whether an action took the operation's destination out of the output tree
fn reverts(action: &UndoAction, destination: &Path) -> bool {
    match action {
        UndoAction::Restored { from, .. } => from == destination,
        UndoAction::Deleted { path } => path == destination,
        _ => false,
    }
}

fn revert(result: &OperationResult, dry_run: bool) -> Vec<UndoAction> {
    let mut actions = Vec::new();
    let (Some(destination), Some(operation)) = (&result.destination, result.operation) else {
        return actions;
    };

    if let Some(sidecar) = &result.sidecar {
        if sidecar.exists() {
            actions.push(delete(sidecar, dry_run));
        }
    }

    if !destination.exists() {
        actions.push(UndoAction::Skipped {
            path: destination.clone(),
            reason: "file not found, may have been moved or deleted".to_string(),
        });
        return actions;
    }

    match operation {
        OperationKind::Copy => actions.push(delete(destination, dry_run)),
        OperationKind::Move => {
            let original = &result.source;
            if original.exists() {
                actions.push(UndoAction::Skipped {
                    path: original.clone(),
                    reason: "original path already exists".to_string(),
                });
            } else if dry_run {
                actions.push(UndoAction::Restored {
                    from: destination.clone(),
                    to: original.clone(),
                });
            } else {
                actions.push(match restore(destination, original) {
                    Ok(()) => UndoAction::Restored {
                        from: destination.clone(),
                        to: original.clone(),
                    },
                    Err(e) => {
                        warn!("Failed to restore {:?}: {}", destination, e);
                        UndoAction::Failed {
                            path: destination.clone(),
                            reason: e.to_string(),
                        }
                    }
                });
            }
        }
    }
    actions
}

fn restore(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| SorterError::io(parent, e))?;
    }
    if from.parent() == to.parent() {
        executor::rename_in_place(from, to)
    } else {
        executor::move_file(from, to)
    }
}

fn delete(path: &Path, dry_run: bool) -> UndoAction {
    if dry_run {
        return UndoAction::Deleted {
            path: path.to_path_buf(),
        };
    }
    match fs::remove_file(path) {
        Ok(()) => UndoAction::Deleted {
            path: path.to_path_buf(),
        },
        Err(e) => UndoAction::Failed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    }
}

fn mark_undone(log_path: &Path, reverted: usize, destinations: Vec<PathBuf>) -> Result<()> {
    let event = SessionEvent::Undone {
        timestamp: Utc::now(),
        reverted,
        destinations,
    };
    let mut file = OpenOptions::new()
        .append(true)
        .open(log_path)
        .map_err(|e| SorterError::io(log_path, e))?;
    let json = serde_json::to_string(&event)?;
    writeln!(file, "{}", json).map_err(|e| SorterError::io(log_path, e))?;
    Ok(())
}
