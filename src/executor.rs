// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! File operations: copy, move, sidecar writes and empty-directory cleanup
//!
//! A destination file only ever appears complete. Data goes to a hidden temp
//! file in the destination directory, is synced, and is then renamed into
//! place. A move is a committed copy followed by source deletion, so the
//! source is never removed before an intact copy exists.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::OperationKind;
use crate::error::ErrorKind;
use crate::planner::PlacementPlan;
use crate::{Result, SorterError};

/// Outcome of one file's operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Skipped { reason: String },
    Failed { kind: ErrorKind, message: String },
}

/// Exactly one of these exists per processed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub source: PathBuf,
    pub destination: Option<PathBuf>,
    pub bucket: String,
    pub operation: Option<OperationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<PathBuf>,
    /// The destination name had to be suffixed
    #[serde(default)]
    pub renamed: bool,
    #[serde(flatten)]
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl OperationResult {
    fn finish(source: &Path, bucket: &str, started: Started, status: OperationStatus) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: None,
            bucket: bucket.to_string(),
            operation: None,
            sidecar: None,
            renamed: false,
            status,
            started_at: started.at,
            duration_ms: started.clock.elapsed().as_millis() as u64,
        }
    }

    pub fn skipped(source: &Path, bucket: &str, started: Started, reason: impl Into<String>) -> Self {
        Self::finish(source, bucket, started, OperationStatus::Skipped { reason: reason.into() })
    }

    pub fn failed(source: &Path, bucket: &str, started: Started, error: &SorterError) -> Self {
        Self::finish(
            source,
            bucket,
            started,
            OperationStatus::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
        )
    }

    /// A file deleted outright; nothing to undo
    pub fn removed(source: &Path, bucket: &str, started: Started) -> Self {
        Self::finish(source, bucket, started, OperationStatus::Succeeded)
    }

    /// Result of executing a plan
    pub fn from_plan(plan: &PlacementPlan, started: Started, outcome: Result<()>) -> Self {
        let (status, sidecar) = match outcome {
            Ok(()) => (OperationStatus::Succeeded, plan.sidecar.clone()),
            Err(e) => (
                OperationStatus::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                },
                None,
            ),
        };
        Self {
            destination: Some(plan.destination()),
            operation: Some(plan.operation),
            sidecar,
            renamed: plan.renamed,
            ..Self::finish(&plan.source, &plan.bucket, started, status)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OperationStatus::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, OperationStatus::Failed { .. })
    }
}

/// Start time of an operation, wall clock for logs and monotonic for duration
#[derive(Debug, Clone, Copy)]
pub struct Started {
    at: DateTime<Utc>,
    clock: Instant,
}

impl Started {
    pub fn now() -> Self {
        Self {
            at: Utc::now(),
            clock: Instant::now(),
        }
    }
}

/// Carry out a plan's image operation
pub fn execute(plan: &PlacementPlan) -> Result<()> {
    let destination = plan.destination();
    match plan.operation {
        OperationKind::Copy => commit_copy(&plan.source, &destination).map(|_| ()),
        OperationKind::Move => move_file(&plan.source, &destination),
    }
}

/// Write the plan's sidecar; only called once the image is in place
pub fn write_sidecar(plan: &PlacementPlan, text: &str) -> Result<()> {
    match &plan.sidecar {
        Some(path) => write_atomic(path, text.as_bytes()),
        None => Ok(()),
    }
}

/// Copy `source` to `destination` so the destination only appears complete
///
/// Returns the number of bytes copied. Any failure removes the temp file and
/// leaves the source untouched.
pub fn commit_copy(source: &Path, destination: &Path) -> Result<u64> {
    let dir = destination
        .parent()
        .ok_or_else(|| SorterError::planning(destination, "destination has no parent"))?;
    let temp = temp_path(dir, destination);

    let outcome = (|| -> Result<u64> {
        let bytes = {
            let mut input = File::open(source).map_err(|e| SorterError::io(source, e))?;
            let mut output = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp)
                .map_err(|e| SorterError::io(&temp, e))?;
            let bytes = io::copy(&mut input, &mut output).map_err(|e| SorterError::io(&temp, e))?;
            output.flush().map_err(|e| SorterError::io(&temp, e))?;

            if let Ok(modified) = input.metadata().and_then(|m| m.modified()) {
                if let Err(e) = output.set_modified(modified) {
                    debug!("Could not preserve mtime on {:?}: {}", temp, e);
                }
            }
            output.sync_all().map_err(|e| SorterError::io(&temp, e))?;
            bytes
        };

        // Never replace something that appeared after planning
        if destination.exists() {
            return Err(SorterError::io(
                destination,
                io::Error::new(io::ErrorKind::AlreadyExists, "destination appeared during the run"),
            ));
        }
        fs::rename(&temp, destination).map_err(|e| SorterError::io(destination, e))?;
        Ok(bytes)
    })();

    if outcome.is_err() {
        discard_temp(&temp);
    }
    outcome
}

/// Committed copy, size check, then source deletion
pub fn move_file(source: &Path, destination: &Path) -> Result<()> {
    let expected = fs::metadata(source).map_err(|e| SorterError::io(source, e))?.len();
    commit_copy(source, destination)?;

    let actual = fs::metadata(destination)
        .map_err(|e| SorterError::io(destination, e))?
        .len();
    if actual != expected {
        // Keep the source: the copy is the suspect one
        return Err(SorterError::io(
            destination,
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("size mismatch after copy: expected {} bytes, found {}", expected, actual),
            ),
        ));
    }

    // The destination copy stays in place if this fails
    fs::remove_file(source).map_err(|e| SorterError::io(source, e))
}

/// Rename within one directory (filename cleanup)
pub fn rename_in_place(source: &Path, destination: &Path) -> Result<()> {
    if destination.exists() {
        return Err(SorterError::io(
            destination,
            io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
        ));
    }
    fs::rename(source, destination).map_err(|e| SorterError::io(source, e))
}

/// Write a small file through the same temp-and-rename path
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SorterError::planning(path, "path has no parent"))?;
    let temp = temp_path(dir, path);

    let outcome = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)
            .map_err(|e| SorterError::io(&temp, e))?;
        file.write_all(contents).map_err(|e| SorterError::io(&temp, e))?;
        file.sync_all().map_err(|e| SorterError::io(&temp, e))?;
        if path.exists() {
            return Err(SorterError::io(
                path,
                io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
            ));
        }
        fs::rename(&temp, path).map_err(|e| SorterError::io(path, e))
    })();

    if outcome.is_err() {
        discard_temp(&temp);
    }
    outcome
}

fn temp_path(dir: &Path, destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    dir.join(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Remove a temp file left by a failed write; failure is logged, not raised
fn discard_temp(temp: &Path) {
    if !temp.exists() {
        return;
    }
    if let Err(e) = fs::remove_file(temp) {
        warn!("Failed to remove temp file {:?}: {}", temp, e);
    }
}

/// Remove the directories a move left empty, deepest first
///
/// Candidates are the parents of the `moved` sources and their ancestors
/// below `root`. Directories nothing was moved out of are never touched, and
/// `root` and anything in `keep` survive. Returns the removed directories.
pub fn remove_emptied_dirs(root: &Path, moved: &[PathBuf], keep: &[PathBuf]) -> Vec<PathBuf> {
    let mut candidates = BTreeSet::new();
    for source in moved {
        for dir in source.ancestors().skip(1) {
            if dir == root || !dir.starts_with(root) {
                break;
            }
            candidates.insert(dir.to_path_buf());
        }
    }
    let mut candidates: Vec<PathBuf> = candidates.into_iter().collect();
    candidates.sort_by_key(|dir| Reverse(dir.components().count()));

    let mut removed = Vec::new();
    for dir in candidates {
        if keep.iter().any(|k| *k == dir) {
            continue;
        }
        let is_empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !is_empty {
            continue;
        }
        match fs::remove_dir(&dir) {
            Ok(()) => {
                debug!("Removed empty directory {:?}", dir);
                removed.push(dir);
            }
            Err(e) => warn!("Failed to remove empty directory {:?}: {}", dir, e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(source: &Path, dir: &Path, name: &str, operation: OperationKind) -> PlacementPlan {
        PlacementPlan {
            source: source.to_path_buf(),
            destination_dir: dir.to_path_buf(),
            file_name: name.to_string(),
            operation,
            sidecar: None,
            renamed: false,
            bucket: "test".to_string(),
        }
    }

    fn no_temp_files(dir: &Path) -> bool {
        fs::read_dir(dir)
            .unwrap()
            .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".tmp"))
    }

    #[test]
    fn test_copy_keeps_source_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        fs::write(&source, b"pixels").unwrap();
        let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        File::options().write(true).open(&source).unwrap().set_modified(old).unwrap();

        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        execute(&plan(&source, &out, "a.png", OperationKind::Copy)).unwrap();

        assert_eq!(fs::read(out.join("a.png")).unwrap(), b"pixels");
        assert!(source.exists());
        assert_eq!(fs::metadata(out.join("a.png")).unwrap().modified().unwrap(), old);
        assert!(no_temp_files(&out));
    }

    #[test]
    fn test_committed_copy_precedes_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        fs::write(&source, b"pixels").unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();

        // The copy step alone: both files exist and are identical
        let bytes = commit_copy(&source, &out.join("a.png")).unwrap();
        assert_eq!(bytes, 6);
        assert_eq!(fs::read(&source).unwrap(), fs::read(out.join("a.png")).unwrap());

        // A full move removes the source only after the copy landed
        move_file(&source, &out.join("b.png")).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read(out.join("b.png")).unwrap(), b"pixels");
    }

    #[test]
    fn test_failed_move_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        fs::write(&source, b"pixels").unwrap();

        let missing = dir.path().join("missing").join("a.png");
        let err = move_file(&source, &missing).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(fs::read(&source).unwrap(), b"pixels");
        assert!(no_temp_files(dir.path()));
    }

    #[test]
    fn test_existing_destination_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        fs::write(&source, b"new").unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("a.png"), b"old").unwrap();

        assert!(commit_copy(&source, &out.join("a.png")).is_err());
        assert_eq!(fs::read(out.join("a.png")).unwrap(), b"old");
        assert!(no_temp_files(&out));
    }

    #[test]
    fn test_failed_atomic_write_discards_temp() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("a.txt"), b"old").unwrap();

        assert!(write_atomic(&out.join("a.txt"), b"new").is_err());
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"old");
        assert!(no_temp_files(&out));

        // Nothing to discard is not an error
        discard_temp(&out.join(".missing.tmp"));
        assert!(no_temp_files(&out));
    }

    #[test]
    fn test_sidecar_written_after_image() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.png");
        fs::write(&source, b"pixels").unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();

        let mut plan = plan(&source, &out, "a.png", OperationKind::Move);
        plan.sidecar = Some(out.join("a.txt"));
        execute(&plan).unwrap();
        write_sidecar(&plan, "=== MODELS ===").unwrap();

        assert_eq!(fs::read_to_string(out.join("a.txt")).unwrap(), "=== MODELS ===");
        assert!(!source.exists());
    }

    #[test]
    fn test_operation_result_from_plan() {
        let p = plan(Path::new("a.png"), Path::new("out"), "a.png", OperationKind::Copy);
        let ok = OperationResult::from_plan(&p, Started::now(), Ok(()));
        assert!(ok.is_success());
        assert_eq!(ok.destination, Some(PathBuf::from("out").join("a.png")));

        let err = SorterError::planning("out", "denied");
        let failed = OperationResult::from_plan(&p, Started::now(), Err(err));
        assert!(failed.is_failure());
        match failed.status {
            OperationStatus::Failed { kind, .. } => assert_eq!(kind, ErrorKind::PlanningError),
            other => panic!("unexpected status {:?}", other),
        }
    }

    #[test]
    fn test_remove_emptied_dirs_deepest_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let deep = root.join("a").join("b").join("c");
        fs::create_dir_all(&deep).unwrap();
        fs::create_dir_all(root.join("keep")).unwrap();
        fs::write(root.join("keep").join("x.png"), b"x").unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        fs::create_dir_all(root.join("untouched")).unwrap();
        fs::create_dir_all(root.join(".git").join("refs").join("tags")).unwrap();

        let moved = [
            deep.join("x.png"),
            root.join("keep").join("y.png"),
            root.join("target").join("z.png"),
        ];
        let removed = remove_emptied_dirs(root, &moved, &[root.join("target")]);
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0], deep);
        assert!(!root.join("a").exists());
        assert!(root.join("keep").exists());
        assert!(root.join("target").exists());
        assert!(root.join("untouched").exists());
        assert!(root.join(".git").join("refs").join("tags").exists());
        assert!(root.exists());
    }
}
