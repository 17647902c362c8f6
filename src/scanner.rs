// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Source directory enumeration

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::SortConfig;
use crate::{Result, SorterError};

/// Extensions of files another program is still writing
const PARTIAL_EXTENSIONS: &[&str] = &["part", "partial", "crdownload", "download", "tmp"];

/// Whether a file is finished and visible
///
/// Hidden names are out, which covers the executor's own in-flight temp
/// files, and so are downloads still in progress.
pub fn is_settled(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }
    !Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PARTIAL_EXTENSIONS.iter().any(|p| ext.eq_ignore_ascii_case(p)))
        .unwrap_or(false)
}

/// A settled file with one of the configured image extensions
pub fn is_sortable(path: &Path, config: &SortConfig) -> bool {
    is_settled(path) && config.is_image(path)
}

/// Best-effort absolute form for prefix comparisons
fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Image files under `source`, sorted by path
///
/// Directories listed in `exclude` (the output root, the log directory) and
/// hidden directories are never entered. Only the top level is read unless
/// `config.recursive` is set.
pub fn scan(source: &Path, config: &SortConfig, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    scan_images(source, config, exclude, config.recursive)
}

/// Like [`scan`] but always recursive (flattening)
pub fn scan_nested(source: &Path, config: &SortConfig, exclude: &[PathBuf]) -> Result<Vec<PathBuf>> {
    scan_images(source, config, exclude, true)
}

fn scan_images(source: &Path, config: &SortConfig, exclude: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    if !source.is_dir() {
        return Err(SorterError::Config(format!(
            "source directory {:?} does not exist or is not a directory",
            source
        )));
    }

    let excluded: Vec<PathBuf> = exclude.iter().map(|p| resolve(p)).collect();
    let mut walker = WalkDir::new(source).min_depth(1).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    let entries = walker.into_iter().filter_entry(|entry| {
        if !entry.file_type().is_dir() {
            return true;
        }
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        let resolved = resolve(entry.path());
        !hidden && !excluded.iter().any(|ex| resolved == *ex)
    });

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", source, e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if is_sortable(path, config) {
            files.push(path.to_path_buf());
        } else {
            debug!("Ignoring {:?}", path);
        }
    }

    files.sort();
    Ok(files)
}
