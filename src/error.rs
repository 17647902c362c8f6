// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for Sorter

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Sorter operations
pub type Result<T> = std::result::Result<T, SorterError>;

/// Sorter error types
#[derive(Error, Debug)]
pub enum SorterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unreadable image {path:?}: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },

    #[error("Cannot plan destination {path:?}: {reason}")]
    Planning { path: PathBuf, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serializable classification of a per-file failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnreadableImage,
    MetadataAbsent,
    PlanningError,
    IoError,
    ConfigError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::UnreadableImage => "UnreadableImage",
            ErrorKind::MetadataAbsent => "MetadataAbsent",
            ErrorKind::PlanningError => "PlanningError",
            ErrorKind::IoError => "IOError",
            ErrorKind::ConfigError => "ConfigError",
        };
        f.write_str(name)
    }
}

impl SorterError {
    /// Attach a path to a bare I/O error
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SorterError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SorterError::UnreadableImage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn planning(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SorterError::Planning {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// The failure kind recorded in the session summary
    pub fn kind(&self) -> ErrorKind {
        match self {
            SorterError::Config(_) => ErrorKind::ConfigError,
            SorterError::UnreadableImage { .. } | SorterError::Image(_) => ErrorKind::UnreadableImage,
            SorterError::Planning { .. } => ErrorKind::PlanningError,
            SorterError::FileSystem(_)
            | SorterError::Io { .. }
            | SorterError::Json(_) => ErrorKind::IoError,
        }
    }

    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, SorterError::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(SorterError::unreadable("a.png", "bad header").kind(), ErrorKind::UnreadableImage);
        assert_eq!(SorterError::planning("out", "denied").kind(), ErrorKind::PlanningError);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(SorterError::io("x", io).kind(), ErrorKind::IoError);
        assert!(SorterError::Config("empty query".into()).is_fatal());
        assert!(!SorterError::planning("out", "denied").is_fatal());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::IoError.to_string(), "IOError");
        assert_eq!(ErrorKind::UnreadableImage.to_string(), "UnreadableImage");
    }
}
