// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for Sorter
//!
//! The configuration is produced by the front end (CLI or GUI) and consumed
//! by the engine. It is loaded from a JSON file; every field has a default so
//! a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::query::QuerySpec;
use crate::{Result, SorterError};

/// Main run configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SortConfig {
    /// Copy or move files into the output tree
    #[serde(default)]
    pub mode: OperationKind,

    /// Add a second directory level keyed by the sorted LoRA stack
    #[serde(default)]
    pub group_by_lora: bool,

    /// Metadata search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Dominant color settings
    #[serde(default)]
    pub color: ColorConfig,

    /// Flatten settings
    #[serde(default)]
    pub flatten: FlattenConfig,

    /// Write a `.txt` sidecar with the normalized metadata next to each image
    #[serde(default = "default_true")]
    pub write_metadata_sidecars: bool,

    /// Descend into subdirectories of the source directory
    #[serde(default)]
    pub recursive: bool,

    /// File extensions treated as images
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Base model bucketing
    #[serde(default)]
    pub model: ModelConfig,

    /// Directory receiving one session log per run
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Progress events buffered before new ones are dropped
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
}

/// How files reach the destination
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    #[default]
    Copy,
    Move,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Copy => f.write_str("COPY"),
            OperationKind::Move => f.write_str("MOVE"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SearchConfig {
    /// Query evaluated against each image; required for search runs
    #[serde(default)]
    pub spec: Option<QuerySpec>,
    /// Place each hit under the first query term it matched
    #[serde(default)]
    pub subfolder_per_term: bool,
    /// Bucket used for hits when not splitting per term
    #[serde(default = "default_search_bucket")]
    pub bucket_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ColorConfig {
    /// Pixels with luminance below this (0.0 - 1.0) count as dark
    #[serde(default = "default_dark_threshold")]
    pub dark_threshold: f32,
    /// Number of equal hue sectors on the color wheel
    #[serde(default = "default_hue_sectors")]
    pub hue_sectors: u16,
    /// Images are sampled down to at most `sample_size x sample_size` pixels
    #[serde(default = "default_sample_size")]
    pub sample_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlattenConfig {
    /// Remove directories left empty after a move-mode flatten
    #[serde(default = "default_true")]
    pub cleanup_empty_dirs: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub grouping: ModelGrouping,
    /// Known model families, matched in order against the checkpoint name
    #[serde(default = "default_families")]
    pub families: Vec<ModelFamily>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelGrouping {
    /// One folder per detected family, `Other/<name>` for the rest
    #[default]
    Family,
    /// One folder per cleaned checkpoint name
    Checkpoint,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ModelFamily {
    pub name: String,
    pub patterns: Vec<String>,
}

impl ModelFamily {
    fn new(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_dark_threshold() -> f32 { 0.10 }
fn default_hue_sectors() -> u16 { 6 }
fn default_sample_size() -> u32 { 150 }
fn default_log_dir() -> String { "sort_logs".to_string() }
fn default_progress_capacity() -> usize { 64 }
fn default_search_bucket() -> String { "search-hit".to_string() }

fn default_extensions() -> Vec<String> {
    vec!["png", "jpg", "jpeg", "webp", "gif", "bmp", "tiff", "tif"]
        .into_iter().map(String::from).collect()
}

// More specific fragments come first: "sdxl" would otherwise swallow
// "ponyDiffusionV6XL" and friends.
fn default_families() -> Vec<ModelFamily> {
    vec![
        ModelFamily::new("Pony", &["pony"]),
        ModelFamily::new("Illustrious", &["illustrious", "ilxl"]),
        ModelFamily::new("NoobAI", &["noobai", "noob"]),
        ModelFamily::new("Flux", &["flux"]),
        ModelFamily::new("SD3", &["sd3", "sd_3", "stable-diffusion-3"]),
        ModelFamily::new("SDXL", &["sdxl", "xl_", "_xl", "xl-", "-xl"]),
        ModelFamily::new("SD1.5", &["sd15", "sd1.5", "sd_1.5", "v1-5", "v1.5"]),
    ]
}

pub const MIN_HUE_SECTORS: u16 = 3;
pub const MAX_HUE_SECTORS: u16 = 36;

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            mode: OperationKind::default(),
            group_by_lora: false,
            search: SearchConfig::default(),
            color: ColorConfig::default(),
            flatten: FlattenConfig::default(),
            write_metadata_sidecars: true,
            recursive: false,
            extensions: default_extensions(),
            model: ModelConfig::default(),
            log_dir: default_log_dir(),
            progress_capacity: default_progress_capacity(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            spec: None,
            subfolder_per_term: false,
            bucket_name: default_search_bucket(),
        }
    }
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            dark_threshold: default_dark_threshold(),
            hue_sectors: default_hue_sectors(),
            sample_size: default_sample_size(),
        }
    }
}

impl Default for FlattenConfig {
    fn default() -> Self {
        Self {
            cleanup_empty_dirs: true,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            grouping: ModelGrouping::default(),
            families: default_families(),
        }
    }
}

impl SortConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| SorterError::Config(format!("Failed to parse config: {}", e)))?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values that would make any run misbehave
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.color.dark_threshold) {
            return Err(SorterError::Config(format!(
                "color.dark_threshold must be within 0.0..=1.0, got {}",
                self.color.dark_threshold
            )));
        }
        if !(MIN_HUE_SECTORS..=MAX_HUE_SECTORS).contains(&self.color.hue_sectors) {
            return Err(SorterError::Config(format!(
                "color.hue_sectors must be within {}..={}, got {}",
                MIN_HUE_SECTORS, MAX_HUE_SECTORS, self.color.hue_sectors
            )));
        }
        if self.color.sample_size == 0 {
            return Err(SorterError::Config("color.sample_size must be positive".to_string()));
        }
        if self.extensions.is_empty() {
            return Err(SorterError::Config("at least one image extension is required".to_string()));
        }
        if self.progress_capacity == 0 {
            return Err(SorterError::Config("progress_capacity must be positive".to_string()));
        }
        if self.search.bucket_name.trim().is_empty() {
            return Err(SorterError::Config("search.bucket_name must not be empty".to_string()));
        }
        if let Some(family) = self.model.families.iter().find(|f| f.patterns.is_empty()) {
            return Err(SorterError::Config(format!(
                "model family '{}' has no patterns",
                family.name
            )));
        }
        Ok(())
    }

    /// The query for a search run; a missing, empty or uncompilable query is a caller mistake
    pub fn search_spec(&self) -> Result<&QuerySpec> {
        match &self.search.spec {
            Some(spec) if !spec.is_empty() => {
                spec.validate()?;
                Ok(spec)
            }
            Some(_) => Err(SorterError::Config("search query has no terms".to_string())),
            None => Err(SorterError::Config("search run requires a query".to_string())),
        }
    }

    /// Whether a path has one of the configured image extensions
    pub fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::MatchMode;

    #[test]
    fn test_defaults_are_valid() {
        let config = SortConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, OperationKind::Copy);
        assert_eq!(config.color.hue_sectors, 6);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SortConfig = serde_json::from_str(r#"{"mode": "move", "group_by_lora": true}"#).unwrap();
        assert_eq!(config.mode, OperationKind::Move);
        assert!(config.group_by_lora);
        assert!(config.write_metadata_sidecars);
        assert_eq!(config.log_dir, "sort_logs");
        assert!(!config.model.families.is_empty());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = SortConfig::default();
        config.color.dark_threshold = 1.5;
        assert!(matches!(config.validate(), Err(SorterError::Config(_))));

        let mut config = SortConfig::default();
        config.color.hue_sectors = 2;
        assert!(matches!(config.validate(), Err(SorterError::Config(_))));
    }

    #[test]
    fn test_search_spec_required() {
        let mut config = SortConfig::default();
        assert!(config.search_spec().is_err());

        config.search.spec = Some(QuerySpec::new(Vec::<String>::new(), MatchMode::Any));
        assert!(config.search_spec().is_err());

        config.search.spec = Some(QuerySpec::new(["pony"], MatchMode::Any));
        assert!(config.search_spec().is_ok());

        config.search.spec = Some(QuerySpec::new(["[pony"], MatchMode::Any).with_regex(true));
        assert!(config.search_spec().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = SortConfig::default();
        config.mode = OperationKind::Move;
        config.save(&path).unwrap();

        let loaded = SortConfig::load(&path).unwrap();
        assert_eq!(loaded.mode, OperationKind::Move);
    }

    #[test]
    fn test_is_image() {
        let config = SortConfig::default();
        assert!(config.is_image(Path::new("a/b.PNG")));
        assert!(!config.is_image(Path::new("a/b.txt")));
        assert!(!config.is_image(Path::new("a/noext")));
    }
}
