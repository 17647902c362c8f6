// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Embedded generation metadata: extraction, normalization and sidecar text
//!
//! Raw metadata comes out of the image container as text; the normalizer turns
//! it into a [`MetadataRecord`] that the classifiers and the query matcher
//! share.

pub mod extract;
pub mod normalize;
pub mod parameters;
pub mod sidecar;

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{Result, SorterError};

pub use extract::{extract, parse_text_block};
pub use normalize::{NormalizationWarning, Normalized, Normalizer};

/// The text block found in an image, before any interpretation
#[derive(Debug, Clone, PartialEq)]
pub enum RawMetadata {
    /// No generation metadata in the file
    Absent,
    /// A JSON object (ComfyUI graph, flat key/value map, parsed A1111 text)
    Structured(serde_json::Map<String, serde_json::Value>),
    /// Text that could not be interpreted; kept for display and search
    RawText(String),
}

impl RawMetadata {
    pub fn is_absent(&self) -> bool {
        matches!(self, RawMetadata::Absent)
    }
}

/// A scanned image file
///
/// Pixels are decoded on first access only; metadata sorting never pays for a
/// full decode.
#[derive(Debug)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub size: u64,
    pub format: Option<ImageFormat>,
    pub metadata: RawMetadata,
    pixels: OnceCell<DynamicImage>,
}

impl ImageRecord {
    pub fn new(path: PathBuf, size: u64, format: Option<ImageFormat>, metadata: RawMetadata) -> Self {
        Self {
            path,
            size,
            format,
            metadata,
            pixels: OnceCell::new(),
        }
    }

    /// Short format tag for logs ("png", "jpeg", ...)
    pub fn format_tag(&self) -> String {
        self.format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("unknown")
            .to_string()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Decoded pixel data, decoded once and cached
    pub fn pixels(&self) -> Result<&DynamicImage> {
        if let Some(image) = self.pixels.get() {
            return Ok(image);
        }
        let image = decode_image(&self.path)?;
        Ok(self.pixels.get_or_init(|| image))
    }
}

fn decode_image(path: &Path) -> Result<DynamicImage> {
    image::ImageReader::open(path)
        .map_err(|e| SorterError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| SorterError::io(path, e))?
        .decode()
        .map_err(|e| SorterError::unreadable(path, e))
}

/// A generation setting value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Number(serde_json::Number),
    Text(String),
}

impl SettingValue {
    /// Parse a value declared numeric; non-numeric text is kept as text
    pub fn parse_numeric(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(n) = trimmed.parse::<u64>() {
            return SettingValue::Number(n.into());
        }
        if let Ok(n) = trimmed.parse::<i64>() {
            return SettingValue::Number(n.into());
        }
        if let Some(n) = trimmed.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return SettingValue::Number(n);
        }
        SettingValue::Text(trimmed.to_string())
    }

    /// Convert a scalar JSON value; arrays, objects and null have no setting form
    pub fn from_json(value: &serde_json::Value, numeric: bool) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => Some(SettingValue::Number(n.clone())),
            serde_json::Value::String(s) if numeric => Some(Self::parse_numeric(s)),
            serde_json::Value::String(s) => Some(SettingValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(SettingValue::Text(b.to_string())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Number(n) => n.as_f64(),
            SettingValue::Text(_) => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SettingValue::Number(_))
    }
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingValue::Number(n) => write!(f, "{}", n),
            SettingValue::Text(s) => f.write_str(s),
        }
    }
}

/// One LoRA in the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraRef {
    /// Matching key: no path, extension, weight or version suffix
    pub key: String,
    /// The string as it appeared in the metadata
    pub original: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
}

/// Base model derived from the checkpoint name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseModel {
    /// Known family the checkpoint belongs to, if any
    pub family: Option<String>,
    /// Checkpoint file stem
    pub name: String,
}

/// Canonical, normalized generation metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub checkpoint: Option<String>,
    pub base_model: Option<BaseModel>,
    pub loras: Vec<LoraRef>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub settings: BTreeMap<String, SettingValue>,
    pub raw_text: Option<String>,
}

impl MetadataRecord {
    /// Order-independent signature of the LoRA stack, `None` when empty
    pub fn lora_signature(&self) -> Option<String> {
        if self.loras.is_empty() {
            return None;
        }
        let mut keys: Vec<&str> = self.loras.iter().map(|l| l.key.as_str()).collect();
        keys.sort_by_key(|k| k.to_lowercase());
        keys.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        Some(keys.join("+"))
    }

    pub fn setting(&self, name: &str) -> Option<&SettingValue> {
        self.settings.get(name)
    }
}
