// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Filename cleanup for generator output
//!
//! Generators leave workflow noise in file names: `[workflow_test_batch1] `,
//! `Gen 31 `, `$0152`. These helpers compute the cleaned name; the engine
//! applies them with the usual collision policy.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Suffix of the per-image JSON files some generators write
pub const METADATA_FILE_SUFFIX: &str = "_metadata.json";

/// Cleanup run options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOptions {
    /// Delete stale `*_metadata.json` files
    #[serde(default = "default_true")]
    pub remove_metadata_files: bool,
    /// Name used when nothing is left after cleaning
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Report what would change without touching anything
    #[serde(default)]
    pub dry_run: bool,
}

fn default_true() -> bool { true }
fn default_prefix() -> String { "image".to_string() }

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            remove_metadata_files: true,
            prefix: default_prefix(),
            dry_run: false,
        }
    }
}

fn noise_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\[workflow[^\]]*\]\s*|\bGen\s+\d+\s+|\$\d+").expect("valid noise regex")
    })
}

fn separator_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s_]+").expect("valid separator regex"))
}

/// Whether a file name carries generator noise
pub fn needs_cleanup(file_name: &str) -> bool {
    let (stem, _) = split_extension(file_name);
    noise_regex().is_match(stem) || separator_regex().find_iter(stem).any(|m| m.as_str() != "_")
}

pub fn is_stale_metadata(file_name: &str) -> bool {
    file_name.ends_with(METADATA_FILE_SUFFIX)
}

fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    }
}

/// Clean a file name, keeping its extension
pub fn clean_file_name(file_name: &str, prefix: &str) -> String {
    let (stem, ext) = split_extension(file_name);

    let cleaned = noise_regex().replace_all(stem, "");
    let cleaned = separator_regex().replace_all(cleaned.trim(), "_");
    let cleaned = cleaned.trim_matches(|c: char| c == '_' || c == '-' || c == '.' || c.is_whitespace());

    let stem = if cleaned.is_empty() { prefix } else { cleaned };
    format!("{}{}", stem, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_file_name() {
        assert_eq!(
            clean_file_name("[workflow_test_batch1] Gen 31 portrait $0152.png", "image"),
            "portrait.png"
        );
        assert_eq!(clean_file_name("my  cool__image.jpg", "image"), "my_cool_image.jpg");
        assert_eq!(clean_file_name("$0001.png", "image"), "image.png");
        assert_eq!(clean_file_name("already_clean.png", "image"), "already_clean.png");
    }

    #[test]
    fn test_needs_cleanup() {
        assert!(needs_cleanup("[workflow_test_batch2] cat.png"));
        assert!(needs_cleanup("Gen 4 dog.png"));
        assert!(needs_cleanup("dog $12.png"));
        assert!(needs_cleanup("two  spaces.png"));
        assert!(!needs_cleanup("already_clean.png"));
        assert!(!needs_cleanup("Generated.png"));
    }

    #[test]
    fn test_stale_metadata() {
        assert!(is_stale_metadata("cat_metadata.json"));
        assert!(!is_stale_metadata("cat.json"));
    }
}
