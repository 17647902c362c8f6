// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Destination planning and collision handling
//!
//! Every destination name is claimed in the run's [`ClaimTable`] before any
//! byte is written, so two files planned into the same directory can never
//! receive the same name even when neither exists on disk yet.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::OperationKind;
use crate::{Result, SorterError};

/// Bucket used when no classification is possible
pub const UNCLASSIFIED: &str = "unclassified";

/// Subdirectory for images with metadata but no LoRAs when grouping by LoRA
pub const NO_LORAS: &str = "no_loras";

/// Extension of metadata sidecars
const SIDECAR_EXTENSION: &str = "txt";

/// Names Windows refuses as path components
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Make a string safe as a single path component
pub fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = collapsed.trim_matches(|c: char| c == '.' || c.is_whitespace());

    if cleaned.is_empty() {
        return "_".to_string();
    }
    if RESERVED_NAMES.contains(&cleaned.to_lowercase().as_str()) {
        return format!("{}_", cleaned);
    }
    cleaned.to_string()
}

/// Relative destination directory, one sanitized component per segment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bucket {
    segments: Vec<String>,
}

impl Bucket {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments: Vec<String> = segments
            .into_iter()
            .map(|s| sanitize(s.as_ref()))
            .collect();
        if segments.is_empty() {
            return Self::unclassified();
        }
        Self { segments }
    }

    pub fn unclassified() -> Self {
        Self {
            segments: vec![UNCLASSIFIED.to_string()],
        }
    }

    /// Append a nested level (the LoRA signature directory)
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(sanitize(segment));
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Label used in summaries: top-level bucket only
    pub fn label(&self) -> &str {
        self.segments.first().map(String::as_str).unwrap_or(UNCLASSIFIED)
    }

    pub fn relative_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

/// Destination names claimed during one run, per directory
///
/// Names are compared case-insensitively so that runs behave the same on
/// case-insensitive filesystems.
#[derive(Debug, Default)]
pub struct ClaimTable {
    claimed: HashMap<PathBuf, HashSet<String>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str) -> String {
        name.to_lowercase()
    }

    pub fn is_claimed(&self, dir: &Path, name: &str) -> bool {
        self.claimed
            .get(dir)
            .map(|names| names.contains(&Self::key(name)))
            .unwrap_or(false)
    }

    /// Check and insert in one step; false when the name was already taken
    pub fn claim(&mut self, dir: &Path, name: &str) -> bool {
        self.claimed
            .entry(dir.to_path_buf())
            .or_default()
            .insert(Self::key(name))
    }

    pub fn len(&self) -> usize {
        self.claimed.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where one file goes and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub source: PathBuf,
    pub destination_dir: PathBuf,
    pub file_name: String,
    pub operation: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<PathBuf>,
    /// The destination name differs from the source name
    pub renamed: bool,
    pub bucket: String,
}

impl PlacementPlan {
    pub fn destination(&self) -> PathBuf {
        self.destination_dir.join(&self.file_name)
    }
}

/// Split a file name into stem and extension (without the dot)
fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

fn join_name(stem: &str, ext: Option<&str>) -> String {
    match ext {
        Some(ext) => format!("{}.{}", stem, ext),
        None => stem.to_string(),
    }
}

/// Candidate names: the original, then `stem_1.ext`, `stem_2.ext`, ...
fn candidate(stem: &str, ext: Option<&str>, n: u32) -> String {
    if n == 0 {
        join_name(stem, ext)
    } else {
        join_name(&format!("{}_{}", stem, n), ext)
    }
}

fn sidecar_name(image_name: &str) -> String {
    let (stem, _) = split_name(image_name);
    join_name(stem, Some(SIDECAR_EXTENSION))
}

/// Turns classification results into collision-free placement plans
#[derive(Debug, Clone)]
pub struct PlacementPlanner {
    output_root: PathBuf,
    operation: OperationKind,
    write_sidecars: bool,
    create_dirs: bool,
}

impl PlacementPlanner {
    pub fn new(output_root: impl Into<PathBuf>, operation: OperationKind) -> Self {
        Self {
            output_root: output_root.into(),
            operation,
            write_sidecars: false,
            create_dirs: true,
        }
    }

    pub fn with_sidecars(mut self, enabled: bool) -> Self {
        self.write_sidecars = enabled;
        self
    }

    /// Preview planners never create directories
    pub fn preview(mut self) -> Self {
        self.create_dirs = false;
        self
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Plan a file into `<output-root>/<bucket>`
    pub fn plan(&self, claims: &mut ClaimTable, source: &Path, bucket: &Bucket) -> Result<PlacementPlan> {
        let dir = self.output_root.join(bucket.relative_path());
        self.plan_into(claims, source, &dir, bucket.label())
    }

    /// Plan a file into an explicit directory
    pub fn plan_into(
        &self,
        claims: &mut ClaimTable,
        source: &Path,
        dir: &Path,
        bucket: &str,
    ) -> Result<PlacementPlan> {
        let original = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SorterError::planning(source, "source has no file name"))?;
        self.plan_named(claims, source, dir, &original, bucket)
    }

    /// Plan a file into `dir` under a preferred name (rename-in-place uses this)
    pub fn plan_named(
        &self,
        claims: &mut ClaimTable,
        source: &Path,
        dir: &Path,
        preferred: &str,
        bucket: &str,
    ) -> Result<PlacementPlan> {
        self.prepare_dir(dir)?;

        let original = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (stem, ext) = split_name(preferred);

        for n in 0..=u32::MAX {
            let name = candidate(stem, ext, n);
            if !self.is_free(claims, dir, &name) {
                continue;
            }
            let sidecar = if self.write_sidecars {
                let sidecar = sidecar_name(&name);
                if !self.is_free(claims, dir, &sidecar) {
                    continue;
                }
                claims.claim(dir, &sidecar);
                Some(dir.join(sidecar))
            } else {
                None
            };
            claims.claim(dir, &name);

            let renamed = name != original;
            if renamed {
                debug!("{:?} planned as {:?} in {:?}", source, name, dir);
            }
            return Ok(PlacementPlan {
                source: source.to_path_buf(),
                destination_dir: dir.to_path_buf(),
                file_name: name,
                operation: self.operation,
                sidecar,
                renamed,
                bucket: bucket.to_string(),
            });
        }

        Err(SorterError::planning(dir.join(preferred), "no free destination name"))
    }

    fn is_free(&self, claims: &ClaimTable, dir: &Path, name: &str) -> bool {
        !claims.is_claimed(dir, name) && !dir.join(name).exists()
    }

    fn prepare_dir(&self, dir: &Path) -> Result<()> {
        if self.create_dirs {
            return std::fs::create_dir_all(dir).map_err(|e| SorterError::planning(dir, e));
        }
        // Preview: only reject paths already occupied by something else
        for ancestor in dir.ancestors() {
            if ancestor.exists() {
                if !ancestor.is_dir() {
                    return Err(SorterError::planning(dir, format!("{:?} is not a directory", ancestor)));
                }
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_same_names_get_distinct_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let planner = PlacementPlanner::new(dir.path().join("out"), OperationKind::Copy);
        let mut claims = ClaimTable::new();
        let bucket = Bucket::new(["Pony"]);

        let names: Vec<String> = (0..5)
            .map(|i| {
                let source = dir.path().join(format!("src{}", i)).join("image.png");
                planner.plan(&mut claims, &source, &bucket).unwrap().file_name
            })
            .collect();

        assert_eq!(names, vec!["image.png", "image_1.png", "image_2.png", "image_3.png", "image_4.png"]);
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn test_existing_file_on_disk_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("Pony")).unwrap();
        fs::write(out.join("Pony").join("a.png"), b"existing").unwrap();

        let planner = PlacementPlanner::new(&out, OperationKind::Move);
        let plan = planner
            .plan(&mut ClaimTable::new(), &dir.path().join("a.png"), &Bucket::new(["Pony"]))
            .unwrap();
        assert_eq!(plan.file_name, "a_1.png");
        assert!(plan.renamed);
        assert_eq!(plan.operation, OperationKind::Move);
    }

    #[test]
    fn test_sidecar_shares_collision_pass() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(out.join("unclassified")).unwrap();
        fs::write(out.join("unclassified").join("a.txt"), b"notes").unwrap();

        let planner = PlacementPlanner::new(&out, OperationKind::Copy).with_sidecars(true);
        let mut claims = ClaimTable::new();
        let plan = planner
            .plan(&mut claims, &dir.path().join("a.png"), &Bucket::unclassified())
            .unwrap();
        assert_eq!(plan.file_name, "a_1.png");
        assert_eq!(plan.sidecar, Some(out.join("unclassified").join("a_1.txt")));

        // a.jpg would want a_1.txt too, which is now claimed
        let plan = planner
            .plan(&mut claims, &dir.path().join("a_1.jpg"), &Bucket::unclassified())
            .unwrap();
        assert_eq!(plan.file_name, "a_1_1.jpg");
    }

    #[test]
    fn test_claims_are_case_insensitive() {
        let mut claims = ClaimTable::new();
        assert!(claims.claim(Path::new("out"), "Image.PNG"));
        assert!(!claims.claim(Path::new("out"), "image.png"));
        assert!(claims.claim(Path::new("other"), "image.png"));
        assert_eq!(claims.len(), 2);
    }

    #[test]
    fn test_preview_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let planner = PlacementPlanner::new(&out, OperationKind::Copy).preview();
        let plan = planner
            .plan(&mut ClaimTable::new(), &dir.path().join("a.png"), &Bucket::new(["Flux"]))
            .unwrap();
        assert_eq!(plan.destination(), out.join("Flux").join("a.png"));
        assert!(!out.exists());
    }

    #[test]
    fn test_blocked_directory_is_planning_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("Flux"), b"not a directory").unwrap();

        for planner in [
            PlacementPlanner::new(&out, OperationKind::Copy),
            PlacementPlanner::new(&out, OperationKind::Copy).preview(),
        ] {
            let err = planner
                .plan(&mut ClaimTable::new(), &dir.path().join("a.png"), &Bucket::new(["Flux"]))
                .unwrap_err();
            assert!(matches!(err, SorterError::Planning { .. }), "got {:?}", err);
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("Other/sd_xl:base"), "Other_sd_xl_base");
        assert_eq!(sanitize("  ..  "), "_");
        assert_eq!(sanitize("CON"), "CON_");
        assert_eq!(sanitize("styleA+styleB"), "styleA+styleB");
        assert_eq!(sanitize("my   model\tname"), "my model name");
    }

    #[test]
    fn test_bucket_paths() {
        let bucket = Bucket::new(["Other", "dreamshaper_8"]).child("styleA+styleB");
        assert_eq!(bucket.label(), "Other");
        assert_eq!(bucket.to_string(), "Other/dreamshaper_8/styleA+styleB");
        assert_eq!(
            bucket.relative_path(),
            PathBuf::from("Other").join("dreamshaper_8").join("styleA+styleB")
        );
        assert_eq!(Bucket::new(Vec::<String>::new()), Bucket::unclassified());
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("a.b.png"), ("a.b", Some("png")));
        assert_eq!(split_name(".hidden"), (".hidden", None));
        assert_eq!(split_name("noext"), ("noext", None));
    }
}
