// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Run orchestration
//!
//! One run processes files sequentially: scan, extract, classify, plan,
//! execute, log. The claim table and the summary live in the run's
//! [`RunContext`]; nothing is shared across runs. Per-file failures become
//! `OperationResult`s and never abort the run. Only configuration errors are
//! fatal, and they are raised before anything on disk changes.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::cleanup::{self, CleanupOptions};
use crate::color;
use crate::config::{ModelGrouping, OperationKind, SortConfig};
use crate::executor::{self, OperationResult, OperationStatus, Started};
use crate::metadata::{self, sidecar, BaseModel, MetadataRecord, NormalizationWarning, Normalizer};
use crate::planner::{Bucket, ClaimTable, PlacementPlan, PlacementPlanner, NO_LORAS, UNCLASSIFIED};
use crate::progress::{CancellationToken, ProgressSender};
use crate::query::{self, QuerySpec};
use crate::scanner;
use crate::session::{RunKind, SessionEvent, SessionLog, SessionSummary};
use crate::{Result, SorterError};

/// Bucket label for search misses, which stay where they are
pub const SEARCH_MISS: &str = "unmatched";

/// Sorting strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    ByModel,
    ByColor,
    Search,
}

impl SortMode {
    fn run_kind(&self) -> RunKind {
        match self {
            SortMode::ByModel => RunKind::SortByModel,
            SortMode::ByColor => RunKind::SortByColor,
            SortMode::Search => RunKind::Search,
        }
    }
}

/// State owned by one run
pub struct RunContext {
    pub run_id: String,
    pub claims: ClaimTable,
    pub summary: SessionSummary,
    log: Option<SessionLog>,
    progress: ProgressSender,
    cancel: CancellationToken,
    clock: Instant,
}

impl RunContext {
    fn new(kind: RunKind, log: Option<SessionLog>, run_id: String, engine: &Engine) -> Self {
        Self {
            summary: SessionSummary::new(run_id.clone(), kind, Utc::now()),
            run_id,
            claims: ClaimTable::new(),
            log,
            progress: engine.progress.clone(),
            cancel: engine.cancel.clone(),
            clock: Instant::now(),
        }
    }

    /// Log an event; a log write failure is a warning, not a run failure
    fn log(&mut self, event: SessionEvent) {
        if let Some(log) = &mut self.log {
            if let Err(e) = log.append(&event) {
                warn!("Session log write failed: {}", e);
                self.summary.warn(format!("session log write failed: {}", e));
            }
        }
    }

    fn warn(&mut self, path: Option<&Path>, message: String) {
        match path {
            Some(p) => warn!("{:?}: {}", p, message),
            None => warn!("{}", message),
        }
        self.summary.warn(match path {
            Some(p) => format!("{}: {}", p.display(), message),
            None => message.clone(),
        });
        self.log(SessionEvent::Warning {
            timestamp: Utc::now(),
            path: path.map(Path::to_path_buf),
            message,
        });
    }

    fn record(&mut self, result: OperationResult) {
        match &result.status {
            OperationStatus::Failed { kind, message } => {
                warn!("{} {:?}: {}", kind, result.source, message)
            }
            OperationStatus::Skipped { reason } => debug!("Skipped {:?}: {}", result.source, reason),
            OperationStatus::Succeeded => debug!(
                "{:?} -> {:?}",
                result.source,
                result.destination.as_deref().unwrap_or(Path::new(""))
            ),
        }
        self.summary.record(&result);
        self.log(SessionEvent::Outcome { result });
    }

    /// Checked between files; the current file always completes
    fn should_stop(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.summary.cancelled = true;
        }
        self.summary.cancelled
    }

    fn report(&self, index: usize, total: usize, path: &Path) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.progress.report(index, total, name);
    }

    fn finish(mut self) -> SessionSummary {
        self.summary.elapsed_ms = self.clock.elapsed().as_millis() as u64;
        self.summary.progress_dropped = self.progress.dropped();
        let summary = self.summary.clone();
        self.log(SessionEvent::RunFinished {
            timestamp: Utc::now(),
            summary: summary.clone(),
        });
        if let Some(log) = &self.log {
            info!("Session log written to {:?}", log.path());
        }
        summary
    }
}

/// Plans a preview would execute, plus the files it could not place
#[derive(Debug, Clone)]
pub struct Preview {
    pub plans: Vec<PlacementPlan>,
    pub results: Vec<OperationResult>,
    /// Counts as if every plan succeeded
    pub summary: SessionSummary,
}

/// What a sort would read from one file, without acting on it
#[derive(Debug, Clone)]
pub struct Inspection {
    pub path: PathBuf,
    pub format: String,
    pub record: Option<MetadataRecord>,
    pub warnings: Vec<NormalizationWarning>,
    /// Bucket a model sort would choose
    pub bucket: Bucket,
    /// Sidecar report a sort would write; none without metadata
    pub report: Option<String>,
}

/// Where one image should go, and what to write next to it
struct Placement {
    bucket: Option<Bucket>,
    record: Option<MetadataRecord>,
}

/// The sorting engine
pub struct Engine {
    config: SortConfig,
    progress: ProgressSender,
    cancel: CancellationToken,
}

impl Engine {
    /// Create an engine; invalid configuration is rejected here
    pub fn new(config: SortConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            progress: ProgressSender::disabled(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn new_run_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    fn open_log(&self, kind: RunKind, run_id: &str, source: &Path, destination: Option<&Path>) -> Result<SessionLog> {
        let mut log = SessionLog::create(&self.config.log_dir(), run_id, Utc::now())?;
        log.append(&SessionEvent::RunStarted {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            run: kind,
            source: source.to_path_buf(),
            destination: destination.map(Path::to_path_buf),
            config: Box::new(self.config.clone()),
        })?;
        Ok(log)
    }

    /// Check everything that would make the run fail as a whole
    fn prepare(&self, mode: SortMode, source: &Path, output: &Path) -> Result<(Option<&QuerySpec>, Vec<PathBuf>)> {
        let spec = match mode {
            SortMode::Search => Some(self.config.search_spec()?),
            _ => None,
        };
        if output.exists() && !output.is_dir() {
            return Err(SorterError::Config(format!("output {:?} is not a directory", output)));
        }
        let files = scanner::scan(
            source,
            &self.config,
            &[output.to_path_buf(), self.config.log_dir()],
        )?;
        Ok((spec, files))
    }

    fn planner(&self, output: &Path) -> PlacementPlanner {
        PlacementPlanner::new(output, self.config.mode)
    }

    /// Sort `source` into `output`
    pub fn sort(&self, source: &Path, output: &Path, mode: SortMode) -> Result<SessionSummary> {
        let (spec, files) = self.prepare(mode, source, output)?;
        let kind = mode.run_kind();
        let run_id = Self::new_run_id();
        let log = self.open_log(kind, &run_id, source, Some(output))?;
        let mut ctx = RunContext::new(kind, Some(log), run_id, self);

        info!(
            "Starting {} ({}) of {} file(s): {:?} -> {:?}",
            kind,
            self.config.mode,
            files.len(),
            source,
            output
        );

        let normalizer = Normalizer::new(&self.config.model);
        let planner = self.planner(output);
        let total = files.len();

        for (i, path) in files.iter().enumerate() {
            if ctx.should_stop() {
                info!("Run cancelled after {} of {} file(s)", i, total);
                break;
            }
            let started = Started::now();
            let result = self.process(&mut ctx, &normalizer, &planner, spec, mode, path, started);
            ctx.record(result);
            ctx.report(i + 1, total, path);
        }

        let summary = ctx.finish();
        info!(
            "Finished {}: {} succeeded, {} skipped, {} failed",
            kind, summary.succeeded, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    /// Plan a sort without touching the filesystem
    pub fn preview(&self, source: &Path, output: &Path, mode: SortMode) -> Result<Preview> {
        let (spec, files) = self.prepare(mode, source, output)?;
        let kind = mode.run_kind();
        let mut ctx = RunContext::new(kind, None, Self::new_run_id(), self);

        let normalizer = Normalizer::new(&self.config.model);
        let planner = self.planner(output).preview();
        let total = files.len();
        let mut plans = Vec::new();
        let mut results = Vec::new();

        for (i, path) in files.iter().enumerate() {
            if ctx.should_stop() {
                break;
            }
            let started = Started::now();
            match self.classify(&mut ctx, &normalizer, spec, mode, path) {
                Ok(Placement { bucket: None, .. }) => {
                    results.push(OperationResult::skipped(path, SEARCH_MISS, started, "no query match"));
                }
                Ok(Placement { bucket: Some(bucket), record }) => {
                    let planner = planner.clone().with_sidecars(self.sidecars_for(record.as_ref()));
                    match planner.plan(&mut ctx.claims, path, &bucket) {
                        Ok(plan) => {
                            ctx.summary.record(&OperationResult::from_plan(&plan, started, Ok(())));
                            plans.push(plan);
                        }
                        Err(e) => results.push(OperationResult::failed(path, bucket.label(), started, &e)),
                    }
                }
                Err(e) => results.push(OperationResult::failed(path, UNCLASSIFIED, started, &e)),
            }
            if let Some(result) = results.last().filter(|r| r.source == *path) {
                ctx.summary.record(result);
            }
            ctx.report(i + 1, total, path);
        }

        let summary = ctx.finish();
        Ok(Preview {
            plans,
            results,
            summary,
        })
    }

    fn sidecars_for(&self, record: Option<&MetadataRecord>) -> bool {
        self.config.write_metadata_sidecars && record.is_some()
    }

    /// Extract and classify one file
    fn classify(
        &self,
        ctx: &mut RunContext,
        normalizer: &Normalizer<'_>,
        spec: Option<&QuerySpec>,
        mode: SortMode,
        path: &Path,
    ) -> Result<Placement> {
        let image = metadata::extract(path)?;
        let normalized = normalizer.normalize(&image.metadata);
        for warning in &normalized.warnings {
            ctx.warn(Some(path), warning.to_string());
        }
        let record = normalized.record;

        let bucket = match mode {
            SortMode::ByModel => Some(self.model_bucket(record.as_ref())),
            SortMode::ByColor => {
                let pixels = image.pixels()?;
                let color = color::classify(pixels, &self.config.color);
                debug!("{:?}: {} ({} samples)", path, color.name, color.samples);
                Some(self.with_lora_dir(Bucket::new([color.name.as_str()]), record.as_ref()))
            }
            SortMode::Search => match (spec, record.as_ref()) {
                (Some(spec), Some(rec)) if query::matches(rec, spec) => {
                    let name = if self.config.search.subfolder_per_term {
                        query::first_matching_term(rec, spec).unwrap_or(self.config.search.bucket_name.as_str())
                    } else {
                        self.config.search.bucket_name.as_str()
                    };
                    Some(self.with_lora_dir(Bucket::new([name]), record.as_ref()))
                }
                _ => None,
            },
        };

        Ok(Placement { bucket, record })
    }

    fn model_bucket(&self, record: Option<&MetadataRecord>) -> Bucket {
        let bucket = match record.and_then(|r| r.base_model.as_ref()) {
            Some(base) => base_model_bucket(base, self.config.model.grouping),
            None => Bucket::unclassified(),
        };
        self.with_lora_dir(bucket, record)
    }

    fn with_lora_dir(&self, bucket: Bucket, record: Option<&MetadataRecord>) -> Bucket {
        match record {
            Some(rec) if self.config.group_by_lora => {
                bucket.child(rec.lora_signature().as_deref().unwrap_or(NO_LORAS))
            }
            _ => bucket,
        }
    }

    /// One file through the whole pipeline
    #[allow(clippy::too_many_arguments)]
    fn process(
        &self,
        ctx: &mut RunContext,
        normalizer: &Normalizer<'_>,
        planner: &PlacementPlanner,
        spec: Option<&QuerySpec>,
        mode: SortMode,
        path: &Path,
        started: Started,
    ) -> OperationResult {
        let placement = match self.classify(ctx, normalizer, spec, mode, path) {
            Ok(placement) => placement,
            Err(e) => return OperationResult::failed(path, UNCLASSIFIED, started, &e),
        };
        let Some(bucket) = placement.bucket else {
            return OperationResult::skipped(path, SEARCH_MISS, started, "no query match");
        };

        let sidecars = self.sidecars_for(placement.record.as_ref());
        let planner = planner.clone().with_sidecars(sidecars);
        let plan = match planner.plan(&mut ctx.claims, path, &bucket) {
            Ok(plan) => plan,
            Err(e) => return OperationResult::failed(path, bucket.label(), started, &e),
        };
        ctx.log(SessionEvent::Planned { plan: plan.clone() });

        let outcome = executor::execute(&plan);
        let succeeded = outcome.is_ok();
        let mut result = OperationResult::from_plan(&plan, started, outcome);

        if succeeded {
            if let Some(record) = placement.record.as_ref().filter(|_| sidecars) {
                let text = sidecar::format(record, &plan.file_name);
                if let Err(e) = executor::write_sidecar(&plan, &text) {
                    result.sidecar = None;
                    ctx.warn(Some(path), format!("sidecar not written: {}", e));
                }
            }
        }
        result
    }

    /// Gather every image under `source` into `target`
    pub fn flatten(&self, source: &Path, target: &Path) -> Result<SessionSummary> {
        if target.exists() && !target.is_dir() {
            return Err(SorterError::Config(format!("target {:?} is not a directory", target)));
        }
        let same_dir = same_path(source, target);
        let mut exclude = vec![self.config.log_dir()];
        if !same_dir {
            exclude.push(target.to_path_buf());
        }
        let files: Vec<PathBuf> = scanner::scan_nested(source, &self.config, &exclude)?
            .into_iter()
            .filter(|p| !p.parent().map(|parent| same_path(parent, target)).unwrap_or(false))
            .collect();

        let run_id = Self::new_run_id();
        let log = self.open_log(RunKind::Flatten, &run_id, source, Some(target))?;
        let mut ctx = RunContext::new(RunKind::Flatten, Some(log), run_id, self);
        info!("Flattening {} file(s) from {:?} into {:?}", files.len(), source, target);

        let planner = PlacementPlanner::new(target, self.config.mode);
        let total = files.len();
        let mut moved = Vec::new();
        for (i, path) in files.iter().enumerate() {
            if ctx.should_stop() {
                break;
            }
            let started = Started::now();
            let result = match planner.plan_into(&mut ctx.claims, path, target, "flattened") {
                Ok(plan) => {
                    ctx.log(SessionEvent::Planned { plan: plan.clone() });
                    let outcome = executor::execute(&plan);
                    OperationResult::from_plan(&plan, started, outcome)
                }
                Err(e) => OperationResult::failed(path, "flattened", started, &e),
            };
            if result.is_success() && result.operation == Some(OperationKind::Move) {
                moved.push(path.clone());
            }
            ctx.record(result);
            ctx.report(i + 1, total, path);
        }

        if self.config.mode == OperationKind::Move && self.config.flatten.cleanup_empty_dirs && !ctx.summary.cancelled {
            let keep = [target.to_path_buf(), self.config.log_dir()];
            let removed = executor::remove_emptied_dirs(source, &moved, &keep);
            info!("Removed {} emptied director(ies)", removed.len());
            ctx.summary.directories_removed = removed.len();
        }

        Ok(ctx.finish())
    }

    /// Extract and normalize one file and render its report
    pub fn inspect(&self, path: &Path) -> Result<Inspection> {
        if !path.is_file() {
            return Err(SorterError::Config(format!("{:?} is not a file", path)));
        }
        let image = metadata::extract(path)?;
        let normalized = Normalizer::new(&self.config.model).normalize(&image.metadata);
        let bucket = self.model_bucket(normalized.record.as_ref());
        let report = normalized
            .record
            .as_ref()
            .map(|record| sidecar::format(record, &image.file_name()));
        Ok(Inspection {
            path: path.to_path_buf(),
            format: image.format_tag(),
            record: normalized.record,
            warnings: normalized.warnings,
            bucket,
            report,
        })
    }

    /// Strip generator noise from file names under `dir`
    pub fn cleanup(&self, dir: &Path, options: &CleanupOptions) -> Result<SessionSummary> {
        if !dir.is_dir() {
            return Err(SorterError::Config(format!("{:?} is not a directory", dir)));
        }
        let log_dir = self.config.log_dir();
        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let files: Vec<PathBuf> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !same_path(e.path(), &log_dir))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && scanner::is_settled(e.path()))
            .map(|e| e.into_path())
            .collect();

        let run_id = Self::new_run_id();
        let log = if options.dry_run {
            None
        } else {
            Some(self.open_log(RunKind::Cleanup, &run_id, dir, None)?)
        };
        let mut ctx = RunContext::new(RunKind::Cleanup, log, run_id, self);
        info!(
            "{}Cleaning up {} file(s) in {:?}",
            if options.dry_run { "[DRY RUN] " } else { "" },
            files.len(),
            dir
        );

        let mut planner = PlacementPlanner::new(dir, OperationKind::Move);
        if options.dry_run {
            planner = planner.preview();
        }
        let total = files.len();
        for (i, path) in files.iter().enumerate() {
            if ctx.should_stop() {
                break;
            }
            let started = Started::now();
            let result = self.cleanup_one(&mut ctx, &planner, path, options, started);
            ctx.record(result);
            ctx.report(i + 1, total, path);
        }
        Ok(ctx.finish())
    }

    fn cleanup_one(
        &self,
        ctx: &mut RunContext,
        planner: &PlacementPlanner,
        path: &Path,
        options: &CleanupOptions,
        started: Started,
    ) -> OperationResult {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if options.remove_metadata_files && cleanup::is_stale_metadata(&name) {
            if options.dry_run {
                return OperationResult::skipped(path, "metadata-removed", started, "dry run: would remove");
            }
            return match std::fs::remove_file(path) {
                Ok(()) => OperationResult::removed(path, "metadata-removed", started),
                Err(e) => OperationResult::failed(path, "metadata-removed", started, &SorterError::io(path, e)),
            };
        }

        if !self.config.is_image(path) || !cleanup::needs_cleanup(&name) {
            return OperationResult::skipped(path, "unchanged", started, "name already clean");
        }
        let cleaned = cleanup::clean_file_name(&name, &options.prefix);
        if cleaned == name {
            return OperationResult::skipped(path, "unchanged", started, "name already clean");
        }

        let dir = path.parent().unwrap_or(Path::new("."));
        let plan = match planner.plan_named(&mut ctx.claims, path, dir, &cleaned, "renamed") {
            Ok(plan) => plan,
            Err(e) => return OperationResult::failed(path, "renamed", started, &e),
        };
        if options.dry_run {
            let mut result = OperationResult::from_plan(&plan, started, Ok(()));
            result.status = OperationStatus::Skipped {
                reason: format!("dry run: would rename to {}", plan.file_name),
            };
            return result;
        }
        ctx.log(SessionEvent::Planned { plan: plan.clone() });
        let outcome = executor::rename_in_place(path, &plan.destination());
        OperationResult::from_plan(&plan, started, outcome)
    }
}

/// Top-level bucket segments for a detected base model
pub fn base_model_bucket(base: &BaseModel, grouping: ModelGrouping) -> Bucket {
    match (grouping, &base.family) {
        (ModelGrouping::Checkpoint, _) => Bucket::new([base.name.as_str()]),
        (ModelGrouping::Family, Some(family)) => Bucket::new([family.as_str()]),
        (ModelGrouping::Family, None) => Bucket::new(["Other", base.name.as_str()]),
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::metadata::extract::tests::write_png;
    use crate::query::{MatchMode, QueryField};
    use crate::session;
    use std::fs;

    const PONY_GRAPH: &str = r#"{
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "ponyDiffusionV6XL.safetensors"}},
        "10": {"class_type": "LoraLoader", "inputs": {"lora_name": "styleB.safetensors", "strength_model": 1.0}},
        "11": {"class_type": "LoraLoader", "inputs": {"lora_name": "styleA_v2.safetensors", "strength_model": 0.7}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "anime style pony art"}},
        "3": {"class_type": "KSampler", "inputs": {"steps": 30, "cfg": 7, "positive": ["6", 0]}}
    }"#;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("in")).unwrap();
            Self { dir }
        }

        fn source(&self) -> PathBuf {
            self.dir.path().join("in")
        }

        fn output(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn config(&self) -> SortConfig {
            SortConfig {
                log_dir: self.dir.path().join("logs").to_string_lossy().into_owned(),
                ..SortConfig::default()
            }
        }
    }

    #[test]
    fn test_sort_by_model_with_unreadable_file_mid_batch() {
        let fx = Fixture::new();
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[("prompt", PONY_GRAPH)]);
        fs::write(fx.source().join("b.png"), b"\x89PNG\r\n\x1a\ngarbage").unwrap();
        write_png(&fx.source().join("c.png"), [10, 10, 10], 4, &[]);

        let engine = Engine::new(fx.config()).unwrap();
        let summary = engine.sort(&fx.source(), &fx.output(), SortMode::ByModel).unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].kind, ErrorKind::UnreadableImage);
        assert_eq!(summary.failures[0].source, fx.source().join("b.png"));

        assert!(fx.output().join("Pony").join("a.png").exists());
        assert!(fx.output().join("Pony").join("a.txt").exists());
        // No metadata: unclassified, and no sidecar to write
        assert!(fx.output().join(UNCLASSIFIED).join("c.png").exists());
        assert!(!fx.output().join(UNCLASSIFIED).join("c.txt").exists());
        // Copy mode leaves sources; the unreadable file is untouched
        assert!(fx.source().join("a.png").exists());
        assert!(fx.source().join("b.png").exists());

        let logs = session::list_logs(&fx.dir.path().join("logs")).unwrap();
        assert_eq!(logs.len(), 1);
        let events = session::read_all(&logs[0]).unwrap();
        assert!(matches!(events[0], SessionEvent::RunStarted { .. }));
        assert_eq!(session::summary_of(&events).unwrap().failed, 1);
    }

    #[test]
    fn test_key_conflict_is_reported_as_warning() {
        let fx = Fixture::new();
        let params = r#"{"Model": "illustriousXL_v01", "model": "ponyDiffusionV6XL", "Steps": "30"}"#;
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[("parameters", params)]);

        let engine = Engine::new(fx.config()).unwrap();
        let summary = engine.sort(&fx.source(), &fx.output(), SortMode::ByModel).unwrap();

        assert_eq!(summary.succeeded, 1);
        assert!(fx.output().join("Illustrious").join("a.png").exists());
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("kept 'Model'"));

        let logs = session::list_logs(&fx.dir.path().join("logs")).unwrap();
        let events = session::read_all(&logs[0]).unwrap();
        let warnings: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Warning { path, message, .. } => Some((path.clone(), message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0.as_deref(), Some(fx.source().join("a.png").as_path()));
        assert!(warnings[0].1.contains("'model'"));
        assert_eq!(session::summary_of(&events).unwrap().warnings.len(), 1);
    }

    #[test]
    fn test_inspect_reports_without_touching_files() {
        let fx = Fixture::new();
        let path = fx.source().join("a.png");
        write_png(&path, [200, 50, 50], 4, &[("prompt", PONY_GRAPH)]);
        let plain = fx.source().join("plain.png");
        write_png(&plain, [10, 10, 10], 4, &[]);

        let engine = Engine::new(fx.config()).unwrap();
        let inspection = engine.inspect(&path).unwrap();
        assert_eq!(inspection.format, "png");
        assert_eq!(inspection.bucket.label(), "Pony");
        assert!(inspection.warnings.is_empty());
        let record = inspection.record.unwrap();
        assert_eq!(record.base_model.unwrap().family.as_deref(), Some("Pony"));
        let report = inspection.report.unwrap();
        assert!(report.contains("File: a.png"));
        assert!(report.contains("anime style pony art"));

        let inspection = engine.inspect(&plain).unwrap();
        assert!(inspection.record.is_none());
        assert!(inspection.report.is_none());
        assert_eq!(inspection.bucket.label(), UNCLASSIFIED);

        assert!(engine.inspect(&fx.source()).is_err());
        assert!(!fx.output().exists());
        assert!(!fx.dir.path().join("logs").exists());
    }

    #[test]
    fn test_group_by_lora_signature() {
        let fx = Fixture::new();
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[("prompt", PONY_GRAPH)]);
        write_png(&fx.source().join("b.png"), [200, 50, 50], 4, &[("parameters", "a cat\nSteps: 20, Model: fluxDev")]);

        let config = SortConfig {
            group_by_lora: true,
            mode: OperationKind::Move,
            ..fx.config()
        };
        let summary = Engine::new(config)
            .unwrap()
            .sort(&fx.source(), &fx.output(), SortMode::ByModel)
            .unwrap();

        assert_eq!(summary.succeeded, 2);
        assert!(fx.output().join("Pony").join("styleA+styleB").join("a.png").exists());
        assert!(fx.output().join("Flux").join(NO_LORAS).join("b.png").exists());
        assert!(!fx.source().join("a.png").exists());
    }

    #[test]
    fn test_duplicate_names_across_runs_never_overwrite() {
        let fx = Fixture::new();
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[("prompt", PONY_GRAPH)]);
        let engine = Engine::new(fx.config()).unwrap();

        engine.sort(&fx.source(), &fx.output(), SortMode::ByModel).unwrap();
        let summary = engine.sort(&fx.source(), &fx.output(), SortMode::ByModel).unwrap();

        assert_eq!(summary.duplicates_renamed, 1);
        assert!(fx.output().join("Pony").join("a.png").exists());
        assert!(fx.output().join("Pony").join("a_1.png").exists());
        assert!(fx.output().join("Pony").join("a_1.txt").exists());
    }

    #[test]
    fn test_sort_by_color() {
        let fx = Fixture::new();
        write_png(&fx.source().join("black.png"), [0, 0, 0], 10, &[]);
        write_png(&fx.source().join("blue.png"), [20, 20, 230], 10, &[]);

        let summary = Engine::new(fx.config())
            .unwrap()
            .sort(&fx.source(), &fx.output(), SortMode::ByColor)
            .unwrap();
        assert_eq!(summary.succeeded, 2);
        assert!(fx.output().join("dark").join("black.png").exists());
        assert!(fx.output().join("blue").join("blue.png").exists());
        assert_eq!(summary.bucket_counts["dark"], 1);
    }

    #[test]
    fn test_search_places_hits_and_skips_misses() {
        let fx = Fixture::new();
        write_png(&fx.source().join("hit.png"), [200, 50, 50], 4, &[("prompt", PONY_GRAPH)]);
        write_png(&fx.source().join("miss.png"), [200, 50, 50], 4, &[("parameters", "a cat\nSteps: 20")]);
        write_png(&fx.source().join("bare.png"), [200, 50, 50], 4, &[]);

        let mut config = fx.config();
        config.search.spec = Some(QuerySpec::new(["styleA", "styleB"], MatchMode::Exact).with_field(QueryField::Lora));
        let summary = Engine::new(config)
            .unwrap()
            .sort(&fx.source(), &fx.output(), SortMode::Search)
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 2);
        assert!(fx.output().join("search-hit").join("hit.png").exists());
        assert!(!fx.output().join("search-hit").join("miss.png").exists());
    }

    #[test]
    fn test_empty_search_query_fails_before_any_change() {
        let fx = Fixture::new();
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[]);
        let mut config = fx.config();
        config.search.spec = Some(QuerySpec::new(Vec::<String>::new(), MatchMode::Any));

        let err = Engine::new(config)
            .unwrap()
            .sort(&fx.source(), &fx.output(), SortMode::Search)
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!fx.output().exists());
        assert!(!fx.dir.path().join("logs").exists());
    }

    #[test]
    fn test_preview_touches_nothing() {
        let fx = Fixture::new();
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[("prompt", PONY_GRAPH)]);
        write_png(&fx.source().join("b.png"), [200, 50, 50], 4, &[]);

        let preview = Engine::new(fx.config())
            .unwrap()
            .preview(&fx.source(), &fx.output(), SortMode::ByModel)
            .unwrap();
        assert_eq!(preview.plans.len(), 2);
        assert_eq!(preview.summary.succeeded, 2);
        assert_eq!(preview.plans[0].destination(), fx.output().join("Pony").join("a.png"));
        assert_eq!(preview.plans[0].sidecar, Some(fx.output().join("Pony").join("a.txt")));
        assert_eq!(preview.plans[1].sidecar, None);
        assert!(!fx.output().exists());
        assert!(!fx.dir.path().join("logs").exists());
    }

    #[test]
    fn test_cancelled_run_processes_nothing_more() {
        let fx = Fixture::new();
        write_png(&fx.source().join("a.png"), [200, 50, 50], 4, &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = Engine::new(fx.config())
            .unwrap()
            .with_cancellation(cancel)
            .sort(&fx.source(), &fx.output(), SortMode::ByModel)
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.total, 0);
    }

    #[test]
    fn test_flatten_with_cleanup() {
        let fx = Fixture::new();
        let root = fx.source();
        fs::create_dir_all(root.join("a").join("nested")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        write_png(&root.join("a").join("nested").join("x.png"), [1, 2, 3], 2, &[]);
        write_png(&root.join("b").join("y.png"), [4, 5, 6], 2, &[]);

        let config = SortConfig {
            mode: OperationKind::Move,
            ..fx.config()
        };
        let summary = Engine::new(config).unwrap().flatten(&root, &root).unwrap();

        assert_eq!(summary.succeeded, 2);
        assert!(root.join("x.png").exists());
        assert!(root.join("y.png").exists());
        assert!(!root.join("a").exists());
        assert!(!root.join("b").exists());
        assert_eq!(summary.directories_removed, 3);
    }

    #[test]
    fn test_flatten_cleanup_spares_untouched_dirs() {
        let fx = Fixture::new();
        let root = fx.source();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::create_dir_all(root.join("keep_me_empty")).unwrap();
        fs::create_dir_all(root.join(".git").join("refs").join("tags")).unwrap();
        fs::create_dir_all(root.join("b").join("deeper")).unwrap();
        write_png(&root.join("a").join("x.png"), [1, 2, 3], 2, &[]);
        write_png(&root.join("b").join("x.png"), [4, 5, 6], 2, &[]);

        let config = SortConfig {
            mode: OperationKind::Move,
            ..fx.config()
        };
        let summary = Engine::new(config).unwrap().flatten(&root, &root).unwrap();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.duplicates_renamed, 1);
        assert!(root.join("x.png").exists());
        assert!(root.join("x_1.png").exists());
        assert!(!root.join("a").exists());
        assert!(root.join("b").join("deeper").exists());
        assert!(root.join("keep_me_empty").exists());
        assert!(root.join(".git").join("refs").join("tags").exists());
        assert_eq!(summary.directories_removed, 1);
    }

    #[test]
    fn test_flatten_copy_keeps_tree() {
        let fx = Fixture::new();
        let root = fx.source();
        fs::create_dir_all(root.join("a")).unwrap();
        write_png(&root.join("a").join("x.png"), [1, 2, 3], 2, &[]);
        let target = fx.dir.path().join("flat");

        let summary = Engine::new(fx.config()).unwrap().flatten(&root, &target).unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(target.join("x.png").exists());
        assert!(root.join("a").join("x.png").exists());
        assert_eq!(summary.directories_removed, 0);
    }

    #[test]
    fn test_cleanup_renames_and_removes_metadata() {
        let fx = Fixture::new();
        let dir = fx.source();
        fs::write(dir.join("[workflow_test_batch1] Gen 3 cat.png"), b"x").unwrap();
        fs::write(dir.join("cat.png"), b"existing").unwrap();
        fs::write(dir.join("cat_metadata.json"), b"{}").unwrap();

        let engine = Engine::new(fx.config()).unwrap();
        let dry = engine
            .cleanup(&dir, &CleanupOptions { dry_run: true, ..CleanupOptions::default() })
            .unwrap();
        assert_eq!(dry.skipped, 3);
        assert!(dir.join("cat_metadata.json").exists());

        let summary = engine.cleanup(&dir, &CleanupOptions::default()).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded, 2);
        assert!(dir.join("cat_1.png").exists());
        assert_eq!(fs::read(dir.join("cat.png")).unwrap(), b"existing");
        assert!(!dir.join("cat_metadata.json").exists());
    }

    #[test]
    fn test_base_model_bucket() {
        let known = BaseModel {
            family: Some("Pony".to_string()),
            name: "ponyV6".to_string(),
        };
        let unknown = BaseModel {
            family: None,
            name: "dreamshaper_8".to_string(),
        };
        assert_eq!(base_model_bucket(&known, ModelGrouping::Family).to_string(), "Pony");
        assert_eq!(base_model_bucket(&unknown, ModelGrouping::Family).to_string(), "Other/dreamshaper_8");
        assert_eq!(base_model_bucket(&known, ModelGrouping::Checkpoint).to_string(), "ponyV6");
    }
}
