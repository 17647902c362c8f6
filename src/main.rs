// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Sorter: generation-metadata image sorter
//!
//! Command-line front end. All sorting logic lives in the library; this
//! binary only builds a configuration, runs the engine on a blocking worker
//! and reports progress and results.

use clap::{Parser, Subcommand, ValueEnum};
use std::io;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{debug, info, warn};

use sorter::cleanup::CleanupOptions;
use sorter::config::{ModelGrouping, OperationKind, SortConfig};
use sorter::engine::{Engine, Inspection, Preview, SortMode};
use sorter::executor::OperationStatus;
use sorter::progress::{self, CancellationToken, ProgressEvent};
use sorter::query::{MatchMode, QueryField, QuerySpec};
use sorter::session::{self, SessionSummary};
use sorter::Result;

/// Sorter CLI - sort generated images by model, LoRA stack, prompt or color
#[derive(Parser, Debug)]
#[command(name = "sorter")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Sort generated images into folders by their generation metadata", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "sorter.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Output format for run summaries
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write the run's failures to this CSV file
    #[arg(long, global = true)]
    failures_csv: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sort images from a source directory into an output tree
    Sort {
        /// Directory holding the images
        source: PathBuf,

        /// Root of the sorted tree
        output: PathBuf,

        /// Sorting strategy
        #[arg(short, long, value_enum, default_value = "model")]
        by: SortBy,

        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        query: QueryArgs,

        /// Show the plan without touching any file
        #[arg(long)]
        dry_run: bool,
    },

    /// Gather every image of a nested tree into one directory
    Flatten {
        /// Tree to flatten
        source: PathBuf,

        /// Destination directory (default: the source itself)
        #[arg(short, long)]
        target: Option<PathBuf>,

        /// Move instead of copy
        #[arg(long = "move")]
        move_files: bool,

        /// Keep directories emptied by a move
        #[arg(long)]
        keep_empty_dirs: bool,
    },

    /// Strip generator workflow noise from file names
    Cleanup {
        /// Directory to clean
        dir: PathBuf,

        /// Keep `*_metadata.json` files
        #[arg(long)]
        keep_metadata: bool,

        /// Name used when nothing is left of a file name
        #[arg(long, default_value = "image")]
        prefix: String,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Show what would change without renaming
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the metadata, bucket and report Sorter derives for one image
    Inspect {
        /// Image file
        file: PathBuf,
    },

    /// List recent session logs
    Sessions {
        /// Number of sessions to show
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "sorter.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SortBy {
    Model,
    Checkpoint,
    Color,
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MatchArg {
    Any,
    All,
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FieldArg {
    All,
    Model,
    Lora,
    Prompt,
    Negative,
    Settings,
}

/// Overrides applied on top of the configuration file
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Move instead of copy
    #[arg(long = "move")]
    move_files: bool,

    /// Add a LoRA-stack subdirectory under each bucket
    #[arg(long)]
    group_by_lora: bool,

    /// Descend into subdirectories of the source
    #[arg(short, long)]
    recursive: bool,

    /// Do not write `.txt` metadata sidecars
    #[arg(long)]
    no_sidecars: bool,
}

#[derive(clap::Args, Debug)]
struct QueryArgs {
    /// Search term (repeatable)
    #[arg(short = 't', long = "term")]
    terms: Vec<String>,

    /// How terms combine
    #[arg(long = "match", value_enum, default_value = "any")]
    match_mode: MatchArg,

    /// Field the terms are matched against
    #[arg(long, value_enum, default_value = "all")]
    field: FieldArg,

    /// Match case exactly
    #[arg(long)]
    case_sensitive: bool,

    /// Treat terms as regular expressions
    #[arg(long)]
    regex: bool,

    /// Put each hit under the first term it matched
    #[arg(long)]
    per_term: bool,
}

impl QueryArgs {
    fn to_spec(&self) -> Option<QuerySpec> {
        if self.terms.is_empty() {
            return None;
        }
        let mode = match self.match_mode {
            MatchArg::Any => MatchMode::Any,
            MatchArg::All => MatchMode::All,
            MatchArg::Exact => MatchMode::Exact,
        };
        let field = match self.field {
            FieldArg::All => QueryField::All,
            FieldArg::Model => QueryField::Model,
            FieldArg::Lora => QueryField::Lora,
            FieldArg::Prompt => QueryField::Prompt,
            FieldArg::Negative => QueryField::Negative,
            FieldArg::Settings => QueryField::Settings,
        };
        Some(
            QuerySpec::new(self.terms.iter().cloned(), mode)
                .with_field(field)
                .with_case_sensitive(self.case_sensitive)
                .with_regex(self.regex),
        )
    }
}

/// Fold command-line overrides into the loaded configuration
fn apply_overrides(config: &mut SortConfig, by: SortBy, run: &RunArgs, query: &QueryArgs) {
    if run.move_files {
        config.mode = OperationKind::Move;
    }
    if run.group_by_lora {
        config.group_by_lora = true;
    }
    if run.recursive {
        config.recursive = true;
    }
    if run.no_sidecars {
        config.write_metadata_sidecars = false;
    }
    if by == SortBy::Checkpoint {
        config.model.grouping = ModelGrouping::Checkpoint;
    }
    if let Some(spec) = query.to_spec() {
        config.search.spec = Some(spec);
    }
    if query.per_term {
        config.search.subfolder_per_term = true;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = SortConfig::load(&cli.config)?;
    let json = cli.format == "json";

    match cli.command {
        Commands::Sort {
            source,
            output,
            by,
            run,
            query,
            dry_run,
        } => {
            apply_overrides(&mut config, by, &run, &query);
            let mode = match by {
                SortBy::Model | SortBy::Checkpoint => SortMode::ByModel,
                SortBy::Color => SortMode::ByColor,
                SortBy::Search => SortMode::Search,
            };
            if dry_run {
                let preview = run_worker(config, cli.quiet, move |engine| {
                    engine.preview(&source, &output, mode)
                })
                .await?;
                print_preview(&preview, json)
            } else {
                let summary = run_worker(config, cli.quiet, move |engine| {
                    engine.sort(&source, &output, mode)
                })
                .await?;
                finish_run(&summary, json, cli.failures_csv.as_deref())
            }
        }
        Commands::Flatten {
            source,
            target,
            move_files,
            keep_empty_dirs,
        } => {
            if move_files {
                config.mode = OperationKind::Move;
            }
            if keep_empty_dirs {
                config.flatten.cleanup_empty_dirs = false;
            }
            let target = target.unwrap_or_else(|| source.clone());
            let summary = run_worker(config, cli.quiet, move |engine| engine.flatten(&source, &target)).await?;
            finish_run(&summary, json, cli.failures_csv.as_deref())
        }
        Commands::Cleanup {
            dir,
            keep_metadata,
            prefix,
            recursive,
            dry_run,
        } => {
            if recursive {
                config.recursive = true;
            }
            let options = CleanupOptions {
                remove_metadata_files: !keep_metadata,
                prefix,
                dry_run,
            };
            let summary = run_worker(config, cli.quiet, move |engine| engine.cleanup(&dir, &options)).await?;
            finish_run(&summary, json, cli.failures_csv.as_deref())
        }
        Commands::Inspect { file } => {
            let inspection = Engine::new(config)?.inspect(&file)?;
            print_inspection(&inspection, json)
        }
        Commands::Sessions { count } => list_sessions(&config.log_dir(), count, json),
        Commands::Config { action } => run_config_command(config, action, &cli.config),
    }
}

/// Run one engine call on a blocking worker, with progress and Ctrl+C wired up
async fn run_worker<T, F>(config: SortConfig, quiet: bool, job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Engine) -> Result<T> + Send + 'static,
{
    let (progress_tx, mut progress_rx) = progress::channel(config.progress_capacity);
    let cancel = CancellationToken::new();
    let engine = Engine::new(config)?
        .with_progress(progress_tx)
        .with_cancellation(cancel.clone());

    // Setup graceful shutdown: finish the current file, then stop
    let shutdown = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current file");
            shutdown.cancel();
        }
    });

    let observer = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            report_progress(&event, quiet);
        }
    });

    let outcome = tokio::task::spawn_blocking(move || job(&engine))
        .await
        .map_err(io::Error::from)?;

    ctrl_c.abort();
    // The engine (and with it the sender) is gone, so the observer drains and ends
    if let Err(e) = observer.await {
        debug!("Progress observer ended abnormally: {}", e);
    }
    outcome
}

fn report_progress(event: &ProgressEvent, quiet: bool) {
    if quiet {
        return;
    }
    debug!("[{}/{}] {}", event.index, event.total, event.file_name);
    if event.index == event.total || event.index % 100 == 0 {
        info!("Processed {}/{} file(s)", event.index, event.total);
    }
}

fn finish_run(summary: &SessionSummary, json: bool, failures_csv: Option<&Path>) -> Result<()> {
    if let Some(path) = failures_csv {
        session::write_failures_csv(summary, path)?;
        info!("Wrote {} failure(s) to {:?}", summary.failures.len(), path);
    }
    print_summary(summary, json)
}

fn print_summary(summary: &SessionSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!();
    println!("{} complete{}", capitalize(&summary.run.to_string()), if summary.cancelled { " (cancelled)" } else { "" });
    println!("  Files:      {}", summary.total);
    println!("  Succeeded:  {}", summary.succeeded);
    println!("  Skipped:    {}", summary.skipped);
    println!("  Failed:     {}", summary.failed);
    if summary.duplicates_renamed > 0 {
        println!("  Renamed to avoid collisions: {}", summary.duplicates_renamed);
    }
    if summary.directories_removed > 0 {
        println!("  Empty directories removed:   {}", summary.directories_removed);
    }
    println!("  Elapsed:    {:.1}s", summary.elapsed_ms as f64 / 1000.0);

    if !summary.bucket_counts.is_empty() {
        println!("\nBuckets:");
        for (bucket, count) in &summary.bucket_counts {
            println!("  {:<24} {}", bucket, count);
        }
    }
    if !summary.failures.is_empty() {
        println!("\nFailures:");
        for failure in &summary.failures {
            println!("  [{}] {}: {}", failure.kind, failure.source.display(), failure.message);
        }
    }
    if !summary.warnings.is_empty() {
        println!("\nWarnings: {}", summary.warnings.len());
        for warning in summary.warnings.iter().take(20) {
            println!("  {}", warning);
        }
    }
    if summary.progress_dropped > 0 {
        debug!("{} progress event(s) dropped", summary.progress_dropped);
    }
    Ok(())
}

fn print_preview(preview: &Preview, json: bool) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "plans": preview.plans,
            "unplaced": preview.results,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("[DRY RUN] {} file(s) would be placed:", preview.plans.len());
    for plan in &preview.plans {
        println!(
            "  {} {} -> {}{}",
            plan.operation,
            plan.source.display(),
            plan.destination().display(),
            if plan.renamed { " (renamed)" } else { "" }
        );
    }
    if !preview.results.is_empty() {
        println!("\nNot placed:");
        for result in &preview.results {
            let reason = match &result.status {
                OperationStatus::Skipped { reason } => reason.clone(),
                OperationStatus::Failed { kind, message } => format!("{}: {}", kind, message),
                OperationStatus::Succeeded => continue,
            };
            println!("  {} ({})", result.source.display(), reason);
        }
    }
    Ok(())
}

fn print_inspection(inspection: &Inspection, json: bool) -> Result<()> {
    if json {
        let output = serde_json::json!({
            "file": inspection.path,
            "format": inspection.format,
            "bucket": inspection.bucket.to_string(),
            "record": inspection.record,
            "warnings": inspection.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} ({})", inspection.path.display(), inspection.format);
    println!("  Bucket: {}", inspection.bucket);
    for warning in &inspection.warnings {
        println!("  Warning: {}", warning);
    }
    match &inspection.report {
        Some(report) => println!("\n{}", report),
        None => println!("\nNo generation metadata found."),
    }
    Ok(())
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Show recent runs from their session logs
fn list_sessions(log_dir: &Path, count: usize, json: bool) -> Result<()> {
    let logs = session::list_logs(log_dir)?;
    if logs.is_empty() {
        println!("No session logs in {:?}", log_dir);
        return Ok(());
    }

    let mut rows = Vec::new();
    for path in logs.iter().take(count) {
        let events = session::read_all(path)?;
        let summary = session::summary_of(&events).cloned();
        let undone = session::undo::is_undone(&events);
        rows.push((path.clone(), summary, undone));
    }

    if json {
        let output: Vec<_> = rows
            .iter()
            .map(|(path, summary, undone)| {
                serde_json::json!({ "log": path, "summary": summary, "undone": undone })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Recent sessions ({} of {}):", rows.len(), logs.len());
    for (path, summary, undone) in &rows {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        match summary {
            Some(s) => println!(
                "  {} {:<16} {} ok, {} skipped, {} failed{}",
                name,
                s.run.to_string(),
                s.succeeded,
                s.skipped,
                s.failed,
                if *undone { " [undone]" } else { "" }
            ),
            None => println!("  {} (unfinished)", name),
        }
    }
    Ok(())
}

/// Run config commands
fn run_config_command(config: SortConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output } => {
            SortConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Mode: {}", config.mode);
            println!("  Model families: {}", config.model.families.len());
            println!("  Log directory: {}", config.log_dir);
        }
    }
    Ok(())
}
