// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Sorter Undo Utility
//!
//! Reverses the file operations recorded in a session log.

use clap::Parser;
use std::path::PathBuf;

use sorter::session::undo::{self, UndoAction};
use sorter::session::{self, SessionEvent};
use sorter::SortConfig;

#[derive(Parser, Debug)]
#[command(name = "sorter-undo")]
#[command(version)]
#[command(about = "Undo a Sorter run from its session log")]
struct Args {
    /// Session log to undo (default: the newest one in the log directory)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Configuration file, used to locate the log directory
    #[arg(long, default_value = "sorter.json")]
    config: PathBuf,

    /// Number of operations to undo (default: 0, all of them)
    #[arg(short, long, default_value = "0")]
    count: usize,

    /// Dry run - show what would be undone without doing it
    #[arg(long)]
    dry_run: bool,

    /// List the operations recorded in the session log
    #[arg(long)]
    list: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_target(false)
        .init();

    let log_path = match args.log {
        Some(path) => path,
        None => {
            let config = SortConfig::load(&args.config)?;
            match session::list_logs(&config.log_dir())?.into_iter().next() {
                Some(path) => path,
                None => {
                    println!("No session logs found in {:?}.", config.log_dir());
                    println!("Nothing to undo.");
                    return Ok(());
                }
            }
        }
    };

    if !log_path.exists() {
        eprintln!("Session log not found: {:?}", log_path);
        return Ok(());
    }

    let events = session::read_all(&log_path)?;
    let operations = undo::undoable(&events);

    if args.list {
        println!("Session {:?} ({} operation(s)):", log_path, operations.len());
        println!("{:-<80}", "");
        for (i, result) in operations.iter().enumerate() {
            let operation = result.operation.map(|o| o.to_string()).unwrap_or_default();
            let destination = result
                .destination
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_default();
            println!(
                "{:3}. [{}] {} {} -> {}",
                i + 1,
                result.started_at.format("%Y-%m-%d %H:%M:%S"),
                operation,
                result.source.display(),
                destination
            );
        }
        if undo::is_undone(&events) {
            println!("\nThis session has already been undone.");
        }
        return Ok(());
    }

    if operations.is_empty() {
        println!("No operations to undo.");
        return Ok(());
    }

    let report = undo::undo(&log_path, args.count, args.dry_run)?;

    println!(
        "{}Undoing {} operation(s) from {:?}...",
        if args.dry_run { "[DRY RUN] " } else { "" },
        report.actions.len(),
        log_path
    );

    let verb = |done: &'static str, would: &'static str| if args.dry_run { would } else { done };
    for action in &report.actions {
        match action {
            UndoAction::Restored { from, to } => {
                println!("  {}: {} -> {}", verb("Restored", "Would restore"), from.display(), to.display())
            }
            UndoAction::Deleted { path } => println!("  {}: {}", verb("Deleted", "Would delete"), path.display()),
            UndoAction::Skipped { path, reason } => eprintln!("  Skip: {} ({})", path.display(), reason),
            UndoAction::Failed { path, reason } => eprintln!("  Failed: {} ({})", path.display(), reason),
        }
    }

    println!();
    if args.dry_run {
        println!("Dry run complete. {} operation(s) would be undone.", report.reverted());
    } else {
        println!(
            "Done. {} undone, {} failed/skipped.",
            report.reverted(),
            report.skipped_or_failed()
        );
        if let Some(SessionEvent::RunStarted { run, .. }) = events.first() {
            println!("Reverted {} session {:?}.", run, log_path.file_name().unwrap_or_default());
        }
    }

    Ok(())
}
