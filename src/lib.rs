// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Sorter: generation-metadata image sorter
//!
//! Reorganizes collections of generated images by the model, LoRA stack,
//! prompt text or dominant color recorded in (or derived from) each file.
//! Files are never overwritten and never lost: copies commit before a move
//! deletes its source, and every run leaves a session log that can be undone.

pub mod cleanup;
pub mod color;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod planner;
pub mod progress;
pub mod query;
pub mod scanner;
pub mod session;

pub use config::SortConfig;
pub use engine::{Engine, SortMode};
pub use error::{Result, SorterError};
