// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Progress reporting and cooperative cancellation
//!
//! The worker never waits on its observer: progress goes through a bounded
//! channel with `try_send`, and events that do not fit are dropped and
//! counted.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared cancellation flag; every clone observes `cancel()`
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// One processed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// 1-based position in the run
    pub index: usize,
    pub total: usize,
    pub file_name: String,
}

/// Sending half held by the engine
#[derive(Debug, Clone, Default)]
pub struct ProgressSender {
    tx: Option<mpsc::Sender<ProgressEvent>>,
    dropped: Arc<AtomicU64>,
}

impl ProgressSender {
    /// A sender that discards everything (library use without an observer)
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Report progress without blocking
    pub fn report(&self, index: usize, total: usize, file_name: impl Into<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = ProgressEvent {
            index,
            total,
            file_name: file_name.into(),
        };
        if tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events lost because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded progress channel
pub fn channel(capacity: usize) -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        ProgressSender {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_full_channel_drops_instead_of_blocking() {
        let (sender, mut rx) = channel(2);
        for i in 1..=5 {
            sender.report(i, 5, format!("{}.png", i));
        }
        assert_eq!(sender.dropped(), 3);

        assert_eq!(rx.try_recv().unwrap().index, 1);
        assert_eq!(rx.try_recv().unwrap().index, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disabled_sender() {
        let sender = ProgressSender::disabled();
        sender.report(1, 1, "a.png");
        assert_eq!(sender.dropped(), 0);
    }
}
