//! Progress reporting and cancellation primitives.
//!
//! The engine is sans-IO: it reports progress through a plain callback
//! (`&dyn Fn(ProgressSnapshot)`) and polls a shared [`CancelFlag`]
//! between threads. Channel or socket plumbing is the job layer's
//! concern.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::AccuracyMetrics;

/// One progress emission.
///
/// `current_thread` is monotone within a job, and the connection log it
/// describes is always a strict prefix of the final log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Threads placed so far.
    pub current_thread: u32,
    /// Planned total for this job.
    pub total_threads: u32,
    /// Human-readable phase label; also carries recovered-warning text
    /// (e.g. decode fallback notices).
    pub stage_label: String,
    /// PNG-encoded preview of the current canvas, when one was
    /// rendered for this snapshot.
    pub preview_png: Option<Vec<u8>>,
    /// Interim accuracy, when computed for this snapshot.
    pub accuracy: Option<AccuracyMetrics>,
}

/// Callback the engine reports progress through.
pub type ProgressFn<'a> = dyn Fn(ProgressSnapshot) + Sync + 'a;

/// A no-op progress sink for callers that only want the result.
pub fn sink_none(_: ProgressSnapshot) {}

/// Shared cancellation flag, polled by the driver between threads.
///
/// Cloning shares the flag. Observing `true` makes the engine abandon
/// the job and resolve with [`crate::EngineError::Cancelled`]; partial
/// state is discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_flag_is_unset() {
        assert!(!CancelFlag::new().is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let flag = CancelFlag::new();
        let shared = flag.clone();
        flag.cancel();
        assert!(shared.is_cancelled());
    }

    #[test]
    fn snapshot_serde_round_trip() {
        let snap = ProgressSnapshot {
            current_thread: 42,
            total_threads: 1000,
            stage_label: "structure".to_owned(),
            preview_png: Some(vec![1, 2, 3]),
            accuracy: None,
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: ProgressSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snap, back);
    }
}
