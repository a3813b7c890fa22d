//! Background job runner for the stringloom engine.
//!
//! The engine itself is sans-IO and synchronous; this crate provides
//! the small asynchronous contract external collaborators (an HTTP
//! server, a UI) invoke it through: start a generation on a background
//! thread, receive periodic progress snapshots over a channel, cancel,
//! and fetch the result.
//!
//! Each job owns its state exclusively for the duration of one run;
//! the handle is the only way to observe it. The progress receiver
//! observes a strict prefix of the final connection log with a
//! monotone thread counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::JoinHandle;

use log::debug;
use stringloom_engine::{
    CancelFlag, EngineError, GenerationParams, GenerationResult, ProgressSnapshot,
};

static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

fn next_job_id() -> String {
    format!("job-{:08x}", NEXT_JOB.fetch_add(1, Ordering::Relaxed))
}

/// Handle to one running generation job.
///
/// Dropping the handle without [`join`](Self::join)ing detaches the
/// worker; it runs to completion and its result is discarded.
pub struct JobHandle {
    id: String,
    cancel: CancelFlag,
    progress: Receiver<ProgressSnapshot>,
    worker: JoinHandle<Result<GenerationResult, EngineError>>,
}

impl JobHandle {
    /// Opaque job identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Request cancellation. The engine polls the flag between threads
    /// and resolves the job with [`EngineError::Cancelled`]; partial
    /// state is discarded.
    pub fn cancel(&self) {
        debug!("job {}: cancellation requested", self.id);
        self.cancel.cancel();
    }

    /// Drain every progress snapshot currently queued, without
    /// blocking.
    pub fn drain_progress(&self) -> Vec<ProgressSnapshot> {
        let mut out = Vec::new();
        loop {
            match self.progress.try_recv() {
                Ok(snap) => out.push(snap),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Borrow the raw progress receiver for blocking consumption.
    #[must_use]
    pub fn progress(&self) -> &Receiver<ProgressSnapshot> {
        &self.progress
    }

    /// Block until the job finishes and return its result.
    ///
    /// A cancelled job resolves to `Err(EngineError::Cancelled)` — a
    /// terminal state, not an input failure.
    ///
    /// # Errors
    ///
    /// Whatever the engine resolved with; see [`EngineError`].
    ///
    /// # Panics
    ///
    /// Re-raises a panic from the worker thread.
    pub fn join(self) -> Result<GenerationResult, EngineError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Start a generation job on a background thread.
///
/// `image_bytes` and `params` are moved into the worker; progress
/// snapshots arrive on the handle's channel at least every
/// `max_threads / 100` threads.
#[must_use]
pub fn spawn(image_bytes: Vec<u8>, params: GenerationParams) -> JobHandle {
    let id = next_job_id();
    let cancel = CancelFlag::new();
    let (tx, rx) = mpsc::channel();

    let worker_cancel = cancel.clone();
    let worker_id = id.clone();
    let worker = std::thread::spawn(move || {
        debug!("job {worker_id}: started");
        let sink = move |snap: ProgressSnapshot| {
            // A departed receiver is not an error: the job simply runs
            // unobserved.
            let _ = tx.send(snap);
        };
        stringloom_engine::generate_with(&image_bytes, &params, None, &sink, &worker_cancel)
    });

    JobHandle {
        id,
        cancel,
        progress: rx,
        worker,
    }
}

/// Start a continue-from-result job on a background thread.
#[must_use]
pub fn spawn_continue(previous: GenerationResult, additional: u32) -> JobHandle {
    let id = next_job_id();
    let cancel = CancelFlag::new();
    let (tx, rx) = mpsc::channel();

    let worker_cancel = cancel.clone();
    let worker_id = id.clone();
    let worker = std::thread::spawn(move || {
        debug!("job {worker_id}: continuing by {additional} threads");
        let sink = move |snap: ProgressSnapshot| {
            let _ = tx.send(snap);
        };
        stringloom_engine::continue_generation_with(
            &previous,
            additional,
            None,
            &sink,
            &worker_cancel,
        )
    });

    JobHandle {
        id,
        cancel,
        progress: rx,
        worker,
    }
}
