//! Derived, read-only orchestrator state.
//!
//! The control loop publishes into an atomic cell once per tick; handles
//! read it without locks and without touching loop-owned state.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use tracing::Level;

/// Whether the system currently holds any work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    /// No submissions waiting and nothing in flight.
    Standby,
    /// Intake queue or a pending set is non-empty.
    Running,
}

/// Worst log severity observed since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    None,
    Warn,
    Error,
}

impl From<Option<Level>> for ErrorLevel {
    fn from(level: Option<Level>) -> Self {
        match level {
            Some(Level::ERROR) => Self::Error,
            Some(Level::WARN) => Self::Warn,
            _ => Self::None,
        }
    }
}

/// Snapshot returned by `SpawnerHandle::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnerState {
    pub processing: ProcessingState,
    pub error: ErrorLevel,
}

/// Pool and queue counters, published once per control-loop tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnerStats {
    /// Live workers in the primary pool (includes workers draining a sentinel).
    pub primary_workers: u64,
    /// Live workers in the post-processing pool.
    pub post_workers: u64,
    /// Jobs admitted but not yet completed in the primary pipeline.
    pub pending_primary: u64,
    /// Jobs chained into post-processing and not yet completed.
    pub pending_post: u64,
    /// Submissions waiting for admission.
    pub intake_depth: u64,
    /// Worker processes spawned over the orchestrator's lifetime.
    pub total_spawned: u64,
}

/// Lock-free mailbox between the control loop and state readers.
#[derive(Default)]
pub(crate) struct StatusCell {
    running: AtomicU8,
    primary_workers: AtomicU64,
    post_workers: AtomicU64,
    pending_primary: AtomicU64,
    pending_post: AtomicU64,
    intake_depth: AtomicU64,
    total_spawned: AtomicU64,
}

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, processing: ProcessingState, stats: SpawnerStats) {
        self.running.store(
            matches!(processing, ProcessingState::Running) as u8,
            Ordering::Relaxed,
        );
        self.primary_workers
            .store(stats.primary_workers, Ordering::Relaxed);
        self.post_workers.store(stats.post_workers, Ordering::Relaxed);
        self.pending_primary
            .store(stats.pending_primary, Ordering::Relaxed);
        self.pending_post.store(stats.pending_post, Ordering::Relaxed);
        self.intake_depth.store(stats.intake_depth, Ordering::Relaxed);
        self.total_spawned
            .store(stats.total_spawned, Ordering::Relaxed);
    }

    pub fn processing(&self) -> ProcessingState {
        if self.running.load(Ordering::Relaxed) != 0 {
            ProcessingState::Running
        } else {
            ProcessingState::Standby
        }
    }

    pub fn stats(&self) -> SpawnerStats {
        SpawnerStats {
            primary_workers: self.primary_workers.load(Ordering::Relaxed),
            post_workers: self.post_workers.load(Ordering::Relaxed),
            pending_primary: self.pending_primary.load(Ordering::Relaxed),
            pending_post: self.pending_post.load(Ordering::Relaxed),
            intake_depth: self.intake_depth.load(Ordering::Relaxed),
            total_spawned: self.total_spawned.load(Ordering::Relaxed),
        }
    }
}
