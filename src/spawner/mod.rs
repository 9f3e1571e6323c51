//! Worker-process orchestration: the job spawner core.
//!
//! This module manages two pipelines of worker subprocesses: a primary pool
//! of configurable size processing submitted files, and an optional
//! single-worker post-processing stage fed by primary results.
//!
//! # Architecture
//!
//! ```text
//!   submitters ──► intake queue
//!                      │ admission (max in flight)
//!                      ▼
//!               ┌─────────────┐        ┌──────────────┐
//!               │ Orchestrator │──────►│ primary pool │ N workers
//!               │ control loop │◄──────│  (processes) │
//!               └──────┬──────┘ results└──────────────┘
//!                      │ successes
//!                      ▼
//!               ┌──────────────┐
//!               │  post pool   │ 0..1 workers
//!               └──────────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: each worker has its own memory space; a bad job
//!   can at worst kill one worker
//! - **Crash recovery**: dead workers are reaped and respawned each tick
//! - **Elastic sizing**: pools shrink via terminate sentinels and grow via
//!   respawn until the live count matches the target
//! - **Live reload**: every worker is replaced without stopping the loop or
//!   losing queued work

mod ipc;
mod pipeline;
mod proc;
mod protocol;
mod spawn;

pub mod job;
pub mod orchestrator;
pub mod signals;
pub mod status;
pub mod worker_main;

pub use job::{Job, JobId, JobMeta, Outcome, Submission};
pub use orchestrator::{SpawnerConfig, SpawnerHandle, spawn};
pub use signals::{ShutdownFlag, install_signal_handlers};
pub use spawn::WorkerCommand;
pub use status::{ErrorLevel, ProcessingState, SpawnerState, SpawnerStats};
pub use worker_main::run_worker;
