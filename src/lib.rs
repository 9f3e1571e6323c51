//! jobspawn - elastic worker-process pool for file-analysis jobs.
//!
//! Submitted file paths are fanned out to a bounded pool of worker
//! subprocesses, and each successful result can be piped into a second,
//! single-worker post-processing stage. The pool self-heals after worker
//! crashes, supports live reload of worker configuration, applies admission
//! backpressure, and drains cleanly on shutdown.
//!
//! The processing logic itself is external: the embedding application
//! registers named tasks in a [`registry::TaskRegistry`], and jobs reference
//! them by `(module, function)` pairs.

pub mod error;
pub mod logging;
pub mod registry;
pub mod spawner;

pub use error::{Result, SpawnError};
