//! Worker subprocess spawning.
//!
//! Workers are the orchestrator binary re-executed in worker mode, with
//! stdin/stdout piped for the job protocol and stderr inherited so worker
//! logs land next to the orchestrator's.

use super::proc::WorkerHandle;
use crate::error::{Result, SpawnError};
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// The command line a pipeline uses to start its workers.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Re-execute the current binary in its hidden worker mode.
    ///
    /// This is the normal production configuration: the worker resolves jobs
    /// against the same registry the binary builds at startup.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| SpawnError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self {
            program,
            args: vec!["worker".to_string()],
        })
    }

    /// Use an explicit program and argument list.
    ///
    /// Lets tests and embedders point pipelines at a specific worker binary.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Spawn one worker subprocess.
///
/// Returns a [`WorkerHandle`] for communicating with the worker.
pub fn spawn_worker(cmd: &WorkerCommand) -> Result<WorkerHandle> {
    let child = Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit()) // Worker errors go to parent's stderr
        .spawn()
        .map_err(|e| SpawnError::Worker(format!("Failed to spawn worker: {}", e)))?;

    WorkerHandle::from_child(child)
}
