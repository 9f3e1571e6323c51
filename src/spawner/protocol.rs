//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::{Job, JobId, Outcome};
use crate::registry::TargetRef;

/// Request from orchestrator to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Execute one job.
    #[serde(rename = "process")]
    Process {
        id: JobId,
        payload: Value,
        target: TargetRef,
        params: String,
    },

    /// Terminate sentinel: exit without reading further requests.
    #[serde(rename = "terminate")]
    Terminate,
}

/// Response from worker to orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker is idle and ready for the next request.
    #[serde(rename = "ready")]
    Ready,

    /// A job finished (successfully or not).
    #[serde(rename = "done")]
    Done { id: JobId, outcome: Outcome },
}

impl WorkRequest {
    /// Create a process request from a job descriptor.
    pub fn process(job: Job) -> Self {
        Self::Process {
            id: job.id,
            payload: job.payload,
            target: job.target,
            params: job.params,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkRequest serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    /// Create a completion response.
    pub fn done(id: JobId, outcome: Outcome) -> Self {
        Self::Done { id, outcome }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkResponse serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
