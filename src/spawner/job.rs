//! Job descriptors and submission intake.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::TargetRef;

/// Identifies one submitted job.
///
/// Assigned from a monotonically increasing counter at admission; never
/// reused within a process lifetime. A job chained into post-processing
/// keeps the id of the primary job that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of work: a target reference plus a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Filename for primary jobs; the primary result value for post jobs.
    pub payload: Value,
    pub target: TargetRef,
    pub params: String,
}

/// What a worker produced for a job.
///
/// `Failed` deliberately carries no detail: submitters have no per-job error
/// channel, only the aggregate error state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Completed(Value),
    Failed,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// A `(module, function, params)` metadata triple.
///
/// Used both as the default backfill for partial submissions and as the
/// post-processing configuration (post-processing exists iff the post triple
/// names a module and a function).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobMeta {
    pub module: String,
    pub function: String,
    pub params: String,
}

impl JobMeta {
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        params: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            params: params.into(),
        }
    }

    /// Whether the triple names a callable (module and function non-empty).
    pub fn is_configured(&self) -> bool {
        !self.module.is_empty() && !self.function.is_empty()
    }

    pub fn target(&self) -> TargetRef {
        TargetRef::new(self.module.clone(), self.function.clone())
    }
}

/// An externally submitted work item, possibly with partial metadata.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub path: String,
    pub module: Option<String>,
    pub function: Option<String>,
    pub params: Option<String>,
}

impl Submission {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Turn the submission into a job, backfilling missing metadata fields
    /// from `defaults`. Runs at admission time, so submissions still waiting
    /// in the intake queue observe later changes to the defaults.
    pub fn into_job(self, id: JobId, defaults: &JobMeta) -> Job {
        let module = self.module.unwrap_or_else(|| defaults.module.clone());
        let function = self.function.unwrap_or_else(|| defaults.function.clone());
        let params = self.params.unwrap_or_else(|| defaults.params.clone());
        Job {
            id,
            payload: Value::String(self.path),
            target: TargetRef::new(module, function),
            params,
        }
    }
}

/// Unbounded, thread-safe FIFO absorbing burst submissions.
///
/// The only backpressure is downstream: the control loop never admits more
/// than `max_in_flight` jobs out of this queue at a time.
#[derive(Default)]
pub struct IntakeQueue {
    items: Mutex<VecDeque<Submission>>,
}

impl IntakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, submission: Submission) {
        self.items
            .lock()
            .expect("intake queue poisoned")
            .push_back(submission);
    }

    pub fn pop(&self) -> Option<Submission> {
        self.items.lock().expect("intake queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("intake queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
