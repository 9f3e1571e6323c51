//! Task registry: named, statically-typed processing callables.
//!
//! Jobs carry a [`TargetRef`] naming the callable a worker should apply to
//! the payload. The embedding application populates a [`TaskRegistry`] at
//! startup; workers resolve targets against their own copy of the registry
//! (each worker process rebuilds it, since workers re-exec the same binary).
//!
//! A registry entry is a *builder* producing a boxed [`Task`]. Builders may
//! fail, and stateful tasks are constructed once per worker and cached, so a
//! task can hold per-worker state (open handles, lazily-built lookup tables)
//! across jobs.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Names a registry entry: a `(module, function)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub module: String,
    pub function: String,
}

impl TargetRef {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}", self.function)
        } else {
            write!(f, "{}::{}", self.module, self.function)
        }
    }
}

/// Error raised by task resolution, construction, or invocation.
///
/// Deliberately carries only a message: submitters have no per-job error
/// channel, so nothing downstream can consume structured detail.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TaskError(pub String);

impl TaskError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Result of one task invocation.
pub type TaskResult = std::result::Result<Value, TaskError>;

/// A processing callable, invoked at most once per job from a worker process.
///
/// `params` is the free-form parameter string carried by the job (empty when
/// the submitter supplied none).
pub trait Task {
    fn run(&mut self, payload: &Value, params: &str) -> TaskResult;
}

/// Wraps a stateless function as a [`Task`].
struct FnTask(fn(&Value, &str) -> TaskResult);

impl Task for FnTask {
    fn run(&mut self, payload: &Value, params: &str) -> TaskResult {
        (self.0)(payload, params)
    }
}

type TaskBuilder = Box<dyn Fn() -> Result<Box<dyn Task>, TaskError> + Send + Sync>;

/// Maps [`TargetRef`]s to task builders.
#[derive(Default)]
pub struct TaskRegistry {
    entries: HashMap<TargetRef, TaskBuilder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder for a stateful task. The builder runs once per
    /// worker (on first use) and its result is cached; construction failure
    /// surfaces as a resolution failure for the job that triggered it.
    pub fn register<F>(&mut self, module: &str, function: &str, builder: F)
    where
        F: Fn() -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        self.entries
            .insert(TargetRef::new(module, function), Box::new(builder));
    }

    /// Register a stateless function.
    pub fn register_fn(&mut self, module: &str, function: &str, f: fn(&Value, &str) -> TaskResult) {
        self.register(module, function, move || Ok(Box::new(FnTask(f)) as Box<dyn Task>));
    }

    /// Construct the task for `target`.
    ///
    /// Fails when the target is unknown or its builder fails.
    pub fn resolve(&self, target: &TargetRef) -> Result<Box<dyn Task>, TaskError> {
        match self.entries.get(target) {
            Some(builder) => builder(),
            None => Err(TaskError::new(format!("no task registered for '{}'", target))),
        }
    }

    pub fn contains(&self, target: &TargetRef) -> bool {
        self.entries.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Built-in tasks bundled with the standalone binary.
///
/// `noop` is the default target when a submission names none; the rest are
/// small demo/diagnostic callables used by the examples and the integration
/// tests.
pub mod builtin {
    use super::*;
    use std::io::Write;

    /// Module name the built-ins are registered under.
    pub const MODULE: &str = "builtin";

    /// Register every built-in task.
    pub fn register_all(registry: &mut TaskRegistry) {
        registry.register_fn(MODULE, "noop", noop);
        registry.register_fn(MODULE, "upper", upper);
        registry.register_fn(MODULE, "stat", stat);
        registry.register_fn(MODULE, "append", append);
        registry.register_fn(MODULE, "sleep", sleep);
        registry.register_fn(MODULE, "fail", fail);
        registry.register_fn(MODULE, "crash", crash);
    }

    /// The default target when nothing is configured.
    pub fn default_target() -> TargetRef {
        TargetRef::new(MODULE, "noop")
    }

    fn payload_str<'a>(payload: &'a Value) -> Result<&'a str, TaskError> {
        payload
            .as_str()
            .ok_or_else(|| TaskError::new("payload is not a string"))
    }

    /// Default action: log that no task is configured and drop the file.
    fn noop(payload: &Value, _params: &str) -> TaskResult {
        tracing::error!(payload = %payload, "No task configured. File will be ignored.");
        Ok(Value::Null)
    }

    /// Uppercase the payload string.
    fn upper(payload: &Value, _params: &str) -> TaskResult {
        Ok(Value::String(payload_str(payload)?.to_uppercase()))
    }

    /// Report the size of the file named by the payload.
    fn stat(payload: &Value, _params: &str) -> TaskResult {
        let path = payload_str(payload)?;
        let meta = std::fs::metadata(path)?;
        Ok(serde_json::json!({ "path": path, "bytes": meta.len() }))
    }

    /// Append the payload string as one line to the file named by `params`.
    fn append(payload: &Value, params: &str) -> TaskResult {
        if params.is_empty() {
            return Err(TaskError::new("append requires a target path in params"));
        }
        let text = payload_str(payload)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(params)?;
        writeln!(file, "{}", text)?;
        Ok(payload.clone())
    }

    /// Sleep for `params` milliseconds, then return the payload unchanged.
    fn sleep(payload: &Value, params: &str) -> TaskResult {
        let millis: u64 = params
            .parse()
            .map_err(|_| TaskError::new(format!("invalid sleep duration '{}'", params)))?;
        std::thread::sleep(std::time::Duration::from_millis(millis));
        Ok(payload.clone())
    }

    /// Always fails. Exercises the failure path end to end.
    fn fail(_payload: &Value, _params: &str) -> TaskResult {
        Err(TaskError::new("task configured to fail"))
    }

    /// Kill the worker process outright. Exercises crash recovery.
    fn crash(_payload: &Value, _params: &str) -> TaskResult {
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        builtin::register_all(&mut registry);
        registry
    }

    #[test]
    fn test_target_ref_display() {
        let t = TargetRef::new("builtin", "upper");
        assert_eq!(t.to_string(), "builtin::upper");

        let bare = TargetRef::new("", "process");
        assert_eq!(bare.to_string(), "process");
    }

    #[test]
    fn test_resolve_unknown_target() {
        let registry = sample_registry();
        let err = registry
            .resolve(&TargetRef::new("nope", "missing"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("no task registered"));
        assert!(err.to_string().contains("nope::missing"));
    }

    #[test]
    fn test_upper_task() {
        let registry = sample_registry();
        let mut task = registry
            .resolve(&TargetRef::new("builtin", "upper"))
            .unwrap();
        let out = task.run(&Value::String("spectrum.h5".into()), "").unwrap();
        assert_eq!(out, Value::String("SPECTRUM.H5".into()));
    }

    #[test]
    fn test_upper_task_rejects_non_string() {
        let registry = sample_registry();
        let mut task = registry
            .resolve(&TargetRef::new("builtin", "upper"))
            .unwrap();
        assert!(task.run(&serde_json::json!(42), "").is_err());
    }

    #[test]
    fn test_fail_task() {
        let registry = sample_registry();
        let mut task = registry
            .resolve(&TargetRef::new("builtin", "fail"))
            .unwrap();
        assert!(task.run(&Value::String("x".into()), "").is_err());
    }

    #[test]
    fn test_append_task() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results.txt");
        let out_str = out.to_str().unwrap();

        let registry = sample_registry();
        let mut task = registry
            .resolve(&TargetRef::new("builtin", "append"))
            .unwrap();
        task.run(&Value::String("a".into()), out_str).unwrap();
        task.run(&Value::String("b".into()), out_str).unwrap();

        let contents = std::fs::read_to_string(&out).unwrap();
        assert_eq!(contents, "a\nb\n");
    }

    #[test]
    fn test_append_requires_params() {
        let registry = sample_registry();
        let mut task = registry
            .resolve(&TargetRef::new("builtin", "append"))
            .unwrap();
        assert!(task.run(&Value::String("a".into()), "").is_err());
    }

    #[test]
    fn test_stateful_builder_runs_per_resolve() {
        struct Counter(u64);
        impl Task for Counter {
            fn run(&mut self, _payload: &Value, _params: &str) -> TaskResult {
                self.0 += 1;
                Ok(serde_json::json!(self.0))
            }
        }

        let mut registry = TaskRegistry::new();
        registry.register("demo", "counter", || Ok(Box::new(Counter(0)) as Box<dyn Task>));

        let mut task = registry.resolve(&TargetRef::new("demo", "counter")).unwrap();
        assert_eq!(task.run(&Value::Null, "").unwrap(), serde_json::json!(1));
        assert_eq!(task.run(&Value::Null, "").unwrap(), serde_json::json!(2));

        // A fresh resolve builds a fresh instance
        let mut again = registry.resolve(&TargetRef::new("demo", "counter")).unwrap();
        assert_eq!(again.run(&Value::Null, "").unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_failing_builder_surfaces_as_resolution_error() {
        let mut registry = TaskRegistry::new();
        registry.register("demo", "broken", || {
            Err(TaskError::new("constructor exploded"))
        });

        let err = registry
            .resolve(&TargetRef::new("demo", "broken"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("constructor exploded"));
    }
}
