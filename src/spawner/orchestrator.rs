//! The control loop coordinating submission, both pipelines, reload, and
//! shutdown.
//!
//! All mutable orchestration state (pending sets, job counter, pools) is
//! owned by the loop thread; handles interact through the intake queue, the
//! runtime settings, a handful of flags, and the published status cell, so
//! none of the loop state needs locking.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};

use super::job::{IntakeQueue, Job, JobId, JobMeta, Outcome, Submission};
use super::pipeline::Pipeline;
use super::signals::ShutdownFlag;
use super::spawn::WorkerCommand;
use super::status::{ProcessingState, SpawnerState, SpawnerStats, StatusCell};
use crate::error::{Result, SpawnError};
use crate::logging::SeverityTracker;
use crate::registry::builtin;

/// Orchestrator configuration, consumed at spawn time.
///
/// The metadata triples and the worker count can be changed later through
/// the handle; everything else is fixed for the orchestrator's lifetime.
#[derive(Clone)]
pub struct SpawnerConfig {
    /// Primary pool target size.
    pub workers: usize,
    /// Admission bound: jobs in flight in the primary pipeline.
    pub max_in_flight: usize,
    /// Default metadata for submissions that carry none.
    pub default_meta: JobMeta,
    /// Post-processing metadata; post-processing runs iff this names a
    /// module and a function.
    pub post_meta: JobMeta,
    /// Sleep between idle control-loop ticks.
    pub poll_interval: Duration,
    /// Grace period per worker during shutdown before signal escalation.
    pub shutdown_timeout: Duration,
    /// How to start workers; `None` re-executes the current binary in
    /// worker mode.
    pub worker_cmd: Option<WorkerCommand>,
    /// Severity tracker backing the error half of `state()`. Attach the
    /// same tracker to the logging subscriber, or error classification
    /// stays at `None`.
    pub severity: Arc<SeverityTracker>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_in_flight: 6,
            default_meta: JobMeta::new(builtin::MODULE, "noop", ""),
            post_meta: JobMeta::default(),
            poll_interval: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(5),
            worker_cmd: None,
            severity: SeverityTracker::new(),
        }
    }
}

/// Settings the handle may change while the orchestrator runs.
///
/// Re-read by the loop every tick; changes affect future admissions and the
/// next reconciliation, never jobs already in flight.
struct RuntimeSettings {
    workers: usize,
    default_meta: JobMeta,
    post_meta: JobMeta,
}

/// State shared between the loop thread and handles.
struct Shared {
    intake: IntakeQueue,
    settings: Mutex<RuntimeSettings>,
    reload: AtomicBool,
    shutdown: ShutdownFlag,
    status: StatusCell,
    severity: Arc<SeverityTracker>,
}

/// Thread-safe interface to a running orchestrator.
///
/// Cloneable; submissions are fire-and-forget. Failures of individual jobs
/// are observable only through the aggregate error state.
#[derive(Clone)]
pub struct SpawnerHandle {
    shared: Arc<Shared>,
}

impl SpawnerHandle {
    /// Submit a work item using the configured default metadata.
    pub fn submit(&self, path: impl Into<String>) {
        self.shared.intake.push(Submission::new(path));
    }

    /// Submit a work item, overriding any subset of the metadata fields.
    pub fn submit_with(&self, submission: Submission) {
        self.shared.intake.push(submission);
    }

    /// Ask the loop to replace every live worker on its next tick, so code
    /// or configuration changes take effect. Does not block; repeated calls
    /// before the next tick coalesce into one replacement.
    pub fn request_reload(&self) {
        self.shared.reload.store(true, Ordering::SeqCst);
    }

    /// Request a graceful drain and shutdown.
    pub fn stop(&self) {
        self.shared.shutdown.trigger();
    }

    /// The shutdown token, for wiring to process signals.
    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shared.shutdown
    }

    /// Non-blocking snapshot of the processing/error state.
    pub fn state(&self) -> SpawnerState {
        SpawnerState {
            processing: self.shared.status.processing(),
            error: self.shared.severity.worst().into(),
        }
    }

    /// Pool and queue counters as of the last tick.
    pub fn stats(&self) -> SpawnerStats {
        self.shared.status.stats()
    }

    /// Number of buffered warn/error events since the last reset.
    pub fn error_count(&self) -> usize {
        self.shared.severity.count()
    }

    /// Return the `n`-th buffered warn/error event, oldest first.
    pub fn peek_error(&self, n: usize) -> Option<String> {
        self.shared.severity.peek(n)
    }

    /// Clear the error buffer and severity classification.
    pub fn reset_errors(&self) {
        self.shared.severity.reset();
    }

    /// Change the primary pool target size; the pool converges over the
    /// following ticks.
    pub fn set_workers(&self, workers: usize) {
        self.lock_settings().workers = workers;
    }

    /// Change the default metadata applied to future submissions.
    pub fn set_default_meta(&self, meta: JobMeta) {
        self.lock_settings().default_meta = meta;
    }

    /// Change the post-processing metadata. Setting a triple without a
    /// module or function disables post-processing; the post worker drains
    /// on the next tick.
    pub fn set_post_meta(&self, meta: JobMeta) {
        self.lock_settings().post_meta = meta;
    }

    fn lock_settings(&self) -> std::sync::MutexGuard<'_, RuntimeSettings> {
        self.shared.settings.lock().expect("settings poisoned")
    }
}

/// Start an orchestrator on its own control thread.
///
/// Returns the handle plus the loop's join handle. The loop runs until
/// [`SpawnerHandle::stop`] (or the shutdown token) fires and the pipelines
/// drain, or until every handle is dropped.
pub fn spawn(config: SpawnerConfig) -> Result<(SpawnerHandle, thread::JoinHandle<Result<()>>)> {
    if config.max_in_flight == 0 {
        return Err(SpawnError::Config("max-in-flight must be at least 1".into()));
    }

    let worker_cmd = match config.worker_cmd.clone() {
        Some(cmd) => cmd,
        None => WorkerCommand::current_exe()?,
    };

    let shared = Arc::new(Shared {
        intake: IntakeQueue::new(),
        settings: Mutex::new(RuntimeSettings {
            workers: config.workers,
            default_meta: config.default_meta.clone(),
            post_meta: config.post_meta.clone(),
        }),
        reload: AtomicBool::new(false),
        shutdown: ShutdownFlag::new(),
        status: StatusCell::new(),
        severity: Arc::clone(&config.severity),
    });

    let handle = SpawnerHandle {
        shared: Arc::clone(&shared),
    };

    let mut orchestrator = Orchestrator {
        shared,
        primary: Pipeline::new("primary", worker_cmd.clone()),
        post: Pipeline::new("post", worker_cmd),
        pending_primary: HashSet::new(),
        pending_post: HashSet::new(),
        orphaned: HashSet::new(),
        next_job_id: 0,
        max_in_flight: config.max_in_flight,
        poll_interval: config.poll_interval,
        shutdown_timeout: config.shutdown_timeout,
    };

    // Carry the caller's subscriber into the control thread so loop events
    // reach the same sinks (and the same severity tracker) as the caller's.
    let dispatch = tracing::dispatcher::get_default(|d| d.clone());

    let join = thread::Builder::new()
        .name("spawner-control".to_string())
        .spawn(move || {
            let _dispatch_guard = tracing::dispatcher::set_default(&dispatch);
            // A failure of the control loop itself is fatal to the service;
            // convert panics into an error the embedder can observe.
            match catch_unwind(AssertUnwindSafe(|| orchestrator.run())) {
                Ok(result) => result,
                Err(_) => {
                    error!("Unexpected panic in the control loop");
                    Err(SpawnError::Orchestrator(
                        "control loop panicked".to_string(),
                    ))
                }
            }
        })
        .map_err(|e| SpawnError::Orchestrator(format!("Failed to start control thread: {}", e)))?;

    Ok((handle, join))
}

/// Loop-owned orchestration state.
struct Orchestrator {
    shared: Arc<Shared>,
    primary: Pipeline,
    post: Pipeline,
    pending_primary: HashSet<JobId>,
    pending_post: HashSet<JobId>,
    /// Jobs lost to worker crashes. Their ids stay in the pending sets (and
    /// keep the state at RUNNING), but the shutdown gate skips them so a
    /// crash cannot wedge the drain.
    orphaned: HashSet<JobId>,
    next_job_id: u64,
    max_in_flight: usize,
    poll_interval: Duration,
    shutdown_timeout: Duration,
}

impl Orchestrator {
    fn run(&mut self) -> Result<()> {
        info!("Started work spawner control loop");

        loop {
            let mut progressed = false;

            let (workers, default_meta, post_meta) = {
                let settings = self.shared.settings.lock().expect("settings poisoned");
                (
                    settings.workers,
                    settings.default_meta.clone(),
                    settings.post_meta.clone(),
                )
            };

            // Reload: replace every live worker through the sentinel path
            // and start the error accounting afresh.
            if self.shared.reload.swap(false, Ordering::SeqCst) {
                info!("Reload requested; replacing all workers");
                let n = self.primary.live_count();
                self.primary.enqueue_terminates(n);
                let n = self.post.live_count();
                self.post.enqueue_terminates(n);
                self.shared.severity.reset();
                progressed = true;
            }

            // Admission control: the sole backpressure mechanism. The
            // intake queue is unbounded; the primary pending set never
            // exceeds max_in_flight.
            while self.pending_primary.len() < self.max_in_flight {
                let Some(submission) = self.shared.intake.pop() else {
                    break;
                };
                let id = JobId(self.next_job_id);
                self.next_job_id += 1;
                let job = submission.into_job(id, &default_meta);
                debug!(job_id = %id, target = %job.target, "Admitted job");
                self.pending_primary.insert(id);
                self.primary.enqueue(job);
                progressed = true;
            }

            // Primary pool reconciliation
            self.primary.set_target(workers);
            let reaped = self.primary.reap();
            progressed |= !reaped.lost.is_empty() || !reaped.results.is_empty();
            self.orphaned.extend(reaped.lost.iter().copied());
            self.primary.reconcile();
            self.primary.dispatch();

            // Post pool reconciliation: the pool exists only while a post
            // triple is configured.
            self.post
                .set_target(if post_meta.is_configured() { 1 } else { 0 });
            if !post_meta.is_configured() {
                for id in self.post.drain_queued_jobs() {
                    error!(job_id = %id, "Post-processing disabled; dropping queued post job");
                    self.orphaned.insert(id);
                }
            }
            let post_reaped = self.post.reap();
            progressed |= !post_reaped.lost.is_empty() || !post_reaped.results.is_empty();
            self.orphaned.extend(post_reaped.lost.iter().copied());
            self.post.reconcile();
            self.post.dispatch();

            // Harvest primary results, chaining successes into post
            let results = reaped
                .results
                .into_iter()
                .chain(self.primary.poll());
            for (id, outcome) in results {
                self.handle_primary_result(id, outcome, &post_meta);
                progressed = true;
            }

            // Harvest post results (no further chaining)
            let post_results = post_reaped
                .results
                .into_iter()
                .chain(self.post.poll());
            for (id, outcome) in post_results {
                self.handle_post_result(id, outcome);
                progressed = true;
            }

            self.publish_status();

            // Shutdown: stop requested (or nobody left holding a handle)
            // and everything recoverable has drained.
            let stop_requested = self.shared.shutdown.is_triggered()
                || Arc::strong_count(&self.shared) == 1;
            if stop_requested && self.drained() {
                break;
            }

            if !progressed {
                thread::sleep(self.poll_interval);
            }
        }

        info!("Stopping worker pools");
        self.primary.shutdown(self.shutdown_timeout);
        self.post.shutdown(self.shutdown_timeout);
        self.publish_status();
        info!("Work spawner control loop stopped");
        Ok(())
    }

    fn handle_primary_result(&mut self, id: JobId, outcome: Outcome, post_meta: &JobMeta) {
        if !self.pending_primary.remove(&id) {
            error!(job_id = %id, "Got result for unexpected job");
            return;
        }

        match outcome {
            Outcome::Failed => {
                error!(job_id = %id, "Job failed");
            }
            Outcome::Completed(value) => {
                info!(job_id = %id, "Job returned");
                if post_meta.is_configured() {
                    let job = Job {
                        id,
                        payload: value,
                        target: post_meta.target(),
                        params: post_meta.params.clone(),
                    };
                    self.pending_post.insert(id);
                    self.post.enqueue(job);
                }
            }
        }
    }

    fn handle_post_result(&mut self, id: JobId, outcome: Outcome) {
        if !self.pending_post.remove(&id) {
            error!(job_id = %id, "Got post-processing result for unexpected job");
            return;
        }

        if outcome.is_failure() {
            error!(job_id = %id, "Post-processing of job completed with errors");
        } else {
            info!(job_id = %id, "Post-processing of job completed successfully");
        }
    }

    fn publish_status(&self) {
        let idle = self.shared.intake.is_empty()
            && self.pending_primary.is_empty()
            && self.pending_post.is_empty();
        let processing = if idle {
            ProcessingState::Standby
        } else {
            ProcessingState::Running
        };

        self.shared.status.publish(
            processing,
            SpawnerStats {
                primary_workers: self.primary.live_count() as u64,
                post_workers: self.post.live_count() as u64,
                pending_primary: self.pending_primary.len() as u64,
                pending_post: self.pending_post.len() as u64,
                intake_depth: self.shared.intake.len() as u64,
                total_spawned: self.primary.total_spawned() + self.post.total_spawned(),
            },
        );
    }

    /// Whether every recoverable piece of work has finished.
    ///
    /// Jobs orphaned by worker crashes are excluded: they will never
    /// complete, and waiting for them would make shutdown unreachable.
    fn drained(&self) -> bool {
        self.shared.intake.is_empty()
            && self.pending_primary.is_subset(&self.orphaned)
            && self.pending_post.is_subset(&self.orphaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SpawnerConfig::default();
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_in_flight, 6);
        assert_eq!(config.default_meta.target(), builtin::default_target());
        assert!(!config.post_meta.is_configured());
        assert!(config.worker_cmd.is_none());
    }

    #[test]
    fn test_spawn_rejects_zero_max_in_flight() {
        let config = SpawnerConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(matches!(spawn(config), Err(SpawnError::Config(_))));
    }

    #[test]
    fn test_handle_state_before_first_tick() {
        // With zero workers and nothing submitted the loop idles at STANDBY.
        let config = SpawnerConfig {
            workers: 0,
            poll_interval: Duration::from_millis(10),
            // a bogus worker command is fine: nothing gets spawned
            worker_cmd: Some(WorkerCommand::new("/bin/false", vec![])),
            ..Default::default()
        };
        let (handle, join) = spawn(config).unwrap();

        thread::sleep(Duration::from_millis(50));
        let state = handle.state();
        assert_eq!(state.processing, ProcessingState::Standby);
        assert_eq!(handle.stats().primary_workers, 0);

        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_loop_exits_when_all_handles_dropped() {
        let config = SpawnerConfig {
            workers: 0,
            poll_interval: Duration::from_millis(10),
            worker_cmd: Some(WorkerCommand::new("/bin/false", vec![])),
            ..Default::default()
        };
        let (handle, join) = spawn(config).unwrap();
        drop(handle);
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_runtime_settings_updates() {
        let config = SpawnerConfig {
            workers: 0,
            poll_interval: Duration::from_millis(10),
            worker_cmd: Some(WorkerCommand::new("/bin/false", vec![])),
            ..Default::default()
        };
        let (handle, join) = spawn(config).unwrap();

        handle.set_default_meta(JobMeta::new("analysis", "integrate", "x"));
        handle.set_post_meta(JobMeta::new("analysis", "present", ""));
        handle.set_workers(0);

        handle.stop();
        join.join().unwrap().unwrap();
    }
}
