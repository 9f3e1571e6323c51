//! Worker pool management for one pipeline.
//!
//! A pipeline is a FIFO dispatch queue plus an elastic set of worker
//! subprocesses sharing it. The orchestrator calls the tick methods in
//! order: reap dead workers, reconcile the live count against the target,
//! dispatch queued work to idle workers, poll for results.
//!
//! Shrinking is indirect: a terminate sentinel is queued and kills whichever
//! worker reads it next. The target count therefore converges eventually
//! rather than instantaneously, and the accounting here nets out sentinels
//! already queued so repeated ticks do not overshoot.

#![allow(dead_code)] // Some counters are for monitoring

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::job::{Job, JobId, Outcome};
use super::proc::{RecvOutcome, WorkerHandle};
use super::protocol::{WorkRequest, WorkResponse};
use super::signals::analyze_wait_status;
use super::spawn::{WorkerCommand, spawn_worker};

/// An entry in the dispatch queue.
enum Dispatch {
    Job(Box<Job>),
    Terminate,
}

/// Lifecycle of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Spawned, waiting for its first Ready.
    Starting,
    /// Ready for a request.
    Idle,
    /// Executing the given job.
    Busy(JobId),
    /// Sentinel sent; the worker is on its way out.
    Stopping,
}

/// One worker subprocess attached to the pipeline.
struct WorkerSlot {
    id: usize,
    handle: WorkerHandle,
    state: SlotState,
    jobs_completed: usize,
}

/// What a reap pass found: results drained from dead workers' pipes, and
/// jobs that died with their worker.
#[derive(Default)]
pub struct ReapReport {
    pub results: Vec<(JobId, Outcome)>,
    pub lost: Vec<JobId>,
}

/// How many sentinels to queue so the pool shrinks to `target`, given what
/// is already in flight towards that goal.
fn sentinels_needed(live: usize, stopping: usize, queued: usize, target: usize) -> usize {
    live.saturating_sub(stopping)
        .saturating_sub(queued)
        .saturating_sub(target)
}

/// A managed pool of workers sharing one dispatch queue.
pub struct Pipeline {
    label: &'static str,
    cmd: WorkerCommand,
    target_size: usize,
    queue: VecDeque<Dispatch>,
    workers: Vec<WorkerSlot>,
    next_worker_id: usize,
    total_spawned: u64,
}

impl Pipeline {
    pub fn new(label: &'static str, cmd: WorkerCommand) -> Self {
        Self {
            label,
            cmd,
            target_size: 0,
            queue: VecDeque::new(),
            workers: Vec::new(),
            next_worker_id: 0,
            total_spawned: 0,
        }
    }

    /// Set the size the pool should converge to.
    pub fn set_target(&mut self, target: usize) {
        if target != self.target_size {
            info!(
                pipeline = self.label,
                from = self.target_size,
                to = target,
                "Pool target size changed"
            );
        }
        self.target_size = target;
    }

    pub fn target(&self) -> usize {
        self.target_size
    }

    /// Workers currently attached, including ones draining a sentinel.
    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker processes spawned over this pipeline's lifetime.
    pub fn total_spawned(&self) -> u64 {
        self.total_spawned
    }

    /// Queue a job for dispatch.
    pub fn enqueue(&mut self, job: Job) {
        self.queue.push_back(Dispatch::Job(Box::new(job)));
    }

    /// Queue `n` terminate sentinels.
    ///
    /// Each kills whichever worker reads it next; jobs queued behind a
    /// sentinel are dispatched to the remaining workers.
    pub fn enqueue_terminates(&mut self, n: usize) {
        for _ in 0..n {
            self.queue.push_back(Dispatch::Terminate);
        }
    }

    /// Remove every queued job (keeping sentinels), returning their ids.
    ///
    /// Used when post-processing is deconfigured: jobs already chained but
    /// not yet dispatched have no pool left to run on.
    pub fn drain_queued_jobs(&mut self) -> Vec<JobId> {
        let mut dropped = Vec::new();
        self.queue.retain(|d| match d {
            Dispatch::Job(job) => {
                dropped.push(job.id);
                false
            }
            Dispatch::Terminate => true,
        });
        dropped
    }

    fn queued_sentinels(&self) -> usize {
        self.queue
            .iter()
            .filter(|d| matches!(d, Dispatch::Terminate))
            .count()
    }

    fn stopping_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == SlotState::Stopping)
            .count()
    }

    /// Remove workers whose process has exited.
    ///
    /// A dead worker's pipe may still hold responses it wrote before dying;
    /// those are drained first so finished work is not mistaken for lost
    /// work. A job that was dispatched and produced no response is reported
    /// lost.
    pub fn reap(&mut self) -> ReapReport {
        let mut report = ReapReport::default();
        let label = self.label;

        self.workers.retain_mut(|slot| {
            let status = match slot.handle.try_wait() {
                Ok(None) => return true,
                Ok(Some(status)) => Some(status),
                Err(e) => {
                    warn!(pipeline = label, worker_id = slot.id, "Wait failed: {}", e);
                    None
                }
            };

            // Drain whatever the worker managed to write before exiting
            while let Ok(RecvOutcome::Message(msg)) = slot.handle.try_recv() {
                if let WorkResponse::Done { id, outcome } = msg {
                    if slot.state == SlotState::Busy(id) {
                        slot.state = SlotState::Idle;
                    }
                    report.results.push((id, outcome));
                }
            }

            match slot.state {
                SlotState::Busy(id) => {
                    report.lost.push(id);
                    error!(
                        pipeline = label,
                        worker_id = slot.id,
                        job_id = %id,
                        "Worker died holding a job; the job is lost"
                    );
                }
                SlotState::Stopping => {
                    info!(pipeline = label, worker_id = slot.id, "Worker terminated");
                }
                _ => {}
            }

            if let Some(status) = status {
                let reason = analyze_wait_status(status);
                if reason.is_clean_exit() {
                    debug!(pipeline = label, worker_id = slot.id, "Reaped worker");
                } else {
                    warn!(
                        pipeline = label,
                        worker_id = slot.id,
                        reason = %reason,
                        "Worker died unexpectedly"
                    );
                }
            }

            false
        });

        report
    }

    /// Converge the live worker count towards the target: queue sentinels
    /// for the excess, spawn replacements for the shortfall.
    pub fn reconcile(&mut self) {
        let excess = sentinels_needed(
            self.live_count(),
            self.stopping_count(),
            self.queued_sentinels(),
            self.target_size,
        );
        if excess > 0 {
            debug!(
                pipeline = self.label,
                excess, "Queueing terminate sentinels to shrink pool"
            );
            self.enqueue_terminates(excess);
        }

        while self.live_count() < self.target_size {
            match spawn_worker(&self.cmd) {
                Ok(handle) => {
                    let id = self.next_worker_id;
                    self.next_worker_id += 1;
                    self.total_spawned += 1;
                    info!(
                        pipeline = self.label,
                        worker_id = id,
                        pid = handle.pid().as_raw(),
                        "Spawned worker"
                    );
                    self.workers.push(WorkerSlot {
                        id,
                        handle,
                        state: SlotState::Starting,
                        jobs_completed: 0,
                    });
                }
                Err(e) => {
                    error!(pipeline = self.label, "Error spawning a worker: {}", e);
                    break;
                }
            }
        }
    }

    /// Hand queued items to idle workers, FIFO.
    pub fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(slot) = self
                .workers
                .iter_mut()
                .find(|w| w.state == SlotState::Idle)
            else {
                break;
            };

            match self.queue.pop_front().expect("queue checked non-empty") {
                Dispatch::Terminate => {
                    if let Err(e) = slot.handle.send(&WorkRequest::Terminate) {
                        warn!(
                            pipeline = self.label,
                            worker_id = slot.id,
                            "Failed to send sentinel: {}",
                            e
                        );
                    }
                    // Either way the worker is done: a broken pipe means it
                    // is already dying and will be reaped.
                    slot.state = SlotState::Stopping;
                }
                Dispatch::Job(job) => {
                    let id = job.id;
                    match slot.handle.send(&WorkRequest::process(*job)) {
                        Ok(()) => {
                            debug!(
                                pipeline = self.label,
                                worker_id = slot.id,
                                job_id = %id,
                                "Dispatched job"
                            );
                            slot.state = SlotState::Busy(id);
                        }
                        Err(e) => {
                            error!(
                                pipeline = self.label,
                                worker_id = slot.id,
                                job_id = %id,
                                "Failed to dispatch job: {}",
                                e
                            );
                            // The worker's pipe is gone; it will be reaped.
                            // The job itself is lost, as if the worker had
                            // died while holding it.
                            slot.state = SlotState::Busy(id);
                        }
                    }
                }
            }
        }
    }

    /// Poll every worker's pipe for responses.
    pub fn poll(&mut self) -> Vec<(JobId, Outcome)> {
        let mut results = Vec::new();

        for slot in &mut self.workers {
            loop {
                match slot.handle.try_recv() {
                    Ok(RecvOutcome::Message(WorkResponse::Done { id, outcome })) => {
                        slot.jobs_completed += 1;
                        results.push((id, outcome));
                    }
                    Ok(RecvOutcome::Message(WorkResponse::Ready)) => {
                        if slot.state != SlotState::Stopping {
                            slot.state = SlotState::Idle;
                        }
                    }
                    Ok(RecvOutcome::Pending) | Ok(RecvOutcome::Disconnected) => break,
                    Err(e) => {
                        warn!(
                            pipeline = self.label,
                            worker_id = slot.id,
                            "Bad response from worker: {}",
                            e
                        );
                        break;
                    }
                }
            }
        }

        results
    }

    /// Terminate every worker and release the pool.
    ///
    /// Sends the sentinel to each worker and joins it, escalating to signals
    /// for workers that do not leave within the timeout.
    pub fn shutdown(&mut self, timeout: Duration) {
        self.queue.clear();
        for mut slot in self.workers.drain(..) {
            if let Err(e) = slot.handle.stop(timeout) {
                warn!(
                    pipeline = self.label,
                    worker_id = slot.id,
                    "Error stopping worker: {}",
                    e
                );
            }
        }
    }

    /// Total jobs completed across current workers (diagnostic).
    pub fn jobs_completed(&self) -> usize {
        self.workers.iter().map(|w| w.jobs_completed).sum()
    }
}
