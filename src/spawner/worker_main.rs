//! Worker subprocess main entry point.
//!
//! Runs when the binary is invoked in its hidden worker mode. The worker
//! announces readiness, then serves job requests from stdin until it reads
//! the terminate sentinel or the orchestrator closes the pipe.
//!
//! A worker never exits because of a bad job: resolution and invocation
//! failures (including panics inside the task) are converted into `Failed`
//! outcomes and the loop continues.

use std::io::{self, BufRead, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tracing::{debug, error, info};

use super::ipc::send_line;
use super::job::Outcome;
use super::protocol::{WorkRequest, WorkResponse};
use crate::registry::{Task, TargetRef, TaskRegistry};

/// One-slot cache of the most recently resolved task.
///
/// Keeps a stateful task instance alive across jobs that share a target, so
/// per-worker state (handles, lookup tables) survives between invocations.
/// Switching targets drops the previous instance.
struct TaskCache {
    entry: Option<(TargetRef, Box<dyn Task>)>,
}

impl TaskCache {
    fn new() -> Self {
        Self { entry: None }
    }

    /// Get the task for `target`, resolving through the registry when the
    /// cached entry names a different target (or resolution previously
    /// failed and the cache was cleared).
    fn lookup<'a>(
        &'a mut self,
        registry: &TaskRegistry,
        target: &TargetRef,
    ) -> Option<&'a mut Box<dyn Task>> {
        let hit = matches!(&self.entry, Some((cached, _)) if cached == target);
        if !hit {
            match registry.resolve(target) {
                Ok(task) => {
                    debug!(target = %target, "Resolved processing task");
                    self.entry = Some((target.clone(), task));
                }
                Err(e) => {
                    error!(target = %target, "Cannot resolve processing task: {}", e);
                    self.entry = None;
                    return None;
                }
            }
        }
        self.entry.as_mut().map(|(_, task)| task)
    }
}

/// Execute one job against the cache, converting every failure mode into an
/// outcome.
fn execute(
    cache: &mut TaskCache,
    registry: &TaskRegistry,
    target: &TargetRef,
    payload: &Value,
    params: &str,
) -> Outcome {
    let Some(task) = cache.lookup(registry, target) else {
        return Outcome::Failed;
    };

    match catch_unwind(AssertUnwindSafe(|| task.run(payload, params))) {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(e)) => {
            // Invocation failure: the target itself is still valid, keep the cache.
            error!(target = %target, "Processing task failed: {}", e);
            Outcome::Failed
        }
        Err(_) => {
            error!(target = %target, "Processing task panicked");
            Outcome::Failed
        }
    }
}

/// Worker main loop.
///
/// Reads requests from `input`, processes them, and writes responses to
/// `output`. Returns when the terminate sentinel arrives or `input` ends.
fn worker_loop<R: BufRead, W: Write>(
    input: R,
    output: &mut W,
    registry: &TaskRegistry,
) -> io::Result<()> {
    let mut cache = TaskCache::new();

    // Announce readiness
    send_line(output, &WorkResponse::Ready.to_line())?;

    for line in input.lines() {
        let line = line?;
        let request = match WorkRequest::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                error!("Invalid request from orchestrator: {}", e);
                continue;
            }
        };

        match request {
            WorkRequest::Terminate => {
                info!("Terminating worker.");
                return Ok(());
            }

            WorkRequest::Process {
                id,
                payload,
                target,
                params,
            } => {
                let outcome = execute(&mut cache, registry, &target, &payload, &params);
                send_line(output, &WorkResponse::done(id, outcome).to_line())?;
                send_line(output, &WorkResponse::Ready.to_line())?;
            }
        }
    }

    // EOF: the orchestrator is gone
    Ok(())
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 after a clean terminate/EOF, 1 on a pipe error.
pub fn run_worker(registry: &TaskRegistry) -> ! {
    // Ignore SIGPIPE - pipe errors surface through io::Error instead
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    match worker_loop(stdin, &mut stdout, registry) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{TaskResult, builtin};
    use crate::spawner::job::JobId;

    fn job(id: u64, payload: &str, module: &str, function: &str, params: &str) -> WorkRequest {
        WorkRequest::Process {
            id: JobId(id),
            payload: Value::String(payload.into()),
            target: TargetRef::new(module, function),
            params: params.into(),
        }
    }

    fn test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        builtin::register_all(&mut registry);
        registry.register_fn("test", "panics", |_p, _a| panic!("boom"));
        registry
    }

    /// Feed a scripted request sequence through the loop and collect the
    /// responses it wrote.
    fn run_script(registry: &TaskRegistry, requests: &[WorkRequest]) -> Vec<WorkResponse> {
        let script: String = requests.iter().map(|r| r.to_line()).collect();
        let mut out = Vec::new();
        worker_loop(io::Cursor::new(script.into_bytes()), &mut out, registry).unwrap();
        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| WorkResponse::from_line(l).unwrap())
            .collect()
    }

    fn expect_done(response: &WorkResponse, id: u64) -> &Outcome {
        match response {
            WorkResponse::Done { id: got, outcome } => {
                assert_eq!(*got, JobId(id));
                outcome
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_announced_before_any_work() {
        let responses = run_script(&test_registry(), &[WorkRequest::Terminate]);
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], WorkResponse::Ready));
    }

    #[test]
    fn test_job_produces_done_then_ready() {
        let responses = run_script(
            &test_registry(),
            &[
                job(1, "data.h5", builtin::MODULE, "upper", ""),
                WorkRequest::Terminate,
            ],
        );
        assert_eq!(responses.len(), 3);
        match expect_done(&responses[1], 1) {
            Outcome::Completed(v) => assert_eq!(*v, Value::String("DATA.H5".into())),
            Outcome::Failed => panic!("job unexpectedly failed"),
        }
        assert!(matches!(responses[2], WorkResponse::Ready));
    }

    #[test]
    fn test_sentinel_stops_before_queued_jobs() {
        // A job already queued behind the sentinel must never execute.
        let responses = run_script(
            &test_registry(),
            &[
                WorkRequest::Terminate,
                job(9, "never", builtin::MODULE, "upper", ""),
            ],
        );
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], WorkResponse::Ready));
    }

    #[test]
    fn test_unresolvable_target_fails_without_killing_worker() {
        let responses = run_script(
            &test_registry(),
            &[
                job(1, "a", "no_such", "task", ""),
                job(2, "b", builtin::MODULE, "upper", ""),
                WorkRequest::Terminate,
            ],
        );
        assert_eq!(responses.len(), 5);
        assert!(expect_done(&responses[1], 1).is_failure());
        // The next, valid job still succeeds on the same worker
        assert!(!expect_done(&responses[3], 2).is_failure());
    }

    #[test]
    fn test_panicking_task_fails_without_killing_worker() {
        let responses = run_script(
            &test_registry(),
            &[
                job(1, "a", "test", "panics", ""),
                job(2, "b", builtin::MODULE, "upper", ""),
                WorkRequest::Terminate,
            ],
        );
        assert!(expect_done(&responses[1], 1).is_failure());
        assert!(!expect_done(&responses[3], 2).is_failure());
    }

    #[test]
    fn test_eof_without_sentinel_is_a_clean_exit() {
        let responses = run_script(&test_registry(), &[]);
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], WorkResponse::Ready));
    }

    #[test]
    fn test_params_are_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("lines.txt");

        let responses = run_script(
            &test_registry(),
            &[
                job(1, "entry", builtin::MODULE, "append", out.to_str().unwrap()),
                WorkRequest::Terminate,
            ],
        );
        assert!(!expect_done(&responses[1], 1).is_failure());
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "entry\n");
    }

    #[test]
    fn test_cache_keeps_task_state_across_same_target_jobs() {
        struct Counter(u64);
        impl Task for Counter {
            fn run(&mut self, _payload: &Value, _params: &str) -> TaskResult {
                self.0 += 1;
                Ok(serde_json::json!(self.0))
            }
        }

        let mut registry = test_registry();
        registry.register("demo", "counter", || Ok(Box::new(Counter(0)) as Box<dyn Task>));

        let responses = run_script(
            &registry,
            &[
                job(1, "a", "demo", "counter", ""),
                job(2, "b", "demo", "counter", ""),
                // A different target evicts the one-slot cache...
                job(3, "c", builtin::MODULE, "upper", ""),
                // ...so the counter restarts when it is resolved again.
                job(4, "d", "demo", "counter", ""),
                WorkRequest::Terminate,
            ],
        );

        let count = |r: &WorkResponse, id| match expect_done(r, id) {
            Outcome::Completed(v) => v.as_u64().unwrap(),
            Outcome::Failed => panic!("counter failed"),
        };
        assert_eq!(count(&responses[1], 1), 1);
        assert_eq!(count(&responses[3], 2), 2);
        assert_eq!(count(&responses[7], 4), 1);
    }
}
