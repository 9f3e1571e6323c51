//! Parent-side handle to one worker subprocess.
//!
//! Owns the worker's pipe ends and process id. Receives are non-blocking so
//! the control loop can sweep every worker each tick; stopping a worker goes
//! through the terminate sentinel first and escalates to signals only when
//! the worker does not leave on its own.

use std::process::{Child, ChildStdin, ChildStdout};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::ipc::{self, Frame, FrameReader};
use super::protocol::{WorkRequest, WorkResponse};
use crate::error::{Result, SpawnError};

/// One non-blocking receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A complete response arrived.
    Message(WorkResponse),
    /// Nothing to read yet.
    Pending,
    /// The worker closed its stdout.
    Disconnected,
}

/// Handle to a worker subprocess.
pub struct WorkerHandle {
    pid: Pid,
    stdin: ChildStdin,
    stdout: FrameReader<ChildStdout>,
    /// Cached wait status once the process has been reaped.
    exit: Option<WaitStatus>,
}

impl WorkerHandle {
    /// Take over a freshly spawned child.
    ///
    /// Both pipe ends must have been captured; the stdout end is switched to
    /// non-blocking mode for the control loop's per-tick polls.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Worker("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Worker("worker stdout not piped".into()))?;
        ipc::set_nonblocking(&stdout).map_err(|e| {
            SpawnError::Worker(format!("cannot make worker pipe non-blocking: {}", e))
        })?;

        Ok(Self {
            pid,
            stdin,
            stdout: FrameReader::new(stdout),
            exit: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send one request down the worker's stdin.
    pub fn send(&mut self, request: &WorkRequest) -> Result<()> {
        ipc::send_line(&mut self.stdin, &request.to_line())
            .map_err(|e| SpawnError::Worker(format!("send to worker {} failed: {}", self.pid, e)))
    }

    /// Poll the worker's stdout for one response.
    pub fn try_recv(&mut self) -> Result<RecvOutcome> {
        match self.stdout.poll_line() {
            Ok(Frame::Line(line)) => {
                let response = WorkResponse::from_line(&line).map_err(|e| {
                    SpawnError::Worker(format!("garbled response from worker {}: {}", self.pid, e))
                })?;
                Ok(RecvOutcome::Message(response))
            }
            Ok(Frame::Pending) => Ok(RecvOutcome::Pending),
            Ok(Frame::Eof) => Ok(RecvOutcome::Disconnected),
            Err(e) => Err(SpawnError::Worker(format!(
                "read from worker {} failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Non-blocking liveness check.
    ///
    /// Returns the wait status once the process has exited. The status is
    /// cached, so the call stays valid after the process is gone.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.exit.is_some() {
            return Ok(self.exit);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.exit = Some(status);
                Ok(self.exit)
            }
            Err(e) => Err(SpawnError::Worker(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    /// Block until the process exits.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = waitpid(self.pid, None)
            .map_err(|e| SpawnError::Worker(format!("waitpid({}) failed: {}", self.pid, e)))?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Poll for exit until `timeout` passes.
    ///
    /// A wait error counts as gone: the child is no longer observable.
    fn exits_within(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Ok(Some(_)) | Err(_) => return true,
                Ok(None) => {}
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn signal(&self, sig: Signal) {
        if self.exit.is_none() {
            let _ = signal::kill(self.pid, sig);
        }
    }

    /// Stop the worker: sentinel first, then SIGTERM, finally SIGKILL.
    ///
    /// `timeout` bounds the sentinel phase; the signal phases use short fixed
    /// grace periods.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }

        // A send failure means the pipe is already gone; fall through to the
        // wait/escalation ladder either way.
        let _ = self.send(&WorkRequest::Terminate);
        if self.exits_within(timeout) {
            return Ok(());
        }

        self.signal(Signal::SIGTERM);
        if self.exits_within(Duration::from_millis(100)) {
            return Ok(());
        }

        self.signal(Signal::SIGKILL);
        self.wait().map(drop)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.exit.is_none() {
            self.signal(Signal::SIGTERM);
            if self.exits_within(Duration::from_millis(50)) {
                return;
            }
            self.signal(Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}
