//! Crash analysis and shutdown signalling.
//!
//! `analyze_wait_status` classifies why a worker process died so the reap
//! path can log something more useful than a raw wait status. `ShutdownFlag`
//! is the cancellation token the control loop checks every tick; it can be
//! triggered programmatically or wired to SIGINT/SIGTERM.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::wait::WaitStatus;

use crate::error::{Result, SpawnError};

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Likely out of memory (SIGKILL from OOM killer).
    OutOfMemory,
    /// Stack overflow (SIGSEGV on Linux, SIGBUS on macOS).
    StackOverflow,
    /// Process is still running.
    StillAlive,
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Whether the worker left through the sentinel/EOF path.
    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::OutOfMemory => write!(f, "out of memory (SIGKILL from OOM killer)"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
///
/// An uncaught SIGKILL almost always means the OOM killer; SIGSEGV and
/// SIGBUS are stack overflows on Linux and macOS respectively.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::OutOfMemory,
        WaitStatus::Signaled(_, Signal::SIGSEGV | Signal::SIGBUS, _) => {
            TerminationReason::StackOverflow
        }
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// Cancellation token for the control loop.
///
/// Cloneable; every clone observes the same flag. Checked at each poll of the
/// control loop, so triggering it stops the orchestrator within one tick.
#[derive(Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful drain and shutdown.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// The flag the signal handler writes into. Installed once per process.
static SIGNAL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_termination(_signum: nix::libc::c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Wire SIGINT and SIGTERM to the given shutdown flag.
///
/// Only the first installed flag wins; later calls are rejected so two
/// orchestrators cannot silently fight over the process signals.
pub fn install_signal_handlers(flag: &ShutdownFlag) -> Result<()> {
    SIGNAL_FLAG
        .set(Arc::clone(&flag.requested))
        .map_err(|_| SpawnError::Config("signal handlers already installed".into()))?;

    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );

    // Safety: the handler only performs an atomic store.
    unsafe {
        sigaction(Signal::SIGINT, &action)
            .map_err(|e| SpawnError::Config(format!("Failed to install SIGINT handler: {}", e)))?;
        sigaction(Signal::SIGTERM, &action)
            .map_err(|e| SpawnError::Config(format!("Failed to install SIGTERM handler: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_clean_exit() {
        assert!(TerminationReason::Exited(0).is_clean_exit());
        assert!(!TerminationReason::Exited(1).is_clean_exit());
        assert!(!TerminationReason::OutOfMemory.is_clean_exit());
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(analyze_wait_status(status), TerminationReason::Exited(0));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(analyze_wait_status(status), TerminationReason::OutOfMemory);

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, false);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::StackOverflow
        );

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false);
        assert_eq!(
            analyze_wait_status(status),
            TerminationReason::Signaled(Signal::SIGTERM)
        );

        let status = WaitStatus::StillAlive;
        assert_eq!(analyze_wait_status(status), TerminationReason::StillAlive);
    }

    #[test]
    fn test_termination_reason_display() {
        assert!(
            TerminationReason::Exited(3)
                .to_string()
                .contains("exited with code 3")
        );
        assert!(
            TerminationReason::OutOfMemory
                .to_string()
                .contains("out of memory")
        );
    }

    #[test]
    fn test_shutdown_flag_shared_between_clones() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_triggered());

        flag.trigger();
        assert!(observer.is_triggered());
    }
}
