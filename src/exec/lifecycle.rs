//! Type-state lifecycle of the traced interpreter process.
//!
//! `Started -> GroupAssigned -> Released`, then `wait` yields the exit.
//! Each step consumes the prior state, so the process cannot be released
//! before its cgroup membership was decided. The full legal chain:
//!
//! ```no_run
//! use tamarun::config::types::{ExitKind, Result};
//! use tamarun::exec::lifecycle::{Started, TracedProcess};
//! use tamarun::kernel::cgroup::CgroupBackend;
//!
//! fn drive(
//!     process: TracedProcess<Started>,
//!     cgroup: &dyn CgroupBackend,
//!     id: &str,
//! ) -> Result<ExitKind> {
//!     let assigned = match process.assign_to_cgroup(cgroup, id) {
//!         Ok(assigned) => assigned,
//!         Err(failed) => failed.process.skip_cgroup(),
//!     };
//!     let released = assigned.release().map_err(|failed| failed.error)?;
//!     released.wait(None)
//! }
//!
//! fn forged_pid_type_resolves(_pid: nix::unistd::Pid) {}
//!
//! fn main() {}
//! ```
//!
//! Every illegal ordering below fails with one specific error, and each
//! uses the same imports as the chain above:
#![doc = concat!(
    "```compile_fail,E0599\n",
    include_str!("../../tests/typestate_compile_fail/release_before_assign.rs"),
    "```"
)]
#![doc = concat!(
    "```compile_fail,E0599\n",
    include_str!("../../tests/typestate_compile_fail/wait_before_release.rs"),
    "```"
)]
#![doc = concat!(
    "```compile_fail,E0624\n",
    include_str!("../../tests/typestate_compile_fail/forge_stopped_process.rs"),
    "```"
)]
#![doc = concat!(
    "```compile_fail,E0382\n",
    include_str!("../../tests/typestate_compile_fail/reuse_consumed_state.rs"),
    "```"
)]
//!
//! A process handle dropped before it was waited on or killed is killed
//! and reaped, so an early return can never leave a stopped or unlimited
//! interpreter behind.

use crate::config::types::{ExitKind, Result, SandboxError};
use crate::kernel::cgroup::CgroupBackend;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Stopped by the kernel at exec; no interpreter instruction has run
pub struct Started;

/// Cgroup membership settled (assigned, or explicitly skipped)
pub struct GroupAssigned;

/// Tracer detached; the process runs on its own
pub struct Released;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Interpreter process with type-state tracking
pub struct TracedProcess<S> {
    pid: Pid,
    memory_limited: bool,
    settled: bool,
    _state: PhantomData<S>,
}

/// A failed transition hands the process back so the caller decides its fate
pub struct TransitionError<S> {
    pub process: TracedProcess<S>,
    pub error: SandboxError,
}

impl<S> TracedProcess<S> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the process is a member of its execution's cgroup
    pub fn memory_limited(&self) -> bool {
        self.memory_limited
    }

    fn transition<T>(mut self, memory_limited: bool) -> TracedProcess<T> {
        self.settled = true;
        TracedProcess {
            pid: self.pid,
            memory_limited,
            settled: false,
            _state: PhantomData,
        }
    }

    /// SIGKILL the process and reap it, from any state
    pub fn kill(mut self) -> Result<ExitKind> {
        self.settled = true;
        kill_and_reap(self.pid)
    }
}

impl TracedProcess<Started> {
    pub(crate) fn stopped_at_exec(pid: Pid) -> Self {
        Self {
            pid,
            memory_limited: false,
            settled: false,
            _state: PhantomData,
        }
    }

    /// Write the pid into the scope's membership file while still stopped
    pub fn assign_to_cgroup(
        self,
        backend: &dyn CgroupBackend,
        instance_id: &str,
    ) -> std::result::Result<TracedProcess<GroupAssigned>, TransitionError<Started>> {
        match backend.attach_process(instance_id, self.pid.as_raw() as u32) {
            Ok(()) => {
                log::debug!("Process {} joined cgroup {}", self.pid, instance_id);
                Ok(self.transition(true))
            }
            Err(error) => Err(TransitionError {
                process: self,
                error,
            }),
        }
    }

    /// Continue without a cgroup; the outcome reports the run as unlimited
    pub fn skip_cgroup(self) -> TracedProcess<GroupAssigned> {
        log::warn!("Process {} runs without a memory ceiling", self.pid);
        self.transition(false)
    }
}

impl TracedProcess<GroupAssigned> {
    /// Detach the tracer and let the process resume
    pub fn release(
        self,
    ) -> std::result::Result<TracedProcess<Released>, TransitionError<GroupAssigned>> {
        match ptrace::detach(self.pid, None::<Signal>) {
            Ok(()) => {
                let memory_limited = self.memory_limited;
                Ok(self.transition(memory_limited))
            }
            Err(e) => Err(TransitionError {
                error: SandboxError::Ptrace(format!("detach({}) failed: {}", self.pid, e)),
                process: self,
            }),
        }
    }
}

impl TracedProcess<Released> {
    /// Block until the process exits.
    ///
    /// With a deadline the wait polls and kills the process once the
    /// deadline passes, reporting [`ExitKind::TimedOut`].
    pub fn wait(mut self, deadline: Option<Duration>) -> Result<ExitKind> {
        let result = match deadline {
            None => wait_blocking(self.pid),
            Some(limit) => wait_with_deadline(self.pid, limit),
        };
        // Even a failed waitpid leaves nothing safe to signal: the pid may
        // already be reaped and reused.
        self.settled = true;
        result
    }
}

impl<S> Drop for TracedProcess<S> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        log::warn!("Killing unsettled interpreter process {}", self.pid);
        if let Err(e) = kill_and_reap(self.pid) {
            log::error!("Failed to kill process {}: {}", self.pid, e);
        }
    }
}

fn exit_kind(status: WaitStatus) -> Option<ExitKind> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitKind::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(ExitKind::Signaled(signal as i32)),
        _ => None,
    }
}

fn wait_blocking(pid: Pid) -> Result<ExitKind> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(kind) = exit_kind(status) {
                    return Ok(kind);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SandboxError::Wait(format!("waitpid({}): {}", pid, e))),
        }
    }
}

fn wait_with_deadline(pid: Pid, limit: Duration) -> Result<ExitKind> {
    let started = Instant::now();

    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if started.elapsed() >= limit {
                    log::warn!(
                        "Process {} exceeded wall timeout of {:?}, killing",
                        pid,
                        limit
                    );
                    kill_and_reap(pid)?;
                    return Ok(ExitKind::TimedOut);
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
            Ok(status) => {
                if let Some(kind) = exit_kind(status) {
                    return Ok(kind);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(SandboxError::Wait(format!("waitpid({}): {}", pid, e))),
        }
    }
}

/// SIGKILL works on stopped and traced processes alike
pub(crate) fn kill_and_reap(pid: Pid) -> Result<ExitKind> {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            return Err(SandboxError::Spawn(format!(
                "Failed to kill process {}: {}",
                pid, e
            )))
        }
    }

    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(kind) = exit_kind(status) {
                    return Ok(kind);
                }
            }
            Err(Errno::EINTR) => continue,
            // Already reaped elsewhere
            Err(Errno::ECHILD) => return Ok(ExitKind::Signaled(Signal::SIGKILL as i32)),
            Err(e) => return Err(SandboxError::Wait(format!("waitpid({}): {}", pid, e))),
        }
    }
}
