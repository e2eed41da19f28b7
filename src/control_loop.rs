//! Tracee data model and Control Loop state machine (spec §3/§5).
//!
//! A `Tracee` owns everything needed to drive one traced process: its
//! thread map, breakpoints, architecture, and the wait-event bookkeeping
//! that keeps `status` and each thread's cached registers in sync with the
//! kernel. `wait_all_and_update_regs` is the one place that interprets
//! `waitpid` results into our own state transitions, grounded on the
//! `deet` Inferior's `wait`/`cont` pair generalized to multiple threads.

use std::collections::BTreeMap;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::arch::{Architecture, SupportedArch};
use crate::breakpoint::BreakpointEngine;
use crate::error::{DbgError, DbgResult};
use crate::flags::DebuggerConfig;
use crate::ptrace_gateway::{PtraceGateway, WaitOutcome};
use crate::thread::{Thread, ThreadStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceeStatus {
    NotStarted,
    Running,
    Stopped,
    Exited,
}

/// Why a tracee is in `Stopped` state, needed so callers can tell "hit a
/// breakpoint" apart from "single-stepped" apart from "received a signal
/// we're not suppressing".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Breakpoint { addr: u64 },
    SingleStep,
    Signal(Signal),
    GroupStop(Signal),
}

pub struct Tracee {
    pid: Pid,
    gateway: PtraceGateway,
    arch: SupportedArch,
    pub threads: BTreeMap<Pid, Thread>,
    pub breakpoints: BreakpointEngine,
    pub config: DebuggerConfig,
    pub status: TraceeStatus,
    pub last_stop_reason: Option<StopReason>,
}

impl Tracee {
    pub fn new(pid: Pid, arch: SupportedArch, config: DebuggerConfig) -> Tracee {
        let mut threads = BTreeMap::new();
        threads.insert(pid, Thread::new(pid));
        Tracee {
            pid,
            gateway: PtraceGateway::new(pid),
            arch,
            threads,
            breakpoints: BreakpointEngine::new(),
            config,
            status: TraceeStatus::NotStarted,
            last_stop_reason: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn gateway(&self) -> &PtraceGateway {
        &self.gateway
    }

    pub fn architecture(&self) -> &'static dyn Architecture {
        self.arch.capability()
    }

    /// Attaches to an already-running process and waits for the initial
    /// stop, enabling the ptrace options this crate relies on (clone/exit
    /// tracking for multi-threaded tracees).
    pub fn attach(&mut self) -> DbgResult<()> {
        self.gateway.attach()?;
        self.gateway.wait()?;
        self.gateway.set_options(
            ptrace::Options::PTRACE_O_TRACECLONE
                | ptrace::Options::PTRACE_O_TRACEEXIT
                | ptrace::Options::PTRACE_O_EXITKILL,
        )?;
        self.status = TraceeStatus::Stopped;
        debug!(pid = self.pid.as_raw(), "attached to tracee");
        Ok(())
    }

    /// Requires the tracee to be `Stopped`, unless auto-interrupt is
    /// enabled, in which case a `Running` tracee is transparently
    /// interrupted first (spec §5).
    pub fn require_stopped(&mut self) -> DbgResult<()> {
        match self.status {
            TraceeStatus::Stopped => Ok(()),
            TraceeStatus::Running if self.config.auto_interrupt_on_command => {
                self.interrupt()
            }
            other => Err(DbgError::state("Stopped", format!("{other:?}"))),
        }
    }

    fn interrupt(&mut self) -> DbgResult<()> {
        nix::sys::signal::kill(self.pid, Signal::SIGSTOP)
            .map_err(DbgError::from)?;
        self.wait_all_and_update_regs()
    }

    /// Continues every live thread, re-arming any breakpoint the last stop
    /// left disarmed (step-off-and-restore) first, then waits for the next
    /// event. Each thread is its own kernel task (spec §5), so each gets its
    /// own `PTRACE_CONT` and its own pending-signal check rather than a
    /// single `cont` scoped to the tracee's main tid.
    pub fn cont_all_and_set_bps(&mut self) -> DbgResult<()> {
        if let Some(StopReason::Breakpoint { addr }) = self.last_stop_reason.clone() {
            self.step_off_breakpoint(addr)?;
        }
        let tids: Vec<Pid> = self
            .threads
            .iter()
            .filter(|(_, t)| t.status != ThreadStatus::Exited)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in tids {
            PtraceGateway::new(tid).cont(self.pending_signal_for(tid))?;
        }
        self.status = TraceeStatus::Running;
        self.wait_all_and_update_regs()
    }

    fn pending_signal_for(&self, tid: Pid) -> Option<Signal> {
        self.threads
            .get(&tid)
            .and_then(|t| t.pending_signal)
            .filter(|s| !self.config.is_suppressed(*s))
    }

    /// Single-steps past a breakpointed instruction: restore the original
    /// byte, step, then re-arm, so the CPU executes the real instruction
    /// instead of looping on the trap (spec §4.2).
    fn step_off_breakpoint(&mut self, addr: u64) -> DbgResult<()> {
        let arch = self.architecture();
        self.breakpoints.remove_software(&self.gateway, arch, addr)?;
        self.gateway.single_step(None)?;
        self.gateway.wait()?;
        self.breakpoints.place_software(&self.gateway, arch, addr)?;
        Ok(())
    }

    /// Interprets the next `waitpid` event for this tracee's process
    /// group, updating `status`, per-thread state, and `last_stop_reason`.
    pub fn wait_all_and_update_regs(&mut self) -> DbgResult<()> {
        let outcome = self.gateway.wait()?;
        match outcome {
            WaitOutcome::Exited { pid, code } => {
                if let Some(t) = self.threads.get_mut(&pid) {
                    t.status = ThreadStatus::Exited;
                }
                if pid == self.pid {
                    self.status = TraceeStatus::Exited;
                    debug!(pid = pid.as_raw(), code, "tracee exited");
                }
            }
            WaitOutcome::Signaled { pid, signal } => {
                if let Some(t) = self.threads.get_mut(&pid) {
                    t.status = ThreadStatus::Exited;
                }
                if pid == self.pid {
                    self.status = TraceeStatus::Exited;
                    warn!(pid = pid.as_raw(), ?signal, "tracee killed by signal");
                }
            }
            WaitOutcome::PtraceEvent { pid, event } => {
                self.handle_ptrace_event(pid, event)?;
            }
            WaitOutcome::StoppedBySignal { pid, signal } => {
                self.handle_signal_stop(pid, signal)?;
            }
            WaitOutcome::StillAlive => {}
        }
        Ok(())
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) -> DbgResult<()> {
        const PTRACE_EVENT_CLONE: i32 = 3;
        const PTRACE_EVENT_EXIT: i32 = 6;
        match event {
            PTRACE_EVENT_CLONE => {
                let new_tid = self.gateway.get_event_msg()? as i32;
                let new_pid = Pid::from_raw(new_tid);
                // The new task is auto-attached (PTRACE_O_TRACECLONE) and
                // immediately group-stopped; collect that stop now so a
                // later PTRACE_CONT on it isn't sent to a task still mid-clone.
                waitpid(new_pid, Some(WaitPidFlag::__WALL)).ok();
                let mut new_thread = Thread::new(new_pid);
                new_thread.status = ThreadStatus::Stopped;
                self.threads.insert(new_pid, new_thread);
                trace!(parent = pid.as_raw(), child = new_tid, "thread cloned");
                self.status = TraceeStatus::Stopped;
            }
            PTRACE_EVENT_EXIT => {
                if let Some(t) = self.threads.get_mut(&pid) {
                    t.status = ThreadStatus::Exited;
                }
                self.status = TraceeStatus::Stopped;
            }
            other => {
                trace!(event = other, "unhandled ptrace event");
                self.status = TraceeStatus::Stopped;
            }
        }
        Ok(())
    }

    fn handle_signal_stop(&mut self, pid: Pid, signal: Signal) -> DbgResult<()> {
        self.status = TraceeStatus::Stopped;
        let mut regs = self.gateway.get_regs()?;

        if signal == Signal::SIGTRAP {
            let candidate = regs.ip().wrapping_sub(1);
            let is_enabled_breakpoint = self.breakpoints.get(candidate).is_some_and(|bp| bp.enabled);
            if is_enabled_breakpoint {
                regs.set_ip(candidate);
                self.gateway.set_regs(&regs)?;
                self.breakpoints.hit_on(candidate);
                self.last_stop_reason = Some(StopReason::Breakpoint { addr: candidate });
            } else {
                self.last_stop_reason = Some(StopReason::SingleStep);
            }
        } else {
            self.last_stop_reason = Some(StopReason::Signal(signal));
            if let Some(t) = self.threads.get_mut(&pid) {
                if !self.config.is_suppressed(signal) {
                    t.pending_signal = Some(signal);
                }
            }
        }

        if let Some(t) = self.threads.get_mut(&pid) {
            t.status = ThreadStatus::Stopped;
            t.set_regs(regs);
            match crate::cpu_features::fp_layout().and_then(|layout| self.gateway.get_fp_regs(layout)) {
                Ok(fp) => t.set_fp_regs(fp),
                Err(e) => trace!(?e, "failed to read fp regs at stop"),
            }
        }
        Ok(())
    }

    /// Blocking wait with `WNOHANG` semantics layered in by the caller;
    /// exposed for callers that want to poll instead of block, mirroring
    /// the interactive pipe mode's non-blocking read loop.
    pub fn poll_status(&self) -> DbgResult<Option<WaitOutcome>> {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(wait_outcome_from(status))),
            Err(nix::errno::Errno::ECHILD) => Ok(None),
            Err(e) => Err(DbgError::from(e)),
        }
    }
}

fn wait_outcome_from(status: nix::sys::wait::WaitStatus) -> WaitOutcome {
    // Re-derives the same classification PtraceGateway::wait uses, for the
    // WNOHANG poll path which doesn't go through that method.
    use nix::sys::wait::WaitStatus::*;
    match status {
        Exited(pid, code) => WaitOutcome::Exited { pid, code },
        Signaled(pid, signal, _) => WaitOutcome::Signaled { pid, signal },
        Stopped(pid, signal) => WaitOutcome::StoppedBySignal { pid, signal },
        PtraceEvent(pid, _, event) => WaitOutcome::PtraceEvent { pid, event },
        PtraceSyscall(pid) => WaitOutcome::StoppedBySignal {
            pid,
            signal: Signal::SIGTRAP,
        },
        StillAlive | Continued(_) => WaitOutcome::StillAlive,
    }
}

/// RAII guard ensuring a tracee is left `Stopped` for the duration of a
/// borrow, used by Register/Memory View operations that must not run
/// concurrently with a live `cont`.
pub struct StoppedGuard<'a> {
    tracee: &'a mut Tracee,
}

impl<'a> StoppedGuard<'a> {
    pub fn acquire(tracee: &'a mut Tracee) -> DbgResult<StoppedGuard<'a>> {
        tracee.require_stopped()?;
        Ok(StoppedGuard { tracee })
    }

    pub fn tracee(&mut self) -> &mut Tracee {
        self.tracee
    }
}
