//! End-to-end scenarios driving a real traced process through the
//! Control Loop, Breakpoint Engine, and Stepping Engine, using the
//! hand-built ELF fixture in `support` for deterministic code addresses.

mod support;

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::sys::ptrace;
use nix::unistd::Pid;

use dbgkit::arch::SupportedArch;
use dbgkit::control_loop::{StopReason, Tracee, TraceeStatus};
use dbgkit::flags::DebuggerConfig;

fn spawn_fixture() -> (std::process::Child, support::FixtureLayout, tempfile::NamedTempFile) {
    let (file, layout) = support::build();
    let path = file.path().to_path_buf();
    let mut cmd = Command::new(&path);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| ptrace::traceme().map_err(|e| std::io::Error::from_raw_os_error(e as i32)));
    }
    let child = cmd.spawn().expect("spawn fixture process");
    (child, layout, file)
}

fn new_tracee(pid: Pid) -> Tracee {
    Tracee::new(pid, SupportedArch::X64, DebuggerConfig::default())
}

/// Scenario: attaching via `PTRACE_TRACEME` + exec leaves the tracee
/// `Stopped` at its very first instruction (spec §8 scenario 1).
#[test]
fn traceme_exec_stops_at_entry() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);

    tracee.wait_all_and_update_regs().expect("wait for initial exec stop");
    tracee.status = TraceeStatus::Stopped;

    let regs = tracee.gateway().get_regs().expect("read regs at entry");
    assert_eq!(regs.ip(), layout.entry);
}

/// Scenario: placing a software breakpoint at `foo` and continuing stops
/// exactly there, with the instruction pointer rewound past the INT3
/// (spec §8 scenario 2).
#[test]
fn software_breakpoint_stops_at_foo() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    let arch = tracee.architecture();
    let gateway = *tracee.gateway();
    tracee
        .breakpoints
        .place_software(&gateway, arch, layout.foo_addr)
        .expect("place breakpoint at foo");

    tracee.cont_all_and_set_bps().expect("continue to breakpoint");

    assert_eq!(tracee.status, TraceeStatus::Stopped);
    assert_eq!(
        tracee.last_stop_reason,
        Some(StopReason::Breakpoint { addr: layout.foo_addr })
    );
    let regs = tracee.gateway().get_regs().unwrap();
    assert_eq!(regs.ip(), layout.foo_addr);
}

/// Scenario: `next` over the `call foo` instruction lands on the
/// fallthrough address without ever stopping inside `foo` (spec §8
/// scenario 3).
#[test]
fn next_steps_over_call() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    let arch = tracee.architecture();
    let gateway = *tracee.gateway();
    let after = dbgkit::stepping::next(&gateway, arch, &mut tracee.breakpoints)
        .expect("step over call");

    assert_eq!(after.ip(), layout.fallthrough_addr);
}

/// Scenario: `finish` (backtrace heuristic) from inside `foo` returns
/// control to the fallthrough address of the call site (spec §8 scenario
/// 4/5, the six-invariant "finish lands at the caller" property).
#[test]
fn finish_via_backtrace_returns_to_caller() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    let arch = tracee.architecture();
    let gateway = *tracee.gateway();
    tracee
        .breakpoints
        .place_software(&gateway, arch, layout.foo_addr)
        .expect("place breakpoint at foo");
    tracee.cont_all_and_set_bps().expect("run to foo");
    assert_eq!(tracee.gateway().get_regs().unwrap().ip(), layout.foo_addr);

    tracee
        .breakpoints
        .remove_software(&gateway, arch, layout.foo_addr)
        .expect("clear breakpoint before finishing");

    let vmaps = dbgkit::vmap::VmapTable::load(pid).expect("load vmaps");
    let max_steps = tracee.config.default_max_steps;
    let regs = dbgkit::stepping::finish(
        &gateway,
        arch,
        &mut tracee.breakpoints,
        &vmaps,
        dbgkit::flags::FinishHeuristic::Backtrace,
        max_steps,
    )
    .expect("finish back to caller");

    assert_eq!(regs.ip(), layout.fallthrough_addr);
}

/// Scenario: `step_until` reaching an address it's already stopped at is
/// idempotent — a second call with the same target is a no-op and returns
/// the same registers (spec §8 determinism invariant).
#[test]
fn step_until_is_idempotent_once_target_reached() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    let first = dbgkit::stepping::step_until(tracee.gateway(), layout.foo_addr, 1000).unwrap();
    assert_eq!(first.ip(), layout.foo_addr);

    let second = dbgkit::stepping::step_until(tracee.gateway(), layout.foo_addr, 1000).unwrap();
    assert_eq!(second.ip(), layout.foo_addr);
}

/// Scenario: the process runs to completion and reports its exit code
/// once no breakpoints intervene (spec §8 scenario 6).
#[test]
fn uninterrupted_run_reaches_exit() {
    let (child, _layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    loop {
        tracee.cont_all_and_set_bps().unwrap();
        if tracee.status == TraceeStatus::Exited {
            break;
        }
    }

    assert_eq!(tracee.status, TraceeStatus::Exited);
}

/// Scenario: `finish` (step-mode heuristic) from inside `foo` also lands on
/// the fallthrough address of the call site, confirming the post-step `sp`
/// comparison fires at the right instruction (spec §8 scenario 4/5).
#[test]
fn finish_via_step_mode_returns_to_caller() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    let arch = tracee.architecture();
    let gateway = *tracee.gateway();
    tracee
        .breakpoints
        .place_software(&gateway, arch, layout.foo_addr)
        .expect("place breakpoint at foo");
    tracee.cont_all_and_set_bps().expect("run to foo");
    assert_eq!(tracee.gateway().get_regs().unwrap().ip(), layout.foo_addr);

    tracee
        .breakpoints
        .remove_software(&gateway, arch, layout.foo_addr)
        .expect("clear breakpoint before finishing");

    let vmaps = dbgkit::vmap::VmapTable::load(pid).expect("load vmaps");
    let max_steps = tracee.config.default_max_steps;
    let regs = dbgkit::stepping::finish(
        &gateway,
        arch,
        &mut tracee.breakpoints,
        &vmaps,
        dbgkit::flags::FinishHeuristic::StepMode,
        max_steps,
    )
    .expect("finish back to caller via step mode");

    assert_eq!(regs.ip(), layout.fallthrough_addr);
}

/// Scenario: disabling a software breakpoint restores the original byte in
/// tracee memory, and re-enabling it re-patches the INT3 — not just a
/// bookkeeping flip (spec §3's disable/enable invariant).
#[test]
fn disable_restores_bytes_and_enable_repatches() {
    let (child, layout, _file) = spawn_fixture();
    let pid = Pid::from_raw(child.id() as i32);
    let mut tracee = new_tracee(pid);
    tracee.wait_all_and_update_regs().unwrap();
    tracee.status = TraceeStatus::Stopped;

    let arch = tracee.architecture();
    let gateway = *tracee.gateway();
    tracee
        .breakpoints
        .place_software(&gateway, arch, layout.foo_addr)
        .expect("place breakpoint at foo");

    let original = tracee.breakpoints.original_word(layout.foo_addr).expect("tracked original word");
    let aligned = layout.foo_addr - (layout.foo_addr % arch.word_size() as u64);

    let patched = gateway.peek_data(aligned).unwrap();
    assert_eq!(patched & 0xFF, 0xCC);

    tracee
        .breakpoints
        .disable(&gateway, arch, layout.foo_addr)
        .expect("disable breakpoint");
    let restored = gateway.peek_data(aligned).unwrap();
    assert_eq!(restored, original);

    tracee
        .breakpoints
        .enable(&gateway, arch, layout.foo_addr)
        .expect("re-enable breakpoint");
    let repatched = gateway.peek_data(aligned).unwrap();
    assert_eq!(repatched & 0xFF, 0xCC);
    assert_eq!(repatched & !0xFFu64, original & !0xFFu64);
}

#[test]
fn pipe_manager_recvuntil_finds_delimiter_idempotently() {
    use dbgkit::pipe_manager::PipeManager;
    use nix::unistd::{pipe, write};

    let (stdout_read, stdout_write) = pipe().unwrap();
    let (stdin_read, stdin_write) = pipe().unwrap();
    let (stderr_read, _stderr_write) = pipe().unwrap();
    let _ = stdin_read; // kept alive only so stdin_write doesn't see a broken pipe

    write(&stdout_write, b"hello world\n").unwrap();
    drop(stdout_write);

    let manager = PipeManager::new(stdin_write, stdout_read, stderr_read, Duration::from_secs(1));
    let line = manager.recvline(1, true, Duration::from_secs(1)).unwrap();
    assert_eq!(line, b"hello world");
}
