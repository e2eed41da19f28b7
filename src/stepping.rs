//! Stepping Engine: `step`, `step_until`, `next` (step-over), and `finish`
//! (step-out), built on the Ptrace Gateway and Breakpoint Engine.
//!
//! `next`'s step-over and `finish`'s step-mode heuristic are grounded on
//! the CALL/RET nesting-counter idea from spec §4.4; `finish`'s backtrace
//! heuristic reuses the Stack Unwinder directly.

use crate::arch::Architecture;
use crate::breakpoint::BreakpointEngine;
use crate::error::{DbgError, DbgResult};
use crate::flags::FinishHeuristic;
use crate::memory::MemoryView;
use crate::ptrace_gateway::PtraceGateway;
use crate::registers::Registers;
use crate::unwind::unwind;
use crate::vmap::VmapTable;

/// Single-steps one machine instruction, returning the registers as they
/// stand right after the step.
pub fn step(gateway: &PtraceGateway) -> DbgResult<Registers> {
    gateway.single_step(None)?;
    gateway.wait()?;
    gateway.get_regs()
}

/// Repeatedly single-steps until `rip` reaches `target`, up to `max_steps`
/// instructions, returning the final registers. Exceeding `max_steps`
/// without reaching `target` is not itself an error — callers compare the
/// returned `rip` against `target` to tell the difference from a normal
/// arrival.
pub fn step_until(gateway: &PtraceGateway, target: u64, max_steps: u32) -> DbgResult<Registers> {
    let mut regs = gateway.get_regs()?;
    let mut steps = 0;
    while regs.ip() != target && steps < max_steps {
        regs = step(gateway)?;
        steps += 1;
    }
    Ok(regs)
}

/// Step-over: if the instruction at `rip` is a CALL, place a transient
/// breakpoint at the fallthrough address (`rip + call length`) and
/// continue to it instead of stepping into the callee; otherwise this is
/// the same as a plain `step`.
pub fn next(
    gateway: &PtraceGateway,
    arch: &dyn Architecture,
    breakpoints: &mut BreakpointEngine,
) -> DbgResult<Registers> {
    let regs = gateway.get_regs()?;
    let memory = MemoryView::new(gateway, arch.word_size());
    let window = memory.read(regs.ip(), 16)?;

    let call_len = match arch.is_call(&window) {
        Some(len) => len,
        None => return step(gateway),
    };

    let fallthrough = regs.ip() + call_len as u64;
    let already_armed = breakpoints.get(fallthrough).is_some();
    if !already_armed {
        breakpoints.place_software(gateway, arch, fallthrough)?;
    }

    gateway.cont(None)?;
    gateway.wait()?;
    let mut regs = gateway.get_regs()?;

    // A trap lands one byte past the INT3; rewind rip to the breakpoint
    // address before cleanup, same as the Control Loop does for user
    // breakpoints.
    if regs.ip() == fallthrough + 1 {
        regs.set_ip(fallthrough);
        gateway.set_regs(&regs)?;
    }

    if !already_armed {
        breakpoints.remove_software(gateway, arch, fallthrough)?;
    }

    Ok(regs)
}

/// Step-out: run until the current function returns to its caller, using
/// one of two heuristics (spec §4.4).
pub fn finish(
    gateway: &PtraceGateway,
    arch: &dyn Architecture,
    breakpoints: &mut BreakpointEngine,
    vmaps: &VmapTable,
    heuristic: FinishHeuristic,
    max_steps: u32,
) -> DbgResult<Registers> {
    match heuristic {
        FinishHeuristic::Backtrace => finish_via_backtrace(gateway, arch, breakpoints, vmaps),
        FinishHeuristic::StepMode => finish_via_step_mode(gateway, arch, breakpoints, max_steps),
    }
}

/// Unwinds the stack once up front to find the return address of the
/// current frame, then places a transient breakpoint there and continues
/// to it, the same pattern `next` uses for its fallthrough breakpoint.
/// Cheap (one unwind, no per-instruction stepping) but wrong if the
/// frame's return address gets overwritten before it's reached (e.g. by a
/// sibling call the callee makes into the same frame slot), which is the
/// documented tradeoff against the step-mode heuristic.
fn finish_via_backtrace(
    gateway: &PtraceGateway,
    arch: &dyn Architecture,
    breakpoints: &mut BreakpointEngine,
    vmaps: &VmapTable,
) -> DbgResult<Registers> {
    let regs = gateway.get_regs()?;
    let memory = MemoryView::new(gateway, arch.word_size());
    let trace = unwind(&memory, arch, vmaps, &regs);
    let return_address = *trace
        .get(1)
        .ok_or_else(|| DbgError::state("a caller frame to return to", "top-level frame"))?;

    let already_armed = breakpoints.get(return_address).is_some();
    if !already_armed {
        breakpoints.place_software(gateway, arch, return_address)?;
    }

    gateway.cont(None)?;
    gateway.wait()?;
    let mut regs = gateway.get_regs()?;

    if regs.ip() == return_address + 1 {
        regs.set_ip(return_address);
        gateway.set_regs(&regs)?;
    }

    if !already_armed {
        breakpoints.remove_software(gateway, arch, return_address)?;
    }

    Ok(regs)
}

/// Single-steps, tracking CALL/RET nesting depth so a RET is only accepted
/// as "our" return once every nested call it might belong to has itself
/// returned. Slower than the backtrace heuristic but robust to a callee
/// that overwrites its return slot.
fn finish_via_step_mode(
    gateway: &PtraceGateway,
    arch: &dyn Architecture,
    breakpoints: &mut BreakpointEngine,
    max_steps: u32,
) -> DbgResult<Registers> {
    let mut depth: i64 = 0;
    let mut regs = gateway.get_regs()?;
    let starting_sp = regs.sp();
    let _ = breakpoints; // the Control Loop owns restoring any live breakpoint byte before each step

    for _ in 0..max_steps {
        let memory = MemoryView::new(gateway, arch.word_size());
        let window = memory.read(regs.ip(), 16)?;
        let is_ret = window.first().is_some_and(|&b| arch.is_ret(b));
        let is_call = arch.is_call(&window).is_some();
        let depth_before_step = depth;

        regs = step(gateway)?;

        // Evaluated against post-step sp: a RET's pop of the return address
        // only shows up in sp once the step that executes it has happened.
        if step_mode_should_return(depth_before_step, is_ret, regs.sp(), starting_sp) {
            return Ok(regs);
        }
        depth = next_nesting_depth(depth, is_call, is_ret);
    }

    Ok(regs)
}

/// Whether the instruction about to execute is the RET that returns out of
/// the frame `finish` was called in: depth has unwound back to zero and
/// the stack pointer has grown past where we started (the caller's frame
/// already popped ours).
fn step_mode_should_return(depth: i64, is_ret: bool, sp: u64, starting_sp: u64) -> bool {
    is_ret && depth == 0 && sp > starting_sp
}

/// Updates the CALL/RET nesting counter for one executed instruction.
fn next_nesting_depth(depth: i64, is_call: bool, is_ret: bool) -> i64 {
    if is_call {
        depth + 1
    } else if is_ret {
        depth - 1
    } else {
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_depth_tracks_call_and_ret() {
        assert_eq!(next_nesting_depth(0, true, false), 1);
        assert_eq!(next_nesting_depth(1, false, true), 0);
        assert_eq!(next_nesting_depth(2, false, false), 2);
    }

    #[test]
    fn step_mode_returns_only_at_zero_depth_with_grown_stack() {
        assert!(step_mode_should_return(0, true, 0x2000, 0x1000));
        assert!(!step_mode_should_return(1, true, 0x2000, 0x1000));
        assert!(!step_mode_should_return(0, true, 0x1000, 0x1000));
        assert!(!step_mode_should_return(0, false, 0x2000, 0x1000));
    }
}
