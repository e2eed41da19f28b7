//! Stack Unwinder: frame-pointer walk with prologue-aware top-frame
//! correction, a direct port of the Python implementation's
//! `unwind`/`get_return_address`/`_preamble_state` (grounded on
//! `i386_stack_unwinder.py`) generalized over [`crate::arch::Architecture`]
//! instead of being x86_64/i386-specific.
//!
//! A memory read failing partway through the walk truncates the backtrace
//! rather than raising: the original implementation swallows `OSError` and
//! `ValueError` from a bad read the same way.

use crate::arch::{Architecture, PreambleStage};
use crate::memory::MemoryView;
use crate::registers::Registers;
use crate::vmap::VmapTable;

/// Walks the frame-pointer chain starting from `regs`, returning the
/// instruction pointer followed by every return address found, most recent
/// call first.
pub fn unwind(
    memory: &MemoryView,
    arch: &dyn Architecture,
    vmaps: &VmapTable,
    regs: &Registers,
) -> Vec<u64> {
    let word_size = arch.word_size() as u64;
    let mut trace = vec![regs.ip()];

    let mut current_fp = match regs.fp() {
        Some(fp) => fp,
        None => return trace,
    };

    while current_fp != 0 {
        let return_address = match memory.read_word(current_fp + word_size) {
            Ok(w) => w,
            Err(_) => break,
        };

        if !vmaps.contains(return_address) {
            break;
        }

        current_fp = match memory.read_word(current_fp) {
            Ok(w) => w,
            Err(_) => break,
        };

        trace.push(return_address);
    }

    if let Some(corrected) = top_frame_return_address(memory, arch, regs) {
        if trace.get(1) != Some(&corrected) {
            trace.insert(1, corrected);
        }
    }

    trace
}

/// Re-derives the return address for the *current* frame using the
/// prologue classification, since a frame still mid-prologue hasn't pushed
/// rbp yet (or has pushed it but not yet copied rsp into it), so the naive
/// `[rbp + word_size]` read above is wrong for the top frame specifically.
fn top_frame_return_address(memory: &MemoryView, arch: &dyn Architecture, regs: &Registers) -> Option<u64> {
    let window = memory.read(regs.ip(), 4).ok()?;
    let word_size = arch.word_size() as u64;

    match arch.preamble_state(&window) {
        PreambleStage::NotInPreamble => memory.read_word(regs.fp()? + word_size).ok(),
        PreambleStage::BeforePush => memory.read_word(regs.sp()).ok(),
        PreambleStage::AfterPushBeforeMov => memory.read_word(regs.sp() + word_size).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86_64::X86_64;
    use nix::unistd::Pid;

    #[test]
    fn unwind_with_zero_frame_pointer_returns_only_ip() {
        let gateway = crate::ptrace_gateway::PtraceGateway::new(Pid::from_raw(1));
        let memory = MemoryView::new(&gateway, 8);
        let vmaps = VmapTable::default();
        let mut regs_raw = crate::registers::GpRegsX86_64::default();
        regs_raw.rip = 0x4000;
        regs_raw.rbp = 0;
        let regs = Registers::X64(regs_raw);

        let trace = unwind(&memory, &X86_64, &vmaps, &regs);
        assert_eq!(trace, vec![0x4000]);
    }
}
