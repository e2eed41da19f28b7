//! Architecture capability set.
//!
//! The Register View, Stack Unwinder, and CALL/RET decoder all vary per
//! target. Rather than dynamic-dispatching every register access (which
//! would force the hot path through a vtable), we model the variation as a
//! small capability trait that each architecture implements once; the
//! pieces of this crate that need to branch on architecture go through
//! `Architecture`, everything else works on the concrete [`crate::registers::Registers`]
//! for the current target.
//!
//! This is the `{register_fields, word_size, is_call, is_ret,
//! preamble_state, install_breakpoint, breakpoint_size}` capability set
//! described in the design notes.

pub mod aarch64;
pub mod i386;
pub mod x86_64;

/// Which concrete architecture a tracee is running as.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SupportedArch {
    X86,
    X64,
    Aarch64,
}

impl SupportedArch {
    pub fn word_size(self) -> usize {
        match self {
            SupportedArch::X86 => 4,
            SupportedArch::X64 => 8,
            SupportedArch::Aarch64 => 8,
        }
    }

    pub fn capability(self) -> &'static dyn Architecture {
        match self {
            SupportedArch::X86 => &i386::I386,
            SupportedArch::X64 => &x86_64::X86_64,
            SupportedArch::Aarch64 => &aarch64::Aarch64Arch,
        }
    }
}

/// Stage of a function preamble (prologue), used by the stack unwinder's
/// top-frame correction (spec §4.3).
///
/// NB: this is a shallow byte-window classification, exactly as in the
/// source this was distilled from; it can misclassify a preamble if the
/// bytes it's looking for appear inside an immediate operand. A stricter
/// implementation would fully decode the instruction at `rip` instead of
/// scanning a 4-byte window. Left as-is to match the spec's documented
/// open question.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PreambleStage {
    /// Not in a recognizable preamble; the return address is at the usual
    /// `[rbp + word_size]` offset.
    NotInPreamble,
    /// `push rbp` has not executed yet; return address is at `[rsp]`.
    BeforePush,
    /// `push rbp` executed, `mov rbp, rsp` has not; return address is at
    /// `[rsp + word_size]`.
    AfterPushBeforeMov,
}

/// Per-architecture decode/encode primitives needed by the breakpoint
/// engine and stepping engine.
pub trait Architecture: Sync {
    fn arch(&self) -> SupportedArch;

    fn word_size(&self) -> usize {
        self.arch().word_size()
    }

    /// Size in bytes of the software breakpoint instruction (1 on x86/x64,
    /// since INT3 is a single 0xCC byte).
    fn breakpoint_size(&self) -> usize;

    /// Patch a word read from the tracee so that its first
    /// `breakpoint_size()` bytes become the breakpoint instruction, keeping
    /// the rest of the word intact. Used by the Breakpoint Engine when
    /// installing a software breakpoint.
    fn install_breakpoint(&self, word: u64) -> u64;

    /// If the bytes at `rip` encode a CALL instruction this architecture's
    /// `next` recognizes, return its length in bytes.
    fn is_call(&self, bytes: &[u8]) -> Option<usize>;

    /// Whether `byte` is one of the RET opcodes this architecture's
    /// step-mode `finish` recognizes.
    fn is_ret(&self, byte: u8) -> bool;

    /// Classify the 4-byte instruction window at `rip` as a preamble stage.
    fn preamble_state(&self, window: &[u8]) -> PreambleStage;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_size_matches_pointer_width() {
        assert_eq!(SupportedArch::X86.word_size(), 4);
        assert_eq!(SupportedArch::X64.word_size(), 8);
        assert_eq!(SupportedArch::Aarch64.word_size(), 8);
    }
}
