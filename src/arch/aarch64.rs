//! aarch64 register-shape hook.
//!
//! Full aarch64 support (stepping, unwinding, CALL/RET decode) is out of
//! scope for this crate; this module exists only so that [`SupportedArch`]
//! and the Register View have somewhere to route aarch64 targets, per the
//! spec's "hooks for i386/aarch64 register shapes" framing. `is_call` and
//! `is_ret` intentionally report "not recognized" rather than guessing at
//! AArch64 `BL`/`RET` encodings, which are fixed-width 32-bit instructions
//! and don't fit the byte-prefix model `next`/`finish` use here.

use super::{Architecture, PreambleStage, SupportedArch};

pub struct Aarch64Arch;

impl Architecture for Aarch64Arch {
    fn arch(&self) -> SupportedArch {
        SupportedArch::Aarch64
    }

    fn breakpoint_size(&self) -> usize {
        4
    }

    fn install_breakpoint(&self, word: u64) -> u64 {
        // BRK #0 = 0xD4200000, little-endian in the low 4 bytes.
        (word & !0xFFFF_FFFFu64) | 0xD420_0000
    }

    fn is_call(&self, _bytes: &[u8]) -> Option<usize> {
        None
    }

    fn is_ret(&self, _byte: u8) -> bool {
        false
    }

    fn preamble_state(&self, _window: &[u8]) -> PreambleStage {
        PreambleStage::NotInPreamble
    }
}
