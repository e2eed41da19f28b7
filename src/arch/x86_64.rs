//! x86_64 capability implementation: CALL/RET decode, breakpoint patching,
//! preamble classification. Grounded on spec §4.4 (next/finish opcode
//! tables) and spec §6 (breakpoint instruction, CALL/RET opcodes).

use super::{Architecture, PreambleStage, SupportedArch};

pub struct X86_64;

impl Architecture for X86_64 {
    fn arch(&self) -> SupportedArch {
        SupportedArch::X64
    }

    fn breakpoint_size(&self) -> usize {
        1
    }

    fn install_breakpoint(&self, word: u64) -> u64 {
        (word & !0xFFu64) | 0xCC
    }

    fn is_call(&self, bytes: &[u8]) -> Option<usize> {
        let mut i = 0;
        // Tolerate a single REX prefix ahead of the opcode (e.g. `call r8`
        // needs REX.B to select an extended base register for the
        // indirect form). Other legacy prefixes are not handled, matching
        // the literal opcode tables in the spec.
        if bytes.first().is_some_and(|&b| (0x40..=0x4f).contains(&b)) {
            i += 1;
        }
        match bytes.get(i)? {
            0xE8 => Some(i + 5),
            0xFF => {
                let modrm = *bytes.get(i + 1)?;
                if (modrm >> 3) & 0x7 != 2 {
                    return None;
                }
                Some(i + 1 + modrm_trailer_len(&bytes[i + 1..]))
            }
            _ => None,
        }
    }

    fn is_ret(&self, byte: u8) -> bool {
        matches!(byte, 0xC3 | 0xCB | 0xC2 | 0xCA)
    }

    fn preamble_state(&self, window: &[u8]) -> PreambleStage {
        if window.contains(&0x55) {
            PreambleStage::BeforePush
        } else if window.windows(2).any(|w| w == [0x89, 0xE5]) {
            PreambleStage::AfterPushBeforeMov
        } else {
            PreambleStage::NotInPreamble
        }
    }
}

/// Length, in bytes, of the ModR/M (+ optional SIB, + optional
/// displacement) trailer of an `FF /2` indirect call, given `bytes`
/// starting at the ModR/M byte. Does not include the `FF` opcode byte
/// itself.
fn modrm_trailer_len(bytes: &[u8]) -> usize {
    let modrm = bytes[0];
    let md = modrm >> 6;
    let rm = modrm & 0x7;

    let has_sib = md != 0b11 && rm == 0b100;
    let mut len = 1 + if has_sib { 1 } else { 0 };

    let disp_len = match md {
        0b00 => {
            if rm == 0b101 {
                4
            } else if has_sib {
                let sib = bytes[1];
                let base = sib & 0x7;
                if base == 0b101 {
                    4
                } else {
                    0
                }
            } else {
                0
            }
        }
        0b01 => 1,
        0b10 => 4,
        _ => 0,
    };
    len += disp_len;
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_direct_call() {
        let bytes = [0xE8, 0x01, 0x02, 0x03, 0x04, 0x90];
        assert_eq!(X86_64.is_call(&bytes), Some(5));
    }

    #[test]
    fn recognizes_indirect_call_register_direct() {
        // call rax -> FF D0 (modrm = 11 010 000)
        let bytes = [0xFF, 0xD0, 0x90];
        assert_eq!(X86_64.is_call(&bytes), Some(2));
    }

    #[test]
    fn recognizes_indirect_call_through_memory_disp8() {
        // call [rax + 0x10] -> FF 50 10 (modrm = 01 010 000)
        let bytes = [0xFF, 0x50, 0x10, 0x90];
        assert_eq!(X86_64.is_call(&bytes), Some(3));
    }

    #[test]
    fn recognizes_indirect_call_with_sib() {
        // call [rax + rbx*1] -> FF 14 18 (modrm=00 010 100, sib=00 011 000)
        let bytes = [0xFF, 0x14, 0x18, 0x90];
        assert_eq!(X86_64.is_call(&bytes), Some(3));
    }

    #[test]
    fn rejects_non_call_ff_opcode() {
        // FF /0 is INC r/m -> not a call
        let bytes = [0xFF, 0xC0];
        assert_eq!(X86_64.is_call(&bytes), None);
    }

    #[test]
    fn rejects_unrelated_opcode() {
        let bytes = [0x90, 0x90];
        assert_eq!(X86_64.is_call(&bytes), None);
    }

    #[test]
    fn recognizes_all_ret_variants() {
        assert!(X86_64.is_ret(0xC3));
        assert!(X86_64.is_ret(0xCB));
        assert!(X86_64.is_ret(0xC2));
        assert!(X86_64.is_ret(0xCA));
        assert!(!X86_64.is_ret(0x90));
    }

    #[test]
    fn breakpoint_patch_keeps_upper_bytes() {
        let original = 0x1122_3344_5566_7788u64;
        let patched = X86_64.install_breakpoint(original);
        assert_eq!(patched & 0xFF, 0xCC);
        assert_eq!(patched & !0xFFu64, original & !0xFFu64);
    }

    #[test]
    fn preamble_stage_push_rbp() {
        // push rbp ; mov rbp, rsp ; ...
        let window = [0x55, 0x48, 0x89, 0xE5];
        assert_eq!(X86_64.preamble_state(&window), PreambleStage::BeforePush);
    }

    #[test]
    fn preamble_stage_mov_rbp_rsp() {
        let window = [0x48, 0x89, 0xE5, 0x90];
        assert_eq!(
            X86_64.preamble_state(&window),
            PreambleStage::AfterPushBeforeMov
        );
    }

    #[test]
    fn preamble_stage_none() {
        let window = [0x90, 0x90, 0x90, 0x90];
        assert_eq!(X86_64.preamble_state(&window), PreambleStage::NotInPreamble);
    }
}
