//! i386 capability implementation.
//!
//! Register shapes are 32-bit analogues of the x86_64 ones (spec §4.3:
//! "analogous on i386 with 32-bit reads"); the CALL/RET opcodes and
//! breakpoint instruction are identical to x86_64 since both are members
//! of the same instruction set family.

use super::{Architecture, PreambleStage, SupportedArch};

pub struct I386;

impl Architecture for I386 {
    fn arch(&self) -> SupportedArch {
        SupportedArch::X86
    }

    fn breakpoint_size(&self) -> usize {
        1
    }

    fn install_breakpoint(&self, word: u64) -> u64 {
        (word & !0xFFu64) | 0xCC
    }

    fn is_call(&self, bytes: &[u8]) -> Option<usize> {
        match bytes.first()? {
            0xE8 => Some(5),
            0xFF => {
                let modrm = *bytes.get(1)?;
                if (modrm >> 3) & 0x7 != 2 {
                    return None;
                }
                // 32-bit addressing uses the same ModR/M/SIB/disp shape as
                // long mode, minus RIP-relative addressing (mod=00, rm=101
                // is still disp32 in 32-bit mode, just absolute instead of
                // RIP-relative).
                let md = modrm >> 6;
                let rm = modrm & 0x7;
                let has_sib = md != 0b11 && rm == 0b100;
                let mut len = 2 + if has_sib { 1 } else { 0 };
                len += match md {
                    0b00 if rm == 0b101 => 4,
                    0b00 => 0,
                    0b01 => 1,
                    0b10 => 4,
                    _ => 0,
                };
                Some(len)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_call_is_five_bytes() {
        assert_eq!(I386.is_call(&[0xE8, 0, 0, 0, 0]), Some(5));
    }

    #[test]
    fn word_size_is_four() {
        assert_eq!(I386.word_size(), 4);
    }
}
