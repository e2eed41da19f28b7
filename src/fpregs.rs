//! Floating-point / vector register layouts.
//!
//! The kernel exposes three shapes over `PTRACE_GETFPREGS` /
//! `PTRACE_GETREGSET(NT_X86_XSTATE)` depending on what the host CPU
//! supports, growing the same legacy `fxsave` area with extra trailing
//! state (spec §6):
//!
//! * Legacy (544 bytes): plain `fxsave` layout — x87 + xmm0-15.
//! * AVX (+32 bytes at offset 576): ymm0-15 high halves.
//! * AVX-512 (+ 512 bytes at offset 1152, + 1024 bytes at offset 1664):
//!   zmm0-15 high halves, then zmm16-31 in full.
//!
//! [`crate::cpu_features::fp_layout`] picks which of these a given host
//! uses; we don't re-probe per-thread since the layout is process-wide.

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum FpLayoutKind {
    Legacy,
    Avx,
    Avx512,
}

impl FpLayoutKind {
    /// Total byte size of the XSAVE-area region this layout covers.
    pub fn region_len(self) -> usize {
        match self {
            FpLayoutKind::Legacy => 544,
            FpLayoutKind::Avx => 576 + 32 * 16,
            FpLayoutKind::Avx512 => 1664 + 1024,
        }
    }
}

/// The legacy `fxsave` area: x87 control/status/tag words, MXCSR, ST/MM
/// registers, and xmm0-15. Byte-for-byte what `PTRACE_GETFPREGS` returns.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LegacyFpRegs {
    pub cwd: u16,
    pub swd: u16,
    pub ftw: u16,
    pub fop: u16,
    pub rip: u64,
    pub rdp: u64,
    pub mxcsr: u32,
    pub mxcr_mask: u32,
    pub st_space: [u32; 32],
    pub xmm_space: [u32; 64],
    pub padding: [u32; 24],
}

impl std::fmt::Debug for LegacyFpRegs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyFpRegs")
            .field("cwd", &self.cwd)
            .field("swd", &self.swd)
            .field("mxcsr", &self.mxcsr)
            .field("st_space", &"[u32; 32]")
            .field("xmm_space", &"[u32; 64]")
            .finish()
    }
}

/// Extra trailing state present once the host supports AVX: the high 128
/// bits of ymm0-15, living at XSAVE offset 576.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct AvxExtension {
    pub ymm_hi128: [u32; 64],
}

impl std::fmt::Debug for AvxExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvxExtension").field("ymm_hi128", &"[u32; 64]").finish()
    }
}

/// Extra trailing state on AVX-512 hosts: high halves of zmm0-15 at offset
/// 1152, and the full width of zmm16-31 at offset 1664.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Avx512Extension {
    pub zmm_hi256_0_15: [u32; 128],
    pub zmm_16_31: [u32; 256],
}

impl std::fmt::Debug for Avx512Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Avx512Extension")
            .field("zmm_hi256_0_15", &"[u32; 128]")
            .field("zmm_16_31", &"[u32; 256]")
            .finish()
    }
}

/// FP register bank, sized to whatever this host's layout requires.
#[derive(Copy, Clone, Debug)]
pub enum FpRegs {
    Legacy(LegacyFpRegs),
    Avx(LegacyFpRegs, AvxExtension),
    Avx512(LegacyFpRegs, AvxExtension, Avx512Extension),
}

impl FpRegs {
    pub fn layout(&self) -> FpLayoutKind {
        match self {
            FpRegs::Legacy(_) => FpLayoutKind::Legacy,
            FpRegs::Avx(..) => FpLayoutKind::Avx,
            FpRegs::Avx512(..) => FpLayoutKind::Avx512,
        }
    }

    pub fn legacy(&self) -> &LegacyFpRegs {
        match self {
            FpRegs::Legacy(l) | FpRegs::Avx(l, _) | FpRegs::Avx512(l, _, _) => l,
        }
    }

    pub fn legacy_mut(&mut self) -> &mut LegacyFpRegs {
        match self {
            FpRegs::Legacy(l) | FpRegs::Avx(l, _) | FpRegs::Avx512(l, _, _) => l,
        }
    }

    /// xmm register `n` (0-15) as raw bytes, reading from whichever part of
    /// the layout holds it.
    pub fn xmm(&self, n: usize) -> [u8; 16] {
        let words = &self.legacy().xmm_space[n * 4..n * 4 + 4];
        let mut out = [0u8; 16];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_ne_bytes());
        }
        out
    }
}
