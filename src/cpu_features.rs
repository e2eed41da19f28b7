//! Global CPU-feature state.
//!
//! The FP register layout (legacy/AVX/AVX-512) is process-wide and
//! determined once, at startup, by probing `/proc/cpuinfo` for the
//! `avx512`/`avx`/`xsave` feature flags (spec §9 design note). We fail
//! fast if `xsave` is absent, since every layout this crate knows about
//! builds on the XSAVE area shape.
//!
//! The actual instruction-level feature detection (CPUID) is the external
//! collaborator the spec excludes from this crate's scope; `/proc/cpuinfo`
//! is the kernel-provided summary of that detection, and reading it keeps
//! this crate free of inline assembly.

use std::fs;

use lazy_static::lazy_static;

use crate::error::{DbgError, DbgResult};
use crate::fpregs::FpLayoutKind;

lazy_static! {
    static ref PROBED_LAYOUT: Option<FpLayoutKind> = probe_cpuinfo();
}

/// Returns the FP register layout this host's CPU uses, probing
/// `/proc/cpuinfo` exactly once and caching the result for the life of the
/// process. Fails fast if the host doesn't report `xsave` support, since
/// every layout this crate knows about builds on the XSAVE area shape.
pub fn fp_layout() -> DbgResult<FpLayoutKind> {
    PROBED_LAYOUT.ok_or_else(|| {
        DbgError::state("a CPU that reports xsave support", "no xsave flag in /proc/cpuinfo")
    })
}

fn probe_cpuinfo() -> Option<FpLayoutKind> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    classify_flags(&cpuinfo)
}

/// Split out for testability: `classify_flags` takes the raw `/proc/cpuinfo`
/// text so tests can exercise the classification without depending on the
/// host's actual CPU. Returns `None` when `xsave` is absent.
fn classify_flags(cpuinfo: &str) -> Option<FpLayoutKind> {
    let flags_line = cpuinfo
        .lines()
        .find(|l| l.trim_start().starts_with("flags") || l.trim_start().starts_with("Features"))
        .unwrap_or("");

    let has = |flag: &str| flags_line.split_whitespace().any(|f| f == flag);

    if !has("xsave") {
        return None;
    }

    Some(if has("avx512f") {
        FpLayoutKind::Avx512
    } else if has("avx") {
        FpLayoutKind::Avx
    } else {
        FpLayoutKind::Legacy
    })
}

/// Whether the probed `/proc/cpuinfo` text advertises `xsave` support.
pub fn has_xsave(cpuinfo: &str) -> bool {
    cpuinfo
        .lines()
        .find(|l| l.trim_start().starts_with("flags") || l.trim_start().starts_with("Features"))
        .map(|l| l.split_whitespace().any(|f| f == "xsave"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "processor\t: 0\nflags\t\t: fpu vme de pse tsc msr xsave\n";
    const AVX: &str = "processor\t: 0\nflags\t\t: fpu vme xsave avx\n";
    const AVX512: &str = "processor\t: 0\nflags\t\t: fpu vme xsave avx avx512f avx512dq\n";
    const NO_XSAVE: &str = "processor\t: 0\nflags\t\t: fpu vme de pse tsc msr\n";

    #[test]
    fn classifies_legacy_when_only_xsave_present() {
        assert_eq!(classify_flags(LEGACY), Some(FpLayoutKind::Legacy));
    }

    #[test]
    fn classifies_avx() {
        assert_eq!(classify_flags(AVX), Some(FpLayoutKind::Avx));
    }

    #[test]
    fn classifies_avx512_over_avx() {
        assert_eq!(classify_flags(AVX512), Some(FpLayoutKind::Avx512));
    }

    #[test]
    fn missing_xsave_is_detected() {
        assert!(!has_xsave(NO_XSAVE));
        assert!(has_xsave(LEGACY));
        assert_eq!(classify_flags(NO_XSAVE), None);
    }

    #[test]
    fn fp_layout_is_cached_across_calls() {
        let a = fp_layout();
        let b = fp_layout();
        match (a, b) {
            (Ok(x), Ok(y)) => assert_eq!(x, y),
            (Err(_), Err(_)) => {}
            _ => panic!("fp_layout should be consistent across calls"),
        }
    }
}
