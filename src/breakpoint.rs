//! Breakpoint Engine: software breakpoints via INT3 patching and hardware
//! breakpoints via the x86 debug registers (spec §4.2).
//!
//! Software breakpoint install/remove is grounded on the `deet` Inferior's
//! `write_byte`/`install_breakpoint` word-patch dance; hardware breakpoints
//! have no equivalent in the retrieved examples and follow the spec's DR0-3
//! + DR7 description directly.

use std::collections::BTreeMap;

use crate::arch::Architecture;
use crate::error::{DbgError, DbgResult};
use crate::ptrace_gateway::{debugreg_offset, PtraceGateway};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    Software,
    Hardware,
}

#[derive(Clone, Debug)]
pub struct Breakpoint {
    pub addr: u64,
    pub kind: BreakpointKind,
    pub enabled: bool,
    pub hit_count: u64,
    /// Original word read back at install time, for software breakpoints;
    /// `None` for hardware breakpoints (nothing in memory is patched).
    original_word: Option<u64>,
    /// Debug-register slot (0-3) this hardware breakpoint occupies.
    slot: Option<usize>,
}

impl Breakpoint {
    pub fn is_hit_on(&self, addr: u64) -> bool {
        self.enabled && self.addr == addr
    }
}

const DR7_OFFSET_INDEX: usize = 7;

/// Owns every breakpoint set on a tracee and the debug-register slot
/// bookkeeping for hardware breakpoints. One instance per tracee process
/// (shared by every thread, since DR0-3 are per-thread in the kernel but
/// this crate always writes the same value to every thread when arming).
pub struct BreakpointEngine {
    breakpoints: BTreeMap<u64, Breakpoint>,
    /// Which of the 4 hardware slots are occupied, indexed by slot number.
    hw_slots: [Option<u64>; 4],
}

impl Default for BreakpointEngine {
    fn default() -> Self {
        BreakpointEngine {
            breakpoints: BTreeMap::new(),
            hw_slots: [None; 4],
        }
    }
}

impl BreakpointEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints.values()
    }

    pub fn hit_on(&mut self, addr: u64) -> Option<&mut Breakpoint> {
        let bp = self.breakpoints.get_mut(&addr)?;
        if bp.is_hit_on(addr) {
            bp.hit_count += 1;
            Some(bp)
        } else {
            None
        }
    }

    /// Installs a software breakpoint at `addr`: reads the word currently
    /// there, patches its low byte(s) to the architecture's breakpoint
    /// instruction, and writes it back.
    pub fn place_software(
        &mut self,
        gateway: &PtraceGateway,
        arch: &dyn Architecture,
        addr: u64,
    ) -> DbgResult<()> {
        let aligned = align_down(addr, arch);
        let original_word = gateway.peek_data(aligned)?;
        gateway.poke_data(aligned, patched_word(arch, addr, aligned, original_word))?;

        self.breakpoints.insert(
            addr,
            Breakpoint {
                addr,
                kind: BreakpointKind::Software,
                enabled: true,
                hit_count: 0,
                original_word: Some(original_word),
                slot: None,
            },
        );
        Ok(())
    }

    /// Removes a software breakpoint entirely, restoring the original word.
    pub fn remove_software(&mut self, gateway: &PtraceGateway, arch: &dyn Architecture, addr: u64) -> DbgResult<()> {
        let bp = self
            .breakpoints
            .remove(&addr)
            .ok_or_else(|| DbgError::state("an installed breakpoint", "none at this address"))?;
        if bp.enabled {
            if let Some(original) = bp.original_word {
                gateway.poke_data(align_down(addr, arch), original)?;
            }
        }
        Ok(())
    }

    /// Arms a hardware breakpoint in the next free DR0-3 slot, enabling it
    /// (local scope, execute-only) in DR7. Fails with
    /// [`DbgError::NoDebugSlots`] once all four slots are in use.
    pub fn place_hardware(&mut self, gateway: &PtraceGateway, addr: u64) -> DbgResult<()> {
        let slot = self
            .hw_slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(DbgError::NoDebugSlots)?;

        gateway.poke_user(debugreg_offset(slot), addr)?;

        let mut dr7 = gateway.peek_user(debugreg_offset(DR7_OFFSET_INDEX))?;
        // Local-enable bit for this slot is bit (2*slot); condition/length
        // bits for execute-only, 1-byte length are left zero.
        dr7 |= 1 << (slot * 2);
        gateway.poke_user(debugreg_offset(DR7_OFFSET_INDEX), dr7)?;

        self.hw_slots[slot] = Some(addr);
        self.breakpoints.insert(
            addr,
            Breakpoint {
                addr,
                kind: BreakpointKind::Hardware,
                enabled: true,
                hit_count: 0,
                original_word: None,
                slot: Some(slot),
            },
        );
        Ok(())
    }

    pub fn remove_hardware(&mut self, gateway: &PtraceGateway, addr: u64) -> DbgResult<()> {
        let bp = self
            .breakpoints
            .remove(&addr)
            .ok_or_else(|| DbgError::state("an installed breakpoint", "none at this address"))?;
        let slot = bp
            .slot
            .ok_or_else(|| DbgError::state("a hardware breakpoint", "software breakpoint"))?;

        let mut dr7 = gateway.peek_user(debugreg_offset(DR7_OFFSET_INDEX))?;
        dr7 &= !(1 << (slot * 2));
        gateway.poke_user(debugreg_offset(DR7_OFFSET_INDEX), dr7)?;
        gateway.poke_user(debugreg_offset(slot), 0)?;

        self.hw_slots[slot] = None;
        Ok(())
    }

    /// Disables a breakpoint in place: for a software breakpoint this
    /// restores the original word in tracee memory (so a disabled
    /// breakpoint no longer traps), for a hardware breakpoint it clears the
    /// slot's DR7 local-enable bit without freeing the slot. The bookkeeping
    /// entry (and, for software, the remembered original word) is kept so
    /// `enable` can re-arm it without re-reading memory.
    pub fn disable(&mut self, gateway: &PtraceGateway, arch: &dyn Architecture, addr: u64) -> DbgResult<()> {
        let bp = self
            .breakpoints
            .get(&addr)
            .ok_or_else(|| DbgError::state("an installed breakpoint", "none at this address"))?;
        if !bp.enabled {
            return Ok(());
        }
        match bp.kind {
            BreakpointKind::Software => {
                if let Some(original) = bp.original_word {
                    gateway.poke_data(align_down(addr, arch), original)?;
                }
            }
            BreakpointKind::Hardware => {
                let slot = bp
                    .slot
                    .ok_or_else(|| DbgError::state("a hardware breakpoint slot", "none recorded"))?;
                let mut dr7 = gateway.peek_user(debugreg_offset(DR7_OFFSET_INDEX))?;
                dr7 &= !(1 << (slot * 2));
                gateway.poke_user(debugreg_offset(DR7_OFFSET_INDEX), dr7)?;
            }
        }
        self.breakpoints.get_mut(&addr).unwrap().enabled = false;
        Ok(())
    }

    /// Re-arms a previously disabled breakpoint: re-patches the INT3 byte
    /// for software breakpoints, or re-sets the DR7 local-enable bit for
    /// hardware breakpoints.
    pub fn enable(&mut self, gateway: &PtraceGateway, arch: &dyn Architecture, addr: u64) -> DbgResult<()> {
        let bp = self
            .breakpoints
            .get(&addr)
            .ok_or_else(|| DbgError::state("an installed breakpoint", "none at this address"))?;
        if bp.enabled {
            return Ok(());
        }
        match bp.kind {
            BreakpointKind::Software => {
                let original = bp
                    .original_word
                    .ok_or_else(|| DbgError::state("a remembered original word", "none recorded"))?;
                let aligned = align_down(addr, arch);
                gateway.poke_data(aligned, patched_word(arch, addr, aligned, original))?;
            }
            BreakpointKind::Hardware => {
                let slot = bp
                    .slot
                    .ok_or_else(|| DbgError::state("a hardware breakpoint slot", "none recorded"))?;
                let mut dr7 = gateway.peek_user(debugreg_offset(DR7_OFFSET_INDEX))?;
                dr7 |= 1 << (slot * 2);
                gateway.poke_user(debugreg_offset(DR7_OFFSET_INDEX), dr7)?;
            }
        }
        self.breakpoints.get_mut(&addr).unwrap().enabled = true;
        Ok(())
    }

    /// Original byte(s) at `addr`, used by the stepping engine when it
    /// needs to single-step *through* a breakpointed instruction (restore,
    /// step, re-arm).
    pub fn original_word(&self, addr: u64) -> Option<u64> {
        self.breakpoints.get(&addr).and_then(|b| b.original_word)
    }
}

fn align_down(addr: u64, arch: &dyn Architecture) -> u64 {
    let word_size = arch.word_size() as u64;
    addr - (addr % word_size)
}

/// Computes the word to write at `aligned` so that `addr` holds the
/// architecture's breakpoint instruction, given the word's original
/// (unpatched) contents.
fn patched_word(arch: &dyn Architecture, addr: u64, aligned: u64, original_word: u64) -> u64 {
    let offset = addr - aligned;
    let shift = offset * 8;
    let patched_region = arch.install_breakpoint(original_word >> shift) << shift;
    let mask = !(word_mask(arch.breakpoint_size()) << shift);
    (original_word & mask) | patched_region
}

fn word_mask(size_bytes: usize) -> u64 {
    if size_bytes >= 8 {
        u64::MAX
    } else {
        (1u64 << (size_bytes * 8)) - 1
    }
}
