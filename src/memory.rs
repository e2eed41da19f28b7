//! Memory View: address-indexed access to a tracee's memory, built on top
//! of word-aligned `PTRACE_PEEKDATA`/`PTRACE_POKEDATA` reads coalesced into
//! arbitrary byte ranges (spec §4 Memory View).
//!
//! Word-at-a-time peek/poke is the only way ptrace exposes memory (short of
//! `/proc/<pid>/mem`, which this crate doesn't use so that every memory
//! access goes through the same gateway as register/control operations);
//! `read`/`write` here handle the alignment and partial-word bookkeeping,
//! following the same read-modify-write shape the breakpoint engine uses
//! to patch a single byte inside a word.

use crate::error::DbgResult;
use crate::ptrace_gateway::PtraceGateway;

pub struct MemoryView<'a> {
    gateway: &'a PtraceGateway,
    word_size: usize,
}

impl<'a> MemoryView<'a> {
    pub fn new(gateway: &'a PtraceGateway, word_size: usize) -> Self {
        MemoryView { gateway, word_size }
    }

    /// Reads `len` bytes starting at `addr`, coalescing as many
    /// word-aligned peeks as needed.
    pub fn read(&self, addr: u64, len: usize) -> DbgResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let word_size = self.word_size as u64;
        let start_aligned = addr - (addr % word_size);
        let end = addr + len as u64;
        let end_aligned = end.div_ceil(word_size) * word_size;

        let mut raw = Vec::with_capacity((end_aligned - start_aligned) as usize);
        let mut cursor = start_aligned;
        while cursor < end_aligned {
            let word = self.gateway.peek_data(cursor)?;
            raw.extend_from_slice(&word.to_ne_bytes()[..self.word_size]);
            cursor += word_size;
        }

        let skip = (addr - start_aligned) as usize;
        Ok(raw[skip..skip + len].to_vec())
    }

    /// Writes `data` at `addr`, read-modify-writing the boundary words so
    /// unrelated bytes sharing a word with the start/end of `data` survive.
    pub fn write(&self, addr: u64, data: &[u8]) -> DbgResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let word_size = self.word_size;
        let word_size_u64 = word_size as u64;
        let start_aligned = addr - (addr % word_size_u64);
        let end = addr + data.len() as u64;
        let end_aligned = end.div_ceil(word_size_u64) * word_size_u64;

        let mut buf = self.read(start_aligned, (end_aligned - start_aligned) as usize)?;
        let offset = (addr - start_aligned) as usize;
        buf[offset..offset + data.len()].copy_from_slice(data);

        let mut cursor = start_aligned;
        for chunk in buf.chunks(word_size) {
            let mut word_bytes = [0u8; 8];
            word_bytes[..word_size].copy_from_slice(chunk);
            self.gateway.poke_data(cursor, u64::from_ne_bytes(word_bytes))?;
            cursor += word_size_u64;
        }
        Ok(())
    }

    /// Reads a single pointer-width word at `addr`.
    pub fn read_word(&self, addr: u64) -> DbgResult<u64> {
        let bytes = self.read(addr, self.word_size)?;
        let mut word_bytes = [0u8; 8];
        word_bytes[..self.word_size].copy_from_slice(&bytes);
        Ok(u64::from_ne_bytes(word_bytes))
    }
}
