//! VMAP provider: parses `/proc/<pid>/maps` into the mapping ranges the
//! Stack Unwinder uses to decide whether a candidate return address lands
//! inside executable code (spec §4.3, grounded on the Python unwinder's
//! `vmaps` containment check).

use std::fs;
use std::ops::Range;

use nix::unistd::Pid;

use crate::error::{DbgError, DbgResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub range: Range<u64>,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub private: bool,
    pub offset: u64,
    pub path: Option<String>,
}

impl MapEntry {
    pub fn contains(&self, addr: u64) -> bool {
        self.range.contains(&addr)
    }
}

/// Snapshot of a tracee's memory map, re-read on demand (maps change as the
/// tracee mmaps/munmaps, so this is never cached across a resume).
#[derive(Clone, Debug, Default)]
pub struct VmapTable {
    entries: Vec<MapEntry>,
}

impl VmapTable {
    pub fn load(pid: Pid) -> DbgResult<VmapTable> {
        let text = fs::read_to_string(format!("/proc/{pid}/maps"))
            .map_err(|_| DbgError::state("readable /proc/<pid>/maps", "process gone"))?;
        Ok(VmapTable::parse(&text))
    }

    fn parse(text: &str) -> VmapTable {
        let entries = text.lines().filter_map(parse_line).collect();
        VmapTable { entries }
    }

    /// Whether `addr` falls inside any mapped region at all.
    pub fn contains(&self, addr: u64) -> bool {
        self.entries.iter().any(|e| e.contains(addr))
    }

    /// Whether `addr` falls inside an executable mapping — used to sanity
    /// check a candidate return address during unwinding.
    pub fn is_executable(&self, addr: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.executable && e.contains(addr))
    }

    pub fn entry_for(&self, addr: u64) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.contains(addr))
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }
}

fn parse_line(line: &str) -> Option<MapEntry> {
    // Format: "start-end perms offset dev inode  path"
    let mut fields = line.splitn(6, ' ').filter(|f| !f.is_empty());
    let addr_range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let (start, end) = addr_range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let mut perm_chars = perms.chars();
    let readable = perm_chars.next() == Some('r');
    let writable = perm_chars.next() == Some('w');
    let executable = perm_chars.next() == Some('x');
    let private = perm_chars.next() == Some('p');

    Some(MapEntry {
        range: start..end,
        readable,
        writable,
        executable,
        private,
        offset,
        path,
    })
}
