//! Builds a tiny, hand-assembled static x86_64 ELF executable at test time,
//! so the end-to-end scenarios below have a real tracee with known code
//! addresses without depending on an external fixture binary or invoking
//! any compiler.
//!
//! Layout: one PT_LOAD segment covering the whole file, mapped at
//! `BASE_VADDR`. The code is:
//!
//! ```text
//! _start:
//!     call relative foo       ; e8 xx xx xx xx
//!     mov  eax, 60            ; b8 3c 00 00 00     (SYS_exit)
//!     mov  edi, 42            ; bf 2a 00 00 00     (exit code)
//!     syscall                 ; 0f 05
//! foo:
//!     push rbp                ; 55
//!     mov  rbp, rsp           ; 48 89 e5
//!     mov  eax, 7             ; b8 07 00 00 00
//!     pop  rbp                ; 5d
//!     ret                     ; c3
//! ```

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;

pub const BASE_VADDR: u64 = 0x0040_0000;
const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;
const CODE_OFFSET: u64 = EHDR_SIZE + PHDR_SIZE;

pub struct FixtureLayout {
    pub entry: u64,
    pub foo_addr: u64,
    pub call_instr_addr: u64,
    pub fallthrough_addr: u64,
}

fn code_bytes() -> (Vec<u8>, FixtureLayout) {
    let mut code = Vec::new();

    let start_addr = BASE_VADDR + CODE_OFFSET;
    let call_instr_addr = start_addr;

    // `call foo` — rel32 filled in once `foo`'s address is known below.
    code.push(0xE8);
    code.extend_from_slice(&[0, 0, 0, 0]);
    let fallthrough_addr = start_addr + code.len() as u64;

    code.push(0xB8); // mov eax, 60
    code.extend_from_slice(&60u32.to_le_bytes());
    code.push(0xBF); // mov edi, 42
    code.extend_from_slice(&42u32.to_le_bytes());
    code.extend_from_slice(&[0x0F, 0x05]); // syscall

    let foo_addr = start_addr + code.len() as u64;
    code.push(0x55); // push rbp
    code.extend_from_slice(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
    code.push(0xB8); // mov eax, 7
    code.extend_from_slice(&7u32.to_le_bytes());
    code.push(0x5D); // pop rbp
    code.push(0xC3); // ret

    let rel32 = (foo_addr as i64 - (call_instr_addr as i64 + 5)) as i32;
    code[1..5].copy_from_slice(&rel32.to_le_bytes());

    (
        code,
        FixtureLayout {
            entry: start_addr,
            foo_addr,
            call_instr_addr,
            fallthrough_addr,
        },
    )
}

fn elf_header(entry: u64, filesz: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(EHDR_SIZE as usize);
    h.extend_from_slice(b"\x7fELF");
    h.push(2); // ELFCLASS64
    h.push(1); // ELFDATA2LSB
    h.push(1); // EI_VERSION
    h.push(0); // ELFOSABI_SYSV
    h.extend_from_slice(&[0u8; 8]); // padding
    h.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    h.extend_from_slice(&0x3Eu16.to_le_bytes()); // e_machine = EM_X86_64
    h.extend_from_slice(&1u32.to_le_bytes()); // e_version
    h.extend_from_slice(&entry.to_le_bytes()); // e_entry
    h.extend_from_slice(&EHDR_SIZE.to_le_bytes()); // e_phoff
    h.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    h.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    h.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    h.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes()); // e_phentsize
    h.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    h.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    h.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    h.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    debug_assert_eq!(h.len() as u64, EHDR_SIZE);

    let mut ph = Vec::with_capacity(PHDR_SIZE as usize);
    ph.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    ph.extend_from_slice(&7u32.to_le_bytes()); // p_flags = R+W+X
    ph.extend_from_slice(&0u64.to_le_bytes()); // p_offset
    ph.extend_from_slice(&BASE_VADDR.to_le_bytes()); // p_vaddr
    ph.extend_from_slice(&BASE_VADDR.to_le_bytes()); // p_paddr
    ph.extend_from_slice(&filesz.to_le_bytes()); // p_filesz
    ph.extend_from_slice(&filesz.to_le_bytes()); // p_memsz
    ph.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
    debug_assert_eq!(ph.len() as u64, PHDR_SIZE);

    h.extend(ph);
    h
}

/// Writes the fixture binary to a fresh temp file, marks it executable,
/// and returns the open handle (kept alive so the path stays valid) along
/// with the addresses of interest.
pub fn build() -> (tempfile::NamedTempFile, FixtureLayout) {
    let (code, layout) = code_bytes();
    let total_len = CODE_OFFSET + code.len() as u64;
    let mut bytes = elf_header(layout.entry, total_len);
    bytes.extend(code);

    let mut file = tempfile::NamedTempFile::new().expect("create temp fixture file");
    file.write_all(&bytes).expect("write fixture bytes");
    file.flush().expect("flush fixture file");

    let mut perms = fs::metadata(file.path()).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(file.path(), perms).expect("chmod fixture executable");

    (file, layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_addresses_are_monotonic_and_within_code() {
        let (_file, layout) = build();
        assert!(layout.call_instr_addr < layout.fallthrough_addr);
        assert!(layout.fallthrough_addr < layout.foo_addr);
        assert_eq!(layout.entry, layout.call_instr_addr);
    }
}
