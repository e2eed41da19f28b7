//! Ptrace Gateway: the only module that calls into `nix::sys::ptrace`
//! directly. Everything above this layer (Breakpoint Engine, Stepping
//! Engine, Control Loop) goes through here, so the raw `PTRACE_*` request
//! surface stays in one place (spec §4.1).
//!
//! Grounded on the `deet` `Inferior` wrapper's use of `ptrace::read` /
//! `ptrace::write` / `ptrace::getregs` / `ptrace::cont` / `ptrace::step`.

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{DbgError, DbgResult};
use crate::fpregs::{Avx512Extension, AvxExtension, FpLayoutKind, FpRegs, LegacyFpRegs};
use crate::registers::{GpRegsX86_64, Registers};

/// Offset, in the kernel's `user` struct, of `u_debugreg[n]`, used by
/// `PTRACE_PEEKUSER`/`PTRACE_POKEUSER` to read/write the x86 debug
/// registers (DR0-DR7) that back hardware breakpoints.
pub fn debugreg_offset(n: usize) -> u64 {
    // offsetof(struct user, u_debugreg) on x86_64 is 848.
    const U_DEBUGREG_OFFSET: u64 = 848;
    U_DEBUGREG_OFFSET + (n as u64) * 8
}

#[derive(Clone, Copy, Debug)]
pub struct PtraceGateway {
    pid: Pid,
}

impl PtraceGateway {
    pub fn new(pid: Pid) -> PtraceGateway {
        PtraceGateway { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn attach(&self) -> DbgResult<()> {
        ptrace::attach(self.pid).map_err(DbgError::from)
    }

    pub fn detach(&self, signal: Option<Signal>) -> DbgResult<()> {
        ptrace::detach(self.pid, signal).map_err(DbgError::from)
    }

    pub fn set_options(&self, options: ptrace::Options) -> DbgResult<()> {
        ptrace::setoptions(self.pid, options).map_err(DbgError::from)
    }

    pub fn peek_data(&self, addr: u64) -> DbgResult<u64> {
        ptrace::read(self.pid, addr as ptrace::AddressType)
            .map(|w| w as u64)
            .map_err(DbgError::from)
    }

    pub fn poke_data(&self, addr: u64, word: u64) -> DbgResult<()> {
        unsafe {
            ptrace::write(
                self.pid,
                addr as ptrace::AddressType,
                word as *mut std::ffi::c_void,
            )
            .map_err(DbgError::from)
        }
    }

    /// `nix` doesn't wrap `PTRACE_PEEKUSER`/`PTRACE_POKEUSER` (they're rarely
    /// needed outside debug-register access), so these two go straight to
    /// `libc::ptrace`, clearing `errno` first since `PEEKUSER` overloads a
    /// `-1` return with "no error" (the same ambiguity `PEEKDATA` has).
    pub fn peek_user(&self, offset: u64) -> DbgResult<u64> {
        nix::errno::Errno::clear();
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.pid.as_raw(),
                offset as *mut libc::c_void,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if ret == -1 {
            let errno = nix::errno::Errno::last();
            if errno != nix::errno::Errno::UnknownErrno {
                return Err(DbgError::from(errno));
            }
        }
        Ok(ret as u64)
    }

    pub fn poke_user(&self, offset: u64, value: u64) -> DbgResult<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEUSER,
                self.pid.as_raw(),
                offset as *mut libc::c_void,
                value as *mut libc::c_void,
            )
        };
        if ret == -1 {
            return Err(DbgError::from(nix::errno::Errno::last()));
        }
        Ok(())
    }

    pub fn get_regs(&self) -> DbgResult<Registers> {
        let raw = ptrace::getregs(self.pid).map_err(DbgError::from)?;
        Ok(Registers::X64(GpRegsX86_64 {
            r15: raw.r15,
            r14: raw.r14,
            r13: raw.r13,
            r12: raw.r12,
            rbp: raw.rbp,
            rbx: raw.rbx,
            r11: raw.r11,
            r10: raw.r10,
            r9: raw.r9,
            r8: raw.r8,
            rax: raw.rax,
            rcx: raw.rcx,
            rdx: raw.rdx,
            rsi: raw.rsi,
            rdi: raw.rdi,
            orig_rax: raw.orig_rax,
            rip: raw.rip,
            cs: raw.cs,
            eflags: raw.eflags,
            rsp: raw.rsp,
            ss: raw.ss,
            fs_base: raw.fs_base,
            gs_base: raw.gs_base,
            ds: raw.ds,
            es: raw.es,
            fs: raw.fs,
            gs: raw.gs,
        }))
    }

    pub fn set_regs(&self, regs: &Registers) -> DbgResult<()> {
        let r = regs
            .as_x64()
            .ok_or_else(|| DbgError::state("x86_64 register bank", "other architecture"))?;
        let raw = libc::user_regs_struct {
            r15: r.r15,
            r14: r.r14,
            r13: r.r13,
            r12: r.r12,
            rbp: r.rbp,
            rbx: r.rbx,
            r11: r.r11,
            r10: r.r10,
            r9: r.r9,
            r8: r.r8,
            rax: r.rax,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            orig_rax: r.orig_rax,
            rip: r.rip,
            cs: r.cs,
            eflags: r.eflags,
            rsp: r.rsp,
            ss: r.ss,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
        };
        ptrace::setregs(self.pid, raw).map_err(DbgError::from)
    }

    pub fn single_step(&self, signal: Option<Signal>) -> DbgResult<()> {
        ptrace::step(self.pid, signal).map_err(DbgError::from)
    }

    pub fn cont(&self, signal: Option<Signal>) -> DbgResult<()> {
        ptrace::cont(self.pid, signal).map_err(DbgError::from)
    }

    pub fn get_event_msg(&self) -> DbgResult<u64> {
        ptrace::getevent(self.pid)
            .map(|v| v as u64)
            .map_err(DbgError::from)
    }

    /// Blocks until any tracee task changes state. A multi-threaded tracee
    /// has a task per thread (spec §5), each separately waitable, so this
    /// waits on `-1` (any child of this tracer) rather than the single tid
    /// the gateway was constructed with; `__WALL` additionally picks up
    /// clone-created tasks that aren't ordinary `wait()`-visible children.
    /// Translates the kernel's `waitpid` status into our own [`WaitOutcome`].
    pub fn wait(&self) -> DbgResult<WaitOutcome> {
        let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)).map_err(DbgError::from)?;
        Ok(WaitOutcome::from_status(status))
    }

    /// Reads the floating-point/vector register bank, shaped per `layout`
    /// (from [`crate::cpu_features::fp_layout`]): legacy hosts go through
    /// `PTRACE_GETFPREGS`, AVX/AVX-512 hosts through
    /// `PTRACE_GETREGSET(NT_X86_XSTATE)`.
    pub fn get_fp_regs(&self, layout: FpLayoutKind) -> DbgResult<FpRegs> {
        match layout {
            FpLayoutKind::Legacy => {
                let mut raw: LegacyFpRegs = unsafe { std::mem::zeroed() };
                let ret = unsafe {
                    libc::ptrace(
                        libc::PTRACE_GETFPREGS,
                        self.pid.as_raw(),
                        std::ptr::null_mut::<libc::c_void>(),
                        &mut raw as *mut LegacyFpRegs as *mut libc::c_void,
                    )
                };
                if ret == -1 {
                    return Err(DbgError::from(nix::errno::Errno::last()));
                }
                Ok(FpRegs::Legacy(raw))
            }
            FpLayoutKind::Avx | FpLayoutKind::Avx512 => {
                let mut buf = vec![0u8; layout.region_len()];
                let mut iov = libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                };
                let ret = unsafe {
                    libc::ptrace(
                        libc::PTRACE_GETREGSET,
                        self.pid.as_raw(),
                        NT_X86_XSTATE as *mut libc::c_void,
                        &mut iov as *mut libc::iovec as *mut libc::c_void,
                    )
                };
                if ret == -1 {
                    return Err(DbgError::from(nix::errno::Errno::last()));
                }
                Ok(decode_xstate(layout, &buf))
            }
        }
    }

    /// Writes back a floating-point/vector register bank previously read
    /// with [`get_fp_regs`](Self::get_fp_regs).
    pub fn set_fp_regs(&self, regs: &FpRegs) -> DbgResult<()> {
        match regs {
            FpRegs::Legacy(legacy) => {
                let mut raw = *legacy;
                let ret = unsafe {
                    libc::ptrace(
                        libc::PTRACE_SETFPREGS,
                        self.pid.as_raw(),
                        std::ptr::null_mut::<libc::c_void>(),
                        &mut raw as *mut LegacyFpRegs as *mut libc::c_void,
                    )
                };
                if ret == -1 {
                    return Err(DbgError::from(nix::errno::Errno::last()));
                }
                Ok(())
            }
            FpRegs::Avx(..) | FpRegs::Avx512(..) => {
                let mut buf = encode_xstate(regs, regs.layout().region_len());
                let mut iov = libc::iovec {
                    iov_base: buf.as_mut_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                };
                let ret = unsafe {
                    libc::ptrace(
                        libc::PTRACE_SETREGSET,
                        self.pid.as_raw(),
                        NT_X86_XSTATE as *mut libc::c_void,
                        &mut iov as *mut libc::iovec as *mut libc::c_void,
                    )
                };
                if ret == -1 {
                    return Err(DbgError::from(nix::errno::Errno::last()));
                }
                Ok(())
            }
        }
    }
}

/// `NT_X86_XSTATE` note type for `PTRACE_GETREGSET`/`PTRACE_SETREGSET`,
/// used to read the extended AVX/AVX-512 state beyond the legacy `fxsave`
/// area.
const NT_X86_XSTATE: i32 = 0x202;

/// Byte offset, within the XSAVE area, of each extension this crate reads.
/// The region between the legacy area and `AVX_OFFSET` is the 64-byte XSAVE
/// header; the gap between the AVX extension and `AVX512_HI256_OFFSET` holds
/// extended state this crate doesn't model (MPX/PKRU), which is left as-is.
const AVX_OFFSET: usize = 576;
const AVX512_HI256_OFFSET: usize = 1152;
const AVX512_HI16_OFFSET: usize = 1664;

fn decode_xstate(layout: FpLayoutKind, buf: &[u8]) -> FpRegs {
    let legacy_len = std::mem::size_of::<LegacyFpRegs>();
    let mut legacy: LegacyFpRegs = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(buf.as_ptr(), &mut legacy as *mut LegacyFpRegs as *mut u8, legacy_len.min(buf.len()));
    }

    let mut avx: AvxExtension = unsafe { std::mem::zeroed() };
    let avx_len = std::mem::size_of::<AvxExtension>();
    if buf.len() >= AVX_OFFSET + avx_len {
        unsafe {
            std::ptr::copy_nonoverlapping(buf[AVX_OFFSET..].as_ptr(), &mut avx as *mut AvxExtension as *mut u8, avx_len);
        }
    }

    if layout == FpLayoutKind::Legacy {
        return FpRegs::Legacy(legacy);
    }
    if layout == FpLayoutKind::Avx {
        return FpRegs::Avx(legacy, avx);
    }

    let mut avx512: Avx512Extension = unsafe { std::mem::zeroed() };
    if buf.len() >= AVX512_HI16_OFFSET + std::mem::size_of::<Avx512Extension>() {
        let hi256_len = std::mem::size_of_val(&avx512.zmm_hi256_0_15);
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf[AVX512_HI256_OFFSET..].as_ptr(),
                avx512.zmm_hi256_0_15.as_mut_ptr() as *mut u8,
                hi256_len,
            );
        }
        let hi16_len = std::mem::size_of_val(&avx512.zmm_16_31);
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf[AVX512_HI16_OFFSET..].as_ptr(),
                avx512.zmm_16_31.as_mut_ptr() as *mut u8,
                hi16_len,
            );
        }
    }
    FpRegs::Avx512(legacy, avx, avx512)
}

fn encode_xstate(regs: &FpRegs, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let legacy = regs.legacy();
    let legacy_len = std::mem::size_of::<LegacyFpRegs>();
    unsafe {
        std::ptr::copy_nonoverlapping(legacy as *const LegacyFpRegs as *const u8, buf.as_mut_ptr(), legacy_len.min(len));
    }

    if let FpRegs::Avx(_, avx) | FpRegs::Avx512(_, avx, _) = regs {
        let avx_len = std::mem::size_of::<AvxExtension>();
        if len >= AVX_OFFSET + avx_len {
            unsafe {
                std::ptr::copy_nonoverlapping(avx as *const AvxExtension as *const u8, buf[AVX_OFFSET..].as_mut_ptr(), avx_len);
            }
        }
    }

    if let FpRegs::Avx512(_, _, avx512) = regs {
        if len >= AVX512_HI16_OFFSET + std::mem::size_of::<Avx512Extension>() {
            let hi256_len = std::mem::size_of_val(&avx512.zmm_hi256_0_15);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    avx512.zmm_hi256_0_15.as_ptr() as *const u8,
                    buf[AVX512_HI256_OFFSET..].as_mut_ptr(),
                    hi256_len,
                );
            }
            let hi16_len = std::mem::size_of_val(&avx512.zmm_16_31);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    avx512.zmm_16_31.as_ptr() as *const u8,
                    buf[AVX512_HI16_OFFSET..].as_mut_ptr(),
                    hi16_len,
                );
            }
        }
    }
    buf
}

/// Our own summary of a `waitpid` result, decoupled from `nix`'s
/// `WaitStatus` so the Control Loop doesn't need to match on ptrace-event
/// encodings itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited { pid: Pid, code: i32 },
    Signaled { pid: Pid, signal: Signal },
    StoppedBySignal { pid: Pid, signal: Signal },
    /// A `PTRACE_EVENT_*` stop, e.g. clone/fork/exit, as opposed to a plain
    /// signal-delivery stop.
    PtraceEvent { pid: Pid, event: i32 },
    StillAlive,
}

impl WaitOutcome {
    fn from_status(status: WaitStatus) -> WaitOutcome {
        match status {
            WaitStatus::Exited(pid, code) => WaitOutcome::Exited { pid, code },
            WaitStatus::Signaled(pid, signal, _core) => WaitOutcome::Signaled { pid, signal },
            WaitStatus::PtraceEvent(pid, signal, event) if signal == Signal::SIGTRAP && event != 0 => {
                WaitOutcome::PtraceEvent { pid, event }
            }
            WaitStatus::Stopped(pid, signal) => WaitOutcome::StoppedBySignal { pid, signal },
            WaitStatus::PtraceEvent(pid, signal, _) => WaitOutcome::StoppedBySignal { pid, signal },
            WaitStatus::PtraceSyscall(pid) => WaitOutcome::StoppedBySignal {
                pid,
                signal: Signal::SIGTRAP,
            },
            WaitStatus::StillAlive => WaitOutcome::StillAlive,
            WaitStatus::Continued(_) => WaitOutcome::StillAlive,
        }
    }
}
