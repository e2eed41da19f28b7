//! Pipe Manager: buffered, timeout-aware I/O against a tracee's stdin/
//! stdout/stderr pipes, plus an interactive passthrough mode. A direct
//! port of `pipe_manager.py`'s `recv`/`recvuntil`/`send`/`interactive`
//! family, generalized over `nix::poll` instead of `select()` (spec §4.6).

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SetArg};
use nix::unistd::{read, write};

use crate::error::{DbgError, DbgResult};

pub struct PipeManager {
    stdin_write: OwnedFd,
    stdout_read: OwnedFd,
    stderr_read: OwnedFd,
    default_timeout: Duration,
}

impl PipeManager {
    pub fn new(
        stdin_write: OwnedFd,
        stdout_read: OwnedFd,
        stderr_read: OwnedFd,
        default_timeout: Duration,
    ) -> PipeManager {
        PipeManager {
            stdin_write,
            stdout_read,
            stderr_read,
            default_timeout,
        }
    }

    /// Reads at most `numb` bytes (or, with `numb: None`, a single
    /// best-effort chunk up to 4096 bytes) from stdout/stderr, waiting up
    /// to `timeout` total for data to arrive.
    pub fn recv(&self, numb: Option<usize>, timeout: Duration) -> DbgResult<Vec<u8>> {
        self.recv_from(self.stdout_read.as_fd(), numb, timeout)
    }

    pub fn recverr(&self, numb: Option<usize>, timeout: Duration) -> DbgResult<Vec<u8>> {
        self.recv_from(self.stderr_read.as_fd(), numb, timeout)
    }

    fn recv_from(&self, fd: BorrowedFd, numb: Option<usize>, timeout: Duration) -> DbgResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::new();

        match numb {
            Some(0) => Ok(buffer),
            Some(mut remaining) => {
                while remaining > 0 {
                    let Some(budget) = remaining_budget(deadline) else { break };
                    if !wait_readable(fd, budget)? {
                        break;
                    }
                    let mut chunk = vec![0u8; remaining];
                    let n = read(fd.as_raw_fd(), &mut chunk).map_err(|_| DbgError::BrokenPipe)?;
                    if n == 0 {
                        break;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    remaining -= n;
                }
                Ok(buffer)
            }
            None => {
                let Some(budget) = remaining_budget(deadline) else {
                    return Ok(buffer);
                };
                if wait_readable(fd, budget)? {
                    let mut chunk = vec![0u8; 4096];
                    let n = read(fd.as_raw_fd(), &mut chunk).map_err(|_| DbgError::BrokenPipe)?;
                    buffer.extend_from_slice(&chunk[..n]);
                }
                Ok(buffer)
            }
        }
    }

    fn recv_once_until(
        &self,
        fd: BorrowedFd,
        delims: &[u8],
        drop: bool,
        deadline: Instant,
    ) -> DbgResult<Vec<u8>> {
        let mut buffer = Vec::new();
        loop {
            let budget = remaining_budget(deadline).ok_or(DbgError::Timeout)?;
            let byte = self.recv_from(fd, Some(1), budget)?;
            if byte.is_empty() {
                return Err(DbgError::Timeout);
            }
            buffer.extend_from_slice(&byte);
            if ends_with(&buffer, delims) {
                if drop {
                    buffer.truncate(buffer.len() - delims.len());
                }
                return Ok(buffer);
            }
        }
    }

    fn recv_until(
        &self,
        fd: BorrowedFd,
        delims: &[u8],
        occurrences: u32,
        drop: bool,
        timeout: Duration,
    ) -> DbgResult<Vec<u8>> {
        if occurrences == 0 {
            return Err(DbgError::value("occurrences must be positive"));
        }
        let deadline = Instant::now() + timeout;
        let mut buffer = Vec::new();
        for _ in 0..occurrences {
            buffer.extend(self.recv_once_until(fd, delims, drop, deadline)?);
        }
        Ok(buffer)
    }

    pub fn recvuntil(&self, delims: &[u8], occurrences: u32, drop: bool, timeout: Duration) -> DbgResult<Vec<u8>> {
        self.recv_until(self.stdout_read.as_fd(), delims, occurrences, drop, timeout)
    }

    pub fn recverruntil(&self, delims: &[u8], occurrences: u32, drop: bool, timeout: Duration) -> DbgResult<Vec<u8>> {
        self.recv_until(self.stderr_read.as_fd(), delims, occurrences, drop, timeout)
    }

    pub fn recvline(&self, numlines: u32, drop: bool, timeout: Duration) -> DbgResult<Vec<u8>> {
        self.recvuntil(b"\n", numlines, drop, timeout)
    }

    pub fn recverrline(&self, numlines: u32, drop: bool, timeout: Duration) -> DbgResult<Vec<u8>> {
        self.recverruntil(b"\n", numlines, drop, timeout)
    }

    pub fn send(&self, data: &[u8]) -> DbgResult<usize> {
        write(&self.stdin_write, data).map_err(|_| DbgError::BrokenPipe)
    }

    pub fn sendline(&self, data: &[u8]) -> DbgResult<usize> {
        let mut buf = data.to_vec();
        buf.push(b'\n');
        self.send(&buf)
    }

    pub fn sendafter(&self, delims: &[u8], data: &[u8], timeout: Duration) -> DbgResult<usize> {
        self.recvuntil(delims, 1, false, timeout)?;
        self.send(data)
    }

    pub fn sendlineafter(&self, delims: &[u8], data: &[u8], timeout: Duration) -> DbgResult<usize> {
        self.recvuntil(delims, 1, false, timeout)?;
        self.sendline(data)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Drops into raw-mode passthrough: stdin keystrokes go straight to the
    /// tracee, and a background thread forwards tracee stdout to our
    /// stdout until `stop` is set or the tracee's stdout closes. Restores
    /// the terminal mode on every exit path, mirroring the Python
    /// implementation's `try`/`finally` around `tcsetattr`.
    pub fn interactive(&self, stop: Arc<AtomicBool>) -> DbgResult<()> {
        let stdin_fd = io::stdin();
        let raw_fd = stdin_fd.as_raw_fd();
        let original = termios::tcgetattr(unsafe { BorrowedFd::borrow_raw(raw_fd) })
            .map_err(DbgError::from)?;
        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        termios::tcsetattr(
            unsafe { BorrowedFd::borrow_raw(raw_fd) },
            SetArg::TCSANOW,
            &raw,
        )
        .map_err(DbgError::from)?;

        let reader_stop = stop.clone();
        let stdout_read = self.stdout_read.try_clone().map_err(|_| DbgError::BrokenPipe)?;
        let reader = thread::spawn(move || {
            use io::Write;
            while !reader_stop.load(Ordering::Relaxed) {
                match wait_readable(stdout_read.as_fd(), Duration::from_millis(100)) {
                    Ok(true) => {
                        let mut chunk = [0u8; 4096];
                        match read(stdout_read.as_raw_fd(), &mut chunk) {
                            Ok(0) => break,
                            Ok(n) => {
                                let mut out = io::stdout();
                                let _ = out.write_all(&chunk[..n]);
                                let _ = out.flush();
                            }
                            Err(_) => break,
                        }
                    }
                    Ok(false) => continue,
                    Err(_) => break,
                }
            }
        });

        let result = self.forward_stdin_until_stopped(&stop);

        stop.store(true, Ordering::Relaxed);
        let _ = reader.join();
        termios::tcsetattr(
            unsafe { BorrowedFd::borrow_raw(raw_fd) },
            SetArg::TCSANOW,
            &original,
        )
        .map_err(DbgError::from)?;

        result
    }

    fn forward_stdin_until_stopped(&self, stop: &Arc<AtomicBool>) -> DbgResult<()> {
        let stdin_fd = unsafe { BorrowedFd::borrow_raw(io::stdin().as_raw_fd()) };
        while !stop.load(Ordering::Relaxed) {
            if !wait_readable(stdin_fd, Duration::from_millis(100))? {
                continue;
            }
            let mut chunk = [0u8; 256];
            let n = read(stdin_fd.as_raw_fd(), &mut chunk).map_err(DbgError::from)?;
            if n == 0 {
                break;
            }
            self.send(&chunk[..n])?;
        }
        Ok(())
    }
}

fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline - now)
    }
}

fn wait_readable(fd: BorrowedFd, timeout: Duration) -> DbgResult<bool> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let millis: u16 = timeout.as_millis().min(u16::MAX as u128) as u16;
    let n = poll(&mut fds, PollTimeout::from(millis)).map_err(DbgError::from)?;
    Ok(n > 0 && fds[0].revents().is_some_and(|e| e.contains(PollFlags::POLLIN)))
}

fn ends_with(buffer: &[u8], delims: &[u8]) -> bool {
    !delims.is_empty() && buffer.len() >= delims.len() && &buffer[buffer.len() - delims.len()..] == delims
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_with_detects_trailing_delimiter() {
        assert!(ends_with(b"hello\n", b"\n"));
        assert!(!ends_with(b"hello", b"\n"));
        assert!(ends_with(b"flag{abc}", b"}"));
    }

    #[test]
    fn ends_with_rejects_shorter_buffer_than_delim() {
        assert!(!ends_with(b"ab", b"abcd"));
    }

    #[test]
    fn remaining_budget_is_none_past_deadline() {
        let past = Instant::now() - Duration::from_secs(1);
        assert!(remaining_budget(past).is_none());
    }

    #[test]
    fn remaining_budget_is_some_before_deadline() {
        let future = Instant::now() + Duration::from_secs(5);
        assert!(remaining_budget(future).is_some());
    }
}
