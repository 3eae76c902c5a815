use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int, c_void};
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};

use crate::error::{bail, bail_errno, Error, Result};

/// `SECBIT_NO_SETUID_FIXUP` from `<linux/securebits.h>`.
pub const SECBIT_NO_SETUID_FIXUP: libc::c_ulong = 1 << 2;

/// `SECBIT_KEEP_CAPS` from `<linux/securebits.h>`.
pub const SECBIT_KEEP_CAPS: libc::c_ulong = 1 << 4;

/// Get the topmost valid stack pointer inside a segment of stack memory.
#[cfg_attr(debug_assertions, no_alloc)]
pub unsafe fn get_topmost_stack_pointer(stack: &mut [u8]) -> *mut c_void {
    let top_addr = stack.as_mut_ptr().add(stack.len()) as *mut c_void;

    // Align downwards, multiple of 16.
    let top_addr = top_addr as usize & !0xf;

    top_addr as *mut c_void
}

/// Create a Unix stream socket pair.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut socket_fds = [0; 2];
    let 0.. = (unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            socket_fds.as_mut_ptr(),
        )
    }) else {
        bail_errno!("failed to create socketpair");
    };
    let [a, b] = socket_fds;
    Ok(unsafe { (OwnedFd::from_raw_fd(a), OwnedFd::from_raw_fd(b)) })
}

/// Read from `fd` until end-of-file, discarding the bytes. Used as a close-to-signal gate.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn read_until_eof(fd: c_int) -> Result<()> {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            0 => return Ok(()),
            1.. => continue,
            _ => {
                let err = Error::last_os_error();
                if err.errno == libc::EINTR {
                    continue;
                }
                return Err(err.cause("failed to read from socket"));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(c_int),
    Signal(c_int),
}

impl ExitStatus {
    pub fn from_wait_status(wait_status: c_int) -> Result<ExitStatus> {
        if libc::WIFEXITED(wait_status) {
            return Ok(ExitStatus::Code(libc::WEXITSTATUS(wait_status)));
        }
        if libc::WIFSIGNALED(wait_status) {
            return Ok(ExitStatus::Signal(libc::WTERMSIG(wait_status)));
        }

        bail!("invalid wait status")
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// The status this process should exit with to relay the child's termination.
    ///
    /// Exit codes pass through unchanged. Death by signal `N` becomes `128 + N`.
    pub fn exit_code(&self) -> c_int {
        match *self {
            ExitStatus::Code(code) => code,
            ExitStatus::Signal(signal) => 128 + signal,
        }
    }
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn waitpid(pid: c_int) -> Result<ExitStatus> {
    let mut status: c_int = 0;
    loop {
        let 0.. = (unsafe { libc::waitpid(pid, &mut status as *mut c_int, 0) }) else {
            if unsafe { *libc::__errno_location() } == libc::EINTR {
                continue;
            }
            bail_errno!("waitpid failed");
        };
        return ExitStatus::from_wait_status(status);
    }
}

/// Send SIGKILL to `pid`, ignoring failure: the target may already be gone.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn kill_quietly(pid: c_int) {
    let _ = unsafe { libc::kill(pid, libc::SIGKILL) };
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn stat(path: *const c_char) -> Result<libc::stat> {
    let mut stat_buf = mem::MaybeUninit::<libc::stat>::uninit();
    let 0.. = (unsafe { libc::stat(path, stat_buf.as_mut_ptr()) }) else {
        bail_errno!("failed to stat file");
    };
    Ok(unsafe { stat_buf.assume_init() })
}

/// Create a directory for all non-existent path components of `path`.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn mkdirp(path: *const c_char) -> Result<()> {
    let mkdir_ignoring_eexist = |path: *const c_char| -> Result<()> {
        let mkdir_result = unsafe { libc::mkdir(path, 0o755) };
        if mkdir_result == -1 {
            let err = Error::last_os_error();
            if err.errno != libc::EEXIST {
                return Err(err.cause("failed to create directory"));
            }
        };
        Ok(())
    };

    // Error if the path is longer than PATH_MAX.
    let path_len = unsafe { libc::strlen(path) };
    if path_len > libc::PATH_MAX as usize {
        bail!("mkdirp() path is longer than PATH_MAX");
    }
    // Copy the path to a local buffer.
    let mut buf = [b'\0'; libc::PATH_MAX as usize + 1];
    buf[..path_len + 1]
        .copy_from_slice(unsafe { std::slice::from_raw_parts(path.cast::<u8>(), path_len + 1) });

    // Loop through indices of `/` characters in the buffer to create ancestors.
    for i in 1..buf.len() {
        if buf[i] == b'\0' {
            break;
        }
        if buf[i] != b'/' {
            continue;
        }

        buf[i] = b'\0';
        mkdir_ignoring_eexist(buf.as_ptr().cast())?;
        buf[i] = b'/';
    }

    // Create the final directory.
    mkdir_ignoring_eexist(buf.as_ptr().cast())?;

    Ok(())
}

/// Read the parent-death signal of the calling thread. Zero means none is configured.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn get_parent_death_signal() -> Result<c_int> {
    let mut signal: c_int = 0;
    let 0 = (unsafe { libc::prctl(libc::PR_GET_PDEATHSIG, &mut signal as *mut c_int) }) else {
        bail_errno!("prctl(PR_GET_PDEATHSIG) failed");
    };
    Ok(signal)
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn set_parent_death_signal(signal: c_int) -> Result<()> {
    let 0 = (unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal as libc::c_ulong) }) else {
        bail_errno!("prctl(PR_SET_PDEATHSIG) failed");
    };
    Ok(())
}

#[cfg_attr(debug_assertions, no_alloc)]
pub fn set_securebits(bits: libc::c_ulong) -> Result<()> {
    let 0 = (unsafe { libc::prctl(libc::PR_SET_SECUREBITS, bits) }) else {
        bail_errno!("prctl(PR_SET_SECUREBITS) failed");
    };
    Ok(())
}

/// Mark every descriptor from `first` upward close-on-exec.
///
/// Descriptors are not closed outright: the table may be shared with another process
/// (`CLONE_FILES`), and exec unshares the table before it drops close-on-exec entries.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn cloexec_from(first: c_int) -> Result<()> {
    let max_fd = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n @ 1.. => n as c_int,
        _ => 1024,
    };
    for fd in first..max_fd {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            // EBADF: nothing open here.
            continue;
        }
        let 0.. = (unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }) else {
            bail_errno!("fcntl(F_SETFD, FD_CLOEXEC) failed");
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork_and_exit(code: c_int) -> c_int {
        match unsafe { libc::fork() } {
            0 => unsafe { libc::_exit(code) },
            pid @ 1.. => pid,
            _ => panic!("fork failed"),
        }
    }

    #[test]
    fn exit_code_relays_every_status_byte() {
        for code in 0..=255 {
            let pid = fork_and_exit(code);
            let status = waitpid(pid).unwrap();
            assert_eq!(status, ExitStatus::Code(code));
            assert_eq!(status.exit_code(), code);
        }
    }

    #[test]
    fn killed_child_maps_to_128_plus_signal() {
        let pid = match unsafe { libc::fork() } {
            0 => loop {
                unsafe { libc::pause() };
            },
            pid @ 1.. => pid,
            _ => panic!("fork failed"),
        };
        kill_quietly(pid);
        let status = waitpid(pid).unwrap();
        assert_eq!(status, ExitStatus::Signal(libc::SIGKILL));
        assert_eq!(status.exit_code(), 128 + libc::SIGKILL);
        assert!(!status.success());
    }

    #[test]
    fn read_until_eof_returns_after_peer_close() {
        let (a, b) = socket_pair().unwrap();
        let handle = std::thread::spawn(move || {
            use std::os::fd::AsRawFd;
            read_until_eof(b.as_raw_fd())
        });
        drop(a);
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn parent_death_signal_round_trips() {
        // Run in a forked child so the test harness thread keeps its own setting.
        match unsafe { libc::fork() } {
            0 => {
                let ok = set_parent_death_signal(libc::SIGUSR1).is_ok()
                    && get_parent_death_signal().ok() == Some(libc::SIGUSR1);
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            pid @ 1.. => assert!(waitpid(pid).unwrap().success()),
            _ => panic!("fork failed"),
        }
    }
}
