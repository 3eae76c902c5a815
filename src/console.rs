//! Console attachment and session setup.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use tracing::debug;

use crate::error::{bail, bail_errno, Error, ErrorKind, Result};

/// Open the console (a pty slave) and make it stdin, stdout and stderr.
pub fn open_and_dup(path: &Path) -> Result<()> {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        bail!(ErrorKind::Config, "console path contains an interior NUL");
    };
    let fd @ 0.. = (unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) }) else {
        return Err(Error::last_os_error()
            .cause("failed to open console")
            .detail(path.display().to_string()));
    };

    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        let 0.. = (unsafe { libc::dup2(fd, target) }) else {
            let err = Error::last_os_error().cause("dup2(console) failed");
            unsafe { libc::close(fd) };
            return Err(err);
        };
    }
    if fd > libc::STDERR_FILENO {
        unsafe { libc::close(fd) };
    }
    debug!(console = %path.display(), "console attached");
    Ok(())
}

/// Start a new session, detaching from the launcher's controlling terminal.
pub fn setsid() -> Result<()> {
    let 0.. = (unsafe { libc::setsid() }) else {
        bail_errno!("setsid failed");
    };
    Ok(())
}

/// Make stdin, which must already be the console, the session's controlling terminal.
pub fn setctty() -> Result<()> {
    let 0 = (unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) }) else {
        bail_errno!("ioctl(TIOCSCTTY) failed");
    };
    Ok(())
}
