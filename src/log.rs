//! The diagnostic log file.
//!
//! Before clone, everything goes through `tracing`, which the binary points at this file. After
//! clone the nested child must not allocate, so it writes straight to the file's descriptor
//! with [`log_fd!`].

use std::ffi::c_int;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{Error, Result};

/// Where the init process appends its diagnostics.
pub const LOG_PATH: &str = "/tmp/nsinit.log";

/// Log a message (given in format_args! style) by writing it to a file descriptor.
///
/// This cannot allocate---buffer messages to a fixed-length, stack-allocated 2048-byte buffer.
///
/// ```ignore
/// log_fd!(fd, "msg {param}", param = 42)
/// ```
macro_rules! log_fd {
    ($fd:expr, $fmt:literal) => {
        {
            use std::io::Write as _;
            let mut buffer = [0u8; 2048];
            let mut cursor = std::io::Cursor::new(&mut buffer[..]);
            let _ = writeln!(cursor, concat!("NSINIT: ", $fmt));
            let _ = unsafe {libc::write($fd, cursor.get_ref().as_ptr() as *const std::ffi::c_void, cursor.position() as usize)};
        }
    };
    ($fd:expr, $fmt:literal, $($arg:tt)*) => {
        {
            use std::io::Write as _;
            let mut buffer = [0u8; 2048];
            let mut cursor = std::io::Cursor::new(&mut buffer[..]);
            let _ = writeln!(cursor, concat!("NSINIT: ", $fmt), $($arg)*);
            let _ = unsafe {libc::write($fd, cursor.get_ref().as_ptr() as *const std::ffi::c_void, cursor.position() as usize)};
        }
    };
}
pub(crate) use log_fd;

/// An append-only diagnostic log.
#[derive(Debug)]
pub struct DiagnosticLog {
    file: File,
}

impl DiagnosticLog {
    /// Open (creating with mode 0666 if absent) the log at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<DiagnosticLog> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o666)
            .open(path)
            .map_err(|e| {
                Error::from(e)
                    .cause("failed to open diagnostic log")
                    .detail(path.display().to_string())
            })?;
        Ok(DiagnosticLog { file })
    }

    /// Raw descriptor for allocation-free logging after clone.
    pub fn raw_fd(&self) -> c_int {
        self.file.as_raw_fd()
    }

    /// An independent handle on the same open file, for a `tracing` writer.
    pub fn try_clone_file(&self) -> Result<File> {
        self.file
            .try_clone()
            .map_err(|e| Error::from(e).cause("failed to duplicate diagnostic log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_fd_appends_prefixed_line() -> eyre::Result<()> {
        let path = std::env::temp_dir().join(format!("nsinit-log-{}", std::process::id()));
        let log = DiagnosticLog::open(&path)?;
        log_fd!(log.raw_fd(), "In parent.");
        log_fd!(log.raw_fd(), "child pid={pid}", pid = 42);
        drop(log);

        let contents = std::fs::read_to_string(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(contents, "NSINIT: In parent.\nNSINIT: child pid=42\n");
        Ok(())
    }
}
