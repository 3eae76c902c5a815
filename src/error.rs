use alloc_counter::no_alloc;
use std::ffi::c_int;

use crate::config::ConfigError;

/// Result type for our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classes of init failure. Every class is fatal; the kind only decides what the
/// caller has to clean up and how the failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed container configuration, detected before kernel state is touched.
    Config,
    /// A namespace, identity, signal, clone or exec call failed.
    Kernel,
    /// The handshake channel could not be read, written or closed.
    Sync,
    /// Mapping-write or wait failure after the nested child was spawned.
    ChildLifecycle,
}

/// An error type which can track cause (reason the error happened) and context (what we were
/// doing when the error happened) without allocating.
///
/// Only `detail` owns memory, and it is only filled in on paths that run before clone. The
/// by-value builders take a non-`Copy` `Error`, so they carry no `no_alloc` guard of their own.
#[derive(Debug, Clone)]
pub struct Error {
    pub errno: c_int,
    pub kind: ErrorKind,
    pub cause: Option<&'static str>,
    pub context: Option<&'static str>,
    pub detail: Option<String>,
}

impl Error {
    /// Create an empty error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn new() -> Error {
        Error {
            errno: 0,
            kind: ErrorKind::Kernel,
            cause: None,
            context: None,
            detail: None,
        }
    }

    /// Create an error from the last OS error.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn last_os_error() -> Error {
        Error {
            errno: unsafe { *libc::__errno_location() },
            ..Error::new()
        }
    }

    /// Create an error from a raw errno value.
    #[cfg_attr(debug_assertions, no_alloc)]
    pub fn from_errno(errno: c_int) -> Error {
        Error {
            errno,
            ..Error::new()
        }
    }

    /// Replace the cause of an error.
    pub fn cause(self, msg: &'static str) -> Error {
        Error {
            cause: Some(msg),
            ..self
        }
    }

    /// Replace the context of an error.
    pub fn context(self, msg: &'static str) -> Error {
        Error {
            context: Some(msg),
            ..self
        }
    }

    /// Set the context of an error unless a more specific one is already present.
    pub fn or_context(self, msg: &'static str) -> Error {
        Error {
            context: self.context.or(Some(msg)),
            ..self
        }
    }

    /// Replace the kind of an error.
    pub fn kind(self, kind: ErrorKind) -> Error {
        Error { kind, ..self }
    }

    /// Attach owned detail text. Allocates; never call this after clone.
    pub fn detail(self, detail: impl Into<String>) -> Error {
        Error {
            detail: Some(detail.into()),
            ..self
        }
    }
}

impl Default for Error {
    fn default() -> Self {
        Self::new()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::from_errno(e.raw_os_error().unwrap_or(0))
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Error {
        Error {
            errno: 0,
            kind: ErrorKind::Config,
            cause: None,
            context: None,
            detail: Some(e.to_string()),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut parts = [self.context, self.cause, self.detail.as_deref()]
            .into_iter()
            .flatten();

        if let Some(first) = parts.next() {
            write!(f, "{first}")?;
            for part in parts {
                write!(f, ": {part}")?;
            }
            if self.errno == 0 {
                return Ok(());
            }
            write!(f, ": ")?;
        }

        // Get the error message from errno.
        let error_msg = unsafe { libc::strerror(self.errno) };
        let error_msg_len = unsafe { libc::strlen(error_msg) };
        let error_msg_str: &str = unsafe {
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(
                error_msg as *const u8,
                error_msg_len,
            ))
        };
        write!(f, "{} (errno {})", error_msg_str, self.errno)
    }
}

impl std::error::Error for Error {}

// Define a macro, bail!, which returns an error with no errno and a custom message.
macro_rules! bail {
    ($kind:expr, $msg:expr) => {
        return Err($crate::error::Error::new().kind($kind).cause($msg))
    };
    ($msg:expr) => {
        return Err($crate::error::Error::new().cause($msg))
    };
}
pub(crate) use bail;

// Define a macro, bail_errno!, which returns an error with the last OS error:
//
// - `bail_errno!()` returns an error with the last OS error.
// - `bail_errno!(msg)` returns an error with the last OS error and a cause message.
macro_rules! bail_errno {
    () => {
        return Err($crate::error::Error::last_os_error());
    };
    ($msg:expr) => {
        return Err($crate::error::Error::last_os_error().cause($msg));
    };
}
pub(crate) use bail_errno;
