//! The private channel between the launcher and the init process.
//!
//! The launcher writes one JSON payload and closes its end; the init process reads until
//! end-of-file. The same socket pair also works without a payload, as a gate that opens when
//! the other side closes its end.

use std::collections::BTreeMap;
use std::ffi::c_int;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use alloc_counter::no_alloc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{bail, bail_errno, Error, ErrorKind, Result};
use crate::libc_util::{read_until_eof, socket_pair};

/// String-keyed payload produced by the launcher, consumed once by network attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(BTreeMap<String, String>);

impl Context {
    pub fn new() -> Context {
        Context::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single-use channel. Each side holds at most one end, and each end is closed at most once.
#[derive(Debug)]
pub struct SyncPipe {
    parent: Option<OwnedFd>,
    child: Option<OwnedFd>,
}

impl SyncPipe {
    /// Create both ends of a new channel.
    pub fn new() -> Result<SyncPipe> {
        let (parent, child) = socket_pair().map_err(|e| {
            e.kind(ErrorKind::Sync)
                .context("Failed to create sync pipe")
        })?;
        Ok(SyncPipe {
            parent: Some(parent),
            child: Some(child),
        })
    }

    /// Wrap the child end inherited from the launcher.
    pub fn from_child_fd(child: OwnedFd) -> SyncPipe {
        SyncPipe {
            parent: None,
            child: Some(child),
        }
    }

    /// Make the child end survive exec, returning its descriptor number for the init
    /// process's command line.
    pub fn child_fd_for_exec(&self) -> Result<RawFd> {
        let Some(child) = &self.child else {
            bail!(ErrorKind::Sync, "child end already closed");
        };
        let fd = child.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        let 0.. = (unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) }) else {
            bail_errno!("failed to clear FD_CLOEXEC on sync pipe");
        };
        Ok(fd)
    }

    /// Write the payload to the child and close the parent end.
    ///
    /// The close happens on every path, so a failed send still unblocks the reader.
    pub fn send_to_child(&mut self, context: &Context) -> Result<()> {
        let Some(parent) = self.parent.take() else {
            bail!(ErrorKind::Sync, "parent end already closed");
        };
        let data = serde_json::to_vec(context).map_err(|e| {
            Error::new()
                .kind(ErrorKind::Sync)
                .cause("failed to encode handshake payload")
                .detail(e.to_string())
        })?;
        let mut stream = File::from(parent);
        stream.write_all(&data).map_err(|e| {
            Error::from(e)
                .kind(ErrorKind::Sync)
                .cause("failed to send to child")
        })?;
        debug!(bytes = data.len(), "sent handshake payload");
        Ok(())
    }

    /// Block until the launcher has written its payload and closed its end, then decode it.
    ///
    /// The child end is closed before this returns, whether or not the read succeeded. An
    /// empty transmission decodes to an empty [`Context`].
    pub fn read_from_parent(&mut self) -> Result<Context> {
        let Some(child) = self.child.take() else {
            bail!(ErrorKind::Sync, "child end already closed");
        };
        // The launcher's copy of the child end, if any, must not keep us from seeing EOF.
        drop(self.parent.take());

        let mut data = Vec::new();
        File::from(child).read_to_end(&mut data).map_err(|e| {
            Error::from(e)
                .kind(ErrorKind::Sync)
                .cause("failed to read from parent")
        })?;
        if data.is_empty() {
            return Ok(Context::new());
        }
        serde_json::from_slice(&data).map_err(|e| {
            Error::new()
                .kind(ErrorKind::Sync)
                .cause("failed to decode handshake payload")
                .detail(e.to_string())
        })
    }

    /// Close whichever ends this side still holds. Safe to call repeatedly.
    pub fn close(&mut self) {
        drop(self.parent.take());
        drop(self.child.take());
    }

    /// Split a payload-less channel for a child that shares this process's descriptor table.
    ///
    /// The caller owns the parent end and signals by closing it. Once the child exists it owns
    /// the child end: with `CLONE_FILES` the caller must then give it up with `into_raw_fd` and
    /// let the child close it in the shared table.
    pub(crate) fn into_close_gate(mut self) -> Result<(OwnedFd, OwnedFd)> {
        let (Some(parent), Some(child)) = (self.parent.take(), self.child.take()) else {
            bail!(ErrorKind::Sync, "close gate needs both ends");
        };
        Ok((parent, child))
    }
}

/// Block until every copy of the other end of a close gate is gone.
#[cfg_attr(debug_assertions, no_alloc)]
pub fn await_close(fd: c_int) -> Result<()> {
    read_until_eof(fd).map_err(|e| {
        e.kind(ErrorKind::Sync)
            .context("Failed waiting on sync pipe")
    })
}
