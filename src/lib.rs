mod libc_util;

mod error;
mod id_map;
mod mount_table;

pub mod capabilities;
pub mod config;
mod console;
pub mod environment;
pub mod escalate;
pub mod handshake;
mod init;
pub mod log;
mod mount;
pub mod network;
pub mod pdeathsig;
pub mod security;
pub mod user;

pub use config::{ConfigError, Container, HostIdentity, NetworkConfig};
pub use error::{Error, ErrorKind, Result};
pub use id_map::{IdMap, IdMappings};
pub use init::init;
pub use libc_util::ExitStatus;
pub use mount_table::{Mount, MountTable, MountpointType};

/// In test builds, use alloc_counter to verify at runtime that the functions which must be
/// async-signal-safe do not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
