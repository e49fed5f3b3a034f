//! Runtime services for a many-core NoC operating system.
//!
//! Three singleton daemons — the name service, the remote memory service
//! and the System V IPC service — provide a single-system-image abstraction
//! over a raw message-passing substrate of mailboxes (fixed-size control
//! frames) and portals (one-shot bulk transfers). Client stubs for each
//! service live next to their server; the in-process loopback fabric in
//! [`noc`] wires everything together for the daemon binary and the tests.

pub mod config;
pub mod msg;
pub mod name;
pub mod noc;
pub mod proc;
pub mod rmem;
pub mod sysv;
pub mod task;

use thiserror::Error;

/// What a client stub call can fail with: a transport problem, a frame we
/// could not parse, or an error the server itself replied with.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport: {0}")]
    Noc(#[from] noc::NocError),
    #[error("bad frame: {0}")]
    Codec(#[from] msg::CodecError),
    #[error("server: {0}")]
    Server(#[from] msg::Errno),
}

impl ClientError {
    /// The server-side error number, when that is what happened.
    pub fn errno(&self) -> Option<msg::Errno> {
        match self {
            ClientError::Server(errno) => Some(*errno),
            _ => None,
        }
    }
}
