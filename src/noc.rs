//! Abstract NoC transport surface.
//!
//! Everything above this module speaks in terms of nodes, mailboxes and
//! portals; nothing above it knows how bytes actually move. Mailboxes carry
//! single fixed-MTU frames, portals carry one-shot bulk transfers that the
//! receiver must explicitly allow. The only transport shipped in-tree is the
//! in-process loopback fabric in [`fabric`]; a kernel-backed transport would
//! implement the same handle surface.

pub mod fabric;

pub use fabric::{Fabric, Mailbox, MailboxRx, Node, PortalGrant, PortalRx, PortalTx};

use thiserror::Error;

/// Integer identifying a physical NoC endpoint. Stable for a boot.
pub type NodeNum = u32;

/// Port number within a node.
pub type PortNum = u32;

/// Well-known port of every process's standard inbox and inbound portal.
pub const STD_PORT: PortNum = 1;

#[derive(Error, Debug)]
pub enum NocError {
    #[error("no endpoint bound at node {0} port {1}")]
    NoEndpoint(NodeNum, PortNum),
    #[error("endpoint already bound at node {0} port {1}")]
    PortInUse(NodeNum, PortNum),
    #[error("frame of {0} bytes exceeds mailbox MTU of {1}")]
    FrameTooBig(usize, usize),
    #[error("bulk transfer of {got} bytes does not fit buffer of {want}")]
    ShortTransfer { got: usize, want: usize },
}
