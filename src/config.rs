//! Compile-time layout of the NoC cluster: which node and port every
//! service daemon lives on, plus the table sizes shared by servers and
//! client stubs. Changing a value here changes it for both sides.

use crate::noc::{NodeNum, PortNum};

/// Name server placement.
pub const NAME_SERVER_NODE: NodeNum = 0;
pub const NAME_SERVER_PORT: PortNum = 2;

/// Remote memory server placement.
pub const RMEM_SERVER_NODE: NodeNum = 4;
pub const RMEM_SERVER_PORT: PortNum = 2;

/// System V server placement.
pub const SYSV_SERVER_NODE: NodeNum = 0;
pub const SYSV_SERVER_PORT: PortNum = 3;

/// Port every SysV client listens on for shared-memory invalidation
/// notices. Broadcasts from the server land here, not on the client's
/// request/reply inbox.
pub const SHM_SNOOPER_PORT: PortNum = 5;

/// Spawner nodes and their registered names.
pub const SPAWN_SERVER_0_NODE: NodeNum = 0;
pub const SPAWN_SERVER_1_NODE: NodeNum = 4;
pub const SPAWN_SERVER_0_NAME: &str = "spawn0";
pub const SPAWN_SERVER_1_NAME: &str = "spawn1";

/// Capacity of the process and name tables in the name server.
pub const PNAME_MAX: usize = 64;

/// Maximum process name length. Names must be strictly shorter.
pub const PROC_NAME_MAX: usize = 32;

/// Remote memory geometry. Block 0 is reserved as the null block.
pub const RMEM_NUM_BLOCKS: usize = 512;
pub const RMEM_BLOCK_SIZE: usize = 1024;

/// Lines in the client-side page cache.
pub const RCACHE_NUM_LINES: usize = 16;

/// System V limits.
pub const SHM_MAX: usize = 32;
pub const MSG_QUEUES_MAX: usize = 16;
pub const MSG_LENGTH_MAX: usize = 512;
pub const MSG_PER_QUEUE_MAX: usize = 64;
pub const SEMAPHORES_MAX: usize = 32;
pub const CONNECTIONS_MAX: usize = 64;

/// Mailbox MTU. Every request/reply message must fit in one write.
pub const MAILBOX_MSG_SIZE: usize = 64;
