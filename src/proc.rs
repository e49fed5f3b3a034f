//! Packed process identifiers.
//!
//! A pid is a 32-bit value split into three fields: the low 14 bits are a
//! monotonically allocated id, the middle 12 bits are reserved, and the top
//! 6 bits carry the NoC node the process was registered from. Peers recover
//! the origin node of any pid by pure arithmetic, without asking the name
//! server.

use crate::noc::NodeNum;
use std::fmt;

const ID_BITS: u32 = 14;
const RESERVED_BITS: u32 = 12;

const ID_OFFSET: u32 = 0;
const RESERVED_OFFSET: u32 = ID_BITS;
const SOURCE_OFFSET: u32 = ID_BITS + RESERVED_BITS;

const ID_MASK: u32 = (1 << ID_BITS) - 1;
const RESERVED_MASK: u32 = (1 << RESERVED_BITS) - 1;
const SOURCE_MASK: u32 = (1 << 6) - 1;

/// A packed process identifier.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Pid(pub i32);

/// Sentinel meaning "no process".
pub const PID_NULL: Pid = Pid(-1);

impl Pid {
    pub fn from_raw(raw: i32) -> Pid {
        Pid(raw)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self == PID_NULL
    }

    pub fn id(self) -> u32 {
        ((self.0 as u32) >> ID_OFFSET) & ID_MASK
    }

    pub fn reserved(self) -> u32 {
        ((self.0 as u32) >> RESERVED_OFFSET) & RESERVED_MASK
    }

    pub fn source(self) -> NodeNum {
        ((self.0 as u32) >> SOURCE_OFFSET) & SOURCE_MASK
    }

    pub fn with_id(self, id: u32) -> Pid {
        let bits = (self.0 as u32) & !(ID_MASK << ID_OFFSET);
        Pid((bits | ((id & ID_MASK) << ID_OFFSET)) as i32)
    }

    pub fn with_reserved(self, reserved: u32) -> Pid {
        let bits = (self.0 as u32) & !(RESERVED_MASK << RESERVED_OFFSET);
        Pid((bits | ((reserved & RESERVED_MASK) << RESERVED_OFFSET)) as i32)
    }

    pub fn with_source(self, source: NodeNum) -> Pid {
        let bits = (self.0 as u32) & !(SOURCE_MASK << SOURCE_OFFSET);
        Pid((bits | ((source & SOURCE_MASK) << SOURCE_OFFSET)) as i32)
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Pid(NULL)")
        } else {
            write!(f, "Pid(id={} node={})", self.id(), self.source())
        }
    }
}

/// Process group identifier, drawn from the same space as [`Pid`].
pub type Gid = i32;

/// What the name server knows about a process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcInfo {
    pub pid: Pid,
    pub nodenum: i32,
}

impl ProcInfo {
    pub const NULL: ProcInfo = ProcInfo {
        pid: PID_NULL,
        nodenum: -1,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_packing() {
        let pid = PID_NULL.with_source(5).with_id(1234);
        assert_eq!(pid.id(), 1234);
        assert_eq!(pid.source(), 5);
        // Bits not touched by with_id/with_source keep the sentinel's ones.
        assert_eq!(pid.reserved(), RESERVED_MASK);
    }

    #[test]
    fn test_pid_field_isolation() {
        let pid = Pid(0).with_id(0x3fff).with_reserved(0).with_source(63);
        assert_eq!(pid.id(), 0x3fff);
        assert_eq!(pid.reserved(), 0);
        assert_eq!(pid.source(), 63);

        let pid = pid.with_id(1);
        assert_eq!(pid.id(), 1);
        assert_eq!(pid.source(), 63);
    }

    #[test]
    fn test_pid_null() {
        assert!(PID_NULL.is_null());
        assert!(!Pid(0).is_null());
        assert_eq!(ProcInfo::NULL.pid, PID_NULL);
        assert_eq!(ProcInfo::NULL.nodenum, -1);
    }

    #[test]
    fn test_source_roundtrip_from_allocated_pid() {
        // The way the name server mints pids: stamp source, then id.
        for node in [0u32, 1, 4, 63] {
            let pid = PID_NULL.with_source(node).with_id(7);
            assert_eq!(pid.source(), node);
            assert_eq!(pid.id(), 7);
        }
    }
}
