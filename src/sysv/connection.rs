//! Reference-counted client connections.
//!
//! The SysV server remembers which `(pid, port)` pairs currently hold any
//! of its resources. Repeated opens from the same pair bump one record;
//! broadcasts (shared-memory invalidation) enumerate the live records.

use crate::config::CONNECTIONS_MAX;
use crate::msg::Errno;
use crate::noc::PortNum;
use crate::proc::Pid;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub remote: Pid,
    pub port: PortNum,
    pub count: u32,
}

pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        ConnectionTable::new()
    }
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable {
            slots: vec![None; CONNECTIONS_MAX],
        }
    }

    /// Index of the record for `(remote, port)`, if connected.
    pub fn lookup(&self, remote: Pid, port: PortNum) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot, Some(c) if c.remote == remote && c.port == port)
        })
    }

    /// Establishes or re-references a connection.
    pub fn connect(&mut self, remote: Pid, port: PortNum) -> Result<usize, Errno> {
        if let Some(i) = self.lookup(remote, port) {
            self.slots[i].as_mut().unwrap().count += 1;
            return Ok(i);
        }
        let free = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Errno::Eagain)?;
        self.slots[free] = Some(Connection {
            remote,
            port,
            count: 1,
        });
        Ok(free)
    }

    /// Drops one reference; the record disappears with the last one.
    pub fn disconnect(&mut self, remote: Pid, port: PortNum) -> Result<(), Errno> {
        let i = self.lookup(remote, port).ok_or(Errno::Enoent)?;
        let conn = self.slots[i].as_mut().unwrap();
        conn.count -= 1;
        if conn.count == 0 {
            self.slots[i] = None;
        }
        Ok(())
    }

    /// First registered reply port of `remote`, used to reach a waiter
    /// whose request was answered long after it arrived.
    pub fn port_of(&self, remote: Pid) -> Option<PortNum> {
        self.slots.iter().find_map(|slot| match slot {
            Some(c) if c.remote == remote => Some(c.port),
            _ => None,
        })
    }

    /// Snapshot of every live connection, for broadcast fan-out.
    pub fn get_connections(&self) -> Vec<Connection> {
        self.slots.iter().filter_map(|slot| *slot).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::PID_NULL;

    fn pid(n: u32) -> Pid {
        PID_NULL.with_source(1).with_id(n)
    }

    #[test]
    fn test_connect_disconnect_balances() {
        let mut table = ConnectionTable::new();
        assert!(table.get_connections().is_empty());

        table.connect(pid(1), 7).unwrap();
        table.connect(pid(1), 7).unwrap();
        assert_eq!(table.get_connections().len(), 1);
        assert_eq!(table.get_connections()[0].count, 2);

        table.disconnect(pid(1), 7).unwrap();
        assert_eq!(table.get_connections().len(), 1);
        table.disconnect(pid(1), 7).unwrap();
        assert!(table.get_connections().is_empty());
    }

    #[test]
    fn test_distinct_pairs_get_distinct_records() {
        let mut table = ConnectionTable::new();
        table.connect(pid(1), 7).unwrap();
        table.connect(pid(1), 8).unwrap();
        table.connect(pid(2), 7).unwrap();
        assert_eq!(table.get_connections().len(), 3);
    }

    #[test]
    fn test_disconnect_unknown() {
        let mut table = ConnectionTable::new();
        assert_eq!(table.disconnect(pid(9), 1).unwrap_err(), Errno::Enoent);
    }

    #[test]
    fn test_port_of() {
        let mut table = ConnectionTable::new();
        table.connect(pid(3), 42).unwrap();
        assert_eq!(table.port_of(pid(3)), Some(42));
        assert_eq!(table.port_of(pid(4)), None);
    }

    #[test]
    fn test_table_full() {
        let mut table = ConnectionTable::new();
        for i in 0..CONNECTIONS_MAX {
            table.connect(pid(i as u32), 1).unwrap();
        }
        assert_eq!(
            table.connect(pid(9999), 1).unwrap_err(),
            Errno::Eagain
        );
    }
}
