//! System V message queues.
//!
//! Queues are keyed integers holding typed messages in FIFO order. Receive
//! selects by type: 0 takes the head, a positive type matches exactly, a
//! negative type takes the lowest type not exceeding its magnitude.
//! Blocking send/receive is not implemented; callers get `EAGAIN` and
//! retry, whatever their flags say.

use crate::config::{MSG_LENGTH_MAX, MSG_PER_QUEUE_MAX, MSG_QUEUES_MAX};
use crate::msg::Errno;
use crate::sysv::{IPC_CREAT, IPC_EXCL};
use log::debug;
use std::collections::VecDeque;

struct MsgQueue {
    key: i32,
    refcount: u32,
    msgs: VecDeque<(i64, Vec<u8>)>,
}

pub struct MsgManager {
    queues: Vec<Option<MsgQueue>>,
}

impl Default for MsgManager {
    fn default() -> Self {
        MsgManager::new()
    }
}

impl MsgManager {
    pub fn new() -> MsgManager {
        MsgManager {
            queues: (0..MSG_QUEUES_MAX).map(|_| None).collect(),
        }
    }

    fn queue_mut(&mut self, msgid: i32) -> Result<&mut MsgQueue, Errno> {
        if msgid < 0 || msgid as usize >= MSG_QUEUES_MAX {
            return Err(Errno::Einval);
        }
        self.queues[msgid as usize].as_mut().ok_or(Errno::Einval)
    }

    /// Finds or creates the queue for `key`; returns its id.
    pub fn get(&mut self, key: i32, flags: i32) -> Result<i32, Errno> {
        if let Some(i) = self
            .queues
            .iter()
            .position(|q| matches!(q, Some(q) if q.key == key))
        {
            if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                return Err(Errno::Eexist);
            }
            self.queues[i].as_mut().unwrap().refcount += 1;
            return Ok(i as i32);
        }
        if flags & IPC_CREAT == 0 {
            return Err(Errno::Enoent);
        }
        let free = self
            .queues
            .iter()
            .position(|q| q.is_none())
            .ok_or(Errno::Eagain)?;
        self.queues[free] = Some(MsgQueue {
            key,
            refcount: 1,
            msgs: VecDeque::new(),
        });
        debug!("[msg] created queue key={key} msgid={free}");
        Ok(free as i32)
    }

    /// Drops one handle; the queue and its pending messages go with the
    /// last one.
    pub fn close(&mut self, msgid: i32) -> Result<(), Errno> {
        let queue = self.queue_mut(msgid)?;
        queue.refcount -= 1;
        if queue.refcount == 0 {
            let dropped = self.queues[msgid as usize].take().unwrap();
            if !dropped.msgs.is_empty() {
                debug!(
                    "[msg] queue {msgid} destroyed with {} pending messages",
                    dropped.msgs.len()
                );
            }
        }
        Ok(())
    }

    /// Appends a message. The caller has already drained the payload off
    /// the wire, so a refusal here never stalls the peer.
    pub fn push(&mut self, msgid: i32, msgtyp: i64, data: Vec<u8>) -> Result<(), Errno> {
        if data.len() > MSG_LENGTH_MAX {
            return Err(Errno::Einval);
        }
        let queue = self.queue_mut(msgid)?;
        if queue.msgs.len() >= MSG_PER_QUEUE_MAX {
            return Err(Errno::Eagain);
        }
        queue.msgs.push_back((msgtyp, data));
        Ok(())
    }

    /// Removes and returns the first message matching `msgtyp` whose size
    /// is exactly `size`.
    pub fn pop(&mut self, msgid: i32, msgtyp: i64, size: usize) -> Result<(i64, Vec<u8>), Errno> {
        let queue = self.queue_mut(msgid)?;
        let index = match msgtyp {
            0 => {
                if queue.msgs.is_empty() {
                    return Err(Errno::Eagain);
                }
                0
            }
            t if t > 0 => queue
                .msgs
                .iter()
                .position(|(typ, _)| *typ == t)
                .ok_or(Errno::Eagain)?,
            t => {
                // Lowest type <= |t|, earliest among equals.
                let bound = -t;
                let lowest = queue
                    .msgs
                    .iter()
                    .filter(|(typ, _)| *typ <= bound)
                    .map(|(typ, _)| *typ)
                    .min()
                    .ok_or(Errno::Eagain)?;
                queue
                    .msgs
                    .iter()
                    .position(|(typ, _)| *typ == lowest)
                    .unwrap()
            }
        };
        if queue.msgs[index].1.len() != size {
            return Err(Errno::Eagain);
        }
        Ok(queue.msgs.remove(index).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_create_and_reuse() {
        let mut mgr = MsgManager::new();
        let a = mgr.get(100, IPC_CREAT).unwrap();
        let b = mgr.get(100, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(mgr.get(100, IPC_CREAT | IPC_EXCL).unwrap_err(), Errno::Eexist);
        assert_eq!(mgr.get(200, 0).unwrap_err(), Errno::Enoent);
    }

    #[test]
    fn test_close_destroys_on_last_ref() {
        let mut mgr = MsgManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        mgr.get(1, 0).unwrap();
        mgr.close(id).unwrap();
        // Still alive through the second handle.
        mgr.push(id, 1, vec![0]).unwrap();
        mgr.close(id).unwrap();
        assert_eq!(mgr.push(id, 1, vec![0]).unwrap_err(), Errno::Einval);
    }

    #[test]
    fn test_fifo_order_for_type_zero() {
        let mut mgr = MsgManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        mgr.push(id, 5, vec![5; 2]).unwrap();
        mgr.push(id, 3, vec![3; 2]).unwrap();
        assert_eq!(mgr.pop(id, 0, 2).unwrap(), (5, vec![5; 2]));
        assert_eq!(mgr.pop(id, 0, 2).unwrap(), (3, vec![3; 2]));
        assert_eq!(mgr.pop(id, 0, 2).unwrap_err(), Errno::Eagain);
    }

    #[test]
    fn test_positive_type_matches_exactly() {
        let mut mgr = MsgManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        mgr.push(id, 5, vec![5]).unwrap();
        mgr.push(id, 3, vec![3]).unwrap();
        assert_eq!(mgr.pop(id, 3, 1).unwrap(), (3, vec![3]));
        assert_eq!(mgr.pop(id, 4, 1).unwrap_err(), Errno::Eagain);
    }

    #[test]
    fn test_negative_type_takes_lowest_within_bound() {
        let mut mgr = MsgManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        mgr.push(id, 7, vec![7]).unwrap();
        mgr.push(id, 2, vec![2]).unwrap();
        mgr.push(id, 4, vec![4]).unwrap();
        // Bound 5: candidates are 2 and 4; lowest wins.
        assert_eq!(mgr.pop(id, -5, 1).unwrap(), (2, vec![2]));
        assert_eq!(mgr.pop(id, -5, 1).unwrap(), (4, vec![4]));
        // Only type 7 left, above the bound.
        assert_eq!(mgr.pop(id, -5, 1).unwrap_err(), Errno::Eagain);
    }

    #[test]
    fn test_size_mismatch_is_eagain() {
        let mut mgr = MsgManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        mgr.push(id, 1, vec![0; 16]).unwrap();
        assert_eq!(mgr.pop(id, 1, 8).unwrap_err(), Errno::Eagain);
        assert!(mgr.pop(id, 1, 16).is_ok());
    }

    #[test]
    fn test_capacity_limits() {
        let mut mgr = MsgManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        assert_eq!(
            mgr.push(id, 1, vec![0; MSG_LENGTH_MAX + 1]).unwrap_err(),
            Errno::Einval
        );
        for i in 0..MSG_PER_QUEUE_MAX {
            mgr.push(id, i as i64 + 1, vec![0]).unwrap();
        }
        assert_eq!(mgr.push(id, 1, vec![0]).unwrap_err(), Errno::Eagain);
    }
}
