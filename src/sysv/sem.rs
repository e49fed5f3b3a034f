//! System V semaphores with server-side wait queues.
//!
//! `operate` is the only interesting path: a decrement that cannot proceed
//! parks the caller's pid on the semaphore, and a later increment settles
//! the debt by performing the parked operation and telling the server whom
//! to send the long-overdue reply to; the reply port comes from the
//! connection table, where the waiter's `sem_get` registered it. The queue
//! is FIFO among satisfiable waiters; no stronger fairness is promised.

use crate::config::SEMAPHORES_MAX;
use crate::msg::{Errno, SemBuf};
use crate::proc::Pid;
use crate::sysv::{IPC_CREAT, IPC_EXCL, IPC_NOWAIT};
use log::debug;
use std::collections::VecDeque;

#[derive(Copy, Clone, Debug)]
pub struct Waiter {
    pub pid: Pid,
    pub op: SemBuf,
}

struct Semaphore {
    key: i32,
    refcount: u32,
    value: i32,
    waiters: VecDeque<Waiter>,
}

/// What the server should do after an `operate`.
#[derive(Debug)]
pub enum SemOutcome {
    /// The operation completed; reply to the requester. When a parked
    /// waiter became satisfiable, it was already applied — send the waiter
    /// its deferred reply too.
    Done(Option<Waiter>),
    /// The requester must block: no reply now, it was queued.
    Block,
}

pub struct SemManager {
    sems: Vec<Option<Semaphore>>,
}

impl Default for SemManager {
    fn default() -> Self {
        SemManager::new()
    }
}

impl SemManager {
    pub fn new() -> SemManager {
        SemManager {
            sems: (0..SEMAPHORES_MAX).map(|_| None).collect(),
        }
    }

    fn sem_mut(&mut self, semid: i32) -> Result<&mut Semaphore, Errno> {
        if semid < 0 || semid as usize >= SEMAPHORES_MAX {
            return Err(Errno::Einval);
        }
        self.sems[semid as usize].as_mut().ok_or(Errno::Einval)
    }

    /// Finds or creates the semaphore for `key`; returns its id.
    pub fn get(&mut self, key: i32, flags: i32) -> Result<i32, Errno> {
        if let Some(i) = self
            .sems
            .iter()
            .position(|s| matches!(s, Some(s) if s.key == key))
        {
            if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                return Err(Errno::Eexist);
            }
            self.sems[i].as_mut().unwrap().refcount += 1;
            return Ok(i as i32);
        }
        if flags & IPC_CREAT == 0 {
            return Err(Errno::Enoent);
        }
        let free = self
            .sems
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::Eagain)?;
        self.sems[free] = Some(Semaphore {
            key,
            refcount: 1,
            value: 0,
            waiters: VecDeque::new(),
        });
        debug!("[sem] created semaphore key={key} semid={free}");
        Ok(free as i32)
    }

    /// Drops one handle. A semaphore with parked waiters survives even
    /// unreferenced; destroying it would strand them without a reply.
    pub fn close(&mut self, semid: i32) -> Result<(), Errno> {
        let sem = self.sem_mut(semid)?;
        if sem.refcount == 0 {
            return Err(Errno::Einval);
        }
        sem.refcount -= 1;
        if sem.refcount == 0 && sem.waiters.is_empty() {
            self.sems[semid as usize] = None;
        }
        Ok(())
    }

    /// Applies `sembuf` for the requester `pid`.
    pub fn operate(&mut self, semid: i32, pid: Pid, sembuf: SemBuf) -> Result<SemOutcome, Errno> {
        let sem = self.sem_mut(semid)?;
        let op = sembuf.op as i32;

        if op > 0 {
            sem.value += op;
        } else if op < 0 {
            if sem.value + op < 0 {
                if sembuf.flg as i32 & IPC_NOWAIT != 0 {
                    return Err(Errno::Eagain);
                }
                sem.waiters.push_back(Waiter { pid, op: sembuf });
                debug!("[sem] semid={semid} parking {pid:?}");
                return Ok(SemOutcome::Block);
            }
            sem.value += op;
        } else {
            // Wait-for-zero.
            if sem.value != 0 {
                if sembuf.flg as i32 & IPC_NOWAIT != 0 {
                    return Err(Errno::Eagain);
                }
                sem.waiters.push_back(Waiter { pid, op: sembuf });
                debug!("[sem] semid={semid} parking {pid:?} (wait-for-zero)");
                return Ok(SemOutcome::Block);
            }
        }

        // The value moved; settle the first waiter it satisfies.
        let woken = Self::wake_one(sem);
        Ok(SemOutcome::Done(woken))
    }

    fn wake_one(sem: &mut Semaphore) -> Option<Waiter> {
        let index = sem.waiters.iter().position(|w| {
            let op = w.op.op as i32;
            if op < 0 {
                sem.value + op >= 0
            } else {
                sem.value == 0
            }
        })?;
        let waiter = sem.waiters.remove(index).unwrap();
        sem.value += waiter.op.op as i32;
        debug!("[sem] waking {:?}", waiter.pid);
        Some(waiter)
    }

    /// Waiters still parked, across all semaphores. Consulted at server
    /// shutdown so abandonment is at least loud.
    pub fn parked_waiters(&self) -> Vec<Waiter> {
        self.sems
            .iter()
            .flatten()
            .flat_map(|s| s.waiters.iter().copied())
            .collect()
    }

    #[cfg(test)]
    fn value(&self, semid: i32) -> i32 {
        self.sems[semid as usize].as_ref().unwrap().value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::PID_NULL;

    fn pid(n: u32) -> Pid {
        PID_NULL.with_source(1).with_id(n)
    }

    fn buf(op: i16, flg: i16) -> SemBuf {
        SemBuf { num: 0, op, flg }
    }

    #[test]
    fn test_get_and_close() {
        let mut mgr = SemManager::new();
        let a = mgr.get(7, IPC_CREAT).unwrap();
        let b = mgr.get(7, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(mgr.get(7, IPC_CREAT | IPC_EXCL).unwrap_err(), Errno::Eexist);
        mgr.close(a).unwrap();
        mgr.close(b).unwrap();
        assert_eq!(mgr.close(a).unwrap_err(), Errno::Einval);
    }

    #[test]
    fn test_increment_then_decrement_is_synchronous() {
        let mut mgr = SemManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();

        match mgr.operate(id, pid(1), buf(2, 0)).unwrap() {
            SemOutcome::Done(None) => {}
            _ => panic!("increment should complete alone"),
        }
        assert_eq!(mgr.value(id), 2);

        match mgr.operate(id, pid(1), buf(-1, 0)).unwrap() {
            SemOutcome::Done(None) => {}
            _ => panic!("covered decrement should complete"),
        }
        assert_eq!(mgr.value(id), 1);
    }

    #[test]
    fn test_uncovered_decrement_blocks_or_fails_fast() {
        let mut mgr = SemManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();

        assert_eq!(
            mgr.operate(id, pid(1), buf(-1, IPC_NOWAIT as i16))
                .unwrap_err(),
            Errno::Eagain
        );
        match mgr.operate(id, pid(1), buf(-1, 0)).unwrap() {
            SemOutcome::Block => {}
            _ => panic!("uncovered decrement should block"),
        }
        assert_eq!(mgr.parked_waiters().len(), 1);
        // The pending decrement keeps the invariant: value plus parked
        // debits never goes negative once the waiter is settled.
        assert_eq!(mgr.value(id), 0);
    }

    #[test]
    fn test_increment_wakes_parked_waiter() {
        let mut mgr = SemManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();

        assert!(matches!(
            mgr.operate(id, pid(1), buf(-1, 0)).unwrap(),
            SemOutcome::Block
        ));
        match mgr.operate(id, pid(2), buf(1, 0)).unwrap() {
            SemOutcome::Done(Some(waiter)) => {
                assert_eq!(waiter.pid, pid(1));
                assert_eq!(waiter.op.op, -1);
            }
            _ => panic!("increment should settle the waiter"),
        }
        assert_eq!(mgr.value(id), 0);
        assert!(mgr.parked_waiters().is_empty());
    }

    #[test]
    fn test_fifo_among_satisfiable() {
        let mut mgr = SemManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();

        // First waiter needs 3, second needs 1.
        assert!(matches!(
            mgr.operate(id, pid(1), buf(-3, 0)).unwrap(),
            SemOutcome::Block
        ));
        assert!(matches!(
            mgr.operate(id, pid(2), buf(-1, 0)).unwrap(),
            SemOutcome::Block
        ));

        // +1 cannot satisfy the first waiter; the second gets it.
        match mgr.operate(id, pid(3), buf(1, 0)).unwrap() {
            SemOutcome::Done(Some(waiter)) => assert_eq!(waiter.pid, pid(2)),
            _ => panic!("second waiter should be woken"),
        }
        // +3 now satisfies the first.
        match mgr.operate(id, pid(3), buf(3, 0)).unwrap() {
            SemOutcome::Done(Some(waiter)) => assert_eq!(waiter.pid, pid(1)),
            _ => panic!("first waiter should be woken"),
        }
        assert_eq!(mgr.value(id), 0);
    }

    #[test]
    fn test_wait_for_zero() {
        let mut mgr = SemManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();

        // Zero already: completes at once.
        assert!(matches!(
            mgr.operate(id, pid(1), buf(0, 0)).unwrap(),
            SemOutcome::Done(None)
        ));

        mgr.operate(id, pid(1), buf(1, 0)).unwrap();
        assert!(matches!(
            mgr.operate(id, pid(2), buf(0, 0)).unwrap(),
            SemOutcome::Block
        ));
        // Draining the value settles the zero-waiter.
        match mgr.operate(id, pid(3), buf(-1, 0)).unwrap() {
            SemOutcome::Done(Some(waiter)) => assert_eq!(waiter.pid, pid(2)),
            _ => panic!("zero-waiter should be woken"),
        }
    }

    #[test]
    fn test_close_keeps_semaphore_with_waiters() {
        let mut mgr = SemManager::new();
        let id = mgr.get(1, IPC_CREAT).unwrap();
        mgr.operate(id, pid(1), buf(-1, 0)).unwrap();
        mgr.close(id).unwrap();
        // Record survives for the parked waiter's sake.
        assert_eq!(mgr.parked_waiters().len(), 1);
        match mgr.operate(id, pid(2), buf(1, 0)).unwrap() {
            SemOutcome::Done(Some(_)) => {}
            _ => panic!("waiter should still be reachable"),
        }
    }

    #[test]
    fn test_bad_semid() {
        let mut mgr = SemManager::new();
        assert_eq!(
            mgr.operate(0, pid(1), buf(1, 0)).unwrap_err(),
            Errno::Einval
        );
        assert_eq!(
            mgr.operate(-1, pid(1), buf(1, 0)).unwrap_err(),
            Errno::Einval
        );
    }
}
