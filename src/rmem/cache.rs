//! Client-side page cache over the RMem stub.
//!
//! Sits between the virtual-memory layer and remote memory: `get` faults a
//! block in, `put` marks it dirty, and write-back happens on eviction or on
//! an explicit flush. The replacement policy is chosen at runtime and can
//! be swapped without purging resident lines.

use crate::config::{RCACHE_NUM_LINES, RMEM_BLOCK_SIZE};
use crate::msg::Errno;
use crate::rmem::client::RmemClient;
use crate::rmem::{RPage, RMEM_NULL};
use crate::ClientError;
use log::debug;

/// Replacement policies understood by [`RCache::select_policy`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    /// No real caching: every miss lands in slot 0, every put writes
    /// straight through.
    Bypass,
    /// Evict lines in installation order.
    Fifo,
    /// Evict the line untouched for longest.
    Lru,
}

trait ReplacementPolicy: Send {
    fn kind(&self) -> PolicyKind;
    fn on_install(&mut self, slot: usize);
    fn on_hit(&mut self, slot: usize);
    /// Picks the slot to evict next. `valid` flags which slots hold lines.
    fn victim(&mut self, valid: &[bool]) -> usize;
}

struct Bypass;

impl ReplacementPolicy for Bypass {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Bypass
    }
    fn on_install(&mut self, _slot: usize) {}
    fn on_hit(&mut self, _slot: usize) {}
    fn victim(&mut self, _valid: &[bool]) -> usize {
        0
    }
}

/// Shared shape of the age-ordered policies: FIFO stamps on install only,
/// LRU restamps on every touch.
struct Aged {
    kind: PolicyKind,
    clock: u64,
    stamp: Vec<u64>,
}

impl Aged {
    fn new(kind: PolicyKind) -> Aged {
        Aged {
            kind,
            clock: 0,
            stamp: vec![0; RCACHE_NUM_LINES],
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

impl ReplacementPolicy for Aged {
    fn kind(&self) -> PolicyKind {
        self.kind
    }

    fn on_install(&mut self, slot: usize) {
        let now = self.tick();
        self.stamp[slot] = now;
    }

    fn on_hit(&mut self, slot: usize) {
        if self.kind == PolicyKind::Lru {
            let now = self.tick();
            self.stamp[slot] = now;
        }
    }

    fn victim(&mut self, valid: &[bool]) -> usize {
        // Prefer an empty slot; otherwise the oldest stamp wins.
        if let Some(free) = valid.iter().position(|&v| !v) {
            return free;
        }
        (0..RCACHE_NUM_LINES)
            .min_by_key(|&i| self.stamp[i])
            .unwrap_or(0)
    }
}

fn make_policy(kind: PolicyKind) -> Box<dyn ReplacementPolicy> {
    match kind {
        PolicyKind::Bypass => Box::new(Bypass),
        PolicyKind::Fifo | PolicyKind::Lru => Box::new(Aged::new(kind)),
    }
}

struct Line {
    blknum: RPage,
    data: Vec<u8>,
    valid: bool,
    dirty: bool,
}

pub struct RCache {
    client: RmemClient,
    lines: Vec<Line>,
    policy: Box<dyn ReplacementPolicy>,
}

impl RCache {
    pub fn new(client: RmemClient, kind: PolicyKind) -> RCache {
        let lines = (0..RCACHE_NUM_LINES)
            .map(|_| Line {
                blknum: RMEM_NULL,
                data: vec![0u8; RMEM_BLOCK_SIZE],
                valid: false,
                dirty: false,
            })
            .collect();
        RCache {
            client,
            lines,
            policy: make_policy(kind),
        }
    }

    /// Swaps the replacement policy. Resident lines stay resident; only
    /// the policy bookkeeping starts fresh.
    pub fn select_policy(&mut self, kind: PolicyKind) {
        debug!("[rcache] policy -> {kind:?}");
        self.policy = make_policy(kind);
    }

    pub fn policy(&self) -> PolicyKind {
        self.policy.kind()
    }

    fn slot_of(&self, blknum: RPage) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.valid && l.blknum == blknum)
    }

    /// Returns the cached contents of `blknum`, faulting it in from remote
    /// memory on a miss. The borrow is stable until the next call that may
    /// evict. Under the bypass policy every call re-reads remote memory.
    pub fn get(&mut self, blknum: RPage) -> Result<&mut [u8], ClientError> {
        if blknum == RMEM_NULL {
            return Err(ClientError::Server(Errno::Einval));
        }

        let resident = self.slot_of(blknum);
        if self.policy.kind() != PolicyKind::Bypass {
            if let Some(slot) = resident {
                self.policy.on_hit(slot);
                return Ok(&mut self.lines[slot].data);
            }
        }

        // Bypass refetches resident blocks too; reusing their slot keeps a
        // block from occupying two lines at once.
        let slot = match resident {
            Some(slot) => slot,
            None => {
                let valid: Vec<bool> = self.lines.iter().map(|l| l.valid).collect();
                self.policy.victim(&valid)
            }
        };
        self.evict(slot)?;

        self.client.read(blknum, &mut self.lines[slot].data)?;
        self.lines[slot].blknum = blknum;
        self.lines[slot].valid = true;
        self.lines[slot].dirty = false;
        self.policy.on_install(slot);
        debug!("[rcache] miss blknum={blknum} -> slot {slot}");
        Ok(&mut self.lines[slot].data)
    }

    /// Marks the resident line for `blknum` dirty. Under the bypass policy
    /// this writes through immediately.
    pub fn put(&mut self, blknum: RPage) -> Result<(), ClientError> {
        let slot = self
            .slot_of(blknum)
            .ok_or(ClientError::Server(Errno::Enoent))?;
        self.lines[slot].dirty = true;
        if self.policy.kind() == PolicyKind::Bypass {
            self.flush(blknum)?;
        }
        Ok(())
    }

    /// Writes the line for `blknum` back when dirty. Idempotent.
    pub fn flush(&mut self, blknum: RPage) -> Result<(), ClientError> {
        if let Some(slot) = self.slot_of(blknum) {
            if self.lines[slot].dirty {
                self.client.write(blknum, &self.lines[slot].data)?;
                self.lines[slot].dirty = false;
            }
        }
        Ok(())
    }

    /// Writes back every dirty line. After it returns no line is dirty.
    pub fn flush_all(&mut self) -> Result<(), ClientError> {
        for slot in 0..self.lines.len() {
            if self.lines[slot].valid && self.lines[slot].dirty {
                let blknum = self.lines[slot].blknum;
                self.client.write(blknum, &self.lines[slot].data)?;
                self.lines[slot].dirty = false;
            }
        }
        Ok(())
    }

    /// Drops the line for `blknum` without write-back. Used by the SHM
    /// snooper when the server broadcasts an invalidation: the remote copy
    /// is authoritative from now on.
    pub fn invalidate(&mut self, blknum: RPage) {
        if let Some(slot) = self.slot_of(blknum) {
            debug!("[rcache] invalidate blknum={blknum} slot={slot}");
            self.lines[slot].valid = false;
            self.lines[slot].dirty = false;
            self.lines[slot].blknum = RMEM_NULL;
        }
    }

    fn evict(&mut self, slot: usize) -> Result<(), ClientError> {
        if self.lines[slot].valid && self.lines[slot].dirty {
            let blknum = self.lines[slot].blknum;
            debug!("[rcache] writeback on evict blknum={blknum}");
            self.client.write(blknum, &self.lines[slot].data)?;
        }
        self.lines[slot].valid = false;
        self.lines[slot].dirty = false;
        self.lines[slot].blknum = RMEM_NULL;
        Ok(())
    }

    /// The stub this cache writes through to.
    pub fn client(&self) -> &RmemClient {
        &self.client
    }

    #[cfg(test)]
    fn resident(&self, blknum: RPage) -> bool {
        self.slot_of(blknum).is_some()
    }

    #[cfg(test)]
    fn dirty(&self, blknum: RPage) -> bool {
        self.slot_of(blknum)
            .map(|s| self.lines[s].dirty)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RMEM_SERVER_NODE;
    use crate::noc::Fabric;
    use std::sync::Arc;
    use std::thread;

    struct Rig {
        cache: RCache,
        verify: RmemClient,
        server: Option<thread::JoinHandle<()>>,
    }

    fn boot(policy: PolicyKind) -> Rig {
        let fabric = Fabric::new();
        let server_node = Arc::new(fabric.attach(RMEM_SERVER_NODE).unwrap());
        let mut server = crate::rmem::RmemServer::new(server_node).unwrap();
        let handle = thread::spawn(move || server.run());

        let node = Arc::new(fabric.attach(1).unwrap());
        let cache = RCache::new(RmemClient::new(Arc::clone(&node)).unwrap(), policy);
        let verify = RmemClient::new(node).unwrap();
        Rig {
            cache,
            verify,
            server: Some(handle),
        }
    }

    impl Rig {
        fn shutdown(mut self) {
            self.verify.shutdown().unwrap();
            self.server.take().unwrap().join().unwrap();
        }
    }

    fn remote_fill(client: &RmemClient, blknum: RPage, fill: u8) {
        let buf = vec![fill; RMEM_BLOCK_SIZE];
        client.write(blknum, &buf).unwrap();
    }

    fn remote_byte(client: &RmemClient, blknum: RPage) -> u8 {
        let mut buf = vec![0u8; RMEM_BLOCK_SIZE];
        client.read(blknum, &mut buf).unwrap();
        buf[0]
    }

    #[test]
    fn test_get_faults_in_remote_contents() {
        let mut rig = boot(PolicyKind::Fifo);
        let b = rig.cache.client().alloc().unwrap();
        remote_fill(&rig.verify, b, 0x42);

        let data = rig.cache.get(b).unwrap();
        assert!(data.iter().all(|&x| x == 0x42));
        rig.cache.client().free(b).unwrap();
        rig.shutdown();
    }

    #[test]
    fn test_put_then_flush_writes_back() {
        let mut rig = boot(PolicyKind::Fifo);
        let b = rig.cache.client().alloc().unwrap();

        rig.cache.get(b).unwrap()[0] = 0x77;
        rig.cache.put(b).unwrap();
        assert!(rig.cache.dirty(b));
        // Not flushed yet: remote still zero.
        assert_eq!(remote_byte(&rig.verify, b), 0);

        rig.cache.flush(b).unwrap();
        assert!(!rig.cache.dirty(b));
        assert_eq!(remote_byte(&rig.verify, b), 0x77);

        // Idempotent when clean.
        rig.cache.flush(b).unwrap();
        rig.shutdown();
    }

    #[test]
    fn test_flush_all_leaves_nothing_dirty() {
        let mut rig = boot(PolicyKind::Fifo);
        let blocks: Vec<RPage> = (0..4).map(|_| rig.cache.client().alloc().unwrap()).collect();

        for (i, &b) in blocks.iter().enumerate() {
            rig.cache.get(b).unwrap()[0] = i as u8 + 1;
            rig.cache.put(b).unwrap();
        }
        rig.cache.flush_all().unwrap();
        for (i, &b) in blocks.iter().enumerate() {
            assert!(!rig.cache.dirty(b));
            assert_eq!(remote_byte(&rig.verify, b), i as u8 + 1);
        }
        rig.shutdown();
    }

    #[test]
    fn test_eviction_never_loses_updates() {
        let mut rig = boot(PolicyKind::Fifo);
        let blocks: Vec<RPage> = (0..RCACHE_NUM_LINES + 1)
            .map(|_| rig.cache.client().alloc().unwrap())
            .collect();

        // Dirty the first block, then stream enough misses through the
        // cache to force its eviction.
        rig.cache.get(blocks[0]).unwrap()[0] = 0xaa;
        rig.cache.put(blocks[0]).unwrap();
        for &b in &blocks[1..] {
            rig.cache.get(b).unwrap();
        }
        assert!(!rig.cache.resident(blocks[0]));
        assert_eq!(remote_byte(&rig.verify, blocks[0]), 0xaa);
        rig.shutdown();
    }

    #[test]
    fn test_fifo_evicts_in_install_order() {
        let mut rig = boot(PolicyKind::Fifo);
        let blocks: Vec<RPage> = (0..RCACHE_NUM_LINES + 1)
            .map(|_| rig.cache.client().alloc().unwrap())
            .collect();

        for &b in &blocks[..RCACHE_NUM_LINES] {
            rig.cache.get(b).unwrap();
        }
        // Touching the oldest line does not save it under FIFO.
        rig.cache.get(blocks[0]).unwrap();
        rig.cache.get(blocks[RCACHE_NUM_LINES]).unwrap();
        assert!(!rig.cache.resident(blocks[0]));
        assert!(rig.cache.resident(blocks[1]));
        rig.shutdown();
    }

    #[test]
    fn test_lru_spares_recently_used() {
        let mut rig = boot(PolicyKind::Lru);
        let blocks: Vec<RPage> = (0..RCACHE_NUM_LINES + 1)
            .map(|_| rig.cache.client().alloc().unwrap())
            .collect();

        for &b in &blocks[..RCACHE_NUM_LINES] {
            rig.cache.get(b).unwrap();
        }
        // Refresh block 0; block 1 becomes the LRU victim.
        rig.cache.get(blocks[0]).unwrap();
        rig.cache.get(blocks[RCACHE_NUM_LINES]).unwrap();
        assert!(rig.cache.resident(blocks[0]));
        assert!(!rig.cache.resident(blocks[1]));
        rig.shutdown();
    }

    #[test]
    fn test_bypass_writes_through() {
        let mut rig = boot(PolicyKind::Bypass);
        let b = rig.cache.client().alloc().unwrap();

        rig.cache.get(b).unwrap()[0] = 0x11;
        rig.cache.put(b).unwrap();
        // Put wrote through immediately; nothing left dirty.
        assert!(!rig.cache.dirty(b));
        assert_eq!(remote_byte(&rig.verify, b), 0x11);
        rig.shutdown();
    }

    #[test]
    fn test_bypass_get_always_refetches() {
        let mut rig = boot(PolicyKind::Bypass);
        let b = rig.cache.client().alloc().unwrap();

        assert!(rig.cache.get(b).unwrap().iter().all(|&x| x == 0));
        // Remote contents change behind the cache's back; the next get
        // must not serve the stale first read.
        remote_fill(&rig.verify, b, 0x5f);
        assert_eq!(rig.cache.get(b).unwrap()[0], 0x5f);

        let stats = rig.cache.client().stats();
        assert_eq!(stats.nreads, 2);
        rig.shutdown();
    }

    #[test]
    fn test_bypass_refetch_flushes_resident_dirty_line() {
        let mut rig = boot(PolicyKind::Fifo);
        let b = rig.cache.client().alloc().unwrap();

        // Dirty the line under FIFO, then switch to bypass.
        rig.cache.get(b).unwrap()[0] = 0x11;
        rig.cache.put(b).unwrap();
        rig.cache.select_policy(PolicyKind::Bypass);

        // The bypass get writes the pending update back before refetching,
        // so the refetched bytes are the flushed ones.
        assert_eq!(rig.cache.get(b).unwrap()[0], 0x11);
        assert_eq!(remote_byte(&rig.verify, b), 0x11);
        assert!(!rig.cache.dirty(b));
        rig.shutdown();
    }

    #[test]
    fn test_policy_switch_keeps_resident_lines() {
        let mut rig = boot(PolicyKind::Fifo);
        let b = rig.cache.client().alloc().unwrap();
        remote_fill(&rig.verify, b, 0x33);

        rig.cache.get(b).unwrap();
        let before = rig.cache.client().stats();
        rig.cache.select_policy(PolicyKind::Lru);
        assert!(rig.cache.resident(b));
        // Still a hit: no extra remote read happened.
        rig.cache.get(b).unwrap();
        assert_eq!(rig.cache.client().stats().nreads, before.nreads);
        rig.shutdown();
    }

    #[test]
    fn test_invalidate_drops_without_writeback() {
        let mut rig = boot(PolicyKind::Fifo);
        let b = rig.cache.client().alloc().unwrap();
        remote_fill(&rig.verify, b, 0x01);

        rig.cache.get(b).unwrap()[0] = 0x99;
        rig.cache.put(b).unwrap();
        rig.cache.invalidate(b);
        assert!(!rig.cache.resident(b));
        // The local update was deliberately discarded.
        assert_eq!(remote_byte(&rig.verify, b), 0x01);
        // A fresh get refetches the authoritative copy.
        assert_eq!(rig.cache.get(b).unwrap()[0], 0x01);
        rig.shutdown();
    }

    #[test]
    fn test_get_null_block_rejected() {
        let mut rig = boot(PolicyKind::Fifo);
        assert!(rig.cache.get(RMEM_NULL).is_err());
        rig.shutdown();
    }
}
