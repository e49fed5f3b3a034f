//! Remote Memory Service.
//!
//! One daemon owns a pool of fixed-size blocks and serves alloc, free,
//! read and write requests. Control rides on the mailbox; block contents
//! ride on portals. Block 0 is reserved at startup and doubles as the null
//! target: a transfer aimed at a bogus block still completes against block
//! 0 so the peer's portal never stalls, and the reply carries the fault.

pub mod cache;
pub mod client;

use crate::config::{RMEM_BLOCK_SIZE, RMEM_NUM_BLOCKS, RMEM_SERVER_PORT};
use crate::msg::{Errno, Header, Message, Opcode, Payload, Ret};
use crate::noc::{MailboxRx, Node, NocError};
use log::{debug, info, warn};
use std::sync::Arc;

/// Remote block number.
pub type RPage = u32;

/// The reserved null block. Never returned by alloc, never freeable.
pub const RMEM_NULL: RPage = 0;

#[derive(Default)]
struct Stats {
    nallocs: u64,
    nfrees: u64,
    nreads: u64,
    nwrites: u64,
    tstart: u64,
    tshutdown: u64,
    talloc: u64,
    tfree: u64,
    tread: u64,
    twrite: u64,
    nblocks: usize,
}

pub struct RmemServer {
    node: Arc<Node>,
    inbox: MailboxRx,
    memory: Vec<u8>,
    bitmap: Vec<u8>,
    stats: Stats,
}

fn bit_test(bitmap: &[u8], bit: usize) -> bool {
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

fn bit_set(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

fn bit_clear(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

fn first_free(bitmap: &[u8]) -> Option<usize> {
    (0..RMEM_NUM_BLOCKS).find(|&bit| !bit_test(bitmap, bit))
}

impl RmemServer {
    pub fn new(node: Arc<Node>) -> Result<RmemServer, NocError> {
        let inbox = node.mailbox_bind(RMEM_SERVER_PORT)?;
        let mut bitmap = vec![0u8; (RMEM_NUM_BLOCKS + 7) / 8];

        // First block is special.
        bit_set(&mut bitmap, 0);
        let mut stats = Stats {
            nblocks: 1,
            ..Stats::default()
        };
        stats.tstart = node.clock();

        info!("[rmem] server alive");
        info!(
            "[rmem] serving {} blocks of {} bytes on node {}",
            RMEM_NUM_BLOCKS,
            RMEM_BLOCK_SIZE,
            node.num()
        );

        Ok(RmemServer {
            inbox,
            memory: vec![0u8; RMEM_NUM_BLOCKS * RMEM_BLOCK_SIZE],
            bitmap,
            stats,
            node,
        })
    }

    pub fn run(&mut self) {
        loop {
            let frame = match self.inbox.read() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("[rmem] inbox read failed: {err}");
                    continue;
                }
            };
            let request = match Message::decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("[rmem] dropping malformed frame: {err}");
                    continue;
                }
            };
            let header = request.header;
            debug!(
                "[rmem] request opcode={:?} source={}",
                header.opcode, header.source
            );

            let t0 = self.node.clock();
            let ret = match request.payload {
                Payload::None if header.opcode == Opcode::RmemAlloc => {
                    self.stats.nallocs += 1;
                    let ret = self.do_alloc();
                    self.stats.talloc += self.node.clock() - t0;
                    ret
                }
                Payload::RmemFree { blknum } => {
                    self.stats.nfrees += 1;
                    let ret = self.do_free(blknum);
                    self.stats.tfree += self.node.clock() - t0;
                    ret
                }
                Payload::RmemWrite { blknum } => {
                    self.stats.nwrites += 1;
                    let ret = self.do_write(&header, blknum);
                    self.stats.twrite += self.node.clock() - t0;
                    ret
                }
                Payload::RmemRead { blknum } => {
                    self.stats.nreads += 1;
                    let ret = self.do_read(&header, blknum);
                    self.stats.tread += self.node.clock() - t0;
                    ret
                }
                Payload::None if header.opcode == Opcode::RmemExit => {
                    self.stats.tshutdown = self.node.clock();
                    break;
                }
                other => {
                    warn!("[rmem] unexpected payload {other:?}");
                    continue;
                }
            };

            let ret = match ret {
                Ok(ret) => ret,
                Err(err) => Ret::from_errno(err),
            };
            let response =
                Message::reply(self.node.num(), Opcode::RmemSuccess, Opcode::RmemFail, ret);
            let outbox = self
                .node
                .mailbox_open(header.source, header.mailbox_port)
                .expect("[rmem] open reply mailbox");
            outbox
                .write(&response.encode())
                .expect("[rmem] write reply");
        }

        info!(
            "[rmem] uptime={}ns",
            self.stats.tshutdown.saturating_sub(self.stats.tstart)
        );
        info!(
            "[rmem] talloc={} nallocs={} tfree={} nfrees={} tread={} nreads={} twrite={} nwrites={}",
            self.stats.talloc,
            self.stats.nallocs,
            self.stats.tfree,
            self.stats.nfrees,
            self.stats.tread,
            self.stats.nreads,
            self.stats.twrite,
            self.stats.nwrites
        );
    }

    fn block_mut(&mut self, blknum: RPage) -> &mut [u8] {
        let start = blknum as usize * RMEM_BLOCK_SIZE;
        &mut self.memory[start..start + RMEM_BLOCK_SIZE]
    }

    fn block(&self, blknum: RPage) -> &[u8] {
        let start = blknum as usize * RMEM_BLOCK_SIZE;
        &self.memory[start..start + RMEM_BLOCK_SIZE]
    }

    fn do_alloc(&mut self) -> Result<Ret, Errno> {
        if self.stats.nblocks == RMEM_NUM_BLOCKS {
            warn!("[rmem] remote memory full");
            return Err(Errno::Enomem);
        }
        let bit = first_free(&self.bitmap).expect("bitmap full despite free count");
        bit_set(&mut self.bitmap, bit);
        self.stats.nblocks += 1;
        debug!(
            "[rmem] alloc blknum={} nblocks={}/{}",
            bit, self.stats.nblocks, RMEM_NUM_BLOCKS
        );
        Ok(Ret {
            blknum: bit as RPage,
            ..Ret::default()
        })
    }

    fn do_free(&mut self, blknum: RPage) -> Result<Ret, Errno> {
        if blknum == RMEM_NULL || blknum as usize >= RMEM_NUM_BLOCKS {
            warn!("[rmem] invalid block number {blknum}");
            return Err(Errno::Einval);
        }
        if self.stats.nblocks == 1 {
            warn!("[rmem] remote memory is empty");
            return Err(Errno::Efault);
        }
        if !bit_test(&self.bitmap, blknum as usize) {
            warn!("[rmem] bad free block {blknum}");
            return Err(Errno::Efault);
        }

        self.block_mut(blknum).fill(0);
        bit_clear(&mut self.bitmap, blknum as usize);
        self.stats.nblocks -= 1;
        debug!(
            "[rmem] free blknum={} nblocks={}/{}",
            blknum, self.stats.nblocks, RMEM_NUM_BLOCKS
        );
        Ok(Ret::default())
    }

    /// Receives one block over the portal. A write aimed at an unallocated
    /// block is drained into block 0 so the sender never stalls; the reply
    /// then carries `EFAULT`.
    fn do_write(&mut self, header: &Header, blknum: RPage) -> Result<Ret, Errno> {
        if blknum == RMEM_NULL || blknum as usize >= RMEM_NUM_BLOCKS {
            warn!("[rmem] invalid write block {blknum}");
            return Err(Errno::Einval);
        }

        let (target, fault) = if bit_test(&self.bitmap, blknum as usize) {
            (blknum, None)
        } else {
            warn!("[rmem] bad write block {blknum}");
            (RMEM_NULL, Some(Errno::Efault))
        };

        let mut buf = vec![0u8; RMEM_BLOCK_SIZE];
        let grant = self
            .node
            .stdinportal()
            .allow_from(header.source, header.portal_port);
        let n = grant.read(&mut buf).expect("[rmem] portal read");
        assert_eq!(n, RMEM_BLOCK_SIZE, "[rmem] short portal read");
        self.block_mut(target).copy_from_slice(&buf);

        match fault {
            Some(err) => Err(err),
            None => Ok(Ret::default()),
        }
    }

    /// Sends one block over a portal to the requester. A read of an
    /// unallocated block sends block 0 and flags `EFAULT`.
    fn do_read(&mut self, header: &Header, blknum: RPage) -> Result<Ret, Errno> {
        if blknum == RMEM_NULL || blknum as usize >= RMEM_NUM_BLOCKS {
            warn!("[rmem] invalid read block {blknum}");
            return Err(Errno::Einval);
        }

        let (source, fault) = if bit_test(&self.bitmap, blknum as usize) {
            (blknum, None)
        } else {
            warn!("[rmem] bad read block {blknum}");
            (RMEM_NULL, Some(Errno::Efault))
        };

        let outportal = self
            .node
            .portal_open(header.source, header.portal_port)
            .expect("[rmem] open outbound portal");
        let n = outportal
            .write(self.block(source))
            .expect("[rmem] portal write");
        assert_eq!(n, RMEM_BLOCK_SIZE, "[rmem] short portal write");

        match fault {
            Some(err) => Err(err),
            None => Ok(Ret::default()),
        }
    }
}
