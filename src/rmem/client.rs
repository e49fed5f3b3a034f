//! Client stub for the Remote Memory Service.
//!
//! Each call is one mailbox round trip; reads and writes additionally move
//! one block over a one-shot portal. The stub validates block numbers
//! before anything hits the wire, so a caller can never wedge its own
//! portal against a request the server will refuse without transferring.

use crate::config::{RMEM_BLOCK_SIZE, RMEM_NUM_BLOCKS, RMEM_SERVER_NODE, RMEM_SERVER_PORT};
use crate::msg::{Errno, Header, Message, Opcode, Payload};
use crate::noc::{Mailbox, Node};
use crate::rmem::{RPage, RMEM_NULL};
use crate::ClientError;
use log::debug;
use std::sync::{Arc, Mutex};

/// Client-side operation counters, mirroring what the server accounts for
/// on its end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RmemStats {
    pub nallocs: u64,
    pub nfrees: u64,
    pub nreads: u64,
    pub nwrites: u64,
}

pub struct RmemClient {
    node: Arc<Node>,
    server: Mailbox,
    stats: Mutex<RmemStats>,
}

impl RmemClient {
    pub fn new(node: Arc<Node>) -> Result<RmemClient, ClientError> {
        let server = node.mailbox_open(RMEM_SERVER_NODE, RMEM_SERVER_PORT)?;
        Ok(RmemClient {
            node,
            server,
            stats: Mutex::new(RmemStats::default()),
        })
    }

    fn header(&self, opcode: Opcode) -> Header {
        let mut header = Header::new(opcode, self.node.num());
        header.mailbox_port = self.node.stdinbox().port();
        header
    }

    fn read_reply(&self) -> Result<Message, ClientError> {
        let frame = self.node.stdinbox().read()?;
        let reply = Message::decode(&frame)?;
        if reply.header.opcode == Opcode::RmemFail {
            let err = crate::msg::errcode_to_result(reply.ret().errcode)
                .expect_err("fail reply without errcode");
            return Err(ClientError::Server(err));
        }
        Ok(reply)
    }

    /// Allocates one remote block; never returns the null block.
    pub fn alloc(&self) -> Result<RPage, ClientError> {
        let msg = Message::new(self.header(Opcode::RmemAlloc), Payload::None);
        self.server.write(&msg.encode())?;
        let reply = self.read_reply()?;
        self.stats.lock().unwrap().nallocs += 1;
        debug!("[rmem-client] alloc -> {}", reply.ret().blknum);
        Ok(reply.ret().blknum)
    }

    /// Releases a remote block.
    pub fn free(&self, blknum: RPage) -> Result<(), ClientError> {
        if blknum == RMEM_NULL || blknum as usize >= RMEM_NUM_BLOCKS {
            return Err(ClientError::Server(Errno::Einval));
        }
        let msg = Message::new(self.header(Opcode::RmemFree), Payload::RmemFree { blknum });
        self.server.write(&msg.encode())?;
        self.read_reply()?;
        self.stats.lock().unwrap().nfrees += 1;
        Ok(())
    }

    /// Writes exactly one block. `buf` must be `RMEM_BLOCK_SIZE` bytes.
    pub fn write(&self, blknum: RPage, buf: &[u8]) -> Result<usize, ClientError> {
        if blknum == RMEM_NULL || blknum as usize >= RMEM_NUM_BLOCKS {
            return Err(ClientError::Server(Errno::Einval));
        }
        if buf.len() != RMEM_BLOCK_SIZE {
            return Err(ClientError::Server(Errno::Emsgsize));
        }

        // Open the portal first so the request can carry its source port;
        // the server gates its allow on it.
        let portal = self
            .node
            .portal_open(RMEM_SERVER_NODE, crate::noc::STD_PORT)?;
        let mut header = self.header(Opcode::RmemWrite);
        header.portal_port = portal.src_port();
        let msg = Message::new(header, Payload::RmemWrite { blknum });

        self.server.write(&msg.encode())?;
        let n = portal.write(buf)?;
        self.read_reply()?;
        self.stats.lock().unwrap().nwrites += 1;
        Ok(n)
    }

    /// Reads exactly one block into `buf` (`RMEM_BLOCK_SIZE` bytes).
    pub fn read(&self, blknum: RPage, buf: &mut [u8]) -> Result<usize, ClientError> {
        if blknum == RMEM_NULL || blknum as usize >= RMEM_NUM_BLOCKS {
            return Err(ClientError::Server(Errno::Einval));
        }
        if buf.len() != RMEM_BLOCK_SIZE {
            return Err(ClientError::Server(Errno::Emsgsize));
        }

        let mut header = self.header(Opcode::RmemRead);
        header.portal_port = self.node.stdinportal().port();
        let msg = Message::new(header, Payload::RmemRead { blknum });
        self.server.write(&msg.encode())?;

        let n = self
            .node
            .stdinportal()
            .allow(RMEM_SERVER_NODE)
            .read(buf)?;
        self.read_reply()?;
        self.stats.lock().unwrap().nreads += 1;
        Ok(n)
    }

    /// Snapshot of the client-side counters.
    pub fn stats(&self) -> RmemStats {
        *self.stats.lock().unwrap()
    }

    /// Asks the server to exit its request loop. No reply.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        let msg = Message::new(self.header(Opcode::RmemExit), Payload::None);
        self.server.write(&msg.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noc::Fabric;
    use std::thread;

    pub(crate) fn boot(
        fabric: &Fabric,
        client_node: u32,
    ) -> (RmemClient, thread::JoinHandle<()>) {
        let server_node = Arc::new(fabric.attach(RMEM_SERVER_NODE).unwrap());
        let mut server = crate::rmem::RmemServer::new(server_node).unwrap();
        let handle = thread::spawn(move || server.run());

        let node = Arc::new(fabric.attach(client_node).unwrap());
        let client = RmemClient::new(node).unwrap();
        (client, handle)
    }

    #[test]
    fn test_alloc_free() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);

        let blknum = client.alloc().unwrap();
        assert_ne!(blknum, RMEM_NULL);
        assert!(client.free(blknum).is_ok());

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_read_write() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);

        let blknum = client.alloc().unwrap();
        let buf = vec![1u8; RMEM_BLOCK_SIZE];
        assert_eq!(client.write(blknum, &buf).unwrap(), RMEM_BLOCK_SIZE);

        let mut back = vec![0u8; RMEM_BLOCK_SIZE];
        assert_eq!(client.read(blknum, &mut back).unwrap(), RMEM_BLOCK_SIZE);
        assert!(back.iter().all(|&b| b == 1));

        assert!(client.free(blknum).is_ok());
        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_three_block_consistency() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);

        let b1 = client.alloc().unwrap();
        let b2 = client.alloc().unwrap();
        let b3 = client.alloc().unwrap();

        for (b, fill) in [(b1, 1u8), (b2, 2), (b3, 3)] {
            let buf = vec![fill; RMEM_BLOCK_SIZE];
            assert_eq!(client.write(b, &buf).unwrap(), RMEM_BLOCK_SIZE);
        }
        for (b, fill) in [(b1, 1u8), (b2, 2), (b3, 3)] {
            let mut buf = vec![9u8; RMEM_BLOCK_SIZE];
            assert_eq!(client.read(b, &mut buf).unwrap(), RMEM_BLOCK_SIZE);
            assert!(buf.iter().all(|&x| x == fill));
        }

        for b in [b1, b2, b3] {
            assert!(client.free(b).is_ok());
        }
        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_stats_deltas() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);

        let s1 = client.stats();
        let blknum = client.alloc().unwrap();
        let s2 = client.stats();
        assert_eq!(s2.nallocs - s1.nallocs, 1);
        assert_eq!(s2.nwrites, s1.nwrites);

        let buf = vec![1u8; RMEM_BLOCK_SIZE];
        client.write(blknum, &buf).unwrap();
        let s3 = client.stats();
        assert_eq!(s3.nwrites - s2.nwrites, 1);

        let mut back = vec![0u8; RMEM_BLOCK_SIZE];
        client.read(blknum, &mut back).unwrap();
        let s4 = client.stats();
        assert_eq!(s4.nreads - s3.nreads, 1);

        client.free(blknum).unwrap();
        let s5 = client.stats();
        assert_eq!(s5.nfrees - s4.nfrees, 1);

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_boundary_blocks_rejected_locally() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);
        let buf = vec![0u8; RMEM_BLOCK_SIZE];
        let mut rbuf = vec![0u8; RMEM_BLOCK_SIZE];

        for bad in [RMEM_NULL, RMEM_NUM_BLOCKS as RPage] {
            assert_eq!(
                client.write(bad, &buf).unwrap_err().errno(),
                Some(Errno::Einval)
            );
            assert_eq!(
                client.read(bad, &mut rbuf).unwrap_err().errno(),
                Some(Errno::Einval)
            );
            assert_eq!(client.free(bad).unwrap_err().errno(), Some(Errno::Einval));
        }

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_bogus_block_faults_but_transfers() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);

        // Block 7 is in range but was never allocated: the server drains
        // the transfer into the null block and reports the fault.
        let buf = vec![0x5au8; RMEM_BLOCK_SIZE];
        assert_eq!(
            client.write(7, &buf).unwrap_err().errno(),
            Some(Errno::Efault)
        );
        let mut back = vec![0u8; RMEM_BLOCK_SIZE];
        assert_eq!(
            client.read(7, &mut back).unwrap_err().errno(),
            Some(Errno::Efault)
        );

        // The protocol stayed healthy: a normal round trip still works.
        let blknum = client.alloc().unwrap();
        assert_eq!(client.write(blknum, &buf).unwrap(), RMEM_BLOCK_SIZE);
        client.free(blknum).unwrap();

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_double_free_rejected_by_server() {
        let fabric = Fabric::new();
        let (client, server) = boot(&fabric, 1);

        let a = client.alloc().unwrap();
        let _b = client.alloc().unwrap();
        client.free(a).unwrap();
        assert_eq!(client.free(a).unwrap_err().errno(), Some(Errno::Efault));

        client.shutdown().unwrap();
        server.join().unwrap();
    }
}
