//! Client stubs for the System V service, plus the shared-memory snooper.
//!
//! Every call is a mailbox round trip to the SysV server. Queue payloads
//! ride on portals: a send pushes through the server's inbound portal, a
//! receive waits for the ACK naming the server's outbound portal port and
//! then accepts the payload on its own inbound portal. A `sem_operate`
//! that blocks server-side simply leaves the stub parked in its reply read
//! until some other process unblocks it.

use crate::config::{SHM_SNOOPER_PORT, SYSV_SERVER_NODE, SYSV_SERVER_PORT};
use crate::msg::{Errno, Header, Message, Opcode, Payload, Ret, SemBuf};
use crate::noc::{Mailbox, Node};
use crate::proc::Pid;
use crate::rmem::cache::RCache;
use crate::rmem::RPage;
use crate::ClientError;
use log::{debug, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub struct SysvClient {
    node: Arc<Node>,
    server: Mailbox,
    pid: Pid,
}

impl SysvClient {
    /// Opens the connection to the SysV server on behalf of `pid` (as
    /// handed out by the name service).
    pub fn new(node: Arc<Node>, pid: Pid) -> Result<SysvClient, ClientError> {
        let server = node.mailbox_open(SYSV_SERVER_NODE, SYSV_SERVER_PORT)?;
        Ok(SysvClient { node, server, pid })
    }

    fn header(&self, opcode: Opcode) -> Header {
        let mut header = Header::new(opcode, self.node.num());
        header.pid = self.pid;
        header.mailbox_port = self.node.stdinbox().port();
        header
    }

    fn read_reply(&self) -> Result<Message, ClientError> {
        let frame = self.node.stdinbox().read()?;
        let reply = Message::decode(&frame)?;
        if reply.header.opcode == Opcode::SysvFail {
            let err = crate::msg::errcode_to_result(reply.ret().errcode)
                .expect_err("fail reply without errcode");
            return Err(ClientError::Server(err));
        }
        Ok(reply)
    }

    fn transact(&self, msg: Message) -> Result<Ret, ClientError> {
        self.server.write(&msg.encode())?;
        Ok(self.read_reply()?.ret())
    }

    /// Creates (or re-opens) a named region; returns `(shmid, first page)`.
    pub fn shm_create(
        &self,
        name: &str,
        oflags: i32,
        mode: u32,
    ) -> Result<(i32, RPage), ClientError> {
        let msg = Message::new(
            self.header(Opcode::ShmCreate),
            Payload::ShmCreate {
                name: name.to_string(),
                oflags,
                mode,
            },
        );
        let ret = self.transact(msg)?;
        Ok((ret.ipcid, ret.page))
    }

    /// Opens an existing named region; returns `(shmid, first page)`.
    pub fn shm_open(&self, name: &str, oflags: i32) -> Result<(i32, RPage), ClientError> {
        let msg = Message::new(
            self.header(Opcode::ShmOpen),
            Payload::ShmOpen {
                name: name.to_string(),
                oflags,
            },
        );
        let ret = self.transact(msg)?;
        Ok((ret.ipcid, ret.page))
    }

    pub fn shm_close(&self, shmid: i32) -> Result<(), ClientError> {
        let msg = Message::new(self.header(Opcode::ShmClose), Payload::ShmClose { shmid });
        self.transact(msg)?;
        Ok(())
    }

    pub fn shm_unlink(&self, name: &str) -> Result<(), ClientError> {
        let msg = Message::new(
            self.header(Opcode::ShmUnlink),
            Payload::ShmUnlink {
                name: name.to_string(),
            },
        );
        self.transact(msg)?;
        Ok(())
    }

    /// Backs the region with remote memory; returns the first page.
    pub fn shm_ftruncate(&self, shmid: i32, size: u64) -> Result<RPage, ClientError> {
        let msg = Message::new(
            self.header(Opcode::ShmFtruncate),
            Payload::ShmFtruncate { shmid, size },
        );
        let ret = self.transact(msg)?;
        Ok(ret.page)
    }

    /// Asks the server to broadcast an invalidation for `(shmid, page)`.
    pub fn shm_inval(&self, shmid: i32, page: RPage) -> Result<(), ClientError> {
        let msg = Message::new(
            self.header(Opcode::ShmInval),
            Payload::ShmInval { shmid, page },
        );
        self.transact(msg)?;
        Ok(())
    }

    pub fn msg_get(&self, key: i32, flags: i32) -> Result<i32, ClientError> {
        let msg = Message::new(self.header(Opcode::MsgGet), Payload::MsgGet { key, flags });
        Ok(self.transact(msg)?.ipcid)
    }

    pub fn msg_close(&self, msgid: i32) -> Result<(), ClientError> {
        let msg = Message::new(self.header(Opcode::MsgClose), Payload::MsgClose { msgid });
        self.transact(msg)?;
        Ok(())
    }

    /// Two-phase send: request on the mailbox, payload through the
    /// server's inbound portal, reply on the mailbox.
    pub fn msg_send(
        &self,
        msgid: i32,
        msgtyp: i64,
        data: &[u8],
        flags: i32,
    ) -> Result<(), ClientError> {
        let portal = self
            .node
            .portal_open(SYSV_SERVER_NODE, crate::noc::STD_PORT)?;
        let mut header = self.header(Opcode::MsgSend);
        header.portal_port = portal.src_port();
        let msg = Message::new(
            header,
            Payload::MsgSend {
                msgid,
                msgtyp,
                size: data.len() as u32,
                flags,
            },
        );
        self.server.write(&msg.encode())?;
        portal.write(data)?;
        self.read_reply()?;
        Ok(())
    }

    /// Three-phase receive: request, ACK naming the server's portal port,
    /// payload on our inbound portal, then the closing reply.
    pub fn msg_receive(
        &self,
        msgid: i32,
        size: usize,
        msgtyp: i64,
        flags: i32,
    ) -> Result<Vec<u8>, ClientError> {
        let mut header = self.header(Opcode::MsgReceive);
        header.portal_port = self.node.stdinportal().port();
        let msg = Message::new(
            header,
            Payload::MsgReceive {
                msgid,
                msgtyp,
                size: size as u32,
                flags,
            },
        );
        self.server.write(&msg.encode())?;

        let ack = self.read_reply()?;
        debug_assert_eq!(ack.header.opcode, Opcode::SysvAck);
        let mut data = vec![0u8; size];
        let n = self
            .node
            .stdinportal()
            .allow_from(SYSV_SERVER_NODE, ack.header.portal_port)
            .read(&mut data)?;
        data.truncate(n);

        self.read_reply()?;
        Ok(data)
    }

    pub fn sem_get(&self, key: i32, flags: i32) -> Result<i32, ClientError> {
        let msg = Message::new(self.header(Opcode::SemGet), Payload::SemGet { key, flags });
        Ok(self.transact(msg)?.ipcid)
    }

    pub fn sem_close(&self, semid: i32) -> Result<(), ClientError> {
        let msg = Message::new(self.header(Opcode::SemClose), Payload::SemClose { semid });
        self.transact(msg)?;
        Ok(())
    }

    /// Applies one semaphore operation. Blocks in the reply read when the
    /// server parks us; the eventual unblocker's deferred reply releases
    /// the call.
    pub fn sem_operate(&self, semid: i32, num: u16, op: i16, flg: i16) -> Result<(), ClientError> {
        let msg = Message::new(
            self.header(Opcode::SemOperate),
            Payload::SemOperate {
                semid,
                sembuf: SemBuf { num, op, flg },
            },
        );
        self.transact(msg)?;
        Ok(())
    }

    /// Asks the server to exit its request loop. No reply.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        let msg = Message::new(self.header(Opcode::SysvExit), Payload::None);
        self.server.write(&msg.encode())?;
        Ok(())
    }
}

struct SnooperShared {
    seen: Mutex<Vec<(i32, RPage)>>,
    cv: Condvar,
}

/// Listens on the snooper port and evicts invalidated pages from the
/// process's page cache.
pub struct ShmSnooper {
    node: Arc<Node>,
    shared: Arc<SnooperShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ShmSnooper {
    /// Binds the snooper port and starts draining invalidation notices
    /// into `cache`.
    pub fn spawn(node: Arc<Node>, cache: Arc<Mutex<RCache>>) -> Result<ShmSnooper, ClientError> {
        let rx = node.mailbox_bind(SHM_SNOOPER_PORT)?;
        let shared = Arc::new(SnooperShared {
            seen: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        });
        let shared2 = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("shm-snooper-{}", node.num()))
            .spawn(move || loop {
                let frame = match rx.read() {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("[snooper] read failed: {err}");
                        return;
                    }
                };
                let notice = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!("[snooper] malformed notice: {err}");
                        continue;
                    }
                };
                match notice.payload {
                    Payload::ShmInval { shmid, page } => {
                        debug!("[snooper] inval shmid={shmid} page={page}");
                        cache.lock().unwrap().invalidate(page);
                        let mut seen = shared2.seen.lock().unwrap();
                        seen.push((shmid, page));
                        shared2.cv.notify_all();
                    }
                    Payload::None if notice.header.opcode == Opcode::SysvExit => return,
                    other => warn!("[snooper] unexpected notice {other:?}"),
                }
            })
            .expect("spawn snooper");
        Ok(ShmSnooper {
            node,
            shared,
            thread: Some(thread),
        })
    }

    /// Blocks until at least `n` invalidation notices have been seen.
    pub fn wait_for(&self, n: usize) -> Vec<(i32, RPage)> {
        let mut seen = self.shared.seen.lock().unwrap();
        while seen.len() < n {
            seen = self.shared.cv.wait(seen).unwrap();
        }
        seen.clone()
    }

    /// Stops the snooper thread with a poison frame on its own port.
    pub fn stop(mut self) {
        let poison = Message::new(
            Header::new(Opcode::SysvExit, self.node.num()),
            Payload::None,
        );
        if let Ok(tx) = self.node.mailbox_open(self.node.num(), SHM_SNOOPER_PORT) {
            let _ = tx.write(&poison.encode());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
