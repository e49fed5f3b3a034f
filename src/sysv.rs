//! System V IPC Service: shared memory regions, message queues and
//! semaphores behind one request loop.
//!
//! The server tracks a reference-counted connection per client `(pid,
//! port)` pair; shared-memory invalidations fan out to every live
//! connection on the snooper port. Bulk payloads (queue messages) ride on
//! portals; a send is always drained off the wire even when the queue
//! refuses it, so the sender's portal cannot stall. Semaphore operations
//! may defer their reply: a blocked requester gets nothing until a later
//! operation settles it, at which point the reply goes to the port its
//! connection registered.

pub mod client;
pub mod connection;
pub mod msg;
pub mod sem;
pub mod shm;

use crate::config::{SHM_SNOOPER_PORT, SYSV_SERVER_PORT};
use crate::msg::{Errno, Header, Message, Opcode, Payload, Ret, SemBuf};
use crate::noc::{MailboxRx, Node, PortNum};
use crate::proc::Pid;
use crate::rmem::client::RmemClient;
use crate::rmem::RPage;
use crate::ClientError;
use connection::ConnectionTable;
use log::{debug, info, warn};
use msg::MsgManager;
use sem::{SemManager, SemOutcome};
use shm::ShmManager;
use std::sync::Arc;

/// IPC open/operate flags, as found in the request payloads.
pub const IPC_CREAT: i32 = 0o1000;
pub const IPC_EXCL: i32 = 0o2000;
pub const IPC_NOWAIT: i32 = 0o4000;

/// Shared-memory open flags.
pub const O_RDONLY: i32 = 0;
pub const O_RDWR: i32 = 0o2;
pub const O_CREAT: i32 = 0o100;
pub const O_EXCL: i32 = 0o200;

pub struct SysvServer {
    node: Arc<Node>,
    inbox: MailboxRx,
    rmem: RmemClient,
    connections: ConnectionTable,
    shm: ShmManager,
    msgq: MsgManager,
    sems: SemManager,
}

impl SysvServer {
    /// Binds the service port and opens the server's own RMem stub, which
    /// backs shared-memory regions. The RMem server must already be up.
    pub fn new(node: Arc<Node>) -> Result<SysvServer, ClientError> {
        let inbox = node.mailbox_bind(SYSV_SERVER_PORT)?;
        let rmem = RmemClient::new(Arc::clone(&node))?;

        info!("[sysv] server alive");
        info!("[sysv] attached to node {}", node.num());
        info!("[sysv] listening to mailbox {SYSV_SERVER_PORT}");

        Ok(SysvServer {
            inbox,
            rmem,
            connections: ConnectionTable::new(),
            shm: ShmManager::new(),
            msgq: MsgManager::new(),
            sems: SemManager::new(),
            node,
        })
    }

    pub fn run(&mut self) {
        loop {
            let frame = match self.inbox.read() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("[sysv] inbox read failed: {err}");
                    continue;
                }
            };
            let request = match Message::decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("[sysv] dropping malformed frame: {err}");
                    continue;
                }
            };
            let header = request.header;
            debug!(
                "[sysv] request opcode={:?} source={} port={}",
                header.opcode, header.source, header.mailbox_port
            );

            let ret = match request.payload {
                Payload::ShmCreate { name, oflags, mode } => {
                    self.do_shm_create(&header, &name, oflags, mode)
                }
                Payload::ShmOpen { name, oflags } => self.do_shm_open(&header, &name, oflags),
                Payload::ShmClose { shmid } => self.do_shm_close(&header, shmid),
                Payload::ShmUnlink { name } => {
                    self.shm.unlink(&self.rmem, &name).map(|_| Ret::default())
                }
                Payload::ShmFtruncate { shmid, size } => self
                    .shm
                    .ftruncate(&self.rmem, shmid, size)
                    .map(|page| Ret {
                        page,
                        ..Ret::default()
                    }),
                Payload::ShmInval { shmid, page } => self.do_shm_inval(shmid, page),
                Payload::MsgGet { key, flags } => self.do_msg_get(&header, key, flags),
                Payload::MsgClose { msgid } => self.do_msg_close(&header, msgid),
                Payload::MsgSend {
                    msgid,
                    msgtyp,
                    size,
                    flags,
                } => self.do_msg_send(&header, msgid, msgtyp, size, flags),
                Payload::MsgReceive {
                    msgid,
                    msgtyp,
                    size,
                    flags: _,
                } => {
                    // The success path replies in-line (ACK + portal) and
                    // is followed by the generic success frame below.
                    self.do_msg_receive(&header, msgid, msgtyp, size)
                }
                Payload::SemGet { key, flags } => self.do_sem_get(&header, key, flags),
                Payload::SemClose { semid } => self.do_sem_close(&header, semid),
                Payload::SemOperate { semid, sembuf } => {
                    match self.do_sem_operate(&header, semid, sembuf) {
                        // Blocked: the requester was parked, no reply yet.
                        None => continue,
                        Some(ret) => ret,
                    }
                }
                Payload::None if header.opcode == Opcode::SysvExit => break,
                other => {
                    warn!("[sysv] unexpected payload {other:?}");
                    continue;
                }
            };

            let ret = match ret {
                Ok(ret) => ret,
                Err(err) => Ret::from_errno(err),
            };
            self.reply(header.source, header.mailbox_port, ret);
        }

        let parked = self.sems.parked_waiters();
        if !parked.is_empty() {
            warn!(
                "[sysv] shutting down with {} semaphore waiter(s) still parked",
                parked.len()
            );
            for waiter in parked {
                warn!("[sysv] abandoned waiter {:?}", waiter.pid);
            }
        }
        info!("[sysv] shutting down server");
    }

    fn reply(&self, node: u32, port: PortNum, ret: Ret) {
        let response = Message::reply(
            self.node.num(),
            Opcode::SysvSuccess,
            Opcode::SysvFail,
            ret,
        );
        let outbox = self
            .node
            .mailbox_open(node, port)
            .expect("[sysv] open reply mailbox");
        outbox.write(&response.encode()).expect("[sysv] write reply");
    }

    fn do_shm_create(
        &mut self,
        header: &Header,
        name: &str,
        oflags: i32,
        mode: u32,
    ) -> Result<Ret, Errno> {
        let (ipcid, page) = self.shm.create(name, oflags, mode)?;
        self.connections
            .connect(header.pid, header.mailbox_port)?;
        Ok(Ret {
            ipcid,
            page,
            ..Ret::default()
        })
    }

    fn do_shm_open(&mut self, header: &Header, name: &str, oflags: i32) -> Result<Ret, Errno> {
        let (ipcid, page) = self.shm.open(name, oflags)?;
        self.connections
            .connect(header.pid, header.mailbox_port)?;
        Ok(Ret {
            ipcid,
            page,
            ..Ret::default()
        })
    }

    fn do_shm_close(&mut self, header: &Header, shmid: i32) -> Result<Ret, Errno> {
        self.shm.close(&self.rmem, shmid)?;
        self.connections
            .disconnect(header.pid, header.mailbox_port)?;
        Ok(Ret::default())
    }

    /// Broadcasts an invalidation notice for `(shmid, page)` to every
    /// connected client's snooper port.
    fn do_shm_inval(&mut self, shmid: i32, page: RPage) -> Result<Ret, Errno> {
        self.shm.region(shmid)?;
        let remotes = self.connections.get_connections();
        debug!(
            "[sysv] inval shmid={shmid} page={page} -> {} connection(s)",
            remotes.len()
        );
        for conn in remotes {
            let notice = Message::new(
                Header::new(Opcode::ShmInval, self.node.num()),
                Payload::ShmInval { shmid, page },
            );
            let target = conn.remote.source();
            match self.node.mailbox_open(target, SHM_SNOOPER_PORT) {
                Ok(outbox) => {
                    outbox
                        .write(&notice.encode())
                        .expect("[sysv] write invalidation");
                }
                Err(err) => {
                    warn!("[sysv] no snooper on node {target}: {err}");
                }
            }
        }
        Ok(Ret::default())
    }

    fn do_msg_get(&mut self, header: &Header, key: i32, flags: i32) -> Result<Ret, Errno> {
        self.connections
            .connect(header.pid, header.mailbox_port)?;
        match self.msgq.get(key, flags) {
            Ok(ipcid) => Ok(Ret {
                ipcid,
                ..Ret::default()
            }),
            Err(err) => {
                let _ = self
                    .connections
                    .disconnect(header.pid, header.mailbox_port);
                Err(err)
            }
        }
    }

    fn do_msg_close(&mut self, header: &Header, msgid: i32) -> Result<Ret, Errno> {
        self.msgq.close(msgid)?;
        self.connections
            .disconnect(header.pid, header.mailbox_port)?;
        Ok(Ret::default())
    }

    /// Phase two of a send: drain the payload off the portal no matter
    /// what, then enqueue it if the queue will take it.
    fn do_msg_send(
        &mut self,
        header: &Header,
        msgid: i32,
        msgtyp: i64,
        size: u32,
        _flags: i32,
    ) -> Result<Ret, Errno> {
        let mut data = vec![0u8; size as usize];
        let grant = self
            .node
            .stdinportal()
            .allow_from(header.source, header.portal_port);
        let n = grant.read(&mut data).expect("[sysv] portal read");
        assert_eq!(n, size as usize, "[sysv] short portal read");

        self.msgq.push(msgid, msgtyp, data)?;
        Ok(Ret::default())
    }

    /// Phase two and three of a receive: pick the message, send the ACK
    /// carrying our outbound portal port, then push the payload through.
    fn do_msg_receive(
        &mut self,
        header: &Header,
        msgid: i32,
        msgtyp: i64,
        size: u32,
    ) -> Result<Ret, Errno> {
        let (_typ, data) = self.msgq.pop(msgid, msgtyp, size as usize)?;

        let outbox = self
            .node
            .mailbox_open(header.source, header.mailbox_port)
            .expect("[sysv] open ack mailbox");
        let outportal = self
            .node
            .portal_open(header.source, header.portal_port)
            .expect("[sysv] open outbound portal");

        let mut ack_header = Header::new(Opcode::SysvAck, self.node.num());
        ack_header.portal_port = outportal.src_port();
        let ack = Message::new(ack_header, Payload::Ret(Ret::default()));
        outbox.write(&ack.encode()).expect("[sysv] write ack");

        let n = outportal.write(&data).expect("[sysv] portal write");
        assert_eq!(n, data.len(), "[sysv] short portal write");

        Ok(Ret {
            status: data.len() as i32,
            ..Ret::default()
        })
    }

    fn do_sem_get(&mut self, header: &Header, key: i32, flags: i32) -> Result<Ret, Errno> {
        self.connections
            .connect(header.pid, header.mailbox_port)?;
        match self.sems.get(key, flags) {
            Ok(ipcid) => Ok(Ret {
                ipcid,
                ..Ret::default()
            }),
            Err(err) => {
                let _ = self
                    .connections
                    .disconnect(header.pid, header.mailbox_port);
                Err(err)
            }
        }
    }

    fn do_sem_close(&mut self, header: &Header, semid: i32) -> Result<Ret, Errno> {
        self.sems.close(semid)?;
        self.connections
            .disconnect(header.pid, header.mailbox_port)?;
        Ok(Ret::default())
    }

    /// Tri-state semaphore operate. `None` means the requester blocked and
    /// gets no reply now; when it is settled later, its reply port is
    /// recovered from the connection its `sem_get` registered.
    fn do_sem_operate(
        &mut self,
        header: &Header,
        semid: i32,
        sembuf: SemBuf,
    ) -> Option<Result<Ret, Errno>> {
        match self.sems.operate(semid, header.pid, sembuf) {
            Err(err) => Some(Err(err)),
            Ok(SemOutcome::Block) => None,
            Ok(SemOutcome::Done(woken)) => {
                if let Some(waiter) = woken {
                    self.deferred_reply(waiter.pid);
                }
                Some(Ok(Ret::default()))
            }
        }
    }

    /// Sends the delayed success frame to a waiter settled by someone
    /// else's operation. The waiter's stub wakes from its original read,
    /// none the wiser.
    fn deferred_reply(&self, pid: Pid) {
        match self.connections.port_of(pid) {
            Some(port) => {
                debug!("[sysv] deferred reply to {pid:?} port {port}");
                self.reply(pid.source(), port, Ret::default());
            }
            None => warn!("[sysv] no connection left for woken waiter {pid:?}"),
        }
    }
}
