//! Client stub for the Name Service.
//!
//! The synchronous calls block on the standard inbox for their reply. The
//! task-based variants of `lookup` and `heartbeat` pipeline the request
//! through the scheduler in [`crate::task`] so latency-sensitive callers
//! can overlap the round trip with other work. Each async kind keeps a
//! single in-flight slot: a second attempt while one is pending fails fast
//! instead of queuing. Three separate connections to the server keep an
//! async operation from colliding with a synchronous call on the wire.

use crate::config::{NAME_SERVER_NODE, NAME_SERVER_PORT};
use crate::msg::{name_is_valid, Errno, Header, Message, Opcode, Payload};
use crate::noc::{Mailbox, MailboxRx, Node, PortNum};
use crate::proc::{Gid, Pid, ProcInfo, PID_NULL};
use crate::task::{Scheduler, TaskChain, TaskHandle};
use crate::ClientError;
use log::debug;
use std::sync::{Arc, Mutex};

/// Reply port reserved for in-flight async lookups, distinct from the
/// standard inbox so a pending async reply can never be picked up by a
/// synchronous call.
const LOOKUP_REPLY_PORT: PortNum = 4;

pub struct NameClient {
    node: Arc<Node>,
    server: Mailbox,
    server_lookup: Mailbox,
    server_heartbeat: Mailbox,
    lookup_reply: Arc<MailboxRx>,
    proc_info: Mutex<ProcInfo>,
    lookup_busy: Arc<Mutex<bool>>,
    heartbeat_busy: Arc<Mutex<bool>>,
}

impl NameClient {
    /// Opens the three connections to the name server and binds the async
    /// reply port. Does not register the process; call [`setpid`] for that.
    ///
    /// [`setpid`]: NameClient::setpid
    pub fn new(node: Arc<Node>) -> Result<NameClient, ClientError> {
        let server = node.mailbox_open(NAME_SERVER_NODE, NAME_SERVER_PORT)?;
        let server_lookup = node.mailbox_open(NAME_SERVER_NODE, NAME_SERVER_PORT)?;
        let server_heartbeat = node.mailbox_open(NAME_SERVER_NODE, NAME_SERVER_PORT)?;
        let lookup_reply = Arc::new(node.mailbox_bind(LOOKUP_REPLY_PORT)?);
        Ok(NameClient {
            node,
            server,
            server_lookup,
            server_heartbeat,
            lookup_reply,
            proc_info: Mutex::new(ProcInfo::NULL),
            lookup_busy: Arc::new(Mutex::new(false)),
            heartbeat_busy: Arc::new(Mutex::new(false)),
        })
    }

    fn header(&self, opcode: Opcode) -> Header {
        let mut header = Header::new(opcode, self.node.num());
        header.pid = self.getpid();
        header.mailbox_port = self.node.stdinbox().port();
        header
    }

    /// Sends a request and blocks for its reply on the standard inbox.
    fn transact(&self, msg: Message) -> Result<Message, ClientError> {
        self.server.write(&msg.encode())?;
        let frame = self.node.stdinbox().read()?;
        let reply = Message::decode(&frame)?;
        if reply.header.opcode == Opcode::NameFail {
            let err = crate::msg::errcode_to_result(reply.ret().errcode)
                .expect_err("fail reply without errcode");
            return Err(ClientError::Server(err));
        }
        Ok(reply)
    }

    /// Registers the calling process and records its pid.
    pub fn setpid(&self) -> Result<Pid, ClientError> {
        if !self.getpid().is_null() {
            return Err(ClientError::Server(Errno::Eperm));
        }
        let msg = Message::new(self.header(Opcode::NameSetpid), Payload::None);
        let reply = self.transact(msg)?;
        let info = reply.ret().proc_info;
        *self.proc_info.lock().unwrap() = info;
        debug!("[name-client] registered as {:?}", info.pid);
        Ok(info.pid)
    }

    /// Pid recorded by [`setpid`], `PID_NULL` before registration.
    ///
    /// [`setpid`]: NameClient::setpid
    pub fn getpid(&self) -> Pid {
        self.proc_info.lock().unwrap().pid
    }

    /// Attaches `name` to the process `pid`.
    pub fn link(&self, pid: Pid, name: &str) -> Result<(), ClientError> {
        if pid.is_null() {
            return Err(ClientError::Server(Errno::Einval));
        }
        name_is_valid(name)?;
        let msg = Message::new(
            self.header(Opcode::NameLink),
            Payload::NameLink {
                pid,
                name: name.to_string(),
            },
        );
        self.transact(msg)?;
        Ok(())
    }

    /// Drops one reference to `name`.
    pub fn unlink(&self, name: &str) -> Result<(), ClientError> {
        name_is_valid(name)?;
        let msg = Message::new(
            self.header(Opcode::NameUnlink),
            Payload::NameUnlink {
                name: name.to_string(),
            },
        );
        self.transact(msg)?;
        Ok(())
    }

    /// Resolves `name` to its NoC node number.
    pub fn lookup(&self, name: &str) -> Result<i32, ClientError> {
        name_is_valid(name)?;
        let msg = Message::new(
            self.header(Opcode::NameLookup),
            Payload::NameLookup {
                pid: PID_NULL,
                name: name.to_string(),
            },
        );
        let reply = self.transact(msg)?;
        Ok(reply.ret().proc_info.nodenum)
    }

    /// Resolves a pid to its NoC node number.
    pub fn lookup_pid(&self, pid: Pid) -> Result<i32, ClientError> {
        if pid.is_null() {
            return Err(ClientError::Server(Errno::Einval));
        }
        let msg = Message::new(
            self.header(Opcode::NameLookup),
            Payload::NameLookup {
                pid,
                name: String::new(),
            },
        );
        let reply = self.transact(msg)?;
        Ok(reply.ret().proc_info.nodenum)
    }

    /// Records a liveness timestamp for this process. Fire and forget:
    /// heartbeats carry no reply.
    pub fn heartbeat(&self) -> Result<(), ClientError> {
        let msg = Message::new(
            self.header(Opcode::NameAlive),
            Payload::NameAlive {
                timestamp: self.node.clock(),
            },
        );
        self.server.write(&msg.encode())?;
        Ok(())
    }

    /// Group of `pid`, or of the calling process when `pid` is `None`.
    pub fn getpgid(&self, pid: Option<Pid>) -> Result<Gid, ClientError> {
        let pid = match pid {
            Some(pid) if !pid.is_null() => pid,
            Some(_) => return Err(ClientError::Server(Errno::Einval)),
            None => {
                let own = self.getpid();
                if own.is_null() {
                    return Err(ClientError::Server(Errno::Esrch));
                }
                own
            }
        };
        let msg = Message::new(self.header(Opcode::NameGetpgid), Payload::NameGetpgid { pid });
        let reply = self.transact(msg)?;
        Ok(reply.ret().gid)
    }

    /// Moves `pid` (or the calling process) into group `pgid`; `None`
    /// founds a new group named after the target pid.
    pub fn setpgid(&self, pid: Option<Pid>, pgid: Option<Gid>) -> Result<(), ClientError> {
        let pid = match pid {
            Some(pid) => pid,
            None => {
                let own = self.getpid();
                if own.is_null() {
                    return Err(ClientError::Server(Errno::Esrch));
                }
                own
            }
        };
        let pgid = pgid.unwrap_or(pid.raw());
        let msg = Message::new(
            self.header(Opcode::NameSetpgid),
            Payload::NameSetpgid { pid, pgid },
        );
        self.transact(msg)?;
        Ok(())
    }

    /// Asks the server to exit its request loop. No reply.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        let msg = Message::new(self.header(Opcode::NameExit), Payload::None);
        self.server.write(&msg.encode())?;
        Ok(())
    }

    /// Task-based lookup: `write request → read reply → release slot`.
    /// Returns the handle to the terminal stage, or `EAGAIN` when a lookup
    /// is already in flight.
    pub fn lookup_async(
        &self,
        name: &str,
        sched: &Scheduler,
    ) -> Result<TaskHandle, ClientError> {
        name_is_valid(name)?;
        {
            let mut busy = self.lookup_busy.lock().unwrap();
            if *busy {
                return Err(ClientError::Server(Errno::Eagain));
            }
            *busy = true;
        }

        let mut header = self.header(Opcode::NameLookup);
        header.mailbox_port = self.lookup_reply.port();
        let msg = Message::new(
            header,
            Payload::NameLookup {
                pid: PID_NULL,
                name: name.to_string(),
            },
        );
        let frame = msg.encode();

        let server = self.server_lookup.clone();
        let reply = Arc::clone(&self.lookup_reply);
        let busy_on_write = Arc::clone(&self.lookup_busy);
        let busy_on_read = Arc::clone(&self.lookup_busy);
        let busy_release = Arc::clone(&self.lookup_busy);

        let chain = TaskChain::new()
            .then(move |_| match server.write(&frame) {
                Ok(_) => Ok(0),
                Err(_) => {
                    *busy_on_write.lock().unwrap() = false;
                    Err(Errno::Efault)
                }
            })
            .then(move |_| {
                let result = read_lookup_reply(&reply);
                if result.is_err() {
                    *busy_on_read.lock().unwrap() = false;
                }
                result
            })
            .then(move |nodenum| {
                *busy_release.lock().unwrap() = false;
                Ok(nodenum)
            });
        Ok(sched.dispatch(chain))
    }

    /// Task-based heartbeat: `write request → release slot`.
    pub fn heartbeat_async(&self, sched: &Scheduler) -> Result<TaskHandle, ClientError> {
        {
            let mut busy = self.heartbeat_busy.lock().unwrap();
            if *busy {
                return Err(ClientError::Server(Errno::Eagain));
            }
            *busy = true;
        }

        let mut header = self.header(Opcode::NameAlive);
        header.mailbox_port = self.lookup_reply.port();
        let msg = Message::new(
            header,
            Payload::NameAlive {
                timestamp: self.node.clock(),
            },
        );
        let frame = msg.encode();

        let server = self.server_heartbeat.clone();
        let busy_on_write = Arc::clone(&self.heartbeat_busy);
        let busy_release = Arc::clone(&self.heartbeat_busy);

        let chain = TaskChain::new()
            .then(move |_| match server.write(&frame) {
                Ok(_) => Ok(0),
                Err(_) => {
                    *busy_on_write.lock().unwrap() = false;
                    Err(Errno::Efault)
                }
            })
            .then(move |v| {
                *busy_release.lock().unwrap() = false;
                Ok(v)
            });
        Ok(sched.dispatch(chain))
    }
}

fn read_lookup_reply(reply: &MailboxRx) -> Result<i32, Errno> {
    let frame = reply.read().map_err(|_| Errno::Efault)?;
    let msg = Message::decode(&frame).map_err(|_| Errno::Efault)?;
    if msg.header.opcode == Opcode::NameFail {
        return Err(
            crate::msg::errcode_to_result(msg.ret().errcode).expect_err("fail without errcode")
        );
    }
    Ok(msg.ret().proc_info.nodenum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::NameServer;
    use crate::noc::Fabric;
    use std::thread;

    /// Boots a name server on node 0 and returns a registered client on
    /// `client_node`, plus the server thread handle.
    fn boot(client_node: u32) -> (NameClient, thread::JoinHandle<()>, Fabric) {
        let fabric = Fabric::new();
        let server_node = Arc::new(fabric.attach(NAME_SERVER_NODE).unwrap());
        let mut server = NameServer::new(server_node).unwrap();
        let handle = thread::spawn(move || server.run());

        let node = Arc::new(fabric.attach(client_node).unwrap());
        let client = NameClient::new(node).unwrap();
        client.setpid().unwrap();
        (client, handle, fabric)
    }

    #[test]
    fn test_link_lookup_unlink() {
        let (client, server, _fabric) = boot(1);
        let pid = client.getpid();

        assert!(client.link(pid, "cool-name").is_ok());
        assert_eq!(client.lookup("cool-name").unwrap(), 1);
        assert!(client.unlink("cool-name").is_ok());
        assert_eq!(
            client.lookup("cool-name").unwrap_err().errno(),
            Some(Errno::Enoent)
        );

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_double_link_refcount() {
        let (client, server, _fabric) = boot(1);
        let pid = client.getpid();

        assert!(client.link(pid, "x").is_ok());
        assert!(client.link(pid, "x").is_ok());
        assert!(client.unlink("x").is_ok());
        assert_eq!(client.lookup("x").unwrap(), 1);
        assert!(client.unlink("x").is_ok());
        assert_eq!(client.lookup("x").unwrap_err().errno(), Some(Errno::Enoent));

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_setpid_stamps_source_node() {
        let (client, server, _fabric) = boot(6);
        let pid = client.getpid();
        assert_eq!(pid.source(), 6);
        assert_eq!(client.lookup_pid(pid).unwrap(), 6);
        // Registering twice is refused locally.
        assert_eq!(client.setpid().unwrap_err().errno(), Some(Errno::Eperm));

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_fault_matrix() {
        let (client, server, _fabric) = boot(1);
        let pid = client.getpid();

        // Invalid link arguments never reach the wire.
        assert!(client.link(PID_NULL, "missing-name").is_err());
        assert!(client.link(pid, "").is_err());
        let overlong: String =
            std::iter::repeat('\u{1}').take(crate::config::PROC_NAME_MAX + 1).collect();
        assert!(client.link(pid, &overlong).is_err());
        assert!(client.unlink(&overlong).is_err());
        assert!(client.lookup(&overlong).is_err());
        assert!(client.lookup("").is_err());

        // Bad unlink: name exists but was never linked / already removed.
        assert!(client.link(pid, "cool-name").is_ok());
        assert_eq!(
            client.unlink("missing-name").unwrap_err().errno(),
            Some(Errno::Enoent)
        );
        assert!(client.unlink("cool-name").is_ok());
        assert_eq!(
            client.unlink("cool-name").unwrap_err().errno(),
            Some(Errno::Enoent)
        );

        // Bad lookup.
        assert_eq!(
            client.lookup("missing-name").unwrap_err().errno(),
            Some(Errno::Enoent)
        );

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_heartbeat() {
        let (client, server, _fabric) = boot(1);
        let pid = client.getpid();
        assert!(client.link(pid, "beater").is_ok());
        for _ in 0..10 {
            assert!(client.heartbeat().is_ok());
        }
        // The server is still responsive after the unreplied heartbeats.
        assert_eq!(client.lookup("beater").unwrap(), 1);

        client.unlink("beater").unwrap();
        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_process_groups() {
        let (client, server, _fabric) = boot(1);
        let pid = client.getpid();

        assert_eq!(
            client.getpgid(None).unwrap_err().errno(),
            Some(Errno::Eagain)
        );
        assert!(client.setpgid(None, None).is_ok());
        assert_eq!(client.getpgid(None).unwrap(), pid.raw());
        assert_eq!(client.getpgid(Some(pid)).unwrap(), pid.raw());

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_async_lookup() {
        let (client, server, _fabric) = boot(1);
        let pid = client.getpid();
        client.link(pid, "cool-name").unwrap();

        let sched = Scheduler::new(2);
        let handle = client.lookup_async("cool-name", &sched).unwrap();
        assert_eq!(handle.wait(), Ok(1));

        // The slot was released: a second async lookup may run.
        let handle = client.lookup_async("cool-name", &sched).unwrap();
        assert_eq!(handle.wait(), Ok(1));

        // A miss surfaces at the handle and still releases the slot.
        let handle = client.lookup_async("missing-name", &sched).unwrap();
        assert_eq!(handle.wait(), Err(Errno::Enoent));
        let handle = client.lookup_async("cool-name", &sched).unwrap();
        assert_eq!(handle.wait(), Ok(1));

        client.unlink("cool-name").unwrap();
        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_async_single_slot() {
        let (client, server, _fabric) = boot(1);
        let sched = Scheduler::new(1);

        // Simulate an in-flight lookup holding the slot.
        *client.lookup_busy.lock().unwrap() = true;
        assert_eq!(
            client.lookup_async("whatever", &sched).unwrap_err().errno(),
            Some(Errno::Eagain)
        );
        *client.lookup_busy.lock().unwrap() = false;

        client.shutdown().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_async_heartbeat() {
        let (client, server, _fabric) = boot(1);
        let sched = Scheduler::new(1);

        let handle = client.heartbeat_async(&sched).unwrap();
        assert_eq!(handle.wait(), Ok(0));
        let handle = client.heartbeat_async(&sched).unwrap();
        assert_eq!(handle.wait(), Ok(0));

        client.shutdown().unwrap();
        server.join().unwrap();
    }
}
