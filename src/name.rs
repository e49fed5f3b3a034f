//! Name Service: the cluster-wide process registry.
//!
//! A single daemon owns the pid space and the (name, node) mappings.
//! Processes register themselves with `SETPID`, attach human-readable names
//! with `LINK`, and resolve peers with `LOOKUP`. Heartbeats are recorded
//! per process but never expire an entry; eviction is deliberately not
//! implemented (see DESIGN.md).

pub mod client;

use crate::config::{NAME_SERVER_PORT, PNAME_MAX};
use crate::msg::{name_is_valid, Errno, Header, Message, Opcode, Payload, Ret};
use crate::noc::{MailboxRx, Node, NocError, PortNum};
use crate::proc::{Gid, Pid, ProcInfo, PID_NULL};
use log::{debug, info, warn};
use std::sync::Arc;

/// Name under which the server registers itself at boot.
const SELF_NAME: &str = "/name";

struct ProcRecord {
    nodenum: i32,
    timestamp: u64,
    pid: Pid,
    gid: Gid,
}

struct NameRecord {
    name: String,
    port: PortNum,
    refcount: u32,
    proc_index: Option<usize>,
}

#[derive(Default)]
struct Stats {
    nlinks: u64,
    nunlinks: u64,
    nlookups: u64,
}

/// The server context: tables, counters and transport endpoints. One
/// instance per cluster; the request loop is the critical section.
pub struct NameServer {
    node: Arc<Node>,
    inbox: MailboxRx,
    procs: Vec<ProcRecord>,
    names: Vec<NameRecord>,
    pid_counter: u32,
    nr_registration: usize,
    stats: Stats,
}

impl NameServer {
    pub fn new(node: Arc<Node>) -> Result<NameServer, NocError> {
        let inbox = node.mailbox_bind(NAME_SERVER_PORT)?;

        let mut procs: Vec<ProcRecord> = (0..PNAME_MAX)
            .map(|_| ProcRecord {
                nodenum: -1,
                timestamp: 0,
                pid: PID_NULL,
                gid: 0,
            })
            .collect();
        let mut names: Vec<NameRecord> = (0..PNAME_MAX)
            .map(|_| NameRecord {
                name: String::new(),
                port: 0,
                refcount: 0,
                proc_index: None,
            })
            .collect();

        // The server itself owns the first entry of both tables.
        let mut pid_counter = 1;
        let pid = PID_NULL.with_source(node.num()).with_id(pid_counter);
        pid_counter += 1;
        procs[0].nodenum = node.num() as i32;
        procs[0].pid = pid;
        names[0].name = SELF_NAME.to_string();
        names[0].port = NAME_SERVER_PORT;
        names[0].refcount = 1;
        names[0].proc_index = Some(0);

        info!("[name] server alive");
        info!("[name] listening to mailbox {}", NAME_SERVER_PORT);
        info!("[name] attached to node {}", node.num());

        Ok(NameServer {
            node,
            inbox,
            procs,
            names,
            pid_counter,
            nr_registration: 0,
            stats: Stats::default(),
        })
    }

    /// Request loop: read, dispatch, reply, until `EXIT`.
    pub fn run(&mut self) {
        loop {
            let frame = match self.inbox.read() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("[name] inbox read failed: {err}");
                    continue;
                }
            };
            let request = match Message::decode(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!("[name] dropping malformed frame: {err}");
                    continue;
                }
            };
            debug!(
                "[name] request opcode={:?} source={} port={}",
                request.header.opcode, request.header.source, request.header.mailbox_port
            );

            let header = request.header;
            let ret = match request.payload {
                Payload::None if header.opcode == Opcode::NameSetpid => self.do_setpid(&header),
                Payload::NameLink { pid, name } => {
                    self.stats.nlinks += 1;
                    self.do_link(pid, &name, header.mailbox_port).map(|_| Ret::default())
                }
                Payload::NameUnlink { name } => {
                    self.stats.nunlinks += 1;
                    self.do_unlink(&name, header.mailbox_port).map(|_| Ret::default())
                }
                Payload::NameLookup { pid, name } => self.do_lookup(pid, &name),
                Payload::NameAlive { timestamp } => {
                    // Heartbeats carry no reply.
                    if let Err(err) = self.do_heartbeat(header.pid, timestamp) {
                        warn!("[name] heartbeat from unknown pid {:?}: {err}", header.pid);
                    }
                    continue;
                }
                Payload::NameGetpgid { pid } => self.do_getpgid(pid),
                Payload::NameSetpgid { pid, pgid } => {
                    self.do_setpgid(pid, pgid).map(|_| Ret::default())
                }
                Payload::None if header.opcode == Opcode::NameExit => break,
                other => {
                    warn!("[name] unexpected payload {other:?}");
                    continue;
                }
            };

            self.reply(&header, ret);
        }

        info!(
            "[name] links={} lookups={} unlinks={}",
            self.stats.nlinks, self.stats.nlookups, self.stats.nunlinks
        );
    }

    fn reply(&self, request: &Header, ret: Result<Ret, Errno>) {
        let ret = match ret {
            Ok(mut ret) => {
                ret.errcode = 0;
                ret
            }
            Err(err) => Ret::from_errno(err),
        };
        let response = Message::reply(
            self.node.num(),
            Opcode::NameSuccess,
            Opcode::NameFail,
            ret,
        );
        // Failing to reach a requester that just wrote to us is our own
        // transport fault, not the client's.
        let outbox = self
            .node
            .mailbox_open(request.source, request.mailbox_port)
            .expect("[name] open reply mailbox");
        outbox
            .write(&response.encode())
            .expect("[name] write reply");
    }

    /// Allocates the next pid, stamped with the requester's node.
    fn do_setpid(&mut self, header: &Header) -> Result<Ret, Errno> {
        let nodenum = header.source;
        for rec in self.procs.iter_mut() {
            if rec.pid.is_null() {
                let pid = PID_NULL.with_source(nodenum).with_id(self.pid_counter);
                self.pid_counter += 1;
                rec.pid = pid;
                rec.nodenum = nodenum as i32;
                return Ok(Ret {
                    proc_info: ProcInfo {
                        pid,
                        nodenum: nodenum as i32,
                    },
                    ..Ret::default()
                });
            }
        }
        Err(Errno::Eagain)
    }

    /// Registers `name` for the process `pid`, or bumps the refcount when
    /// the same owner links the same name again.
    fn do_link(&mut self, pid: Pid, name: &str, remote_port: PortNum) -> Result<(), Errno> {
        name_is_valid(name)?;
        debug!("[name] link pid={pid:?} name={name}");

        if self.nr_registration >= PNAME_MAX {
            return Err(Errno::Eagain);
        }

        // Name already in use: only the owning (pid, port) may re-link.
        if let Some(i) = self.names.iter().position(|n| n.name == name) {
            let owner = self.names[i]
                .proc_index
                .map(|p| self.procs[p].pid)
                .unwrap_or(PID_NULL);
            if owner == pid && self.names[i].port == remote_port {
                self.names[i].refcount += 1;
                return Ok(());
            }
            return Err(Errno::Einval);
        }

        let proc_index = self
            .procs
            .iter()
            .position(|p| !p.pid.is_null() && p.pid == pid)
            .ok_or(Errno::Einval)?;

        let slot = self
            .names
            .iter()
            .position(|n| n.proc_index.is_none())
            .ok_or(Errno::Eagain)?;

        self.names[slot].name = name.to_string();
        self.names[slot].port = remote_port;
        self.names[slot].proc_index = Some(proc_index);
        self.names[slot].refcount = 1;
        self.nr_registration += 1;
        Ok(())
    }

    /// Drops one reference to `name`; clears the record on the last one.
    fn do_unlink(&mut self, name: &str, remote_port: PortNum) -> Result<(), Errno> {
        name_is_valid(name)?;
        debug!("[name] unlink name={name}");

        for rec in self.names.iter_mut() {
            if rec.proc_index.is_none() || rec.name != name {
                continue;
            }
            if rec.port != remote_port {
                return Err(Errno::Eperm);
            }
            self.nr_registration = self.nr_registration.saturating_sub(1);
            rec.refcount -= 1;
            if rec.refcount == 0 {
                rec.name.clear();
                rec.proc_index = None;
                rec.port = 0;
            }
            return Ok(());
        }
        Err(Errno::Enoent)
    }

    /// Resolves by name when `pid` is null, by pid otherwise.
    fn do_lookup(&mut self, pid: Pid, name: &str) -> Result<Ret, Errno> {
        self.stats.nlookups += 1;
        debug!("[name] lookup pid={pid:?} name={name}");

        if pid.is_null() {
            name_is_valid(name)?;
            for rec in self.names.iter() {
                if let Some(p) = rec.proc_index {
                    if rec.name == name {
                        return Ok(Ret {
                            proc_info: ProcInfo {
                                pid: self.procs[p].pid,
                                nodenum: self.procs[p].nodenum,
                            },
                            ..Ret::default()
                        });
                    }
                }
            }
        } else {
            for rec in self.procs.iter() {
                if rec.pid == pid {
                    return Ok(Ret {
                        proc_info: ProcInfo {
                            pid: rec.pid,
                            nodenum: rec.nodenum,
                        },
                        ..Ret::default()
                    });
                }
            }
        }
        Err(Errno::Enoent)
    }

    fn do_heartbeat(&mut self, pid: Pid, timestamp: u64) -> Result<(), Errno> {
        if pid.is_null() {
            return Err(Errno::Einval);
        }
        for rec in self.procs.iter_mut() {
            if rec.pid == pid {
                rec.timestamp = timestamp;
                return Ok(());
            }
        }
        Err(Errno::Einval)
    }

    fn do_getpgid(&self, pid: Pid) -> Result<Ret, Errno> {
        for rec in self.procs.iter() {
            if rec.pid == pid {
                if rec.gid == 0 {
                    break;
                }
                return Ok(Ret {
                    gid: rec.gid,
                    ..Ret::default()
                });
            }
        }
        Err(Errno::Eagain)
    }

    /// Assigns `pid` to the group `pgid`. Joining a group other than your
    /// own requires the group to exist already.
    fn do_setpgid(&mut self, pid: Pid, pgid: Gid) -> Result<(), Errno> {
        if pgid != pid.raw() && !self.procs.iter().any(|p| p.gid == pgid) {
            return Err(Errno::Eperm);
        }
        for rec in self.procs.iter_mut() {
            if rec.pid == pid {
                rec.gid = pgid;
                return Ok(());
            }
        }
        Err(Errno::Esrch)
    }
}
