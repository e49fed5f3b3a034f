//! In-process loopback NoC fabric.
//!
//! Every "process" of the runtime attaches to the fabric under a node
//! number and gets blocking mailbox and portal handles wired through shared
//! queues. The daemon binary and the test suite both run on this fabric;
//! the handle types are the contract a kernel-backed transport would have
//! to honor.
//!
//! Portal discipline: a transfer happens only after the receiver has
//! allowed the sending node. `allow` yields a grant consumed by a single
//! read, and the sender's handle is consumed by a single write, so the
//! one-shot open/allow/write/close ordering is enforced by the type system
//! rather than by convention.

use crate::config::MAILBOX_MSG_SIZE;
use crate::noc::{NocError, NodeNum, PortNum, STD_PORT};
use lazy_static::lazy_static;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

lazy_static! {
    /// Process-wide fabric used by the daemon binary. Tests build private
    /// fabrics instead so node numbers never collide across tests.
    static ref GLOBAL: Fabric = Fabric::new();
}

struct MailboxSlot {
    queue: Mutex<VecDeque<Vec<u8>>>,
    cv: Condvar,
}

/// A pending or in-flight portal transfer on the receiving side.
struct PortalState {
    /// Which remote the receiver is currently willing to hear from.
    allowed: Option<(NodeNum, Option<PortNum>)>,
    /// Deposited payload: (source node, source port, bytes).
    data: Option<(NodeNum, PortNum, Vec<u8>)>,
}

struct PortalSlot {
    state: Mutex<PortalState>,
    cv: Condvar,
}

struct FabricInner {
    epoch: Instant,
    mailboxes: Mutex<HashMap<(NodeNum, PortNum), Arc<MailboxSlot>>>,
    portals: Mutex<HashMap<(NodeNum, PortNum), Arc<PortalSlot>>>,
    next_portal_port: AtomicU32,
}

/// Handle on the loopback NoC. Cheap to clone; all clones see the same
/// endpoints.
#[derive(Clone)]
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Default for Fabric {
    fn default() -> Self {
        Fabric::new()
    }
}

impl Fabric {
    pub fn new() -> Fabric {
        Fabric {
            inner: Arc::new(FabricInner {
                epoch: Instant::now(),
                mailboxes: Mutex::new(HashMap::new()),
                portals: Mutex::new(HashMap::new()),
                next_portal_port: AtomicU32::new(0x1000),
            }),
        }
    }

    /// The process-wide fabric.
    pub fn global() -> Fabric {
        GLOBAL.clone()
    }

    /// Attaches a process to the fabric as `num`, binding its standard
    /// inbox and inbound portal. Fails if something already attached there.
    pub fn attach(&self, num: NodeNum) -> Result<Node, NocError> {
        let inbox = self.mailbox_bind(num, STD_PORT)?;
        let inportal = self.portal_bind(num, STD_PORT)?;
        debug!("fabric: node {num} attached");
        Ok(Node {
            fabric: self.clone(),
            num,
            inbox,
            inportal,
        })
    }

    /// Monotonic clock shared by every node on the fabric, in nanoseconds.
    pub fn clock(&self) -> u64 {
        self.inner.epoch.elapsed().as_nanos() as u64
    }

    fn mailbox_bind(&self, node: NodeNum, port: PortNum) -> Result<MailboxRx, NocError> {
        let mut map = self.inner.mailboxes.lock().unwrap();
        if map.contains_key(&(node, port)) {
            return Err(NocError::PortInUse(node, port));
        }
        let slot = Arc::new(MailboxSlot {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
        });
        map.insert((node, port), slot.clone());
        Ok(MailboxRx {
            fabric: self.clone(),
            key: (node, port),
            slot,
        })
    }

    fn mailbox_resolve(&self, node: NodeNum, port: PortNum) -> Result<Arc<MailboxSlot>, NocError> {
        let map = self.inner.mailboxes.lock().unwrap();
        map.get(&(node, port))
            .cloned()
            .ok_or(NocError::NoEndpoint(node, port))
    }

    fn portal_bind(&self, node: NodeNum, port: PortNum) -> Result<PortalRx, NocError> {
        let mut map = self.inner.portals.lock().unwrap();
        if map.contains_key(&(node, port)) {
            return Err(NocError::PortInUse(node, port));
        }
        let slot = Arc::new(PortalSlot {
            state: Mutex::new(PortalState {
                allowed: None,
                data: None,
            }),
            cv: Condvar::new(),
        });
        map.insert((node, port), slot.clone());
        Ok(PortalRx {
            fabric: self.clone(),
            key: (node, port),
            slot,
        })
    }

    fn portal_resolve(&self, node: NodeNum, port: PortNum) -> Result<Arc<PortalSlot>, NocError> {
        let map = self.inner.portals.lock().unwrap();
        map.get(&(node, port))
            .cloned()
            .ok_or(NocError::NoEndpoint(node, port))
    }
}

/// A process's attachment to the fabric.
pub struct Node {
    fabric: Fabric,
    num: NodeNum,
    inbox: MailboxRx,
    inportal: PortalRx,
}

impl Node {
    pub fn num(&self) -> NodeNum {
        self.num
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    /// Monotonic clock, nanoseconds since fabric boot.
    pub fn clock(&self) -> u64 {
        self.fabric.clock()
    }

    /// The standard inbox replies arrive on.
    pub fn stdinbox(&self) -> &MailboxRx {
        &self.inbox
    }

    /// The standard inbound portal for bulk receives.
    pub fn stdinportal(&self) -> &PortalRx {
        &self.inportal
    }

    /// Binds an extra inbound mailbox on this node.
    pub fn mailbox_bind(&self, port: PortNum) -> Result<MailboxRx, NocError> {
        self.fabric.mailbox_bind(self.num, port)
    }

    /// Opens an outbound mailbox to `(node, port)`.
    pub fn mailbox_open(&self, node: NodeNum, port: PortNum) -> Result<Mailbox, NocError> {
        let slot = self.fabric.mailbox_resolve(node, port)?;
        Ok(Mailbox { slot })
    }

    /// Binds an extra inbound portal on this node.
    pub fn portal_bind(&self, port: PortNum) -> Result<PortalRx, NocError> {
        self.fabric.portal_bind(self.num, port)
    }

    /// Opens a one-shot outbound portal to `(node, port)`. The handle is
    /// consumed by its single write.
    pub fn portal_open(&self, node: NodeNum, port: PortNum) -> Result<PortalTx, NocError> {
        let slot = self.fabric.portal_resolve(node, port)?;
        let src_port = self
            .fabric
            .inner
            .next_portal_port
            .fetch_add(1, Ordering::Relaxed);
        Ok(PortalTx {
            src_node: self.num,
            src_port,
            slot,
        })
    }
}

/// Outbound mailbox handle.
#[derive(Clone)]
pub struct Mailbox {
    slot: Arc<MailboxSlot>,
}

impl Mailbox {
    /// Writes one frame. Frames larger than the MTU are rejected whole.
    pub fn write(&self, buf: &[u8]) -> Result<usize, NocError> {
        if buf.len() > MAILBOX_MSG_SIZE {
            return Err(NocError::FrameTooBig(buf.len(), MAILBOX_MSG_SIZE));
        }
        let mut queue = self.slot.queue.lock().unwrap();
        queue.push_back(buf.to_vec());
        self.slot.cv.notify_all();
        Ok(buf.len())
    }
}

/// Inbound mailbox handle. Unbinds its endpoint when dropped.
pub struct MailboxRx {
    fabric: Fabric,
    key: (NodeNum, PortNum),
    slot: Arc<MailboxSlot>,
}

impl MailboxRx {
    /// Blocks until a frame arrives and returns it.
    pub fn read(&self) -> Result<Vec<u8>, NocError> {
        let mut queue = self.slot.queue.lock().unwrap();
        loop {
            if let Some(frame) = queue.pop_front() {
                return Ok(frame);
            }
            queue = self.slot.cv.wait(queue).unwrap();
        }
    }

    pub fn port(&self) -> PortNum {
        self.key.1
    }
}

impl Drop for MailboxRx {
    fn drop(&mut self) {
        let mut map = self.fabric.inner.mailboxes.lock().unwrap();
        map.remove(&self.key);
    }
}

/// Inbound portal endpoint. Each transfer starts with an `allow`.
pub struct PortalRx {
    fabric: Fabric,
    key: (NodeNum, PortNum),
    slot: Arc<PortalSlot>,
}

impl PortalRx {
    /// Allows one transfer from any port of `remote`.
    pub fn allow(&self, remote: NodeNum) -> PortalGrant<'_> {
        self.allow_inner(remote, None)
    }

    /// Allows one transfer from a specific `(remote, port)` sender.
    pub fn allow_from(&self, remote: NodeNum, port: PortNum) -> PortalGrant<'_> {
        self.allow_inner(remote, Some(port))
    }

    fn allow_inner(&self, remote: NodeNum, port: Option<PortNum>) -> PortalGrant<'_> {
        let mut state = self.slot.state.lock().unwrap();
        state.allowed = Some((remote, port));
        self.slot.cv.notify_all();
        PortalGrant { rx: self }
    }

    pub fn port(&self) -> PortNum {
        self.key.1
    }
}

impl Drop for PortalRx {
    fn drop(&mut self) {
        let mut map = self.fabric.inner.portals.lock().unwrap();
        map.remove(&self.key);
    }
}

/// Permission for exactly one inbound transfer. Consumed by `read`.
pub struct PortalGrant<'a> {
    rx: &'a PortalRx,
}

impl PortalGrant<'_> {
    /// Blocks until the allowed sender deposits its payload, copies it into
    /// `buf` and returns the byte count.
    pub fn read(self, buf: &mut [u8]) -> Result<usize, NocError> {
        let slot = &self.rx.slot;
        let mut state = slot.state.lock().unwrap();
        loop {
            if let Some((node, port, _)) = &state.data {
                let matches = match state.allowed {
                    Some((want_node, Some(want_port))) => {
                        *node == want_node && *port == want_port
                    }
                    Some((want_node, None)) => *node == want_node,
                    None => false,
                };
                if matches {
                    let (_, _, data) = state.data.take().unwrap();
                    state.allowed = None;
                    slot.cv.notify_all();
                    if data.len() > buf.len() {
                        return Err(NocError::ShortTransfer {
                            got: data.len(),
                            want: buf.len(),
                        });
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    return Ok(data.len());
                }
            }
            state = slot.cv.wait(state).unwrap();
        }
    }
}

/// Outbound one-shot portal handle.
pub struct PortalTx {
    src_node: NodeNum,
    src_port: PortNum,
    slot: Arc<PortalSlot>,
}

impl PortalTx {
    /// The ephemeral source port of this handle. Receivers that want to
    /// gate on a specific sender match against it.
    pub fn src_port(&self) -> PortNum {
        self.src_port
    }

    /// Blocks until the receiver has allowed this sender, deposits the
    /// payload, and consumes the handle.
    pub fn write(self, buf: &[u8]) -> Result<usize, NocError> {
        let mut state = self.slot.state.lock().unwrap();
        loop {
            let allowed = match state.allowed {
                Some((node, Some(port))) => node == self.src_node && port == self.src_port,
                Some((node, None)) => node == self.src_node,
                None => false,
            };
            if allowed && state.data.is_none() {
                state.data = Some((self.src_node, self.src_port, buf.to_vec()));
                self.slot.cv.notify_all();
                return Ok(buf.len());
            }
            state = self.slot.cv.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mailbox_roundtrip() {
        let fabric = Fabric::new();
        let a = fabric.attach(10).unwrap();
        let b = fabric.attach(11).unwrap();

        let tx = a.mailbox_open(11, STD_PORT).unwrap();
        assert_eq!(tx.write(b"hello").unwrap(), 5);
        assert_eq!(b.stdinbox().read().unwrap(), b"hello");
    }

    #[test]
    fn test_mailbox_mtu() {
        let fabric = Fabric::new();
        let a = fabric.attach(10).unwrap();
        let _b = fabric.attach(11).unwrap();
        let tx = a.mailbox_open(11, STD_PORT).unwrap();
        let huge = vec![0u8; MAILBOX_MSG_SIZE + 1];
        assert!(matches!(
            tx.write(&huge),
            Err(NocError::FrameTooBig(_, MAILBOX_MSG_SIZE))
        ));
    }

    #[test]
    fn test_mailbox_open_unbound() {
        let fabric = Fabric::new();
        let a = fabric.attach(10).unwrap();
        assert!(matches!(
            a.mailbox_open(42, 7),
            Err(NocError::NoEndpoint(42, 7))
        ));
    }

    #[test]
    fn test_double_attach() {
        let fabric = Fabric::new();
        let _a = fabric.attach(10).unwrap();
        assert!(matches!(
            fabric.attach(10),
            Err(NocError::PortInUse(10, STD_PORT))
        ));
    }

    #[test]
    fn test_portal_waits_for_allow() {
        let fabric = Fabric::new();
        let a = fabric.attach(10).unwrap();
        let b = fabric.attach(11).unwrap();

        let writer = thread::spawn(move || {
            let tx = a.portal_open(11, STD_PORT).unwrap();
            tx.write(&[7u8; 128]).unwrap()
        });

        // Give the writer a head start; it must not complete before allow.
        thread::sleep(Duration::from_millis(20));
        let mut buf = [0u8; 128];
        let n = b.stdinportal().allow(10).read(&mut buf).unwrap();
        assert_eq!(n, 128);
        assert_eq!(buf[0], 7);
        assert_eq!(writer.join().unwrap(), 128);
    }

    #[test]
    fn test_portal_gates_on_sender_port() {
        let fabric = Fabric::new();
        let a = fabric.attach(10).unwrap();
        let b = fabric.attach(11).unwrap();

        let tx = a.portal_open(11, STD_PORT).unwrap();
        let port = tx.src_port();
        let writer = thread::spawn(move || tx.write(b"gated").unwrap());

        let mut buf = [0u8; 16];
        let n = b.stdinportal().allow_from(10, port).read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"gated");
        writer.join().unwrap();
    }

    #[test]
    fn test_portal_short_buffer() {
        let fabric = Fabric::new();
        let a = fabric.attach(10).unwrap();
        let b = fabric.attach(11).unwrap();

        let tx = a.portal_open(11, STD_PORT).unwrap();
        let writer = thread::spawn(move || tx.write(&[1u8; 64]));
        let mut buf = [0u8; 16];
        let res = b.stdinportal().allow(10).read(&mut buf);
        assert!(matches!(
            res,
            Err(NocError::ShortTransfer { got: 64, want: 16 })
        ));
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn test_rebind_after_drop() {
        let fabric = Fabric::new();
        {
            let _a = fabric.attach(10).unwrap();
        }
        // Dropping the node released its standard endpoints.
        let _a = fabric.attach(10).unwrap();
    }

    #[test]
    fn test_clock_is_monotonic() {
        let fabric = Fabric::new();
        let t0 = fabric.clock();
        thread::sleep(Duration::from_millis(1));
        assert!(fabric.clock() > t0);
    }
}
