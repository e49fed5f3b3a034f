//! Request/reply framing for the service protocols.
//!
//! Every message — request or reply, for any of the three servers — is a
//! fixed-size frame: a common header followed by an opcode-specific payload,
//! little-endian throughout. One frame always fits in a single mailbox
//! write; bulk data never travels here, it goes over a portal.

use crate::config::{MAILBOX_MSG_SIZE, PROC_NAME_MAX};
use crate::noc::{NodeNum, PortNum};
use crate::proc::{Gid, Pid, ProcInfo, PID_NULL};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Bytes taken by [`Header`] on the wire.
pub const HEADER_SIZE: usize = 17;

/// Bytes of every frame on the wire.
pub const MESSAGE_SIZE: usize = 64;

// A frame must fit the mailbox MTU.
const _: () = assert!(MESSAGE_SIZE <= MAILBOX_MSG_SIZE);
// And the largest payload (shm create: name + oflags + mode) must fit the frame.
const _: () = assert!(HEADER_SIZE + PROC_NAME_MAX + 8 <= MESSAGE_SIZE);

/// Operation codes, partitioned per service: 0x1x name, 0x2x rmem,
/// 0x3x/0x4x System V. The `*Success`/`*Fail` sentinels only ever appear in
/// replies and carry the outcome so clients can dispatch before parsing the
/// payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    NameSetpid = 0x11,
    NameLink = 0x12,
    NameUnlink = 0x13,
    NameLookup = 0x14,
    NameAlive = 0x15,
    NameGetpgid = 0x16,
    NameSetpgid = 0x17,
    NameExit = 0x18,
    NameSuccess = 0x1e,
    NameFail = 0x1f,

    RmemAlloc = 0x21,
    RmemFree = 0x22,
    RmemWrite = 0x23,
    RmemRead = 0x24,
    RmemExit = 0x28,
    RmemSuccess = 0x2e,
    RmemFail = 0x2f,

    ShmCreate = 0x31,
    ShmOpen = 0x32,
    ShmUnlink = 0x33,
    ShmClose = 0x34,
    ShmFtruncate = 0x35,
    ShmInval = 0x36,
    MsgGet = 0x37,
    MsgClose = 0x38,
    MsgSend = 0x39,
    MsgReceive = 0x3a,
    SemGet = 0x3b,
    SemClose = 0x3c,
    SemOperate = 0x3d,
    SysvAck = 0x41,
    SysvExit = 0x42,
    SysvSuccess = 0x4e,
    SysvFail = 0x4f,
}

/// Error numbers carried (negated) in the `errcode` field of replies.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Error, TryFromPrimitive, IntoPrimitive,
)]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    Eperm = 1,
    #[error("no such entry")]
    Enoent = 2,
    #[error("no such process")]
    Esrch = 3,
    #[error("resource temporarily unavailable")]
    Eagain = 11,
    #[error("out of memory")]
    Enomem = 12,
    #[error("bad address")]
    Efault = 14,
    #[error("resource busy")]
    Ebusy = 16,
    #[error("already exists")]
    Eexist = 17,
    #[error("invalid argument")]
    Einval = 22,
    #[error("operation not implemented")]
    Enosys = 38,
    #[error("message too long")]
    Emsgsize = 90,
}

/// Turns a wire `errcode` (0 or negative) into a result.
pub fn errcode_to_result(code: i32) -> Result<(), Errno> {
    if code >= 0 {
        return Ok(());
    }
    Err(Errno::try_from(-code).unwrap_or(Errno::Enosys))
}

/// Turns a handler outcome into a wire `errcode`.
pub fn result_to_errcode(res: Result<(), Errno>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(e) => -i32::from(e),
    }
}

/// Checks a process or region name. Valid names are non-empty printable
/// ASCII, strictly shorter than [`PROC_NAME_MAX`].
pub fn name_is_valid(name: &str) -> Result<(), Errno> {
    if name.is_empty() || name.len() >= PROC_NAME_MAX {
        return Err(Errno::Einval);
    }
    if !name.bytes().all(|b| (0x20..0x7f).contains(&b)) {
        return Err(Errno::Einval);
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame is {0} bytes, expected {MESSAGE_SIZE}")]
    BadLength(usize),
    #[error("unknown opcode {0:#04x}")]
    BadOpcode(u8),
    #[error("malformed name field")]
    BadName,
}

/// Common header of every frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    /// Node the request originated from; replies go back there.
    pub source: NodeNum,
    /// Pid of the requester, `PID_NULL` before `SETPID`.
    pub pid: Pid,
    /// Port on `source` where the requester reads replies.
    pub mailbox_port: PortNum,
    /// Port on `source` involved in a bulk transfer, when any.
    pub portal_port: PortNum,
}

impl Header {
    pub fn new(opcode: Opcode, source: NodeNum) -> Header {
        Header {
            opcode,
            source,
            pid: PID_NULL,
            mailbox_port: 0,
            portal_port: 0,
        }
    }
}

/// Semaphore operation triple, as passed to `SEM_OPERATE`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SemBuf {
    pub num: u16,
    pub op: i16,
    pub flg: i16,
}

/// Reply payload. All fields ride in fixed slots; the requester knows which
/// ones are meaningful for the operation it issued.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ret {
    pub errcode: i32,
    pub proc_info: ProcInfo,
    pub gid: Gid,
    pub ipcid: i32,
    pub page: u32,
    pub status: i32,
    pub blknum: u32,
}

impl Default for Ret {
    fn default() -> Ret {
        Ret {
            errcode: 0,
            proc_info: ProcInfo::NULL,
            gid: 0,
            ipcid: -1,
            page: 0,
            status: 0,
            blknum: 0,
        }
    }
}

impl Ret {
    pub fn from_errno(err: Errno) -> Ret {
        Ret {
            errcode: -i32::from(err),
            ..Ret::default()
        }
    }
}

/// Opcode-specific payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    None,
    NameLink { pid: Pid, name: String },
    NameUnlink { name: String },
    NameLookup { pid: Pid, name: String },
    NameAlive { timestamp: u64 },
    NameGetpgid { pid: Pid },
    NameSetpgid { pid: Pid, pgid: Gid },
    RmemFree { blknum: u32 },
    RmemWrite { blknum: u32 },
    RmemRead { blknum: u32 },
    ShmCreate { name: String, oflags: i32, mode: u32 },
    ShmOpen { name: String, oflags: i32 },
    ShmUnlink { name: String },
    ShmClose { shmid: i32 },
    ShmFtruncate { shmid: i32, size: u64 },
    ShmInval { shmid: i32, page: u32 },
    MsgGet { key: i32, flags: i32 },
    MsgClose { msgid: i32 },
    MsgSend { msgid: i32, msgtyp: i64, size: u32, flags: i32 },
    MsgReceive { msgid: i32, msgtyp: i64, size: u32, flags: i32 },
    SemGet { key: i32, flags: i32 },
    SemClose { semid: i32 },
    SemOperate { semid: i32, sembuf: SemBuf },
    Ret(Ret),
}

/// One protocol frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    pub fn new(header: Header, payload: Payload) -> Message {
        Message { header, payload }
    }

    /// Builds a reply frame carrying `ret`, stamped with the success or
    /// failure sentinel of the replying service.
    pub fn reply(source: NodeNum, ok_op: Opcode, fail_op: Opcode, ret: Ret) -> Message {
        let opcode = if ret.errcode < 0 { fail_op } else { ok_op };
        Message {
            header: Header::new(opcode, source),
            payload: Payload::Ret(ret),
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = self.header.opcode.into();
        buf[1..5].copy_from_slice(&self.header.source.to_le_bytes());
        buf[5..9].copy_from_slice(&self.header.pid.raw().to_le_bytes());
        buf[9..13].copy_from_slice(&self.header.mailbox_port.to_le_bytes());
        buf[13..17].copy_from_slice(&self.header.portal_port.to_le_bytes());

        let p = &mut buf[HEADER_SIZE..];
        match &self.payload {
            Payload::None => {}
            Payload::NameLink { pid, name } | Payload::NameLookup { pid, name } => {
                p[0..4].copy_from_slice(&pid.raw().to_le_bytes());
                put_name(&mut p[4..4 + PROC_NAME_MAX], name);
            }
            Payload::NameUnlink { name } => {
                put_name(&mut p[0..PROC_NAME_MAX], name);
            }
            Payload::NameAlive { timestamp } => {
                p[0..8].copy_from_slice(&timestamp.to_le_bytes());
            }
            Payload::NameGetpgid { pid } => {
                p[0..4].copy_from_slice(&pid.raw().to_le_bytes());
            }
            Payload::NameSetpgid { pid, pgid } => {
                p[0..4].copy_from_slice(&pid.raw().to_le_bytes());
                p[4..8].copy_from_slice(&pgid.to_le_bytes());
            }
            Payload::RmemFree { blknum }
            | Payload::RmemWrite { blknum }
            | Payload::RmemRead { blknum } => {
                p[0..4].copy_from_slice(&blknum.to_le_bytes());
            }
            Payload::ShmCreate { name, oflags, mode } => {
                put_name(&mut p[0..PROC_NAME_MAX], name);
                p[PROC_NAME_MAX..PROC_NAME_MAX + 4].copy_from_slice(&oflags.to_le_bytes());
                p[PROC_NAME_MAX + 4..PROC_NAME_MAX + 8].copy_from_slice(&mode.to_le_bytes());
            }
            Payload::ShmOpen { name, oflags } => {
                put_name(&mut p[0..PROC_NAME_MAX], name);
                p[PROC_NAME_MAX..PROC_NAME_MAX + 4].copy_from_slice(&oflags.to_le_bytes());
            }
            Payload::ShmUnlink { name } => {
                put_name(&mut p[0..PROC_NAME_MAX], name);
            }
            Payload::ShmClose { shmid } => {
                p[0..4].copy_from_slice(&shmid.to_le_bytes());
            }
            Payload::ShmFtruncate { shmid, size } => {
                p[0..4].copy_from_slice(&shmid.to_le_bytes());
                p[4..12].copy_from_slice(&size.to_le_bytes());
            }
            Payload::ShmInval { shmid, page } => {
                p[0..4].copy_from_slice(&shmid.to_le_bytes());
                p[4..8].copy_from_slice(&page.to_le_bytes());
            }
            Payload::MsgGet { key, flags } | Payload::SemGet { key, flags } => {
                p[0..4].copy_from_slice(&key.to_le_bytes());
                p[4..8].copy_from_slice(&flags.to_le_bytes());
            }
            Payload::MsgClose { msgid } => {
                p[0..4].copy_from_slice(&msgid.to_le_bytes());
            }
            Payload::MsgSend { msgid, msgtyp, size, flags }
            | Payload::MsgReceive { msgid, msgtyp, size, flags } => {
                p[0..4].copy_from_slice(&msgid.to_le_bytes());
                p[4..12].copy_from_slice(&msgtyp.to_le_bytes());
                p[12..16].copy_from_slice(&size.to_le_bytes());
                p[16..20].copy_from_slice(&flags.to_le_bytes());
            }
            Payload::SemClose { semid } => {
                p[0..4].copy_from_slice(&semid.to_le_bytes());
            }
            Payload::SemOperate { semid, sembuf } => {
                p[0..4].copy_from_slice(&semid.to_le_bytes());
                p[4..6].copy_from_slice(&sembuf.num.to_le_bytes());
                p[6..8].copy_from_slice(&sembuf.op.to_le_bytes());
                p[8..10].copy_from_slice(&sembuf.flg.to_le_bytes());
            }
            Payload::Ret(ret) => {
                p[0..4].copy_from_slice(&ret.errcode.to_le_bytes());
                p[4..8].copy_from_slice(&ret.proc_info.pid.raw().to_le_bytes());
                p[8..12].copy_from_slice(&ret.proc_info.nodenum.to_le_bytes());
                p[12..16].copy_from_slice(&ret.gid.to_le_bytes());
                p[16..20].copy_from_slice(&ret.ipcid.to_le_bytes());
                p[20..24].copy_from_slice(&ret.page.to_le_bytes());
                p[24..28].copy_from_slice(&ret.status.to_le_bytes());
                p[28..32].copy_from_slice(&ret.blknum.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
        if buf.len() != MESSAGE_SIZE {
            return Err(CodecError::BadLength(buf.len()));
        }
        let opcode = Opcode::try_from(buf[0]).map_err(|_| CodecError::BadOpcode(buf[0]))?;
        let header = Header {
            opcode,
            source: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
            pid: Pid::from_raw(i32::from_le_bytes(buf[5..9].try_into().unwrap())),
            mailbox_port: u32::from_le_bytes(buf[9..13].try_into().unwrap()),
            portal_port: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
        };

        let p = &buf[HEADER_SIZE..];
        let payload = match opcode {
            Opcode::NameSetpid
            | Opcode::NameExit
            | Opcode::RmemAlloc
            | Opcode::RmemExit
            | Opcode::SysvExit => Payload::None,
            Opcode::NameLink => Payload::NameLink {
                pid: Pid::from_raw(i32::from_le_bytes(p[0..4].try_into().unwrap())),
                name: get_name(&p[4..4 + PROC_NAME_MAX])?,
            },
            Opcode::NameLookup => Payload::NameLookup {
                pid: Pid::from_raw(i32::from_le_bytes(p[0..4].try_into().unwrap())),
                name: get_name(&p[4..4 + PROC_NAME_MAX])?,
            },
            Opcode::NameUnlink => Payload::NameUnlink {
                name: get_name(&p[0..PROC_NAME_MAX])?,
            },
            Opcode::NameAlive => Payload::NameAlive {
                timestamp: u64::from_le_bytes(p[0..8].try_into().unwrap()),
            },
            Opcode::NameGetpgid => Payload::NameGetpgid {
                pid: Pid::from_raw(i32::from_le_bytes(p[0..4].try_into().unwrap())),
            },
            Opcode::NameSetpgid => Payload::NameSetpgid {
                pid: Pid::from_raw(i32::from_le_bytes(p[0..4].try_into().unwrap())),
                pgid: i32::from_le_bytes(p[4..8].try_into().unwrap()),
            },
            Opcode::RmemFree => Payload::RmemFree {
                blknum: u32::from_le_bytes(p[0..4].try_into().unwrap()),
            },
            Opcode::RmemWrite => Payload::RmemWrite {
                blknum: u32::from_le_bytes(p[0..4].try_into().unwrap()),
            },
            Opcode::RmemRead => Payload::RmemRead {
                blknum: u32::from_le_bytes(p[0..4].try_into().unwrap()),
            },
            Opcode::ShmCreate => Payload::ShmCreate {
                name: get_name(&p[0..PROC_NAME_MAX])?,
                oflags: i32::from_le_bytes(
                    p[PROC_NAME_MAX..PROC_NAME_MAX + 4].try_into().unwrap(),
                ),
                mode: u32::from_le_bytes(
                    p[PROC_NAME_MAX + 4..PROC_NAME_MAX + 8].try_into().unwrap(),
                ),
            },
            Opcode::ShmOpen => Payload::ShmOpen {
                name: get_name(&p[0..PROC_NAME_MAX])?,
                oflags: i32::from_le_bytes(
                    p[PROC_NAME_MAX..PROC_NAME_MAX + 4].try_into().unwrap(),
                ),
            },
            Opcode::ShmUnlink => Payload::ShmUnlink {
                name: get_name(&p[0..PROC_NAME_MAX])?,
            },
            Opcode::ShmClose => Payload::ShmClose {
                shmid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
            },
            Opcode::ShmFtruncate => Payload::ShmFtruncate {
                shmid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                size: u64::from_le_bytes(p[4..12].try_into().unwrap()),
            },
            Opcode::ShmInval => Payload::ShmInval {
                shmid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                page: u32::from_le_bytes(p[4..8].try_into().unwrap()),
            },
            Opcode::MsgGet => Payload::MsgGet {
                key: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                flags: i32::from_le_bytes(p[4..8].try_into().unwrap()),
            },
            Opcode::SemGet => Payload::SemGet {
                key: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                flags: i32::from_le_bytes(p[4..8].try_into().unwrap()),
            },
            Opcode::MsgClose => Payload::MsgClose {
                msgid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
            },
            Opcode::MsgSend => Payload::MsgSend {
                msgid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                msgtyp: i64::from_le_bytes(p[4..12].try_into().unwrap()),
                size: u32::from_le_bytes(p[12..16].try_into().unwrap()),
                flags: i32::from_le_bytes(p[16..20].try_into().unwrap()),
            },
            Opcode::MsgReceive => Payload::MsgReceive {
                msgid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                msgtyp: i64::from_le_bytes(p[4..12].try_into().unwrap()),
                size: u32::from_le_bytes(p[12..16].try_into().unwrap()),
                flags: i32::from_le_bytes(p[16..20].try_into().unwrap()),
            },
            Opcode::SemClose => Payload::SemClose {
                semid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
            },
            Opcode::SemOperate => Payload::SemOperate {
                semid: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                sembuf: SemBuf {
                    num: u16::from_le_bytes(p[4..6].try_into().unwrap()),
                    op: i16::from_le_bytes(p[6..8].try_into().unwrap()),
                    flg: i16::from_le_bytes(p[8..10].try_into().unwrap()),
                },
            },
            Opcode::NameSuccess
            | Opcode::NameFail
            | Opcode::RmemSuccess
            | Opcode::RmemFail
            | Opcode::SysvAck
            | Opcode::SysvSuccess
            | Opcode::SysvFail => Payload::Ret(Ret {
                errcode: i32::from_le_bytes(p[0..4].try_into().unwrap()),
                proc_info: ProcInfo {
                    pid: Pid::from_raw(i32::from_le_bytes(p[4..8].try_into().unwrap())),
                    nodenum: i32::from_le_bytes(p[8..12].try_into().unwrap()),
                },
                gid: i32::from_le_bytes(p[12..16].try_into().unwrap()),
                ipcid: i32::from_le_bytes(p[16..20].try_into().unwrap()),
                page: u32::from_le_bytes(p[20..24].try_into().unwrap()),
                status: i32::from_le_bytes(p[24..28].try_into().unwrap()),
                blknum: u32::from_le_bytes(p[28..32].try_into().unwrap()),
            }),
        };

        Ok(Message { header, payload })
    }

    /// Reply payload accessor; replies always carry [`Payload::Ret`].
    pub fn ret(&self) -> Ret {
        match &self.payload {
            Payload::Ret(ret) => *ret,
            _ => Ret::from_errno(Errno::Enosys),
        }
    }
}

fn put_name(dst: &mut [u8], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in dst[n..].iter_mut() {
        *b = 0;
    }
}

fn get_name(src: &[u8]) -> Result<String, CodecError> {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end])
        .map(|s| s.to_string())
        .map_err(|_| CodecError::BadName)
}
