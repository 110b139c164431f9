//! Message bodies.
//!
//! The channel moves a fixed 64-byte blob. [`MessageBody`] is the typed view
//! services agree on; its wire form is a little-endian `u32` tag followed by
//! a 60-byte payload.

use super::Endpoint;
use crate::errors::{Errno, KernelResult};
use crate::proc::VirtAddr;

/// Size of a message body on the wire.
pub const MSG_SIZE: usize = 64;
/// Payload bytes after the tag.
pub const MSG_PAYLOAD: usize = MSG_SIZE - 4;

/// An opaque message body as it crosses the user boundary.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawMessage(pub [u8; MSG_SIZE]);

impl RawMessage {
    pub const fn zeroed() -> Self {
        Self([0; MSG_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; MSG_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; MSG_SIZE] {
        &mut self.0
    }
}

impl Default for RawMessage {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl core::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tag = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        write!(f, "RawMessage(tag={})", tag)
    }
}

/// Typed message bodies exchanged with kernel services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody {
    /// Untyped payload
    Opaque([u8; MSG_PAYLOAD]),
    /// Print `len` bytes at `text` on the debug console
    DebugPrint { req: i32, rc: i32, text: VirtAddr, len: u64 },
    /// Register or look up a service name
    NameService { req: i32, id: Endpoint, name: VirtAddr, len: u64, rc: i32 },
    /// Thread service request
    Thread { req: i32, rc: i32, args: [u64; 4] },
    /// Process service request
    Proc { req: i32, rc: i32, args: [u64; 4] },
    /// VM service request
    Vm { req: i32, rc: i32, args: [u64; 4] },
}

const TAG_OPAQUE: u32 = 0;
const TAG_DEBUG_PRINT: u32 = 1;
const TAG_NAME_SERVICE: u32 = 2;
const TAG_THREAD: u32 = 3;
const TAG_PROC: u32 = 4;
const TAG_VM: u32 = 5;

struct Writer<'a> {
    buf: &'a mut [u8; MSG_SIZE],
    pos: usize,
}

impl Writer<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8; MSG_SIZE],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn args(&mut self) -> [u64; 4] {
        [self.u64(), self.u64(), self.u64(), self.u64()]
    }
}

impl MessageBody {
    pub fn encode(&self) -> RawMessage {
        let mut raw = RawMessage::zeroed();
        let mut w = Writer { buf: &mut raw.0, pos: 0 };
        match *self {
            MessageBody::Opaque(ref payload) => {
                w.u32(TAG_OPAQUE);
                w.put(payload);
            }
            MessageBody::DebugPrint { req, rc, text, len } => {
                w.u32(TAG_DEBUG_PRINT);
                w.i32(req);
                w.i32(rc);
                w.u64(text);
                w.u64(len);
            }
            MessageBody::NameService { req, id, name, len, rc } => {
                w.u32(TAG_NAME_SERVICE);
                w.i32(req);
                w.i32(rc);
                w.u64(id);
                w.u64(name);
                w.u64(len);
            }
            MessageBody::Thread { req, rc, args }
            | MessageBody::Proc { req, rc, args }
            | MessageBody::Vm { req, rc, args } => {
                w.u32(match self {
                    MessageBody::Thread { .. } => TAG_THREAD,
                    MessageBody::Proc { .. } => TAG_PROC,
                    _ => TAG_VM,
                });
                w.i32(req);
                w.i32(rc);
                for arg in args {
                    w.u64(arg);
                }
            }
        }
        raw
    }

    /// `Invalid` for an unknown tag.
    pub fn decode(raw: &RawMessage) -> KernelResult<Self> {
        let mut r = Reader { buf: &raw.0, pos: 0 };
        let body = match r.u32() {
            TAG_OPAQUE => MessageBody::Opaque(r.take()),
            TAG_DEBUG_PRINT => MessageBody::DebugPrint {
                req: r.i32(),
                rc: r.i32(),
                text: r.u64(),
                len: r.u64(),
            },
            TAG_NAME_SERVICE => {
                let req = r.i32();
                let rc = r.i32();
                MessageBody::NameService {
                    req,
                    rc,
                    id: r.u64(),
                    name: r.u64(),
                    len: r.u64(),
                }
            }
            TAG_THREAD => MessageBody::Thread { req: r.i32(), rc: r.i32(), args: r.args() },
            TAG_PROC => MessageBody::Proc { req: r.i32(), rc: r.i32(), args: r.args() },
            TAG_VM => MessageBody::Vm { req: r.i32(), rc: r.i32(), args: r.args() },
            _ => return Err(Errno::Invalid),
        };
        Ok(body)
    }
}

impl From<MessageBody> for RawMessage {
    fn from(body: MessageBody) -> Self {
        body.encode()
    }
}

impl TryFrom<&RawMessage> for MessageBody {
    type Error = Errno;

    fn try_from(raw: &RawMessage) -> KernelResult<Self> {
        MessageBody::decode(raw)
    }
}
