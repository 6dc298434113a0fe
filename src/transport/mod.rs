//! Transport contract: message channels, listeners and stream framing.

pub mod socket;

use std::os::fd::{OwnedFd, RawFd};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

/// Peer credentials read from the first ancillary credentials message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// One decoded inbound message: payload, the descriptors that rode
/// alongside it and the peer credentials when the transport carries them.
pub struct InboundFrame {
    pub payload: Bytes,
    pub fds: Vec<OwnedFd>,
    pub credentials: Option<Credentials>,
}

/// Per-connection message channel. Implementations must allow `send_msg`
/// and `recv_msg` from different threads concurrently.
pub trait MessageChannel: Send + Sync {
    /// Sends one framed message with optional descriptors.
    fn send_msg(&self, payload: &[u8], fds: &[RawFd]) -> Result<(), Error>;

    /// Blocks for the next message. Fails with
    /// [`Error::ConnectionClosed`] once the peer goes away.
    fn recv_msg(&self) -> Result<InboundFrame, Error>;

    /// Tears the connection down, unblocking any pending receive.
    fn abort(&self) -> Result<(), Error>;

    /// Raw descriptor of the underlying stream, when there is one.
    fn raw_fd(&self) -> Option<RawFd>;
}

/// Accept side of a listening transport.
pub trait Listener: Send + Sync {
    /// Blocks for the next inbound connection.
    fn accept(&self) -> Result<Box<dyn MessageChannel>, Error>;

    /// URI the listener is bound to.
    fn local_uri(&self) -> String;

    /// Stops listening, unblocking a pending accept.
    fn close(&self) -> Result<(), Error>;
}

/// A transport: a connector/listener factory for a set of URI schemes.
pub trait Transport: Send + Sync {
    fn schemes(&self) -> &[&str];
    fn connect(&self, uri: &str) -> Result<Box<dyn MessageChannel>, Error>;
    fn listen(&self, uri: &str) -> Result<Box<dyn Listener>, Error>;
}

/// Message framing magic, little-endian on the wire.
pub const FRAME_MAGIC: u32 = 0xDEADBEEF;

/// Fixed 16-byte header preceding every message on a stream transport:
/// magic, payload length, two reserved zero words.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub len: u32,
    pub reserved: [u32; 2],
}

impl FrameHeader {
    pub const SIZE: usize = 16;

    pub fn new(len: u32) -> FrameHeader {
        FrameHeader {
            magic: FRAME_MAGIC,
            len,
            reserved: [0, 0],
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.magic);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.reserved[0]);
        buf.put_u32_le(self.reserved[1]);
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<FrameHeader, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Protocol("short frame header".into()));
        }
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        let header = FrameHeader {
            magic: word(0),
            len: word(4),
            reserved: [word(8), word(12)],
        };
        if header.magic != FRAME_MAGIC {
            return Err(Error::Protocol(format!(
                "bad frame magic {:#010x}",
                header.magic
            )));
        }
        Ok(header)
    }
}

/// Parsed transport endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// `unix://<path>`: local-domain stream socket.
    Unix(std::path::PathBuf),
    /// `tcp://<host>:<port>`: TCP stream socket, no descriptor passing.
    Tcp(String),
}

pub fn parse_uri(uri: &str) -> Result<Endpoint, Error> {
    if let Some(path) = uri.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(Error::Invalid(format!("bad unix uri '{}'", uri)));
        }
        return Ok(Endpoint::Unix(path.into()));
    }
    if let Some(addr) = uri.strip_prefix("tcp://") {
        if !addr.contains(':') {
            return Err(Error::Invalid(format!("bad tcp uri '{}'", uri)));
        }
        return Ok(Endpoint::Tcp(addr.to_string()));
    }
    Err(Error::Invalid(format!("unsupported uri scheme in '{}'", uri)))
}
