//! Stream socket transport: local-domain sockets with descriptor and
//! credential passing, plus TCP without either.
//!
//! Every message is a 16-byte header plus payload. On local-domain
//! sockets the header travels through `sendmsg` so descriptors ride as
//! `SCM_RIGHTS` ancillary data on the header, and the payload follows as
//! a plain stream write; the receive path mirrors that split. A short
//! read abandons the frame and closes any received descriptors.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};

use bytes::Bytes;
#[cfg(target_os = "linux")]
use nix::sys::socket::UnixCredentials;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Error;

use super::{
    parse_uri, Credentials, Endpoint, FrameHeader, InboundFrame, Listener, MessageChannel,
    Transport,
};

/// Upper bound of descriptors accepted per message.
pub const MAX_MESSAGE_FDS: usize = 16;

/// Upper bound of a frame payload. Larger length words are treated as
/// framing corruption.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// The stream transport handling `unix://` and `tcp://` URIs.
pub struct SocketTransport;

impl Transport for SocketTransport {
    fn schemes(&self) -> &[&str] {
        &["unix", "tcp"]
    }

    fn connect(&self, uri: &str) -> Result<Box<dyn MessageChannel>, Error> {
        match parse_uri(uri)? {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(&path)?;
                #[cfg(target_os = "linux")]
                enable_passcred(stream.as_raw_fd())?;
                debug!(uri, "connected unix stream");
                Ok(Box::new(SocketChannel::unix(stream)))
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                debug!(uri, "connected tcp stream");
                Ok(Box::new(SocketChannel::tcp(stream)))
            }
        }
    }

    fn listen(&self, uri: &str) -> Result<Box<dyn Listener>, Error> {
        match parse_uri(uri)? {
            Endpoint::Unix(path) => {
                // A stale socket file from a previous run blocks bind.
                let _ = std::fs::remove_file(&path);
                let listener = UnixListener::bind(&path)?;
                debug!(uri, "listening on unix socket");
                Ok(Box::new(SocketListener {
                    kind: ListenerKind::Unix(listener),
                    uri: uri.to_string(),
                }))
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())?;
                debug!(uri, "listening on tcp socket");
                Ok(Box::new(SocketListener {
                    kind: ListenerKind::Tcp(listener),
                    uri: uri.to_string(),
                }))
            }
        }
    }
}

enum StreamKind {
    Unix(UnixStream),
    Tcp(TcpStream),
}

/// One connected stream. Sending and receiving take separate locks so a
/// reader thread and writer threads can work the socket concurrently.
pub struct SocketChannel {
    stream: StreamKind,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
}

impl SocketChannel {
    pub fn unix(stream: UnixStream) -> SocketChannel {
        SocketChannel {
            stream: StreamKind::Unix(stream),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    pub fn tcp(stream: TcpStream) -> SocketChannel {
        SocketChannel {
            stream: StreamKind::Tcp(stream),
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
        }
    }

    /// A connected channel pair backed by a local socketpair.
    pub fn pair() -> Result<(SocketChannel, SocketChannel), Error> {
        let (a, b) = UnixStream::pair()?;
        #[cfg(target_os = "linux")]
        {
            enable_passcred(a.as_raw_fd())?;
            enable_passcred(b.as_raw_fd())?;
        }
        Ok((SocketChannel::unix(a), SocketChannel::unix(b)))
    }
}

impl MessageChannel for SocketChannel {
    fn send_msg(&self, payload: &[u8], fds: &[RawFd]) -> Result<(), Error> {
        if fds.len() > MAX_MESSAGE_FDS {
            return Err(Error::Invalid(format!(
                "message carries {} descriptors, limit is {}",
                fds.len(),
                MAX_MESSAGE_FDS
            )));
        }

        let _guard = self.send_lock.lock();
        let header = FrameHeader::new(payload.len() as u32).encode();

        match &self.stream {
            StreamKind::Unix(stream) => {
                let iov = [IoSlice::new(&header)];
                let rights = [ControlMessage::ScmRights(fds)];
                let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
                sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
                    .map_err(nix_err)?;
                let mut writer: &UnixStream = stream;
                writer.write_all(payload)?;
            }
            StreamKind::Tcp(stream) => {
                if !fds.is_empty() {
                    return Err(Error::Invalid(
                        "tcp transport cannot carry descriptors".into(),
                    ));
                }
                let mut writer: &TcpStream = stream;
                writer.write_all(&header)?;
                writer.write_all(payload)?;
            }
        }
        Ok(())
    }

    fn recv_msg(&self) -> Result<InboundFrame, Error> {
        let _guard = self.recv_lock.lock();
        match &self.stream {
            StreamKind::Unix(stream) => self.recv_unix(stream),
            StreamKind::Tcp(stream) => self.recv_tcp(stream),
        }
    }

    fn abort(&self) -> Result<(), Error> {
        if let Some(fd) = self.raw_fd() {
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
            }
        }
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(match &self.stream {
            StreamKind::Unix(stream) => stream.as_raw_fd(),
            StreamKind::Tcp(stream) => stream.as_raw_fd(),
        })
    }
}

impl SocketChannel {
    fn recv_unix(&self, stream: &UnixStream) -> Result<InboundFrame, Error> {
        let mut header_buf = [0u8; FrameHeader::SIZE];
        let mut fds = Vec::new();
        let mut credentials: Option<Credentials> = None;

        // The header rides in the ancillary-carrying receive so that
        // descriptors and credentials arrive with the frame they belong to.
        let received = {
            let mut iov = [IoSliceMut::new(&mut header_buf)];
            #[cfg(target_os = "linux")]
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_MESSAGE_FDS], UnixCredentials);
            #[cfg(not(target_os = "linux"))]
            let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_MESSAGE_FDS]);

            let msg = recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buffer),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(nix_err)?;

            for cmsg in msg.cmsgs() {
                match cmsg {
                    ControlMessageOwned::ScmRights(raw_fds) => {
                        for raw in raw_fds {
                            fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                        }
                    }
                    #[cfg(target_os = "linux")]
                    ControlMessageOwned::ScmCredentials(creds) => {
                        credentials = Some(Credentials {
                            pid: creds.pid(),
                            uid: creds.uid(),
                            gid: creds.gid(),
                        });
                    }
                    _ => {}
                }
            }
            msg.bytes
        };

        if received == 0 {
            return Err(Error::ConnectionClosed);
        }
        if received < FrameHeader::SIZE {
            // The header straddled a stream chunk; pull in the rest.
            let mut reader: &UnixStream = stream;
            reader
                .read_exact(&mut header_buf[received..])
                .map_err(eof_as_closed)?;
        }

        let header = FrameHeader::decode(&header_buf)?;
        if header.len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!("oversized frame ({})", header.len)));
        }
        let mut payload = vec![0u8; header.len as usize];
        let mut reader: &UnixStream = stream;
        // A short read here drops `fds`, closing every received
        // descriptor instead of leaking it.
        reader.read_exact(&mut payload).map_err(eof_as_closed)?;

        Ok(InboundFrame {
            payload: Bytes::from(payload),
            fds,
            credentials,
        })
    }

    fn recv_tcp(&self, stream: &TcpStream) -> Result<InboundFrame, Error> {
        let mut reader: &TcpStream = stream;
        let mut header_buf = [0u8; FrameHeader::SIZE];
        reader.read_exact(&mut header_buf).map_err(eof_as_closed)?;
        let header = FrameHeader::decode(&header_buf)?;
        if header.len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!("oversized frame ({})", header.len)));
        }

        let mut payload = vec![0u8; header.len as usize];
        reader.read_exact(&mut payload).map_err(eof_as_closed)?;

        Ok(InboundFrame {
            payload: Bytes::from(payload),
            fds: Vec::new(),
            credentials: None,
        })
    }
}

enum ListenerKind {
    Unix(UnixListener),
    Tcp(TcpListener),
}

pub struct SocketListener {
    kind: ListenerKind,
    uri: String,
}

impl Listener for SocketListener {
    fn accept(&self) -> Result<Box<dyn MessageChannel>, Error> {
        match &self.kind {
            ListenerKind::Unix(listener) => {
                let (stream, _addr) = listener.accept()?;
                #[cfg(target_os = "linux")]
                enable_passcred(stream.as_raw_fd())?;
                Ok(Box::new(SocketChannel::unix(stream)))
            }
            ListenerKind::Tcp(listener) => {
                let (stream, _addr) = listener.accept()?;
                Ok(Box::new(SocketChannel::tcp(stream)))
            }
        }
    }

    fn local_uri(&self) -> String {
        match &self.kind {
            ListenerKind::Unix(_) => self.uri.clone(),
            ListenerKind::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{}", addr),
                Err(_) => self.uri.clone(),
            },
        }
    }

    fn close(&self) -> Result<(), Error> {
        let fd = match &self.kind {
            ListenerKind::Unix(listener) => listener.as_raw_fd(),
            ListenerKind::Tcp(listener) => listener.as_raw_fd(),
        };
        unsafe {
            libc::shutdown(fd, libc::SHUT_RDWR);
        }
        Ok(())
    }
}

/// Asks the kernel to attach `SCM_CREDENTIALS` to inbound messages.
#[cfg(target_os = "linux")]
fn enable_passcred(fd: RawFd) -> Result<(), Error> {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn nix_err(errno: nix::errno::Errno) -> Error {
    Error::Transport(io::Error::from_raw_os_error(errno as i32))
}

fn eof_as_closed(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Transport(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::file_identity;

    #[test]
    fn test_pair_round_trip() {
        let (a, b) = SocketChannel::pair().unwrap();
        a.send_msg(b"hello", &[]).unwrap();

        let frame = b.recv_msg().unwrap();
        assert_eq!(&frame.payload[..], b"hello");
        assert!(frame.fds.is_empty());
    }

    #[test]
    fn test_fd_passing_preserves_identity() {
        let (a, b) = SocketChannel::pair().unwrap();
        let file = tempfile::tempfile().unwrap();

        a.send_msg(b"take this", &[file.as_raw_fd()]).unwrap();
        let frame = b.recv_msg().unwrap();

        assert_eq!(frame.fds.len(), 1);
        let received = frame.fds[0].as_raw_fd();
        assert_ne!(received, file.as_raw_fd());
        assert_eq!(
            file_identity(received).unwrap(),
            file_identity(file.as_raw_fd()).unwrap()
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_credentials_arrive() {
        let (a, b) = SocketChannel::pair().unwrap();
        a.send_msg(b"creds", &[]).unwrap();

        let frame = b.recv_msg().unwrap();
        let creds = frame.credentials.expect("expected SCM_CREDENTIALS");
        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds.uid, unsafe { libc::getuid() });
    }

    #[test]
    fn test_recv_after_close() {
        let (a, b) = SocketChannel::pair().unwrap();
        drop(a);
        assert!(matches!(b.recv_msg(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_abort_unblocks_receiver() {
        let (a, b) = SocketChannel::pair().unwrap();
        let handle = std::thread::spawn(move || b.recv_msg());
        std::thread::sleep(std::time::Duration::from_millis(50));
        a.abort().unwrap();
        assert!(handle.join().unwrap().is_err());
    }

    #[test]
    fn test_too_many_fds_rejected() {
        let (a, _b) = SocketChannel::pair().unwrap();
        let fds = [0 as RawFd; MAX_MESSAGE_FDS + 1];
        assert!(a.send_msg(b"x", &fds).is_err());
    }

    #[test]
    fn test_tcp_round_trip() {
        let transport = SocketTransport;
        let listener = transport.listen("tcp://127.0.0.1:0").unwrap();
        let uri = listener.local_uri();

        let handle = std::thread::spawn(move || {
            let channel = listener.accept().unwrap();
            let frame = channel.recv_msg().unwrap();
            channel.send_msg(&frame.payload, &[]).unwrap();
        });

        let client = transport.connect(&uri).unwrap();
        client.send_msg(b"echo me", &[]).unwrap();
        let frame = client.recv_msg().unwrap();
        assert_eq!(&frame.payload[..], b"echo me");
        handle.join().unwrap();
    }

    #[test]
    fn test_tcp_rejects_fds() {
        let transport = SocketTransport;
        let listener = transport.listen("tcp://127.0.0.1:0").unwrap();
        let uri = listener.local_uri();
        let handle = std::thread::spawn(move || {
            let _ = listener.accept();
        });
        let client = transport.connect(&uri).unwrap();
        assert!(client.send_msg(b"x", &[1]).is_err());
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn test_unix_listener_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let uri = format!("unix://{}/svc.sock", dir.path().display());

        let transport = SocketTransport;
        let listener = transport.listen(&uri).unwrap();
        let handle = std::thread::spawn(move || {
            let channel = listener.accept().unwrap();
            channel.recv_msg().unwrap().payload
        });

        let client = transport.connect(&uri).unwrap();
        client.send_msg(b"over the socket", &[]).unwrap();
        assert_eq!(&handle.join().unwrap()[..], b"over the socket");
    }

    #[test]
    fn test_received_fd_usable() {
        let (a, b) = SocketChannel::pair().unwrap();

        // Send the write end of a pipe across, then write through the
        // received copy and read it back locally.
        let (read_end, write_end) = pipe_pair();
        a.send_msg(b"pipe", &[write_end.as_raw_fd()]).unwrap();
        drop(write_end);

        let frame = b.recv_msg().unwrap();
        let received = frame.fds.into_iter().next().unwrap();
        let mut writer = std::fs::File::from(received);
        writer.write_all(b"through the pipe").unwrap();
        drop(writer);

        let mut text = String::new();
        let mut reader = std::fs::File::from(read_end);
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "through the pipe");
    }

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (unsafe { OwnedFd::from_raw_fd(fds[0]) }, unsafe {
            OwnedFd::from_raw_fd(fds[1])
        })
    }
}
