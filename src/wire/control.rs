//! The reliable, ordered control link (§4.4): 4-byte little-endian length
//! prefix + opaque payload, repeated. One connection per neighbour, both
//! endpoints symmetric.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};

use parking_lot::Mutex;

use super::{Message, WireError};

/// Frames larger than this are rejected outright rather than causing an
/// unbounded allocation from a corrupt or hostile length prefix.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// A framed control connection to exactly one neighbour.
///
/// Reads are **not** synchronized (only one worker ever reads a given
/// connection, per §5's ordering guarantees); writes are serialized
/// through an internal mutex because the handshake, control loop, and
/// operator surface may all want to send on the same connection
/// concurrently (§5: "implementations SHOULD serialise control-frame
/// writes per connection").
pub struct ControlConn {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    read_half: Mutex<TcpStream>,
    write_half: Mutex<TcpStream>,
}

impl ControlConn {
    pub fn new(stream: TcpStream) -> io::Result<ControlConn> {
        stream.set_nodelay(true).ok();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let write_half = stream.try_clone()?;
        Ok(ControlConn {
            local_addr,
            peer_addr,
            read_half: Mutex::new(stream),
            write_half: Mutex::new(write_half),
        })
    }

    pub fn connect(addr: SocketAddr) -> io::Result<ControlConn> {
        let stream = TcpStream::connect(addr)?;
        ControlConn::new(stream)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads exactly one frame, blocking until it arrives. Returns
    /// `Ok(None)` on a clean EOF (peer closed the connection).
    pub fn recv(&self) -> Result<Option<Message>, WireError> {
        let mut stream = self.read_half.lock();
        let mut len_buf = [0u8; 4];
        if read_exact_or_eof(&mut stream, &mut len_buf)?.is_err() {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(WireError::Malformed(
                bincode::ErrorKind::SizeLimit.into(),
            ));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body)?;
        trace!("{} <- {} ({}B)", self.local_addr, self.peer_addr, len);
        Message::decode(&body).map(Some)
    }

    /// Serializes `msg` and writes the length-prefixed frame, blocking
    /// until the whole frame is on the wire.
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        let body = msg.encode();
        let len = body.len() as u32;
        let mut stream = self.write_half.lock();
        stream.write_all(&len.to_le_bytes())?;
        stream.write_all(&body)?;
        stream.flush()?;
        trace!("{} -> {} ({}B)", self.local_addr, self.peer_addr, len);
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.write_half.lock().shutdown(Shutdown::Both);
    }
}

/// Like `read_exact`, but treats a zero-byte read on the very first
/// attempt as a clean EOF instead of an `UnexpectedEof` error, and a
/// partial read followed by EOF as an error (a genuinely truncated
/// frame, not a graceful close).
fn read_exact_or_eof(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<Result<(), ()>> {
    let mut read = 0;
    while read < buf.len() {
        let n = stream.read(&mut buf[read..])?;
        if n == 0 {
            return if read == 0 {
                Ok(Err(()))
            } else {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated frame"))
            };
        }
        read += n;
    }
    Ok(Ok(()))
}
