//! Transport seam between the probing engine and the instrument.
//!
//! The engine only needs a synchronous request/reply primitive. A raw-socket
//! implementation is provided for instruments that expose SCPI on a TCP port
//! (Rigol scopes listen on 5555); tests drive the engine with in-memory doubles.

use crate::error::{DoomError, TransportError};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default raw SCPI socket port
pub const DEFAULT_SCPI_PORT: u16 = 5555;

/// Identification query defined by IEEE 488.2
pub const IDN_QUERY: &str = "*IDN?";

/// Error queue query used after set-only commands
pub const ERROR_QUERY: &str = ":SYSTem:ERRor?";

/// Clears the status registers and the error queue
pub const CLEAR_STATUS: &str = "*CLS";

/// Largest single response accepted before the read is cut short
const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// Raw reply to a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub payload: Vec<u8>,
    pub elapsed: Duration,
}

/// Single-owner request/reply channel to one instrument.
///
/// Implementations must not multiplex: the engine issues one exchange at a
/// time and expects the reply to belong to the command it just sent.
pub trait Transport {
    /// Send `command` and wait up to `timeout` for a newline-terminated reply.
    fn query(&mut self, command: &str, timeout: Duration) -> Result<Response, TransportError>;

    /// Send `command` without waiting for a reply.
    fn write(&mut self, command: &str) -> Result<(), TransportError>;

    /// Raw identification string reported by the instrument.
    fn identify(&mut self, timeout: Duration) -> Result<String, TransportError> {
        let response = self.query(IDN_QUERY, timeout)?;
        Ok(String::from_utf8_lossy(&response.payload).trim().to_string())
    }

    fn close(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn query(&mut self, command: &str, timeout: Duration) -> Result<Response, TransportError> {
        (**self).query(command, timeout)
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        (**self).write(command)
    }

    fn identify(&mut self, timeout: Duration) -> Result<String, TransportError> {
        (**self).identify(timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// How the end of a reply is recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Newline-terminated text (also `#0` indefinite-length blocks)
    Line,
    /// IEEE 488.2 definite-length block `#<n><len><data>`, total byte count
    Block(usize),
    /// Block header not complete yet
    PendingHeader,
}

fn framing(payload: &[u8]) -> Framing {
    if payload.first() != Some(&b'#') {
        return Framing::Line;
    }
    let Some(&width) = payload.get(1) else {
        return Framing::PendingHeader;
    };
    let width = match width {
        b'1'..=b'9' => usize::from(width - b'0'),
        _ => return Framing::Line,
    };
    let Some(digits) = payload.get(2..2 + width) else {
        return Framing::PendingHeader;
    };
    match std::str::from_utf8(digits).ok().and_then(|d| d.parse::<usize>().ok()) {
        Some(len) => Framing::Block(2 + width + len),
        None => Framing::Line,
    }
}

/// SCPI over a raw TCP socket
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
}

impl TcpTransport {
    /// Connect to `target`, given as `host` or `host:port`.
    pub fn open(target: &str, connect_timeout: Duration) -> Result<Self, DoomError> {
        let peer = if target.contains(':') {
            target.to_string()
        } else {
            format!("{}:{}", target, DEFAULT_SCPI_PORT)
        };

        let addr = peer
            .to_socket_addrs()
            .map_err(|e| DoomError::Connection(format!("{}: {}", peer, e)))?
            .next()
            .ok_or_else(|| DoomError::Connection(format!("{}: no address resolved", peer)))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .map_err(|e| DoomError::Connection(format!("{}: {}", peer, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to {}", peer);
        Ok(Self {
            stream: Some(stream),
            peer,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    /// Discard bytes that arrive late, so a reply to a timed-out probe is not
    /// read as the reply to the next one.
    fn drain(&mut self) {
        let Ok(stream) = self.stream() else {
            return;
        };
        if stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .is_err()
        {
            return;
        }
        let mut scratch = [0u8; 4096];
        let mut dropped = 0usize;
        while let Ok(n) = stream.read(&mut scratch) {
            if n == 0 {
                break;
            }
            dropped += n;
        }
        if dropped > 0 {
            warn!("Dropped {} late bytes from {}", dropped, self.peer);
        }
    }
}

impl Transport for TcpTransport {
    fn query(&mut self, command: &str, timeout: Duration) -> Result<Response, TransportError> {
        let started = Instant::now();
        {
            let stream = self.stream()?;
            stream.write_all(command.as_bytes())?;
            stream.write_all(b"\n")?;
            stream.flush()?;
        }

        let mut payload = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let remaining = match timeout.checked_sub(started.elapsed()) {
                Some(left) if !left.is_zero() => left,
                _ => {
                    self.drain();
                    return Err(TransportError::Timeout(timeout));
                }
            };
            let stream = self.stream()?;
            stream.set_read_timeout(Some(remaining))?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => payload.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.drain();
                    return Err(TransportError::Timeout(timeout));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            match framing(&payload) {
                Framing::Block(total) if payload.len() >= total => {
                    let terminated = payload[total..].contains(&b'\n');
                    payload.truncate(total);
                    if !terminated {
                        self.drain();
                    }
                    break;
                }
                Framing::Line if payload.ends_with(b"\n") => {
                    while matches!(payload.last(), Some(b'\n' | b'\r')) {
                        payload.pop();
                    }
                    break;
                }
                _ => {}
            }
            if payload.len() >= MAX_RESPONSE_BYTES {
                self.drain();
                return Err(TransportError::Oversized(MAX_RESPONSE_BYTES));
            }
        }

        Ok(Response {
            payload,
            elapsed: started.elapsed(),
        })
    }

    fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.write_all(command.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Closed connection to {}", self.peer);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
