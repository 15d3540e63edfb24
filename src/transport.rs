//! Framed JSON transport
//!
//! One message per frame, length-prefixed so a reader never has to guess
//! where a JSON document ends:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  4 bytes: u32 big-endian payload length                 │
//! ├─────────────────────────────────────────────────────────┤
//! │  N bytes: JSON-encoded request or response              │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`Channel`] trait is what the runner programs against; the byte-level
//! mechanics live entirely in [`FramedChannel`].

use crate::message::Response;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Hard cap on inbound frame size (16 MB).
const MAX_FRAME_HARD_LIMIT: usize = 16 * 1024 * 1024;

/// Errors that can occur on the channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed its end; no further traffic is possible.
    #[error("channel closed by peer")]
    Closed,

    /// One inbound message was unusable. The stream itself is still in
    /// sync and the channel remains usable.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The framed, ordered, reliable stream carrying one session.
pub trait Channel {
    /// Block until the next message arrives.
    ///
    /// `Err(Closed)` signals end-of-stream. `Err(Malformed)` reports a
    /// single undecodable message; the next call reads the following frame.
    fn recv(&mut self) -> Result<Value, TransportError>;

    /// Send a success response for the request with the given id.
    fn send_success(&mut self, id: &Value, result: Value) -> Result<(), TransportError>;

    /// Send an error response for the request with the given id.
    fn send_error(
        &mut self,
        id: &Value,
        code: i32,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), TransportError>;

    /// Flush and retire the channel. Every later operation fails with
    /// [`TransportError::Closed`].
    fn close(&mut self) -> Result<(), TransportError>;
}

/// [`Channel`] implementation over any ordered byte stream.
pub struct FramedChannel<S> {
    stream: S,
    max_frame: usize,
    closed: bool,
}

impl<S: Read + Write> FramedChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_frame: MAX_FRAME_HARD_LIMIT,
            closed: false,
        }
    }

    /// Lower the inbound frame cap. Frames above the cap are drained and
    /// reported as malformed instead of desynchronizing the stream.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut header = [0u8; 4];
        if let Err(err) = self.stream.read_exact(&mut header) {
            return Err(eof_as_closed(err));
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            // Consume the declared payload so the next frame starts at a
            // frame boundary.
            io::copy(&mut (&mut self.stream).take(len as u64), &mut io::sink())
                .map_err(eof_as_closed)?;
            return Err(TransportError::Malformed(format!(
                "frame of {len} bytes exceeds the {} byte limit",
                self.max_frame
            )));
        }

        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .map_err(eof_as_closed)?;
        Ok(payload)
    }

    fn send(&mut self, response: &Response) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let body = serde_json::to_vec(response).map_err(|e| TransportError::Encode(e.to_string()))?;
        self.stream.write_all(&(body.len() as u32).to_be_bytes())?;
        self.stream.write_all(&body)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl FramedChannel<UnixStream> {
    /// Adopt an already-connected Unix-domain socket descriptor handed
    /// down by the supervising process.
    ///
    /// Takes ownership of the descriptor; the caller must not use or close
    /// it afterwards.
    pub fn from_descriptor(fd: RawFd) -> Self {
        // Safety: ownership of the descriptor is transferred to us by the
        // process argument contract; nothing else in this process holds it.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Self::new(stream)
    }
}

impl<S: Read + Write> Channel for FramedChannel<S> {
    fn recv(&mut self) -> Result<Value, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let payload = self.read_frame()?;
        serde_json::from_slice(&payload)
            .map_err(|e| TransportError::Malformed(format!("frame is not valid JSON: {e}")))
    }

    fn send_success(&mut self, id: &Value, result: Value) -> Result<(), TransportError> {
        self.send(&Response::success(id.clone(), result))
    }

    fn send_error(
        &mut self,
        id: &Value,
        code: i32,
        message: &str,
        data: Option<Value>,
    ) -> Result<(), TransportError> {
        self.send(&Response::error(id.clone(), code, message, data))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.stream.flush()?;
        }
        Ok(())
    }
}

/// A peer that went away mid-frame looks the same as one that closed
/// cleanly between frames: the stream is over.
fn eof_as_closed(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(err)
    }
}
