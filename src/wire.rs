//! Peer wire protocol.
//!
//! A client opens a connection and sends its node id as an ASCII decimal string in a single write
//! (at most [`HANDSHAKE_MAX_LEN`] bytes, no delimiter). The server answers with zero or more raw
//! 100-byte records followed by the 8-byte [`SENTINEL`] and closes the connection.
//!
//! Records and the sentinel share the same byte stream, so the sentinel is recognized as the
//! pending tail left when the stream ends. The server always closes right after the sentinel,
//! which keeps a record that happens to start with the sentinel bytes unambiguous.

use std::io::{self, prelude::*};

use crate::config::NodeId;
use crate::error::{is_transient, NetSortError};
use crate::record::{Record, RECORD_SIZE};

/// Maximum handshake length in bytes.
pub const HANDSHAKE_MAX_LEN: usize = 16;
/// End-of-stream marker written after the last record.
pub const SENTINEL: &[u8; 8] = b"Finished";

/// How a record stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfStream {
    /// The sentinel was received before the connection was closed.
    Sentinel,
    /// The connection was closed on a record boundary without a sentinel.
    Closed,
}

/// Single decoded unit of a record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Record(Record),
    End(EndOfStream),
}

/// Classifies the bytes left over when a record stream ends.
/// Returns [`None`] if the tail is neither empty nor the sentinel.
pub fn classify_tail(tail: &[u8]) -> Option<EndOfStream> {
    if tail.is_empty() {
        Some(EndOfStream::Closed)
    } else if tail == SENTINEL {
        Some(EndOfStream::Sentinel)
    } else {
        None
    }
}

/// Sends the local node id.
pub fn write_handshake<W: Write>(writer: &mut W, id: NodeId) -> Result<(), NetSortError> {
    let encoded = id.to_string();
    if encoded.len() > HANDSHAKE_MAX_LEN {
        return Err(NetSortError::InvalidHandshake(format!("node id {} does not fit a handshake", id)));
    }

    writer
        .write_all(encoded.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(NetSortError::HandshakeIO)
}

/// Receives the requesting node id with a single read.
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<NodeId, NetSortError> {
    let mut buf = [0u8; HANDSHAKE_MAX_LEN];
    let len = loop {
        match reader.read(&mut buf) {
            Ok(len) => break len,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(NetSortError::HandshakeIO(err)),
        }
    };

    parse_handshake(&buf[..len])
}

/// Parses a handshake payload.
pub fn parse_handshake(payload: &[u8]) -> Result<NodeId, NetSortError> {
    if payload.is_empty() {
        return Err(NetSortError::InvalidHandshake("connection closed before handshake".into()));
    }

    std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.parse::<NodeId>().ok())
        .ok_or_else(|| NetSortError::InvalidHandshake(format!("{:?} is not a node id", String::from_utf8_lossy(payload))))
}

/// Writes the whole buffer, retrying transient failures from the last written byte.
pub fn write_retrying<W: Write>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data")),
            Ok(written) => buf = &buf[written..],
            Err(err) if is_transient(&err) => {
                log::warn!("transient write error, retrying: {}", err);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Writes a single record.
pub fn write_record<W: Write>(writer: &mut W, record: &Record) -> io::Result<()> {
    write_retrying(writer, record.as_bytes())
}

/// Writes the end-of-stream marker and flushes the writer.
pub fn write_sentinel<W: Write>(writer: &mut W) -> io::Result<()> {
    write_retrying(writer, SENTINEL)?;
    writer.flush()
}

/// Decodes records from a byte stream sent by `peer`.
pub struct FrameReader<R> {
    inner: R,
    peer: NodeId,
    buf: [u8; RECORD_SIZE],
    filled: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, peer: NodeId) -> Self {
        FrameReader {
            inner,
            peer,
            buf: [0u8; RECORD_SIZE],
            filled: 0,
        }
    }

    /// Reads the next frame. Transient read errors are logged and the read is retried.
    pub fn next_frame(&mut self) -> Result<Frame, NetSortError> {
        loop {
            if self.filled == RECORD_SIZE {
                self.filled = 0;
                return Ok(Frame::Record(Record::new(self.buf)));
            }

            match self.inner.read(&mut self.buf[self.filled..]) {
                Ok(0) => {
                    let tail = &self.buf[..self.filled];
                    return classify_tail(tail).map(Frame::End).ok_or_else(|| NetSortError::Protocol {
                        peer: self.peer,
                        reason: format!("stream ended inside a record ({} pending bytes)", tail.len()),
                    });
                }
                Ok(read) => self.filled += read,
                Err(err) if is_transient(&err) => {
                    log::warn!("transient read error from node {}, retrying: {}", self.peer, err);
                }
                Err(err) => return Err(NetSortError::PeerStream { peer: self.peer, err }),
            }
        }
    }
}
