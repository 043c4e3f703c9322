//! The TLS record layer as a caller-driven wrap/unwrap engine.
//!
//! [`TlsSocket`](super::TlsSocket) never lets the TLS library touch the network. It moves
//! bytes between its own buffers and the transport and asks the engine to:
//!
//! - `unwrap`: consume network bytes and produce plaintext
//! - `wrap`: consume plaintext and produce network bytes
//!
//! Both report an [`EngineStatus`] telling the caller whether a buffer has to grow
//! (`BufferOverflow` on the destination, `BufferUnderflow` on the source) or the peer
//! closed the session.

use crate::protocol::StreamError;
use rustls::ServerConnection;
use std::io::{Read, Write};
use std::sync::Arc;

const MAX_PLAINTEXT_LEN: usize = 16 * 1024;
const MAX_RECORD_OVERHEAD: usize = 2048 + 5;

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NeedUnwrap,
    NeedWrap,
    NeedTask,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    BufferOverflow,
    BufferUnderflow,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub consumed: usize,
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: EngineStatus, consumed: usize, produced: usize) -> Self {
        Self { status, consumed, produced }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait TlsEngine: Send {
    fn handshake_status(&self) -> HandshakeStatus;

    /// Decrypts from `src` into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, StreamError>;

    /// Encrypts from `src` into `dst`; `src` may be empty to emit pending handshake records.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, StreamError>;

    fn run_delegated_tasks(&mut self);

    /// The network buffer size the engine wants to work with.
    fn packet_buffer_size(&self) -> usize;

    /// The plaintext buffer size the engine wants to work with.
    fn application_buffer_size(&self) -> usize;

    /// Queues a close notification for the peer.
    fn close_outbound(&mut self);
}

/// A [`TlsEngine`] over a rustls server session.
pub struct RustlsEngine {
    conn: ServerConnection,
    outbound_closed: bool,
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .field("outbound_closed", &self.outbound_closed)
            .finish()
    }
}

impl RustlsEngine {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, StreamError> {
        Ok(Self { conn: ServerConnection::new(config)?, outbound_closed: false })
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::Done
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, StreamError> {
        let was_handshaking = self.conn.is_handshaking();

        let mut reader = src;
        let consumed = if src.is_empty() { 0 } else { self.conn.read_tls(&mut reader)? };
        let state = self.conn.process_new_packets()?;

        let available = state.plaintext_bytes_to_read();
        let produced = if available > 0 && !dst.is_empty() { self.conn.reader().read(dst)? } else { 0 };

        let status = if available > produced {
            EngineStatus::BufferOverflow
        } else if state.peer_has_closed() && produced == 0 {
            EngineStatus::Closed
        } else if produced == 0 && !self.conn.wants_write() && was_handshaking == self.conn.is_handshaking() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult::new(status, consumed, produced))
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, StreamError> {
        let consumed = if src.is_empty() || self.outbound_closed { 0 } else { self.conn.writer().write(src)? };

        let mut out = dst;
        let mut produced = 0;
        while self.conn.wants_write() && !out.is_empty() {
            let n = self.conn.write_tls(&mut out)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        let status = if self.conn.wants_write() {
            EngineStatus::BufferOverflow
        } else if self.outbound_closed {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };

        Ok(EngineResult::new(status, consumed, produced))
    }

    fn run_delegated_tasks(&mut self) {}

    fn packet_buffer_size(&self) -> usize {
        MAX_PLAINTEXT_LEN + MAX_RECORD_OVERHEAD
    }

    fn application_buffer_size(&self) -> usize {
        MAX_PLAINTEXT_LEN
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }
}
