//! Plaintext and TLS sockets behind one non-blocking contract.
//!
//! A [`Socket`] is owned by exactly one connection. The event loop registers it with the
//! mio [`Registry`] once and flips its interest as the connection moves between reading
//! and writing:
//!
//! - [`TcpSocket`]: pass-through to the transport
//! - [`TlsSocket`]: drives a [`TlsEngine`] through the handshake on [`Socket::register`],
//!   then decrypts on read and encrypts on write
//!
//! Reads and writes never block: `Ok(ReadOutcome::Bytes(0))` and `Ok(0)` mean the
//! transport would block and the caller should wait for the next readiness event.

mod engine;
mod tcp;
mod tls;
mod tls_config;

pub use engine::EngineResult;
pub use engine::EngineStatus;
pub use engine::HandshakeStatus;
pub use engine::RustlsEngine;
pub use engine::TlsEngine;
pub use tcp::TcpSocket;
pub use tls::TlsSocket;
pub use tls_config::TlsConfig;
pub use tls_config::TlsConfigError;

#[cfg(test)]
pub(crate) use engine::MockTlsEngine;

use crate::protocol::StreamError;
use bytes::BytesMut;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::io;
use std::net::{Shutdown, SocketAddr};

/// The byte stream a socket is layered on.
pub trait Transport: io::Read + io::Write + Source + Send {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for mio::net::TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        mio::net::TcpStream::peer_addr(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, Shutdown::Both)
    }
}

/// The result of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes appended to the destination; `0` when the transport would block.
    Bytes(usize),
    /// The peer closed the stream.
    Eof,
}

/// The result of registering a socket with the selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registration {
    /// Plaintext was decrypted during the TLS handshake and is waiting to be read.
    pub data_remaining: bool,
}

pub trait Socket: Send {
    /// Registers the socket with `registry`, finishing any handshake first.
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<Registration, StreamError>;

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<(), StreamError>;

    fn deregister(&mut self, registry: &Registry) -> Result<(), StreamError>;

    /// Appends available bytes to `dst`.
    fn read(&mut self, dst: &mut BytesMut) -> Result<ReadOutcome, StreamError>;

    /// Writes from `src` and returns how many bytes were taken; `0` means would block.
    fn write(&mut self, src: &[u8]) -> Result<usize, StreamError>;

    /// Pushes out bytes the socket buffered internally; `Ok(true)` once nothing is pending.
    fn flush(&mut self) -> Result<bool, StreamError>;

    fn is_open(&self) -> bool;

    /// Closes the socket; calling it again does nothing.
    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}
