use crate::buffer::read_into;
use crate::protocol::StreamError;
use crate::socket::{ReadOutcome, Registration, Socket, Transport};
use bytes::BytesMut;
use mio::{Interest, Registry, Token};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use tracing::trace;

/// A plaintext socket passing reads and writes straight to the transport.
#[derive(Debug)]
pub struct TcpSocket<T> {
    transport: T,
    read_chunk: usize,
    open: bool,
}

impl<T: Transport> TcpSocket<T> {
    pub fn new(transport: T, read_chunk: usize) -> Self {
        Self { transport, read_chunk, open: true }
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.open { Ok(()) } else { Err(StreamError::Closed) }
    }
}

impl<T: Transport> Socket for TcpSocket<T> {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<Registration, StreamError> {
        self.ensure_open()?;
        registry.register(&mut self.transport, token, interest)?;
        Ok(Registration::default())
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<(), StreamError> {
        self.ensure_open()?;
        registry.reregister(&mut self.transport, token, interest)?;
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> Result<(), StreamError> {
        registry.deregister(&mut self.transport)?;
        Ok(())
    }

    fn read(&mut self, dst: &mut BytesMut) -> Result<ReadOutcome, StreamError> {
        self.ensure_open()?;
        loop {
            return match read_into(&mut self.transport, dst, self.read_chunk) {
                Ok(0) => Ok(ReadOutcome::Eof),
                Ok(n) => Ok(ReadOutcome::Bytes(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(ReadOutcome::Bytes(0)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    fn write(&mut self, src: &[u8]) -> Result<usize, StreamError> {
        self.ensure_open()?;
        loop {
            return match self.transport.write(src) {
                Ok(0) if !src.is_empty() => Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => Ok(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    fn flush(&mut self) -> Result<bool, StreamError> {
        self.ensure_open()?;
        Ok(true)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = self.transport.shutdown() {
            trace!(cause = %e, "shutdown tcp socket failed");
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr().ok()
    }
}
