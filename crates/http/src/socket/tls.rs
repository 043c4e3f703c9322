//! A TLS socket driving a [`TlsEngine`] over a non-blocking transport.
//!
//! Three buffers sit between the transport and the connection:
//!
//! - `peer_net`: ciphertext read from the transport, waiting to be unwrapped
//! - `peer_app`: plaintext produced by unwrap, waiting to be read by the connection
//! - `my_net`: ciphertext produced by wrap, waiting to be written to the transport
//!
//! All three grow when the engine reports an overflow or underflow. The handshake runs
//! inside [`Socket::register`], which the event loop calls from a worker thread; a transport
//! that would block is polled with a short sleep until the handshake timeout expires.

use crate::buffer::GrowableBuffer;
use crate::protocol::StreamError;
use crate::socket::{EngineResult, EngineStatus, HandshakeStatus, ReadOutcome, Registration, Socket, TlsEngine, Transport};
use bytes::BytesMut;
use mio::{Interest, Registry, Token};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct TlsSocket<T, E> {
    transport: T,
    engine: E,
    peer_net: GrowableBuffer,
    peer_app: GrowableBuffer,
    my_net: GrowableBuffer,
    handshake_timeout: Duration,
    inbound_closed: bool,
    open: bool,
}

enum Fill {
    Bytes(usize),
    Eof,
}

/// The capacity to grow to after an overflow: the engine's size if that is larger,
/// otherwise double the current capacity.
fn enlarged(current: usize, proposed: usize) -> usize {
    if proposed > current { proposed } else { current.saturating_mul(2) }
}

impl<T: Transport, E: TlsEngine> TlsSocket<T, E> {
    pub fn new(transport: T, engine: E, handshake_timeout: Duration) -> Self {
        let packet_size = engine.packet_buffer_size();
        let app_size = engine.application_buffer_size();
        Self {
            transport,
            engine,
            peer_net: GrowableBuffer::growable(packet_size),
            peer_app: GrowableBuffer::growable(app_size),
            my_net: GrowableBuffer::growable(packet_size),
            handshake_timeout,
            inbound_closed: false,
            open: true,
        }
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.open { Ok(()) } else { Err(StreamError::Closed) }
    }

    /// Runs the handshake to completion, leaving the socket closed if the peer gave up.
    pub(crate) fn handshake(&mut self) -> Result<(), StreamError> {
        let deadline = Instant::now() + self.handshake_timeout;

        while self.open {
            match self.engine.handshake_status() {
                HandshakeStatus::NeedUnwrap => self.handshake_unwrap(deadline)?,
                HandshakeStatus::NeedWrap => self.handshake_wrap(deadline)?,
                HandshakeStatus::NeedTask => self.engine.run_delegated_tasks(),
                HandshakeStatus::Done => {
                    trace!("tls handshake finished");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn handshake_unwrap(&mut self, deadline: Instant) -> Result<(), StreamError> {
        let received = match self.fill_peer_net()? {
            Fill::Bytes(n) => n,
            Fill::Eof if self.peer_net.is_empty() => {
                debug!("peer closed during tls handshake");
                self.close();
                return Ok(());
            }
            Fill::Eof => 0,
        };

        let result = self.unwrap_peer_net()?;
        match result.status {
            EngineStatus::Ok => Ok(()),
            EngineStatus::BufferOverflow => self.grow_peer_app(),
            EngineStatus::BufferUnderflow => {
                self.grow_peer_net_if_full()?;
                if received == 0 { self.wait(deadline) } else { Ok(()) }
            }
            EngineStatus::Closed => {
                debug!("tls engine closed during handshake");
                self.close();
                Ok(())
            }
        }
    }

    fn handshake_wrap(&mut self, deadline: Instant) -> Result<(), StreamError> {
        let result = self.wrap_into_my_net(&[])?;
        match result.status {
            EngineStatus::Ok => {}
            EngineStatus::BufferOverflow => {
                self.flush_blocking(deadline)?;
                let proposed = enlarged(self.my_net.capacity(), self.engine.packet_buffer_size());
                self.my_net.grow_to(proposed)?;
            }
            EngineStatus::BufferUnderflow => return Err(StreamError::engine("wrap reported buffer underflow")),
            EngineStatus::Closed => {
                self.flush_blocking(deadline)?;
                self.close();
                return Ok(());
            }
        }
        self.flush_blocking(deadline)
    }

    fn wait(&self, deadline: Instant) -> Result<(), StreamError> {
        if Instant::now() >= deadline {
            return Err(StreamError::HandshakeTimeout { timeout_ms: self.handshake_timeout.as_millis() });
        }
        thread::sleep(HANDSHAKE_POLL_INTERVAL);
        Ok(())
    }

    fn fill_peer_net(&mut self) -> Result<Fill, StreamError> {
        if self.peer_net.remaining() == 0 {
            return Ok(Fill::Bytes(0));
        }
        loop {
            return match self.peer_net.read_from(&mut self.transport) {
                Ok(0) => Ok(Fill::Eof),
                Ok(n) => Ok(Fill::Bytes(n)),
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Fill::Bytes(0)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Err(e.into()),
            };
        }
    }

    fn unwrap_peer_net(&mut self) -> Result<EngineResult, StreamError> {
        let result = self.engine.unwrap(self.peer_net.as_slice(), self.peer_app.spare_mut())?;
        self.peer_net.consume(result.consumed);
        self.peer_app.advance(result.produced);
        Ok(result)
    }

    fn wrap_into_my_net(&mut self, src: &[u8]) -> Result<EngineResult, StreamError> {
        let result = self.engine.wrap(src, self.my_net.spare_mut())?;
        self.my_net.advance(result.produced);
        Ok(result)
    }

    fn grow_peer_app(&mut self) -> Result<(), StreamError> {
        let proposed = enlarged(self.peer_app.capacity(), self.engine.application_buffer_size());
        self.peer_app.grow_to(proposed)?;
        Ok(())
    }

    fn grow_peer_net_if_full(&mut self) -> Result<(), StreamError> {
        if self.peer_net.is_full() {
            let proposed = enlarged(self.peer_net.capacity(), self.engine.packet_buffer_size());
            self.peer_net.grow_to(proposed)?;
        }
        Ok(())
    }

    /// Writes pending ciphertext; `Ok(false)` if the transport would block.
    fn flush_my_net(&mut self) -> Result<bool, StreamError> {
        while !self.my_net.is_empty() {
            match self.transport.write(self.my_net.as_slice()) {
                Ok(0) => return Err(StreamError::io(ErrorKind::WriteZero)),
                Ok(n) => self.my_net.consume(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn flush_blocking(&mut self, deadline: Instant) -> Result<(), StreamError> {
        while !self.flush_my_net()? {
            self.wait(deadline)?;
        }
        Ok(())
    }

    /// Emits records the engine wants to send outside of application writes.
    fn pump_outbound(&mut self) -> Result<(), StreamError> {
        while self.engine.handshake_status() == HandshakeStatus::NeedWrap {
            let result = self.wrap_into_my_net(&[])?;
            if result.status == EngineStatus::BufferOverflow {
                if !self.flush_my_net()? {
                    return Ok(());
                }
                continue;
            }
            if result.produced == 0 {
                break;
            }
        }
        self.flush_my_net()?;
        Ok(())
    }

    fn drain_peer_app(&mut self, dst: &mut BytesMut) -> ReadOutcome {
        let n = self.peer_app.len();
        dst.extend_from_slice(self.peer_app.as_slice());
        self.peer_app.clear();
        ReadOutcome::Bytes(n)
    }

    #[cfg(test)]
    pub(crate) fn peer_net_capacity(&self) -> usize {
        self.peer_net.capacity()
    }
}

impl<T: Transport, E: TlsEngine> Socket for TlsSocket<T, E> {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> Result<Registration, StreamError> {
        self.ensure_open()?;
        self.handshake()?;
        if !self.open {
            return Ok(Registration::default());
        }

        registry.register(&mut self.transport, token, interest)?;
        Ok(Registration { data_remaining: !self.peer_app.is_empty() })
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

        if !self.peer_app.is_empty() {
            return Ok(self.drain_peer_app(dst));
        }
        if self.inbound_closed {
            self.close();
            return Ok(ReadOutcome::Eof);
        }

        loop {
            let received = match self.fill_peer_net()? {
                Fill::Bytes(n) => n,
                Fill::Eof if self.peer_net.is_empty() => {
                    self.close();
                    return Ok(ReadOutcome::Eof);
                }
                Fill::Eof => {
                    self.inbound_closed = true;
                    0
                }
            };

            let result = self.unwrap_peer_net()?;
            self.pump_outbound()?;

            match result.status {
                EngineStatus::Ok => {}
                EngineStatus::BufferOverflow => self.grow_peer_app()?,
                EngineStatus::BufferUnderflow => self.grow_peer_net_if_full()?,
                EngineStatus::Closed => {
                    self.inbound_closed = true;
                    if self.peer_app.is_empty() {
                        self.close();
                        return Ok(ReadOutcome::Eof);
                    }
                }
            }

            if !self.peer_app.is_empty() {
                return Ok(self.drain_peer_app(dst));
            }
            if self.inbound_closed {
                self.close();
                return Ok(ReadOutcome::Eof);
            }
            if received == 0 && result.consumed == 0 && result.status != EngineStatus::BufferOverflow {
                return Ok(ReadOutcome::Bytes(0));
            }
        }
    }

    fn write(&mut self, src: &[u8]) -> Result<usize, StreamError> {
        self.ensure_open()?;
        if !self.flush_my_net()? {
            return Ok(0);
        }

        let chunk = &src[..src.len().min(self.engine.application_buffer_size())];
        let mut consumed = 0;
        loop {
            let result = self.wrap_into_my_net(&chunk[consumed..])?;
            consumed += result.consumed;

            match result.status {
                EngineStatus::Ok => break,
                EngineStatus::BufferOverflow => {
                    let proposed = enlarged(self.my_net.capacity(), self.engine.packet_buffer_size());
                    self.my_net.grow_to(proposed)?;
                }
                EngineStatus::BufferUnderflow => return Err(StreamError::engine("wrap reported buffer underflow")),
                EngineStatus::Closed => {
                    self.close();
                    return Err(StreamError::Closed);
                }
            }
        }

        self.flush_my_net()?;
        Ok(consumed)
    }

    fn flush(&mut self) -> Result<bool, StreamError> {
        self.ensure_open()?;
        self.flush_my_net()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        self.engine.close_outbound();
        if let Err(e) = self.wrap_into_my_net(&[]).and_then(|_| self.flush_my_net()) {
            trace!(cause = %e, "send tls close notify failed");
        }
        if let Err(e) = self.transport.shutdown() {
            trace!(cause = %e, "shutdown tls socket failed");
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockTlsEngine;
    use crate::socket::mock::MockTransport;
    use mockall::Sequence;

    fn engine_with_sizes(packet: usize, app: usize) -> MockTlsEngine {
        let mut engine = MockTlsEngine::new();
        engine.expect_packet_buffer_size().return_const(packet);
        engine.expect_application_buffer_size().return_const(app);
        engine.expect_close_outbound().return_const(());
        engine
    }

    #[test]
    fn handshake_underflow_grows_network_buffer_and_retries() {
        let transport = MockTransport::new();
        transport.push_input(b"abcdefgh");

        let mut engine = engine_with_sizes(4, 16);
        let mut seq = Sequence::new();
        engine
            .expect_handshake_status()
            .times(2)
            .in_sequence(&mut seq)
            .return_const(HandshakeStatus::NeedUnwrap);
        engine.expect_handshake_status().times(1).in_sequence(&mut seq).return_const(HandshakeStatus::Done);

        let mut unwrap_seq = Sequence::new();
        engine
            .expect_unwrap()
            .withf(|src, _| src == b"abcd")
            .times(1)
            .in_sequence(&mut unwrap_seq)
            .returning(|_, _| Ok(EngineResult::new(EngineStatus::BufferUnderflow, 0, 0)));
        engine
            .expect_unwrap()
            .withf(|src, _| src == b"abcdefgh")
            .times(1)
            .in_sequence(&mut unwrap_seq)
            .returning(|src, _| Ok(EngineResult::new(EngineStatus::Ok, src.len(), 0)));

        let mut socket = TlsSocket::new(transport, engine, Duration::from_secs(1));
        socket.handshake().unwrap();

        assert!(socket.is_open());
        assert_eq!(socket.peer_net_capacity(), 8);
    }

    #[test]
    fn handshake_keeps_decrypted_plaintext() {
        let transport = MockTransport::new();
        transport.push_input(b"record");

        let mut engine = engine_with_sizes(32, 32);
        let mut seq = Sequence::new();
        engine
            .expect_handshake_status()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(HandshakeStatus::NeedUnwrap);
        engine.expect_handshake_status().return_const(HandshakeStatus::Done);
        engine.expect_unwrap().times(1).returning(|src, dst| {
            dst[..4].copy_from_slice(b"GET ");
            Ok(EngineResult::new(EngineStatus::Ok, src.len(), 4))
        });

        let mut socket = TlsSocket::new(transport, engine, Duration::from_secs(1));
        socket.handshake().unwrap();

        let mut dst = BytesMut::new();
        assert_eq!(socket.read(&mut dst).unwrap(), ReadOutcome::Bytes(4));
        assert_eq!(&dst[..], b"GET ");
    }

    #[test]
    fn unwrap_closed_closes_without_error() {
        let transport = MockTransport::new();
        transport.push_input(b"close_notify");

        let mut engine = engine_with_sizes(32, 32);
        engine.expect_handshake_status().return_const(HandshakeStatus::Done);
        engine
            .expect_unwrap()
            .times(1)
            .returning(|src, _| Ok(EngineResult::new(EngineStatus::Closed, src.len(), 0)));
        engine.expect_wrap().returning(|_, _| Ok(EngineResult::new(EngineStatus::Closed, 0, 0)));

        let mut socket = TlsSocket::new(transport.clone(), engine, Duration::from_secs(1));
        let mut dst = BytesMut::new();

        assert_eq!(socket.read(&mut dst).unwrap(), ReadOutcome::Eof);
        assert!(!socket.is_open());
        assert!(transport.is_shutdown());
        assert!(matches!(socket.read(&mut dst), Err(StreamError::Closed)));
    }

    #[test]
    fn read_underflow_waits_for_more_bytes() {
        let transport = MockTransport::new();
        transport.push_input(b"part");

        let mut engine = engine_with_sizes(32, 32);
        engine.expect_handshake_status().return_const(HandshakeStatus::Done);
        let mut seq = Sequence::new();
        engine
            .expect_unwrap()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(EngineResult::new(EngineStatus::BufferUnderflow, 0, 0)));
        engine
            .expect_unwrap()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(EngineResult::new(EngineStatus::BufferUnderflow, 0, 0)));
        engine.expect_unwrap().times(1).in_sequence(&mut seq).returning(|src, dst| {
            dst[..src.len()].copy_from_slice(src);
            Ok(EngineResult::new(EngineStatus::Ok, src.len(), src.len()))
        });

        let mut socket = TlsSocket::new(transport.clone(), engine, Duration::from_secs(1));
        let mut dst = BytesMut::new();

        assert_eq!(socket.read(&mut dst).unwrap(), ReadOutcome::Bytes(0));

        transport.push_input(b"ial");
        assert_eq!(socket.read(&mut dst).unwrap(), ReadOutcome::Bytes(7));
        assert_eq!(&dst[..], b"partial");
    }

    #[test]
    fn write_grows_network_buffer_on_overflow() {
        let transport = MockTransport::new();

        let mut engine = engine_with_sizes(4, 64);
        engine.expect_handshake_status().return_const(HandshakeStatus::Done);
        let mut seq = Sequence::new();
        engine.expect_wrap().times(1).in_sequence(&mut seq).returning(|src, dst| {
            dst.copy_from_slice(&src[..4]);
            Ok(EngineResult::new(EngineStatus::BufferOverflow, 4, 4))
        });
        engine.expect_wrap().times(1).in_sequence(&mut seq).returning(|src, dst| {
            dst[..src.len()].copy_from_slice(src);
            Ok(EngineResult::new(EngineStatus::Ok, src.len(), src.len()))
        });

        let mut socket = TlsSocket::new(transport.clone(), engine, Duration::from_secs(1));

        assert_eq!(socket.write(b"hello").unwrap(), 5);
        assert!(socket.flush().unwrap());
        assert_eq!(transport.written(), b"hello".to_vec());
    }
}
