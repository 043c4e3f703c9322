use crate::connection::{ConnectionContext, ConnectionState, HttpConnection};
use crate::server::Shared;
use crate::socket::{RustlsEngine, Socket, TcpSocket, TlsSocket};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const EVENTS_CAPACITY: usize = 1024;

/// An interest change requested by a connection, applied by the I/O thread after polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterestChange {
    Read(Token),
    Write(Token),
    Cancel(Token),
}

type InterestQueue = Arc<Mutex<Vec<InterestChange>>>;

pub(crate) struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    registry: Arc<Registry>,
    connections: HashMap<Token, HttpConnection>,
    interests: InterestQueue,
    next_token: usize,
    next_id: u64,
    context: ConnectionContext,
    tls: Option<Arc<rustls::ServerConfig>>,
    select_timeout: Duration,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
}

impl EventLoop {
    pub(crate) fn new(
        poll: Poll,
        listener: TcpListener,
        context: ConnectionContext,
        tls: Option<Arc<rustls::ServerConfig>>,
        select_timeout: Duration,
        handshake_timeout: Duration,
        shared: Arc<Shared>,
    ) -> std::io::Result<Self> {
        let registry = Arc::new(poll.registry().try_clone()?);
        Ok(Self {
            poll,
            listener,
            registry,
            connections: HashMap::new(),
            interests: Arc::new(Mutex::new(Vec::new())),
            next_token: FIRST_CONNECTION,
            next_id: 0,
            context,
            tls,
            select_timeout,
            handshake_timeout,
            shared,
        })
    }

    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(addr = %self.shared.local_addr, "server listening");

        while !self.shared.is_shutting_down() {
            if let Err(e) = self.poll.poll(&mut events, Some(self.select_timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(cause = %e, "poll failed, stopping server");
                break;
            }

            self.apply_interest_changes();
            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.dispatch(token, event),
                }
            }
        }

        self.shutdown();
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.open(stream, addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(cause = %e, "failed to accept connection");
                    return;
                }
            }
        }
    }

    fn open(&mut self, stream: TcpStream, addr: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.next_id += 1;
        let id = self.next_id;

        let socket: Box<dyn Socket> = match &self.tls {
            Some(config) => match RustlsEngine::new(Arc::clone(config)) {
                Ok(engine) => Box::new(TlsSocket::new(stream, engine, self.handshake_timeout)),
                Err(e) => {
                    warn!(remote = %addr, cause = %e, "failed to create tls session");
                    return;
                }
            },
            None => Box::new(TcpSocket::new(stream, self.context.read_buffer_size)),
        };

        let connection = HttpConnection::new(id, socket, self.context.clone());
        self.subscribe(&connection, token);
        self.connections.insert(token, connection.clone());
        self.shared.connections.fetch_add(1, Ordering::AcqRel);
        debug!(connection = id, remote = %addr, "connection accepted");

        if self.tls.is_some() {
            let registry = Arc::clone(&self.registry);
            let handshake = connection.clone();
            let submitted = self.context.worker.submit(move || register_and_handle(&handshake, &registry, token));
            if let Err(e) = submitted {
                warn!(connection = id, cause = %e, "failed to submit tls handshake");
                connection.close();
            }
        } else {
            register_and_handle(&connection, &self.registry, token);
        }
    }

    fn subscribe(&self, connection: &HttpConnection, token: Token) {
        for (state, change) in [
            (ConnectionState::ReadyToRead, InterestChange::Read(token)),
            (ConnectionState::ReadyToWrite, InterestChange::Write(token)),
            (ConnectionState::Closed, InterestChange::Cancel(token)),
        ] {
            let interests = Arc::clone(&self.interests);
            let shared = Arc::clone(&self.shared);
            connection.when_state_is(state, move || {
                interests.lock().unwrap_or_else(PoisonError::into_inner).push(change);
                if let Err(e) = shared.waker.wake() {
                    warn!(cause = %e, "failed to wake selector");
                }
            });
        }
    }

    fn dispatch(&self, token: Token, event: &Event) {
        let Some(connection) = self.connections.get(&token) else {
            trace!(?token, "event for unknown connection");
            return;
        };

        if event.is_error() {
            debug!(connection = connection.id(), "socket error, closing connection");
            connection.close();
            return;
        }
        connection.handle();
    }

    fn apply_interest_changes(&mut self) {
        let changes = std::mem::take(&mut *self.interests.lock().unwrap_or_else(PoisonError::into_inner));

        for change in changes {
            match change {
                InterestChange::Read(token) => self.reregister(token, Interest::READABLE),
                InterestChange::Write(token) => self.reregister(token, Interest::WRITABLE),
                InterestChange::Cancel(token) => {
                    let Some(connection) = self.connections.remove(&token) else {
                        continue;
                    };
                    if let Err(e) = connection.deregister(&self.registry) {
                        trace!(connection = connection.id(), cause = %e, "deregister failed");
                    }
                    self.shared.connections.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }

    fn reregister(&self, token: Token, interest: Interest) {
        let Some(connection) = self.connections.get(&token) else {
            return;
        };
        if let Err(e) = connection.reregister(&self.registry, token, interest) {
            debug!(connection = connection.id(), cause = %e, "reregister failed, closing connection");
            connection.close();
        }
    }

    fn shutdown(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.close();
            if let Err(e) = connection.deregister(&self.registry) {
                trace!(connection = connection.id(), cause = %e, "deregister failed");
            }
        }
        self.shared.connections.store(0, Ordering::Release);
        self.interests.lock().unwrap_or_else(PoisonError::into_inner).clear();

        if let Err(e) = self.registry.deregister(&mut self.listener) {
            trace!(cause = %e, "failed to deregister listener");
        }
        self.context.worker.close();
        info!(addr = %self.shared.local_addr, "server stopped");
    }
}

fn register_and_handle(connection: &HttpConnection, registry: &Registry, token: Token) {
    match connection.register(registry, token) {
        Ok(()) => connection.handle(),
        Err(e) => debug!(connection = connection.id(), cause = %e, "failed to register connection"),
    }
}
