//! The listening side: one selector thread plus a worker pool.
//!
//! [`HttpServer::start`] binds the listener, spawns the selector thread and returns a
//! [`ServerHandle`] for waiting on and stopping the server. The selector thread accepts
//! connections, drives their I/O and applies the read/write interest changes the
//! connections ask for; handlers and TLS handshakes run on the [`ReactorWorker`].

mod event_loop;

use crate::config::{ConfigError, ServerConfig};
use crate::connection::ConnectionContext;
use crate::handler::{ExceptionHandlerRegistry, RequestHandler};
use crate::socket::{TlsConfig, TlsConfigError};
use crate::worker::{ReactorError, ReactorWorker};
use event_loop::{EventLoop, LISTENER, WAKER};
use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid server config: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("invalid tls config: {source}")]
    Tls {
        #[from]
        source: TlsConfigError,
    },

    #[error("failed to start worker pool: {source}")]
    Reactor {
        #[from]
        source: ReactorError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Running,
    Stopped,
}

/// What the selector thread and the handles share.
#[derive(Debug)]
pub(crate) struct Shared {
    phase: Mutex<Phase>,
    phase_changed: Condvar,
    shutdown: AtomicBool,
    connections: AtomicUsize,
    waker: Waker,
    local_addr: SocketAddr,
    host: String,
    scheme: &'static str,
}

impl Shared {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase() = phase;
        self.phase_changed.notify_all();
    }

    fn wait_while(&self, condition: impl Fn(Phase) -> bool) {
        let guard = self.phase();
        let _guard = self.phase_changed.wait_while(guard, |phase| condition(*phase)).unwrap_or_else(PoisonError::into_inner);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Marks the server stopped when the selector thread exits, even by panic.
struct StoppedOnExit(Arc<Shared>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set_phase(Phase::Stopped);
    }
}

pub struct HttpServer {
    config: ServerConfig,
    handler: Arc<dyn RequestHandler>,
    exceptions: ExceptionHandlerRegistry,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer").field("config", &self.config).field("exceptions", &self.exceptions).finish_non_exhaustive()
    }
}

impl HttpServer {
    pub fn new<H: RequestHandler + 'static>(config: ServerConfig, handler: H) -> Self {
        Self::with_handler(config, Arc::new(handler))
    }

    pub fn with_handler(config: ServerConfig, handler: Arc<dyn RequestHandler>) -> Self {
        Self { config, handler, exceptions: ExceptionHandlerRegistry::default() }
    }

    /// Replaces the registry turning handler errors into responses.
    #[must_use]
    pub fn exceptions(mut self, exceptions: ExceptionHandlerRegistry) -> Self {
        self.exceptions = exceptions;
        self
    }

    /// Binds the listener and starts serving on a new thread.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let config = self.config;
        config.validate()?;

        let tls = config.tls.as_ref().map(TlsConfig::build).transpose()?;
        let mut listener = TcpListener::bind(config.socket_addr()?)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let worker = Arc::new(ReactorWorker::new(config.min_workers, config.max_workers, config.worker_keep_alive())?);
        let context = ConnectionContext {
            handler: self.handler,
            exceptions: Arc::new(self.exceptions),
            worker,
            read_buffer_size: config.read_buffer_size,
            limits: config.decoder_limits(),
        };

        let shared = Arc::new(Shared {
            phase: Mutex::new(Phase::Starting),
            phase_changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            waker,
            local_addr,
            host: config.host.clone(),
            scheme: if tls.is_some() { "https" } else { "http" },
        });

        let event_loop = EventLoop::new(
            poll,
            listener,
            context,
            tls,
            config.select_timeout(),
            config.handshake_timeout(),
            Arc::clone(&shared),
        )?;

        let stopped = StoppedOnExit(Arc::clone(&shared));
        let thread = thread::Builder::new().name("sprout-selector".into()).spawn(move || serve(stopped, event_loop))?;

        Ok(ServerHandle { shared, thread: Mutex::new(Some(thread)) })
    }
}

fn serve(stopped: StoppedOnExit, event_loop: EventLoop) {
    stopped.0.set_phase(Phase::Running);
    event_loop.run();
}

/// Controls a started server. Dropping the handle does not stop the server.
#[derive(Debug)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    /// Blocks until the selector thread is running (or already stopped).
    pub fn await_until_start(&self) {
        self.shared.wait_while(|phase| phase == Phase::Starting);
    }

    /// Blocks until the selector thread has exited.
    pub fn await_until_stop(&self) {
        self.shared.wait_while(|phase| phase != Phase::Stopped);

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            error!("selector thread panicked");
        }
    }

    /// Stops accepting, closes every connection and waits for the selector thread.
    pub fn stop(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel)
            && let Err(e) = self.shared.waker.wake()
        {
            error!(cause = %e, "failed to wake selector for shutdown");
        }
        self.await_until_stop();
    }

    pub fn is_running(&self) -> bool {
        *self.shared.phase() == Phase::Running
    }

    pub fn is_started(&self) -> bool {
        *self.shared.phase() != Phase::Starting
    }

    /// The number of open connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// `scheme://host:port` of the bound listener.
    pub fn host_url(&self) -> String {
        format!("{}://{}:{}", self.shared.scheme, self.shared.host, self.shared.local_addr.port())
    }
}
