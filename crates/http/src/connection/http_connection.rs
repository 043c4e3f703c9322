use crate::codec::{DecoderLimits, RequestDecoder, ResponseEncoder};
use crate::connection::state::{ConnectionState, IllegalStateTransition, StateMachine};
use crate::handler::{ExceptionHandlerRegistry, RequestHandler};
use crate::protocol::{HttpError, ParseError, Request, Response};
use crate::socket::{ReadOutcome, Socket};
use crate::worker::ReactorWorker;
use bytes::BytesMut;
use http::{StatusCode, Version};
use mio::{Interest, Registry, Token};
use std::error::Error;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::codec::Encoder;
use tracing::{debug, error, trace, warn};

/// What every connection of a server shares.
#[derive(Clone)]
pub struct ConnectionContext {
    pub handler: Arc<dyn RequestHandler>,
    pub exceptions: Arc<ExceptionHandlerRegistry>,
    pub worker: Arc<ReactorWorker>,
    pub read_buffer_size: usize,
    pub limits: DecoderLimits,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// A handle to one client connection.
///
/// Clones share the same connection. The event loop calls [`HttpConnection::handle`] on
/// every readiness event; a worker thread runs the handler and hands the response back
/// by moving the connection to [`ConnectionState::ReadyToWrite`].
#[derive(Clone)]
pub struct HttpConnection {
    id: u64,
    inner: Arc<Mutex<Inner>>,
    context: ConnectionContext,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection").field("id", &self.id).field("state", &self.state()).finish()
    }
}

struct Inner {
    id: u64,
    socket: Box<dyn Socket>,
    machine: StateMachine,
    decoder: RequestDecoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    written: usize,
    response: Option<Response>,
    version: Version,
    close_after_write: bool,
    remote_addr: Option<SocketAddr>,
}

enum Step {
    Done,
    Blocked,
    Eof,
}

impl HttpConnection {
    pub fn new(id: u64, socket: Box<dyn Socket>, context: ConnectionContext) -> Self {
        let remote_addr = socket.peer_addr();
        let inner = Inner {
            id,
            socket,
            machine: StateMachine::new(),
            decoder: RequestDecoder::with_limits(context.limits),
            read_buf: BytesMut::with_capacity(context.read_buffer_size),
            write_buf: BytesMut::new(),
            written: 0,
            response: None,
            version: Version::HTTP_11,
            close_after_write: false,
            remote_addr,
        };
        Self { id, inner: Arc::new(Mutex::new(inner)), context }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().machine.current()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().machine.is(ConnectionState::Closed)
    }

    /// Calls `callback` every time the connection enters `state`.
    ///
    /// Callbacks run while the connection is locked and must not call back into it.
    pub fn when_state_is<F>(&self, state: ConnectionState, callback: F)
    where
        F: Fn() + Send + 'static,
    {
        self.lock().machine.when_state_is(state, callback);
    }

    pub fn change_state(&self, to: ConnectionState) -> Result<(), IllegalStateTransition> {
        self.lock().machine.change(to)
    }

    /// Registers the socket for reading, running the TLS handshake first if there is one.
    pub fn register(&self, registry: &Registry, token: Token) -> Result<(), HttpError> {
        let mut inner = self.lock();
        let registration = match inner.socket.register(registry, token, Interest::READABLE) {
            Ok(registration) => registration,
            Err(e) => {
                inner.close();
                return Err(e.into());
            }
        };

        if !inner.socket.is_open() {
            debug!(connection = self.id, "peer closed before registration");
            inner.close();
            return Ok(());
        }

        let next = if registration.data_remaining { ConnectionState::DataRemaining } else { ConnectionState::ReadyToRead };
        inner.machine.change(next)?;
        Ok(())
    }

    pub fn reregister(&self, registry: &Registry, token: Token, interest: Interest) -> Result<(), HttpError> {
        let mut inner = self.lock();
        if inner.machine.is(ConnectionState::Closed) {
            return Ok(());
        }
        inner.socket.reregister(registry, token, interest)?;
        Ok(())
    }

    pub fn deregister(&self, registry: &Registry) -> Result<(), HttpError> {
        self.lock().socket.deregister(registry)?;
        Ok(())
    }

    /// Advances the connection as far as the socket allows without blocking.
    pub fn handle(&self) {
        let mut inner = self.lock();
        if let Err(e) = self.drive(&mut inner) {
            match e {
                HttpError::StateError { source } => {
                    error!(connection = self.id, cause = %source, "illegal state transition, closing connection");
                }
                e => debug!(connection = self.id, cause = %e, "connection failed, closing"),
            }
            inner.close();
        }
    }

    fn drive(&self, inner: &mut Inner) -> Result<(), HttpError> {
        loop {
            match inner.machine.current() {
                ConnectionState::Initialized | ConnectionState::RequestHandling | ConnectionState::Closed => {
                    return Ok(());
                }
                ConnectionState::DataRemaining | ConnectionState::ReadyToRead => {
                    inner.machine.change(ConnectionState::ReadingHeadLine)?;
                }
                ConnectionState::ReadingHeadLine => {
                    if !inner.read_step(RequestDecoder::read_head_line, ConnectionState::HeadersReady, &self.context.exceptions)? {
                        return Ok(());
                    }
                }
                ConnectionState::HeadersReady => {
                    inner.version = inner.decoder.version();
                    inner.machine.change(ConnectionState::ReadingHeaders)?;
                }
                ConnectionState::ReadingHeaders => {
                    if !inner.read_step(RequestDecoder::read_headers, ConnectionState::BodyReady, &self.context.exceptions)? {
                        return Ok(());
                    }
                }
                ConnectionState::BodyReady => match inner.decoder.prepare_body() {
                    Ok(()) => inner.machine.change(ConnectionState::ReadingBody)?,
                    Err(e) => inner.reject(&self.context.exceptions, &e)?,
                },
                ConnectionState::ReadingBody => {
                    if !inner.read_step(RequestDecoder::read_body, ConnectionState::BodyReadyDone, &self.context.exceptions)? {
                        return Ok(());
                    }
                }
                ConnectionState::BodyReadyDone => inner.machine.change(ConnectionState::RequestReady)?,
                ConnectionState::RequestReady => {
                    let request = inner.decoder.finish().with_remote_addr(inner.remote_addr);
                    inner.version = request.version();
                    inner.machine.change(ConnectionState::RequestHandling)?;
                    trace!(connection = self.id, method = %request.method(), path = request.path(), "request ready");

                    let connection = self.clone();
                    if let Err(e) = self.context.worker.submit(move || connection.handle_request(request)) {
                        warn!(connection = self.id, cause = %e, "failed to submit request");
                        inner.close();
                    }
                    return Ok(());
                }
                ConnectionState::ReadyToWrite => {
                    let response = inner.response.take().unwrap_or_else(|| Response::with_status(StatusCode::INTERNAL_SERVER_ERROR));
                    inner.close_after_write |= response.is_close();
                    ResponseEncoder::new(inner.version).encode(&response, &mut inner.write_buf)?;
                    inner.written = 0;
                    inner.machine.change(ConnectionState::ResponseWriting)?;
                }
                ConnectionState::ResponseWriting => {
                    if !inner.write_pending()? {
                        return Ok(());
                    }
                    inner.machine.change(ConnectionState::ResponseWriteCompleted)?;
                }
                ConnectionState::ResponseWriteCompleted => {
                    inner.write_buf.clear();
                    inner.written = 0;
                    if inner.close_after_write {
                        inner.close();
                        return Ok(());
                    }
                    inner.version = Version::HTTP_11;
                    inner.machine.change(ConnectionState::ReadyToRead)?;
                }
            }
        }
    }

    /// Runs the handler on the calling worker thread and hands the response to the I/O thread.
    pub(crate) fn handle_request(&self, mut request: Request) {
        let keep_alive = request.is_keep_alive();
        let mut response = Response::new();

        let handler = Arc::clone(&self.context.handler);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut request, &mut response)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = self.id, cause = %e, "handler failed");
                answer_error(self.id, &self.context.exceptions, &*e, &mut response);
            }
            Err(_) => {
                error!(connection = self.id, path = request.path(), "handler panicked");
                response = Response::with_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        if !keep_alive {
            response.set_close();
        }

        let mut inner = self.lock();
        if inner.machine.is(ConnectionState::Closed) {
            trace!(connection = self.id, "connection closed while handling request");
            return;
        }
        inner.response = Some(response);
        if let Err(e) = inner.machine.change(ConnectionState::ReadyToWrite) {
            error!(connection = self.id, cause = %e, "illegal state transition, closing connection");
            inner.close();
        }
    }

    /// Closes the socket once; later calls do nothing.
    pub fn close(&self) {
        self.lock().close();
    }
}

/// Maps `error` through `exceptions`; a panicking exception handler yields a bare 500 that
/// closes the connection once written.
fn answer_error(id: u64, exceptions: &ExceptionHandlerRegistry, error: &(dyn Error + 'static), response: &mut Response) {
    if panic::catch_unwind(AssertUnwindSafe(|| exceptions.handle(error, response))).is_err() {
        error!(connection = id, cause = %error, "exception handler panicked, closing after response");
        *response = Response::with_status(StatusCode::INTERNAL_SERVER_ERROR);
        response.set_close();
    }
}

impl Inner {
    /// Runs `step` until it completes or the socket has nothing more to give.
    ///
    /// Returns `Ok(true)` when the connection moved on, either to `next` or to answering a
    /// malformed request, and `Ok(false)` when it has to wait for the socket.
    fn read_step<F>(&mut self, step: F, next: ConnectionState, exceptions: &ExceptionHandlerRegistry) -> Result<bool, HttpError>
    where
        F: Fn(&mut RequestDecoder, &mut BytesMut) -> Result<bool, ParseError>,
    {
        loop {
            match step(&mut self.decoder, &mut self.read_buf) {
                Ok(true) => {
                    self.machine.change(next)?;
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    self.reject(exceptions, &e)?;
                    return Ok(true);
                }
            }

            match self.fill()? {
                Step::Done => {}
                Step::Blocked => return Ok(false),
                Step::Eof => {
                    if self.machine.is(ConnectionState::ReadingHeadLine) && self.read_buf.is_empty() {
                        trace!(connection = self.id, "peer closed connection");
                    } else {
                        debug!(connection = self.id, state = %self.machine.current(), "peer closed mid-request");
                    }
                    self.close();
                    return Ok(false);
                }
            }
        }
    }

    fn fill(&mut self) -> Result<Step, HttpError> {
        match self.socket.read(&mut self.read_buf)? {
            ReadOutcome::Bytes(0) => Ok(Step::Blocked),
            ReadOutcome::Bytes(_) => Ok(Step::Done),
            ReadOutcome::Eof => Ok(Step::Eof),
        }
    }

    /// Answers a malformed request and closes once the answer is written.
    fn reject(&mut self, exceptions: &ExceptionHandlerRegistry, error: &ParseError) -> Result<(), HttpError> {
        debug!(connection = self.id, cause = %error, "malformed request");
        let mut response = Response::new();
        answer_error(self.id, exceptions, error, &mut response);
        response.set_close();

        self.decoder.reset();
        self.read_buf.clear();
        self.response = Some(response);
        self.close_after_write = true;
        self.machine.change(ConnectionState::ReadyToWrite)?;
        Ok(())
    }

    /// Writes buffered response bytes; `Ok(true)` once everything reached the socket.
    fn write_pending(&mut self) -> Result<bool, HttpError> {
        while self.written < self.write_buf.len() {
            let n = self.socket.write(&self.write_buf[self.written..])?;
            if n == 0 {
                return Ok(false);
            }
            self.written += n;
        }
        Ok(self.socket.flush()?)
    }

    fn close(&mut self) {
        if self.machine.is(ConnectionState::Closed) {
            return;
        }
        self.socket.close();
        if let Err(e) = self.machine.change(ConnectionState::Closed) {
            error!(connection = self.id, cause = %e, "failed to close connection");
        }
        debug!(connection = self.id, "connection closed");
    }
}
