//! A non-blocking HTTP/1.1 server engine with optional TLS.
//!
//! One selector thread multiplexes every connection with [`mio`]; handlers and TLS
//! handshakes run on a bounded worker pool, so a slow handler never stalls the reads and
//! writes of other connections.
//!
//! # Example
//!
//! ```no_run
//! use sprout_http::config::ServerConfig;
//! use sprout_http::handler::HandlerError;
//! use sprout_http::protocol::{Request, Response};
//! use sprout_http::server::HttpServer;
//! use tracing::info;
//!
//! fn hello_world(request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
//!     info!(path = request.path(), "receiving request");
//!     response.set_body("Hello World!\r\n");
//!     Ok(())
//! }
//!
//! let config = ServerConfig { port: 8080, ..ServerConfig::default() };
//! let server = HttpServer::new(config, hello_world).start().expect("failed to start server");
//! server.await_until_start();
//! info!(url = server.host_url(), "started");
//! server.await_until_stop();
//! ```
//!
//! # Architecture
//!
//! - [`buffer`]: byte buffers that either grow by doubling or stay fixed
//! - [`socket`]: plaintext and TLS sockets behind one non-blocking contract
//! - [`codec`]: the incremental request decoder and the response encoder
//! - [`connection`]: the per-connection state machine
//! - [`worker`]: the worker pool with handoff and backpressure
//! - [`server`]: the selector thread and server lifecycle
//! - [`handler`]: the handler trait and the error-to-response registry
//! - [`protocol`]: request, response, cookie and error types
//! - [`config`]: server settings, loadable from JSON
//!
//! # Request lifecycle
//!
//! The selector thread reads bytes and feeds them to the connection's decoder as they
//! arrive, in as many reads as it takes. Once head and body are complete the request is
//! submitted to the worker pool. The worker runs the [`handler::RequestHandler`], maps a
//! returned error through the [`handler::ExceptionHandlerRegistry`] and hands the response
//! back; the selector thread then writes it out and either closes the connection or
//! starts reading the next request.
//!
//! # Error Handling
//!
//! - [`protocol::ParseError`]: malformed request, answered with `400` and a closed connection
//! - [`protocol::StreamError`]: socket, TLS or buffer failure, the connection is dropped
//! - [`protocol::StatusError`]: a handler error that carries its own status
//! - [`protocol::HttpError`]: the union of the above seen by the connection
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - Request bodies need a `content-length`; chunked transfer encoding is not supported
//! - Request and response bodies are fully buffered

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod worker;

mod utils;
pub(crate) use utils::ensure;
