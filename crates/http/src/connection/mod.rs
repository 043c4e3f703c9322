//! Per-connection state machine and I/O driver.
//!
//! An [`HttpConnection`] owns one [`Socket`](crate::socket::Socket) and one
//! [`RequestDecoder`](crate::codec::RequestDecoder) and moves through the
//! [`ConnectionState`]s of one request/response cycle after the other:
//!
//! ```text
//! Initialized -> ReadyToRead -> ReadingHeadLine -> HeadersReady -> ReadingHeaders
//!   -> BodyReady -> ReadingBody -> BodyReadyDone -> RequestReady -> RequestHandling
//!   -> ReadyToWrite -> ResponseWriting -> ResponseWriteCompleted -> ReadyToRead | Closed
//! ```
//!
//! Every transition is checked against [`ConnectionState::predecessors`]. Subscribers
//! registered with [`HttpConnection::when_state_is`] are told about every state entered,
//! which is how the event loop learns when to flip read/write interest or forget the
//! connection.

mod http_connection;
mod state;

pub use http_connection::ConnectionContext;
pub use http_connection::HttpConnection;
pub use state::ConnectionState;
pub use state::IllegalStateTransition;
