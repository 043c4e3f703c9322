//! Core HTTP protocol types.
//!
//! - **Request** ([`request`]): the immutable request snapshot handed to handlers
//! - **Response** ([`response`]): the response a handler fills in, with ordered [`Cookie`]s
//! - **Parameters** ([`params`]): multi-valued [`QueryParams`] and routed [`PathParams`]
//! - **Error Handling** ([`error`]):
//!   - [`HttpError`]: top-level error of a connection
//!   - [`ParseError`]: malformed requests, answered with `400`
//!   - [`SendError`]: response serialization errors
//!   - [`StreamError`]: transport and TLS failures, fatal to the connection
//!   - [`StatusError`]: errors that carry their own response status

mod cookie;
pub use cookie::Cookie;
pub use cookie::SameSite;

mod params;
pub use params::PathParams;
pub use params::QueryParams;

mod request;
pub use request::Request;
pub(crate) use request::RequestBuilder;
pub(crate) use request::protocol_name;

mod response;
pub use response::Response;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
pub use error::StatusError;
pub use error::StreamError;
