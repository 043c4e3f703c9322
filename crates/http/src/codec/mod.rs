//! HTTP codec module for decoding requests and encoding responses
//!
//! - [`RequestDecoder`]: incrementally decodes requests from bytes delivered by any number
//!   of non-blocking reads
//! - [`ResponseEncoder`]: serializes a complete [`Response`](crate::protocol::Response)
//!
//! Both implement the `tokio_util` codec traits over [`bytes::BytesMut`].
//!
//! # Example
//!
//! ```
//! use sprout_http::codec::{RequestDecoder, ResponseEncoder};
//! use sprout_http::protocol::Response;
//! use tokio_util::codec::{Decoder, Encoder};
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut request_buffer = BytesMut::from(&b"GET / HTTP/1.1\r\n\r\n"[..]);
//! let request = decoder.decode(&mut request_buffer).unwrap().unwrap();
//!
//! let mut encoder = ResponseEncoder::new(request.version());
//! let mut response_buffer = BytesMut::new();
//! encoder.encode(&Response::new(), &mut response_buffer).unwrap();
//! assert!(response_buffer.starts_with(b"HTTP/1.1 200 OK\r\n"));
//! ```

mod request_decoder;
mod response_encoder;

pub use request_decoder::DecoderLimits;
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
