//! HTTP request decoder module
//!
//! This module provides an incremental decoder for HTTP/1.x requests. Bytes may arrive
//! split at arbitrary points across any number of non-blocking reads; the decoder keeps
//! everything it has accumulated between calls and only hands out a [`Request`] once the
//! head line, all headers and the whole body have been consumed.
//!
//! # Phases
//!
//! 1. Head line: `METHOD SP TARGET SP PROTOCOL`
//! 2. Headers: `name: value` lines until a blank line
//! 3. Body preparation: validates `content-length` and sizes the body sink
//! 4. Body: exactly `content-length` bytes
//!
//! Lines are split on `\n`; `\r` bytes are dropped wherever they appear.
//!
//! The connection drives the phases one by one through [`RequestDecoder::read_head_line`],
//! [`RequestDecoder::read_headers`], [`RequestDecoder::prepare_body`] and
//! [`RequestDecoder::read_body`]. The [`Decoder`] implementation chains them for callers
//! that only care about complete requests.
//!
//! # Example
//!
//! ```
//! use sprout_http::codec::RequestDecoder;
//! use tokio_util::codec::Decoder;
//! use bytes::BytesMut;
//!
//! let mut decoder = RequestDecoder::new();
//! let mut buffer = BytesMut::from(&b"GET /index.html?lang=en HTTP/1.1\r\nhost: localhost\r\n\r\n"[..]);
//! let request = decoder.decode(&mut buffer).unwrap().unwrap();
//! assert_eq!(request.path(), "/index.html");
//! assert_eq!(request.query_param("lang"), Some("en"));
//! ```

use crate::buffer::GrowableBuffer;
use crate::ensure;
use crate::protocol::{ParseError, QueryParams, Request, RequestBuilder};
use bytes::{Buf, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use http::{HeaderName, HeaderValue, Method, Version};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Size limits applied while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderLimits {
    /// Initial capacity of the line buffer.
    pub line_buffer_size: usize,
    /// Longest accepted head line or header line.
    pub max_line_size: usize,
    /// Initial capacity of the body sink.
    pub body_buffer_size: usize,
    /// Largest accepted `content-length`.
    pub max_body_size: usize,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self { line_buffer_size: 256, max_line_size: 8 * 1024, body_buffer_size: 2048, max_body_size: 10 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    HeadLine,
    Headers,
    BodyPending,
    Body,
    Ready,
}

/// An incremental decoder for HTTP/1.x requests.
#[derive(Debug)]
pub struct RequestDecoder {
    phase: Phase,
    line: GrowableBuffer,
    body: GrowableBuffer,
    builder: RequestBuilder,
    limits: DecoderLimits,
}

impl RequestDecoder {
    /// Creates a new `RequestDecoder` with default limits
    pub fn new() -> Self {
        Self::with_limits(DecoderLimits::default())
    }

    pub fn with_limits(limits: DecoderLimits) -> Self {
        Self {
            phase: Phase::HeadLine,
            line: GrowableBuffer::growable_with_max(limits.line_buffer_size, limits.max_line_size),
            body: GrowableBuffer::fixed(limits.body_buffer_size),
            builder: RequestBuilder::default(),
            limits,
        }
    }

    /// Reads the request line.
    ///
    /// Returns `Ok(true)` once the line is complete, `Ok(false)` if more bytes are needed.
    /// Blank lines in front of the request line are skipped.
    pub fn read_head_line(&mut self, src: &mut BytesMut) -> Result<bool, ParseError> {
        loop {
            if !self.fill_line(src)? {
                return Ok(false);
            }
            if !self.line.is_empty() {
                break;
            }
        }

        let line = std::str::from_utf8(self.line.as_slice()).map_err(ParseError::invalid_request_line)?;
        parse_request_line(line, &mut self.builder)?;

        self.line.clear();
        self.phase = Phase::Headers;
        Ok(true)
    }

    /// Reads header lines up to and including the blank line ending the head.
    ///
    /// Returns `Ok(true)` once the blank line was seen.
    pub fn read_headers(&mut self, src: &mut BytesMut) -> Result<bool, ParseError> {
        loop {
            if !self.fill_line(src)? {
                return Ok(false);
            }
            if self.line.is_empty() {
                self.phase = Phase::BodyPending;
                return Ok(true);
            }

            parse_header_line(self.line.as_slice(), &mut self.builder)?;
            self.line.clear();
        }
    }

    /// Validates `content-length` and limits the body sink to exactly that size.
    pub fn prepare_body(&mut self) -> Result<(), ParseError> {
        let content_length = match self.builder.content_length() {
            Some(content_length) => content_length,
            None if requires_content_length(self.builder.method()) => {
                return Err(ParseError::missing_content_length(self.builder.method()));
            }
            None => 0,
        };

        ensure!(
            content_length <= self.limits.max_body_size,
            ParseError::too_large_body(content_length, self.limits.max_body_size)
        );

        self.body.set_limit(content_length);
        self.phase = Phase::Body;
        Ok(())
    }

    /// Moves body bytes into the body sink.
    ///
    /// Returns `Ok(true)` once the sink holds `content-length` bytes; a zero-length body
    /// is complete right away.
    pub fn read_body(&mut self, src: &mut BytesMut) -> Result<bool, ParseError> {
        let written = self.body.write_partial(src);
        src.advance(written);

        if self.body.is_full() {
            self.phase = Phase::Ready;
            return Ok(true);
        }
        Ok(false)
    }

    /// The protocol version of the request line read so far, `HTTP/1.1` before one was read.
    pub fn version(&self) -> Version {
        self.builder.version()
    }

    /// Whether head and body are complete.
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Hands out the accumulated request and resets the decoder for the next one.
    pub fn finish(&mut self) -> Request {
        let body = self.body.take();
        let request = self.builder.build(body);
        self.reset();
        request
    }

    /// Clears all accumulated state, shrinking buffers that grew beyond their defaults.
    pub fn reset(&mut self) {
        self.phase = Phase::HeadLine;
        self.line.reset();
        self.body.reset();
        self.builder.reset();
    }

    fn fill_line(&mut self, src: &mut BytesMut) -> Result<bool, ParseError> {
        let newline = src.iter().position(|b| *b == b'\n');
        let end = newline.unwrap_or(src.len());

        let max_line_size = self.limits.max_line_size;
        for part in src[..end].split(|b| *b == b'\r') {
            self.line.write(part).map_err(|e| {
                trace!(cause = %e, "line buffer exhausted");
                ParseError::too_large_line(max_line_size)
            })?;
        }

        src.advance(newline.map_or(end, |pos| pos + 1));
        Ok(newline.is_some())
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestDecoder {
    type Item = Request;
    type Error = ParseError;

    /// Attempts to decode a complete HTTP request from the provided buffer
    ///
    /// # Returns
    ///
    /// - `Ok(Some(request))`: head and body are complete
    /// - `Ok(None)`: need more data to proceed, accumulated state is kept
    /// - `Err(_)`: the request is malformed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let progressed = match self.phase {
                Phase::HeadLine => self.read_head_line(src)?,
                Phase::Headers => self.read_headers(src)?,
                Phase::BodyPending => {
                    self.prepare_body()?;
                    true
                }
                Phase::Body => self.read_body(src)?,
                Phase::Ready => return Ok(Some(self.finish())),
            };

            if !progressed {
                return Ok(None);
            }
        }
    }
}

fn requires_content_length(method: &Method) -> bool {
    [Method::POST, Method::PUT, Method::PATCH, Method::DELETE].contains(method)
}

fn parse_request_line(line: &str, builder: &mut RequestBuilder) -> Result<(), ParseError> {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(protocol), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::invalid_request_line(line));
    };

    let method = parse_method(method)?;
    let version = match protocol {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => return Err(ParseError::invalid_version(other)),
    };
    let scheme = protocol.split('/').next().unwrap_or_default().to_ascii_lowercase();

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    ensure!(path.starts_with('/'), ParseError::invalid_uri(target));
    let query = QueryParams::parse(query)?;

    builder.head_line(method, path.to_string(), query, version, scheme);
    Ok(())
}

fn parse_method(method: &str) -> Result<Method, ParseError> {
    let method = match method {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "PATCH" => Method::PATCH,
        "DELETE" => Method::DELETE,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        "TRACE" => Method::TRACE,
        "CONNECT" => Method::CONNECT,
        other => return Err(ParseError::invalid_method(other)),
    };
    Ok(method)
}

fn parse_header_line(line: &[u8], builder: &mut RequestBuilder) -> Result<(), ParseError> {
    let colon = line
        .iter()
        .position(|b| *b == b':')
        .ok_or_else(|| ParseError::invalid_header(format!("missing ':' in '{}'", String::from_utf8_lossy(line))))?;

    let name = HeaderName::from_bytes(line[..colon].trim_ascii()).map_err(ParseError::invalid_header)?;
    let value = line[colon + 1..].trim_ascii();

    if name == CONTENT_LENGTH {
        let content_length = std::str::from_utf8(value)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .ok_or_else(|| ParseError::invalid_content_length(String::from_utf8_lossy(value)))?;
        builder.set_content_length(content_length);
    } else if name == CONTENT_TYPE {
        builder.set_content_type(String::from_utf8_lossy(value).into_owned());
    } else if name == COOKIE {
        parse_cookies(&String::from_utf8_lossy(value), builder);
    } else {
        let value = HeaderValue::from_bytes(value).map_err(ParseError::invalid_header)?;
        builder.headers_mut().append(name, value);
    }
    Ok(())
}

fn parse_cookies(value: &str, builder: &mut RequestBuilder) {
    for pair in value.split(';') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = name.trim();
        if !name.is_empty() {
            builder.cookie(name.to_string(), value.trim().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const POST_REQUEST: &str = indoc! {r#"
        POST /user/12?tab=info&tab=more HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: application/json
        Cookie: session=abc; theme=dark
        Content-Type: application/json
        Content-Length: 17

        {"name":"sprout"}"#};

    fn decode_all(bytes: &[u8]) -> Request {
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::from(bytes);
        decoder.decode(&mut buffer).unwrap().unwrap()
    }

    fn decode_in_chunks(bytes: &[u8], chunk_size: usize) -> Request {
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::new();
        for chunk in bytes.chunks(chunk_size) {
            buffer.extend_from_slice(chunk);
            if let Some(request) = decoder.decode(&mut buffer).unwrap() {
                return request;
            }
        }
        panic!("request incomplete with chunk size {chunk_size}");
    }

    fn assert_same_request(left: &Request, right: &Request) {
        assert_eq!(left.method(), right.method());
        assert_eq!(left.path(), right.path());
        assert_eq!(left.version(), right.version());
        assert_eq!(left.scheme(), right.scheme());
        assert_eq!(left.query(), right.query());
        assert_eq!(left.headers(), right.headers());
        assert_eq!(left.cookies(), right.cookies());
        assert_eq!(left.content_length(), right.content_length());
        assert_eq!(left.content_type(), right.content_type());
        assert_eq!(left.body(), right.body());
    }

    #[test]
    fn decode_post_request() {
        let request = decode_all(POST_REQUEST.as_bytes());

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.path(), "/user/12");
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.scheme(), "http");
        assert_eq!(request.query().get_all("tab"), &["info".to_string(), "more".to_string()]);
        assert_eq!(request.header("host"), Some("127.0.0.1:8080"));
        assert_eq!(request.header("accept"), Some("application/json"));
        assert_eq!(request.cookie("session"), Some("abc"));
        assert_eq!(request.cookie("theme"), Some("dark"));
        assert_eq!(request.content_length(), 17);
        assert_eq!(request.content_type(), Some("application/json"));
        assert_eq!(request.body_str().unwrap(), r#"{"name":"sprout"}"#);

        assert!(request.headers().get(CONTENT_LENGTH).is_none());
        assert!(request.headers().get(CONTENT_TYPE).is_none());
        assert!(request.headers().get(COOKIE).is_none());
    }

    #[test]
    fn chunked_decode_matches_single_shot() {
        let crlf = POST_REQUEST.replace('\n', "\r\n");
        let requests = [
            POST_REQUEST.to_string(),
            crlf,
            "GET / HTTP/1.0\r\n\r\n".to_string(),
            "DELETE /items/1 HTTP/1.1\r\ncontent-length: 0\r\nx-trace: a\r\nx-trace: b\r\n\r\n".to_string(),
        ];

        for raw in &requests {
            let expected = decode_all(raw.as_bytes());
            for chunk_size in 1..=raw.len() {
                let actual = decode_in_chunks(raw.as_bytes(), chunk_size);
                assert_same_request(&expected, &actual);
            }
        }
    }

    #[test]
    fn decode_pipelined_requests() {
        let raw = "GET /a HTTP/1.1\r\n\r\nPUT /b HTTP/1.1\r\ncontent-length: 2\r\n\r\nokGET /c";
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::from(raw);

        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().path(), "/a");
        let second = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.path(), "/b");
        assert_eq!(second.body().as_ref(), b"ok");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert_eq!(decoder.phase, Phase::HeadLine);
    }

    #[test]
    fn header_without_colon_is_rejected() {
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::from("GET / HTTP/1.1\r\nbroken header\r\n\r\n");

        let err = decoder.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::InvalidHeader { .. }));
    }

    #[test]
    fn post_without_content_length_is_rejected() {
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::from("POST /form HTTP/1.1\r\nhost: a\r\n\r\n");

        let err = decoder.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::MissingContentLength { .. }));
    }

    #[test]
    fn invalid_content_length_is_rejected() {
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::from("POST /form HTTP/1.1\r\ncontent-length: ten\r\n\r\n");

        let err = decoder.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::InvalidContentLength { .. }));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let limits = DecoderLimits { max_body_size: 4, ..DecoderLimits::default() };
        let mut decoder = RequestDecoder::with_limits(limits);
        let mut buffer = BytesMut::from("PUT /file HTTP/1.1\r\ncontent-length: 5\r\n\r\nhello");

        let err = decoder.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::TooLargeBody { content_length: 5, max_size: 4 }));
    }

    #[test]
    fn malformed_request_lines_are_rejected() {
        let cases = ["GET /\r\n", "FETCH / HTTP/1.1\r\n", "GET / HTTP/2.0\r\n", "GET index HTTP/1.1\r\n"];
        for raw in cases {
            let mut decoder = RequestDecoder::new();
            let mut buffer = BytesMut::from(raw);
            assert!(matches!(decoder.decode(&mut buffer), Err(_)), "{raw:?} should fail");
        }
    }

    #[test]
    fn too_long_line_is_rejected() {
        let limits = DecoderLimits { line_buffer_size: 8, max_line_size: 32, ..DecoderLimits::default() };
        let mut decoder = RequestDecoder::with_limits(limits);
        let mut buffer = BytesMut::from(format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(64)).as_str());

        let err = decoder.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, ParseError::TooLargeLine { max_size: 32 }));
    }

    #[test]
    fn reset_shrinks_grown_buffers() {
        let mut decoder = RequestDecoder::new();
        let raw = format!("GET / HTTP/1.1\r\nx-long: {}\r\ncontent-length: 4096\r\n\r\n{}", "v".repeat(1000), "b".repeat(4096));
        let mut buffer = BytesMut::from(raw.as_str());

        let request = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(request.body().len(), 4096);
        assert_eq!(decoder.line.capacity(), 256);
        assert_eq!(decoder.body.capacity(), 2048);
    }

    #[test]
    fn phases_report_progress() {
        let mut decoder = RequestDecoder::new();
        let mut buffer = BytesMut::from("GET /p HTTP/1.1\r\nhost");

        assert!(decoder.read_head_line(&mut buffer).unwrap());
        assert!(!decoder.read_headers(&mut buffer).unwrap());
        assert!(buffer.is_empty());

        buffer.extend_from_slice(b": x\r\n\r\n");
        assert!(decoder.read_headers(&mut buffer).unwrap());
        decoder.prepare_body().unwrap();
        assert!(decoder.read_body(&mut buffer).unwrap());
        assert!(decoder.is_ready());

        let request = decoder.finish();
        assert_eq!(request.header("host"), Some("x"));
    }
}
