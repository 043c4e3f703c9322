//! HTTP response encoder
//!
//! Serializes a complete [`Response`] as
//!
//! ```text
//! PROTOCOL SP STATUS-CODE SP REASON\r\n
//! content-length: N\r\n
//! [content-type: T\r\n]
//! (name: value\r\n)*
//! (set-cookie: cookie\r\n)*
//! \r\n
//! body
//! ```
//!
//! One `set-cookie` line is written per cookie, in the order the cookies were added.

use crate::protocol::{Response, SendError, protocol_name};
use bytes::{BufMut, BytesMut};
use http::Version;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE};
use std::io::Write;
use tokio_util::codec::Encoder;

const INIT_HEADER_SIZE: usize = 4 * 1024;

/// Encoder for HTTP responses implementing the [`Encoder`] trait.
#[derive(Debug, Clone, Copy)]
pub struct ResponseEncoder {
    version: Version,
}

impl ResponseEncoder {
    /// Creates an encoder answering with the protocol of the request being served.
    pub fn new(version: Version) -> Self {
        Self { version }
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self::new(Version::HTTP_11)
    }
}

impl Encoder<&Response> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, response: &Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = response.body();
        dst.reserve(INIT_HEADER_SIZE + body.len());

        let status = response.status();
        dst.put_slice(protocol_name(self.version).as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        dst.put_slice(b"\r\n");

        dst.put_slice(CONTENT_LENGTH.as_str().as_bytes());
        dst.put_slice(b": ");
        write!(FastWrite(dst), "{}", body.len())?;
        dst.put_slice(b"\r\n");

        if let Some(content_type) = response.content_type() {
            put_header(dst, CONTENT_TYPE.as_str().as_bytes(), content_type.as_bytes());
        }

        for (header_name, header_value) in response.headers() {
            if header_name == CONTENT_LENGTH || header_name == CONTENT_TYPE {
                continue;
            }
            put_header(dst, header_name.as_ref(), header_value.as_ref());
        }

        for cookie in response.cookies() {
            dst.put_slice(SET_COOKIE.as_str().as_bytes());
            dst.put_slice(b": ");
            write!(FastWrite(dst), "{cookie}")?;
            dst.put_slice(b"\r\n");
        }

        dst.put_slice(b"\r\n");
        dst.put_slice(body);
        Ok(())
    }
}

#[inline]
fn put_header(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.put_slice(name);
    dst.put_slice(b": ");
    dst.put_slice(value);
    dst.put_slice(b"\r\n");
}

/// Fast writer implementation for writing to BytesMut.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Cookie;
    use http::{HeaderValue, StatusCode};
    use indoc::indoc;

    fn encode(response: &Response) -> String {
        let mut dst = BytesMut::new();
        ResponseEncoder::default().encode(response, &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn encode_plain_response() {
        let mut response = Response::new();
        response.set_body("hello");
        response.insert_header(http::header::SERVER, HeaderValue::from_static("sprout"));

        let expected = indoc! {"
            HTTP/1.1 200 OK\r
            content-length: 5\r
            content-type: text/plain\r
            server: sprout\r
            \r
            hello"};
        assert_eq!(encode(&response), expected);
    }

    #[test]
    fn encode_cookies_in_order() {
        let mut response = Response::with_status(StatusCode::NOT_FOUND);
        response.clear_content_type();
        response.add_cookie(Cookie::new("first", "1").path("/"));
        response.add_cookie(Cookie::new("second", "2").http_only(true));

        let raw = encode(&response);
        let set_cookies: Vec<&str> = raw
            .split("\r\n")
            .filter_map(|line| line.strip_prefix("set-cookie: "))
            .collect();

        assert!(raw.starts_with("HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\n"));
        assert!(!raw.contains("content-type"));
        assert_eq!(set_cookies, vec!["first=1; Path=/", "second=2; HttpOnly"]);
        assert!(raw.ends_with("\r\n\r\nNot Found"));
    }

    #[test]
    fn encode_http_10() {
        let mut dst = BytesMut::new();
        ResponseEncoder::new(Version::HTTP_10).encode(&Response::new(), &mut dst).unwrap();
        assert!(dst.starts_with(b"HTTP/1.0 200 OK\r\n"));
    }
}
