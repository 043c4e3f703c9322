//! The parsed HTTP request handed to handler code.
//!
//! A [`Request`] is only ever observed complete: the decoder fills a [`RequestBuilder`]
//! while bytes arrive and hands out an immutable snapshot once the head and the whole
//! body are in. The builder is then reset and reused for the next request on the same
//! keep-alive connection.

use crate::protocol::{PathParams, QueryParams};
use bytes::Bytes;
use http::header::CONNECTION;
use http::{Extensions, HeaderMap, Method, Version};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::Utf8Error;

#[derive(Debug)]
pub struct Request {
    version: Version,
    scheme: String,
    method: Method,
    path: String,
    query: QueryParams,
    path_params: PathParams,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    content_length: usize,
    content_type: Option<String>,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    extensions: Extensions,
}

impl Request {
    pub fn version(&self) -> Version {
        self.version
    }

    /// The protocol token as it appears on the request line, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &'static str {
        protocol_name(self.version)
    }

    /// The lower-cased protocol name, e.g. `http`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &QueryParams {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name)
    }

    pub fn path_params(&self) -> &PathParams {
        &self.path_params
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name)
    }

    /// Populated by the router once the request has been matched.
    pub fn set_path_params(&mut self, path_params: PathParams) {
        self.path_params = path_params;
    }

    /// Request headers, without `content-length`, `content-type` and `cookie`.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Request-scoped attachments shared between filters and the handler.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Whether the client allows the connection to be reused after this request.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.headers.get(CONNECTION).and_then(|value| value.to_str().ok());
        match self.version {
            Version::HTTP_10 => connection.is_some_and(|value| value.eq_ignore_ascii_case("keep-alive")),
            _ => !connection.is_some_and(|value| value.eq_ignore_ascii_case("close")),
        }
    }
}

pub(crate) fn protocol_name(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// The mutable side of a [`Request`], owned by the decoder until the request is ready.
#[derive(Debug, Default)]
pub(crate) struct RequestBuilder {
    version: Version,
    scheme: String,
    method: Method,
    path: String,
    query: QueryParams,
    headers: HeaderMap,
    cookies: HashMap<String, String>,
    content_length: Option<usize>,
    content_type: Option<String>,
}

impl RequestBuilder {
    pub(crate) fn head_line(&mut self, method: Method, path: String, query: QueryParams, version: Version, scheme: String) {
        self.method = method;
        self.path = path;
        self.query = query;
        self.version = version;
        self.scheme = scheme;
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn cookie(&mut self, name: String, value: String) {
        self.cookies.insert(name, value);
    }

    pub(crate) fn set_content_length(&mut self, content_length: usize) {
        self.content_length = Some(content_length);
    }

    pub(crate) fn content_length(&self) -> Option<usize> {
        self.content_length
    }

    pub(crate) fn set_content_type(&mut self, content_type: String) {
        self.content_type = Some(content_type);
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    /// Moves the accumulated state into a [`Request`] and leaves the builder reset.
    pub(crate) fn build(&mut self, body: Bytes) -> Request {
        Request {
            version: self.version,
            scheme: std::mem::take(&mut self.scheme),
            method: std::mem::take(&mut self.method),
            path: std::mem::take(&mut self.path),
            query: std::mem::take(&mut self.query),
            path_params: PathParams::default(),
            headers: std::mem::take(&mut self.headers),
            cookies: std::mem::take(&mut self.cookies),
            content_length: self.content_length.take().unwrap_or(0),
            content_type: self.content_type.take(),
            body,
            remote_addr: None,
            extensions: Extensions::new(),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.version = Version::default();
        self.scheme.clear();
        self.method = Method::default();
        self.path.clear();
        self.query.clear();
        self.headers.clear();
        self.cookies.clear();
        self.content_length = None;
        self.content_type = None;
    }
}

impl Request {
    pub(crate) fn with_remote_addr(mut self, remote_addr: Option<SocketAddr>) -> Self {
        self.remote_addr = remote_addr;
        self
    }
}
