//! The response a handler fills in.

use crate::protocol::{Cookie, StatusError};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, LOCATION};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::Serialize;

#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    content_type: Option<String>,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
    body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            content_type: Some(mime::TEXT_PLAIN.to_string()),
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// A response carrying `status` and its canonical reason as body.
    pub fn with_status(status: StatusCode) -> Self {
        let mut response = Self::new();
        response.set_status(status);
        response.set_body(status.canonical_reason().unwrap_or_default());
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Sends no `content-type` header at all.
    pub fn clear_content_type(&mut self) {
        self.content_type = None;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// Adds a cookie; cookies are sent in the order they were added.
    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    /// Asks the client to drop the cookie `name`.
    pub fn remove_cookie(&mut self, name: &str) {
        self.cookies.retain(|cookie| cookie.name() != name);
        self.cookies.push(Cookie::expired(name));
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Serializes `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> serde_json::Result<()> {
        self.body = Bytes::from(serde_json::to_vec(value)?);
        self.content_type = Some(mime::APPLICATION_JSON.to_string());
        Ok(())
    }

    /// Redirects to `location` with a `3xx` status.
    pub fn redirect(&mut self, location: &str, status: StatusCode) -> Result<(), StatusError> {
        if !status.is_redirection() {
            return Err(StatusError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{status} is not a redirect status")));
        }
        let location = HeaderValue::from_str(location).map_err(|e| StatusError::new(StatusCode::INTERNAL_SERVER_ERROR, e))?;

        self.status = status;
        self.headers.insert(LOCATION, location);
        self.body = Bytes::new();
        Ok(())
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header(CONTENT_ENCODING.as_str())
    }

    /// Whether the connection must be closed once this response is written.
    pub fn is_close(&self) -> bool {
        self.headers
            .get(CONNECTION)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
    }

    pub fn set_close(&mut self) {
        self.headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let response = Response::new();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content_type(), Some("text/plain"));
        assert!(response.body().is_empty());
        assert!(!response.is_close());
    }

    #[test]
    fn redirect_requires_3xx() {
        let mut response = Response::new();
        assert!(matches!(response.redirect("/login", StatusCode::OK), Err(_)));

        response.redirect("/login", StatusCode::FOUND).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.header("location"), Some("/login"));
    }

    #[test]
    fn json_body() {
        let mut response = Response::new();
        response.json(&serde_json::json!({"id": 1})).unwrap();

        assert_eq!(response.content_type(), Some("application/json"));
        assert_eq!(response.body(), &Bytes::from_static(br#"{"id":1}"#));
    }

    #[test]
    fn remove_cookie_replaces_pending_cookie() {
        let mut response = Response::new();
        response.add_cookie(Cookie::new("a", "1"));
        response.remove_cookie("a");

        assert_eq!(response.cookies(), &[Cookie::expired("a")]);
    }
}
