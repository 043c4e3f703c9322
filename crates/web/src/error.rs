use http::Method;
use thiserror::Error;

/// Registration errors, returned when the routes are being set up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("{method}({accept_type}) {template} is registered already")]
    DuplicateRoute { method: Method, accept_type: String, template: String },

    #[error("route path is empty")]
    EmptyPath,

    #[error("accept type of {template} is blank")]
    BlankAcceptType { template: String },
}

impl RouterError {
    pub fn duplicate_route<A: ToString, T: ToString>(method: Method, accept_type: A, template: T) -> Self {
        Self::DuplicateRoute { method, accept_type: accept_type.to_string(), template: template.to_string() }
    }
}

/// No route answers the request; the server turns it into `404 Not Found`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("route not found for {method} {path}")]
pub struct RouteNotFound {
    method: Method,
    path: String,
}

impl RouteNotFound {
    pub fn new<S: ToString>(method: Method, path: S) -> Self {
        Self { method, path: path.to_string() }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
