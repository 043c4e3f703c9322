//! Filters run around route handlers.
//!
//! A filter is registered on the [`Router`](crate::router::Router) against a path pattern
//! and optionally a method and an accept type. Before-filters run in registration order
//! ahead of the handler; the first failing one stops the chain and the handler. After-filters
//! run in registration order once the handler is done, whether it failed or not.
//!
//! # Example
//!
//! ```
//! use sprout_web::filter::filter_fn;
//! use sprout_web::router::Router;
//!
//! let mut router = Router::new();
//! router.before("/admin/*", filter_fn(|request, _response| {
//!     match request.header("authorization") {
//!         Some(_) => Ok(()),
//!         None => Err("missing authorization".into()),
//!     }
//! }));
//! ```

use sprout_http::handler::HandlerError;
use sprout_http::protocol::{Request, Response};

/// Identifies one filter registration; a registration is attached to a route at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterId(pub(crate) u64);

pub trait Filter: Send + Sync {
    /// Inspects or amends the exchange. An error ends the request with the response the
    /// exception handlers build for it.
    fn filter(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError>;
}

impl<F> Filter for F
where
    F: Fn(&mut Request, &mut Response) -> Result<(), HandlerError> + Send + Sync,
{
    fn filter(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
        (self)(request, response)
    }
}

/// Pins a closure to the filter signature so its argument types can be inferred.
pub fn filter_fn<F>(f: F) -> impl Filter
where
    F: Fn(&mut Request, &mut Response) -> Result<(), HandlerError> + Send + Sync,
{
    f
}
