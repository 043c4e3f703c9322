//! The seam between the engine and application code.
//!
//! The connection hands every complete [`Request`] to a [`RequestHandler`] on a worker
//! thread. Whatever the handler returns as error is turned into a response by the
//! [`ExceptionHandlerRegistry`].

mod exception;

pub use exception::ExceptionHandlerRegistry;

use crate::protocol::{Request, Response};
use std::error::Error;

pub type HandlerError = Box<dyn Error + Send + Sync>;

pub trait RequestHandler: Send + Sync {
    /// Fills `response` for `request`.
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError>;
}

impl<F> RequestHandler for F
where
    F: Fn(&mut Request, &mut Response) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
        (self)(request, response)
    }
}
