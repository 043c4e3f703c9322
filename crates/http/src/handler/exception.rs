use crate::protocol::{ParseError, Response, StatusError};
use http::StatusCode;
use std::any::TypeId;
use std::error::Error;
use std::fmt;
use tracing::error;

type ErasedHandler = Box<dyn Fn(&(dyn Error + 'static), &mut Response) -> bool + Send + Sync>;

/// Maps errors to responses.
///
/// Resolution walks the error and then its [`source`](Error::source) chain; at each level
/// the handler registered for that exact type wins. When nothing is registered along the
/// chain, a [`StatusError`] anywhere in it decides the status, otherwise the answer is
/// `500 Internal Server Error`.
pub struct ExceptionHandlerRegistry {
    handlers: Vec<(TypeId, ErasedHandler)>,
}

impl fmt::Debug for ExceptionHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionHandlerRegistry").field("handlers", &self.handlers.len()).finish()
    }
}

impl Default for ExceptionHandlerRegistry {
    /// A registry answering [`ParseError`] with `400 Bad Request`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(|e: &ParseError, response: &mut Response| {
            *response = Response::with_status(StatusCode::BAD_REQUEST);
            response.set_body(e.to_string());
        });
        registry
    }
}

impl ExceptionHandlerRegistry {
    pub fn empty() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers `handler` for errors of type `E`, replacing an earlier one for the same type.
    pub fn register<E, F>(&mut self, handler: F)
    where
        E: Error + 'static,
        F: Fn(&E, &mut Response) + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Box::new(move |error, response| match error.downcast_ref::<E>() {
            Some(e) => {
                handler(e, response);
                true
            }
            None => false,
        });

        let type_id = TypeId::of::<E>();
        match self.handlers.iter_mut().find(|(id, _)| *id == type_id) {
            Some(entry) => entry.1 = erased,
            None => self.handlers.push((type_id, erased)),
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Writes the answer for `error` into `response`.
    pub fn handle(&self, error: &(dyn Error + 'static), response: &mut Response) {
        for cause in chain(error) {
            if self.handlers.iter().any(|(_, handler)| handler(cause, response)) {
                return;
            }
        }

        if let Some(status_error) = chain(error).find_map(|cause| cause.downcast_ref::<StatusError>()) {
            *response = Response::with_status(status_error.status());
            response.set_body(status_error.message().to_owned());
            return;
        }

        error!(cause = %error, "unhandled error, responding with internal server error");
        *response = Response::with_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
}

fn chain<'a>(error: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(error), |e: &&'a (dyn Error + 'static)| (*e).source())
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("outer")]
    struct Outer {
        #[source]
        inner: Inner,
    }

    #[derive(Debug, Error)]
    #[error("inner")]
    struct Inner;

    #[derive(Debug, Error)]
    #[error("wrapped")]
    struct Wrapped {
        #[source]
        status: StatusError,
    }

    fn outer() -> Outer {
        Outer { inner: Inner }
    }

    #[test]
    fn exact_type_wins_over_source() {
        let mut registry = ExceptionHandlerRegistry::empty();
        registry.register(|_: &Inner, response: &mut Response| response.set_status(StatusCode::CONFLICT));
        registry.register(|_: &Outer, response: &mut Response| response.set_status(StatusCode::IM_A_TEAPOT));

        let mut response = Response::new();
        registry.handle(&outer(), &mut response);

        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[test]
    fn falls_back_to_source_chain() {
        let mut registry = ExceptionHandlerRegistry::empty();
        registry.register(|_: &Inner, response: &mut Response| response.set_status(StatusCode::CONFLICT));

        let mut response = Response::new();
        registry.handle(&outer(), &mut response);

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn status_error_in_chain_sets_status() {
        let registry = ExceptionHandlerRegistry::empty();
        let error = Wrapped { status: StatusError::not_found("no such user") };

        let mut response = Response::new();
        registry.handle(&error, &mut response);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(&response.body()[..], b"no such user");
    }

    #[test]
    fn unknown_errors_become_internal_server_error() {
        let registry = ExceptionHandlerRegistry::default();
        let error: Box<dyn Error + Send + Sync> = "boom".into();

        let mut response = Response::new();
        registry.handle(&*error, &mut response);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn parse_errors_are_bad_requests_by_default() {
        let registry = ExceptionHandlerRegistry::default();

        let mut response = Response::new();
        registry.handle(&ParseError::invalid_method("BREW"), &mut response);

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn registering_twice_replaces() {
        let mut registry = ExceptionHandlerRegistry::empty();
        registry.register(|_: &Inner, response: &mut Response| response.set_status(StatusCode::CONFLICT));
        registry.register(|_: &Inner, response: &mut Response| response.set_status(StatusCode::GONE));

        let mut response = Response::new();
        registry.handle(&Inner, &mut response);

        assert_eq!(registry.len(), 1);
        assert_eq!(response.status(), StatusCode::GONE);
    }
}
