//! A small web layer over the `sprout-http` engine.
//!
//! `sprout-web` adds what an application needs on top of the raw request/response
//! exchange:
//!
//! - a trie [`Router`] resolving method, path and `Accept` header to a handler, with
//!   `:param` and `*` templates and path-prefix groups
//! - [filters](filter) running before and after the handlers of matching routes
//! - cookie-keyed [sessions](session)
//! - response [compression](compress) picked by the handler's `Content-Encoding`
//! - a [`Server`] builder wiring all of it into the engine
//!
//! # Example
//!
//! ```no_run
//! use sprout_web::router::Router;
//! use sprout_web::{Server, WebConfig, handler_fn};
//!
//! let mut router = Router::new();
//! router
//!     .get("/hello/:name", handler_fn(|request, response| {
//!         response.set_body(format!("hello {}", request.path_param("name").unwrap_or("world")));
//!         Ok(())
//!     }))
//!     .unwrap();
//!
//! let server = Server::builder().router(router).config(WebConfig::default()).build().unwrap().start().unwrap();
//! server.await_until_stop();
//! ```

mod error;
mod handler;
mod server;

pub mod compress;
pub mod filter;
pub mod router;
pub mod session;

pub use error::{RouteNotFound, RouterError};
pub use handler::handler_fn;
pub use router::Router;
pub use server::{Server, ServerBuildError, ServerBuilder, ServerHandle, WebConfig};

pub use sprout_http::handler::{HandlerError, RequestHandler};
pub use sprout_http::protocol::{Cookie, Request, Response, SameSite, StatusError};
