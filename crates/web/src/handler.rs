use sprout_http::handler::{HandlerError, RequestHandler};
use sprout_http::protocol::{Request, Response};

/// Pins a closure to the handler signature so its argument types can be inferred.
///
/// ```
/// use sprout_web::handler_fn;
/// use sprout_web::router::Router;
///
/// let mut router = Router::new();
/// router
///     .get("/hello/:name", handler_fn(|request, response| {
///         response.set_body(format!("hello {}", request.path_param("name").unwrap_or("nobody")));
///         Ok(())
///     }))
///     .unwrap();
/// ```
pub fn handler_fn<F>(f: F) -> impl RequestHandler
where
    F: Fn(&mut Request, &mut Response) -> Result<(), HandlerError> + Send + Sync,
{
    f
}
