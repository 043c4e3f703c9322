//! Routing: templates, filters and resolution.
//!
//! Routes are keyed by their normalized path (`/user/:id` becomes `/user/*`), then by
//! method, then by accept type. Resolution tries the raw path as an exact key first and
//! falls back to a byte-wise trie descent in which `*` edges absorb a path segment; a
//! childless `*` at the end of a route absorbs everything left.
//!
//! Literal bytes always win over a wildcard at the same position, so `/user/list` resolves
//! to that route even when `/user/:id` is registered too.
//!
//! # Example
//!
//! ```
//! use http::Method;
//! use sprout_web::filter::filter_fn;
//! use sprout_web::handler_fn;
//! use sprout_web::router::Router;
//!
//! let mut router = Router::new();
//! router
//!     .get("/user/:id", handler_fn(|request, response| {
//!         response.set_body(format!("user {}", request.path_param("id").unwrap_or_default()));
//!         Ok(())
//!     }))
//!     .unwrap();
//! router.before("/user/*", filter_fn(|_request, response| {
//!     response.set_content_type("text/plain; charset=utf-8");
//!     Ok(())
//! }));
//!
//! let matched = router.resolve(&Method::GET, "/user/42", None).unwrap();
//! assert_eq!(matched.entry().template(), "/user/:id");
//! assert_eq!(matched.params().get("id"), Some("42"));
//! assert_eq!(matched.entry().before_filters().count(), 1);
//! ```

mod route;
mod trie;

pub use route::{ANY_ACCEPT_TYPE, PathPattern, RouteEntry, normalize};

use crate::error::{RouteNotFound, RouterError};
use crate::filter::{Filter, FilterId};
use http::Method;
use sprout_http::handler::RequestHandler;
use sprout_http::protocol::PathParams;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use trie::Trie;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Before,
    After,
}

struct FilterRegistration {
    id: FilterId,
    stage: Stage,
    pattern: PathPattern,
    method: Option<Method>,
    accept_type: Option<String>,
    filter: Arc<dyn Filter>,
}

impl FilterRegistration {
    fn applies_to(&self, entry: &RouteEntry) -> bool {
        self.pattern.is_match(entry.normalized())
            && self.method.as_ref().is_none_or(|method| method == entry.method())
            && self.accept_type.as_deref().is_none_or(|accept_type| accept_type == entry.accept_type())
    }

    fn attach(&self, entry: &mut RouteEntry) {
        if !self.applies_to(entry) {
            return;
        }
        match self.stage {
            Stage::Before => entry.add_before(self.id, &self.filter),
            Stage::After => entry.add_after(self.id, &self.filter),
        }
    }
}

/// The route a request resolved to, with the params recovered from its path.
#[derive(Debug)]
pub struct RouteMatch<'r> {
    entry: &'r RouteEntry,
    params: PathParams,
}

impl<'r> RouteMatch<'r> {
    pub fn entry(&self) -> &'r RouteEntry {
        self.entry
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn into_parts(self) -> (&'r RouteEntry, PathParams) {
        (self.entry, self.params)
    }
}

#[derive(Default)]
pub struct Router {
    trie: Trie,
    /// normalized path → trie node, the fast path for literal routes
    exact: HashMap<String, usize>,
    prefixes: Vec<String>,
    filters: Vec<FilterRegistration>,
    next_filter: u64,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.exact.keys().collect::<Vec<_>>())
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

macro_rules! method_routes {
    ($($name:ident => $method:ident),* $(,)?) => {
        $(
            #[doc = concat!("Registers `handler` for `", stringify!($method), "` requests on `template`, for any accept type.")]
            pub fn $name<H: RequestHandler + 'static>(&mut self, template: &str, handler: H) -> Result<&mut Self, RouterError> {
                self.route(Method::$method, template, ANY_ACCEPT_TYPE, handler)
            }
        )*
    };
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    method_routes! {
        get => GET,
        post => POST,
        put => PUT,
        patch => PATCH,
        delete => DELETE,
        head => HEAD,
        options => OPTIONS,
        trace => TRACE,
        connect => CONNECT,
    }

    /// Registers `handler` for `method` requests on `template` whose `Accept` header is
    /// exactly `accept_type`.
    ///
    /// Templates that normalize to the same path share the method/accept-type namespace:
    /// `/user/:id` and `/user/:name` collide.
    pub fn route<H: RequestHandler + 'static>(
        &mut self,
        method: Method,
        template: &str,
        accept_type: &str,
        handler: H,
    ) -> Result<&mut Self, RouterError> {
        let template = self.with_prefix(template);
        if template.is_empty() {
            return Err(RouterError::EmptyPath);
        }
        let accept_type = accept_type.trim();
        if accept_type.is_empty() {
            return Err(RouterError::BlankAcceptType { template });
        }

        let mut entry = RouteEntry::new(&template, method.clone(), accept_type, Arc::new(handler));
        for registration in &self.filters {
            registration.attach(&mut entry);
        }

        let normalized = entry.normalized().to_owned();
        let (node, handlers) = self.trie.insert(&normalized);

        let by_accept = handlers.entry(method.clone()).or_default();
        if by_accept.contains_key(accept_type) {
            return Err(RouterError::duplicate_route(method, accept_type, template));
        }
        by_accept.insert(accept_type.to_owned(), entry);
        self.exact.insert(normalized, node);
        Ok(self)
    }

    /// Registers routes inside `group` under `prefix`; groups nest.
    pub fn path<F>(&mut self, prefix: &str, group: F) -> Result<&mut Self, RouterError>
    where
        F: FnOnce(&mut Self) -> Result<(), RouterError>,
    {
        self.prefixes.push(prefix.to_owned());
        let result = group(self);
        self.prefixes.pop();
        result.map(|()| self)
    }

    /// Runs `filter` ahead of the handler of every route matching `template`, including
    /// routes registered later.
    pub fn before<F: Filter + 'static>(&mut self, template: &str, filter: F) -> &mut Self {
        self.add_filter(Stage::Before, template, None, None, Arc::new(filter))
    }

    /// Like [`before`](Self::before), restricted to a method and/or an accept type.
    pub fn before_for<F: Filter + 'static>(
        &mut self,
        template: &str,
        method: Option<Method>,
        accept_type: Option<&str>,
        filter: F,
    ) -> &mut Self {
        self.add_filter(Stage::Before, template, method, accept_type, Arc::new(filter))
    }

    /// Runs `filter` ahead of every route.
    pub fn before_all<F: Filter + 'static>(&mut self, filter: F) -> &mut Self {
        self.before("*", filter)
    }

    /// Runs `filter` after the handler of every route matching `template`, even when the
    /// handler fails.
    pub fn after<F: Filter + 'static>(&mut self, template: &str, filter: F) -> &mut Self {
        self.add_filter(Stage::After, template, None, None, Arc::new(filter))
    }

    pub fn after_for<F: Filter + 'static>(
        &mut self,
        template: &str,
        method: Option<Method>,
        accept_type: Option<&str>,
        filter: F,
    ) -> &mut Self {
        self.add_filter(Stage::After, template, method, accept_type, Arc::new(filter))
    }

    pub fn after_all<F: Filter + 'static>(&mut self, filter: F) -> &mut Self {
        self.after("*", filter)
    }

    fn add_filter(
        &mut self,
        stage: Stage,
        template: &str,
        method: Option<Method>,
        accept_type: Option<&str>,
        filter: Arc<dyn Filter>,
    ) -> &mut Self {
        self.next_filter += 1;
        let registration = FilterRegistration {
            id: FilterId(self.next_filter),
            stage,
            pattern: PathPattern::compile(&self.with_prefix(template)),
            method,
            accept_type: accept_type.map(str::to_owned),
            filter,
        };

        for node in self.trie.route_nodes() {
            if let Some(handlers) = self.trie.handlers_mut(node) {
                handlers.values_mut().flat_map(HashMap::values_mut).for_each(|entry| registration.attach(entry));
            }
        }
        self.filters.push(registration);
        self
    }

    /// Finds the route for a request.
    ///
    /// Without an exact `accept` entry the route registered for `*/*` answers.
    pub fn resolve<'r>(&'r self, method: &Method, path: &str, accept: Option<&str>) -> Result<RouteMatch<'r>, RouteNotFound> {
        let not_found = || RouteNotFound::new(method.clone(), path);

        let node = self.exact.get(path).copied().or_else(|| self.trie.find(path)).ok_or_else(not_found)?;
        let by_accept = self.trie.handlers(node).and_then(|handlers| handlers.get(method)).ok_or_else(not_found)?;

        let entry = accept
            .and_then(|accept| by_accept.get(accept))
            .or_else(|| by_accept.get(ANY_ACCEPT_TYPE))
            .ok_or_else(not_found)?;

        let params = entry.pattern().captures(path).ok_or_else(not_found)?;
        Ok(RouteMatch { entry, params })
    }

    /// Removes every route registered on `template`'s normalized path.
    pub fn remove_route(&mut self, template: &str) -> bool {
        match self.exact.remove(&normalize(template.trim())) {
            Some(node) => {
                self.trie.remove(node);
                true
            }
            None => false,
        }
    }

    /// Removes the `method` route on `template`, only the one for `accept_type` when given.
    pub fn remove_route_for(&mut self, template: &str, method: &Method, accept_type: Option<&str>) -> bool {
        let normalized = normalize(template.trim());
        let Some(node) = self.trie.find_exact(&normalized) else {
            return false;
        };
        let Some(handlers) = self.trie.handlers_mut(node) else {
            return false;
        };

        let removed = match accept_type {
            None => handlers.remove(method).is_some(),
            Some(accept_type) => {
                let removed = handlers.get_mut(method).and_then(|by_accept| by_accept.remove(accept_type)).is_some();
                if handlers.get(method).is_some_and(HashMap::is_empty) {
                    handlers.remove(method);
                }
                removed
            }
        };

        if handlers.is_empty() {
            self.exact.remove(&normalized);
            self.trie.remove(node);
        }
        removed
    }

    /// Drops every route; registered filters stay and apply to routes added afterwards.
    pub fn clear_routes(&mut self) {
        self.trie.clear();
        self.exact.clear();
    }

    /// Every registered route, in no particular order.
    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.exact
            .values()
            .filter_map(|node| self.trie.handlers(*node))
            .flat_map(|handlers| handlers.values().flat_map(HashMap::values))
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    fn with_prefix(&self, template: &str) -> String {
        let mut path = self.prefixes.concat();
        path.push_str(template);
        path.trim().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::filter_fn;
    use crate::handler_fn;
    use bytes::BytesMut;
    use sprout_http::codec::RequestDecoder;
    use sprout_http::handler::HandlerError;
    use sprout_http::protocol::{Request, Response};
    use tokio_util::codec::Decoder;

    fn request(method: &Method, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nhost: localhost\r\ncontent-length: 0\r\n\r\n");
        RequestDecoder::new().decode(&mut BytesMut::from(raw.as_str())).unwrap().unwrap()
    }

    fn body(text: &'static str) -> impl RequestHandler {
        handler_fn(move |_, response| {
            response.set_body(text);
            Ok(())
        })
    }

    fn append(text: &'static str) -> impl Filter {
        filter_fn(move |_, response| {
            let mut body = response.body().to_vec();
            body.extend_from_slice(text.as_bytes());
            response.set_body(body);
            Ok(())
        })
    }

    /// Resolves and runs before-filters, handler and after-filters; returns the body.
    fn run(router: &Router, method: &Method, path: &str) -> String {
        let mut request = request(method, path);
        let mut response = Response::new();
        let (entry, params) = router.resolve(method, path, None).unwrap().into_parts();
        request.set_path_params(params);

        entry.run_before(&mut request, &mut response).unwrap();
        let mut handled = Response::new();
        entry.run_handler(&mut request, &mut handled).unwrap();
        let mut body = response.body().to_vec();
        body.extend_from_slice(handled.body());
        response.set_body(body);
        entry.run_after(&mut request, &mut response).unwrap();

        String::from_utf8(response.body().to_vec()).unwrap()
    }

    #[test]
    fn literal_route_wins_over_param() {
        let mut router = Router::new();
        router.get("/user/:id", body("param")).unwrap().get("/user/list", body("literal")).unwrap();

        assert_eq!(run(&router, &Method::GET, "/user/list"), "literal");
        assert_eq!(run(&router, &Method::GET, "/user/7"), "param");

        let matched = router.resolve(&Method::GET, "/user/7", None).unwrap();
        assert_eq!(matched.params().get("id"), Some("7"));
    }

    #[test]
    fn wildcard_captures_remainder() {
        let mut router = Router::new();
        router.get("/static/*", body("static")).unwrap();

        let matched = router.resolve(&Method::GET, "/static/a/b/c", None).unwrap();
        assert_eq!(matched.entry().template(), "/static/*");
        assert_eq!(matched.params().splat(), ["a/b/c"]);
    }

    #[test]
    fn filter_registered_after_route_applies() {
        let mut router = Router::new();
        router.get("/user/:id", body("handler")).unwrap();
        router.before("/user/*", append("before:"));
        router.after("/user/*", append(":after"));

        assert_eq!(run(&router, &Method::GET, "/user/1"), "before:handler:after");
    }

    #[test]
    fn filter_registered_before_route_applies_once() {
        let mut router = Router::new();
        router.before_all(append("a"));
        router.get("/one", body("1")).unwrap();
        router.get("/two", body("2")).unwrap();
        router.before("/one", append("b"));
        router.post("/one", body("p")).unwrap();

        assert_eq!(run(&router, &Method::GET, "/one"), "ab1");
        assert_eq!(run(&router, &Method::GET, "/two"), "a2");
        assert_eq!(run(&router, &Method::POST, "/one"), "abp");

        let entry = router.resolve(&Method::GET, "/one", None).unwrap().entry();
        assert_eq!(entry.before_filters().count(), 2);
    }

    #[test]
    fn filter_restricted_to_method_and_accept_type() {
        let mut router = Router::new();
        router.get("/doc", body("get")).unwrap();
        router.post("/doc", body("post")).unwrap();
        router.route(Method::GET, "/doc", "application/json", body("json")).unwrap();
        router.before_for("/doc", Some(Method::POST), None, append("p:"));
        router.after_for("/doc", None, Some("application/json"), append(":j"));

        assert_eq!(run(&router, &Method::GET, "/doc"), "get");
        assert_eq!(run(&router, &Method::POST, "/doc"), "p:post");

        let entry = router.resolve(&Method::GET, "/doc", Some("application/json")).unwrap().entry();
        assert_eq!(entry.after_filters().count(), 1);
        assert_eq!(entry.before_filters().count(), 0);
    }

    #[test]
    fn accept_type_falls_back_to_any() {
        let mut router = Router::new();
        router.route(Method::GET, "/data", "application/json", body("json")).unwrap();

        assert!(matches!(router.resolve(&Method::GET, "/data", Some("text/html")), Err(_)));

        router.get("/data", body("any")).unwrap();
        let json = router.resolve(&Method::GET, "/data", Some("application/json")).unwrap();
        let html = router.resolve(&Method::GET, "/data", Some("text/html")).unwrap();
        assert_eq!(json.entry().accept_type(), "application/json");
        assert_eq!(html.entry().accept_type(), ANY_ACCEPT_TYPE);
    }

    #[test]
    fn misses_are_route_not_found() {
        let mut router = Router::new();
        router.get("/user/:id", body("user")).unwrap();

        assert_eq!(router.resolve(&Method::GET, "/nope", None).unwrap_err(), RouteNotFound::new(Method::GET, "/nope"));
        assert!(matches!(router.resolve(&Method::POST, "/user/1", None), Err(_)));
        assert!(matches!(router.resolve(&Method::GET, "/user/1/2", None), Err(_)));
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut router = Router::new();
        router.get("/user/:id", body("a")).unwrap();

        let result = router.get("/user/:name", body("b"));
        assert!(matches!(result, Err(RouterError::DuplicateRoute { .. })));
        assert!(matches!(router.put("/user/:name", body("c")), Ok(_)));
    }

    #[test]
    fn rejects_empty_path_and_blank_accept_type() {
        let mut router = Router::new();

        assert!(matches!(router.get("  ", body("a")), Err(RouterError::EmptyPath)));
        assert!(matches!(router.route(Method::GET, "/x", " ", body("a")), Err(RouterError::BlankAcceptType { .. })));
        assert!(router.is_empty());
    }

    #[test]
    fn path_groups_prefix_routes_and_filters() {
        let mut router = Router::new();
        router
            .path("/api", |api| {
                api.before("/*", append("api:"));
                api.get("/health", body("ok"))?;
                api.path("/v1", |v1| {
                    v1.get("/users/:id", body("user"))?;
                    Ok(())
                })?;
                Ok(())
            })
            .unwrap()
            .get("/health", body("root"))
            .unwrap();

        assert_eq!(run(&router, &Method::GET, "/api/health"), "api:ok");
        assert_eq!(run(&router, &Method::GET, "/api/v1/users/3"), "api:user");
        assert_eq!(run(&router, &Method::GET, "/health"), "root");
    }

    #[test]
    fn failing_group_still_pops_prefix() {
        let mut router = Router::new();
        let result = router.path("/api", |api| {
            api.get("/a", body("a"))?;
            api.get("/a", body("again"))?;
            Ok(())
        });
        assert!(matches!(result, Err(_)));

        router.get("/b", body("b")).unwrap();
        assert!(matches!(router.resolve(&Method::GET, "/b", None), Ok(_)));
    }

    #[test]
    fn remove_routes() {
        let mut router = Router::new();
        router.get("/a/:x", body("get")).unwrap();
        router.post("/a/:x", body("post")).unwrap();
        router.route(Method::POST, "/a/:x", "application/json", body("json")).unwrap();
        router.get("/b", body("b")).unwrap();

        assert!(router.remove_route_for("/a/:x", &Method::POST, Some("application/json")));
        assert!(!router.remove_route_for("/a/:x", &Method::POST, Some("application/json")));
        assert!(matches!(router.resolve(&Method::POST, "/a/1", None), Ok(_)));

        assert!(router.remove_route_for("/a/:y", &Method::POST, None));
        assert!(matches!(router.resolve(&Method::POST, "/a/1", None), Err(_)));
        assert!(matches!(router.resolve(&Method::GET, "/a/1", None), Ok(_)));

        assert!(router.remove_route_for("/a/*", &Method::GET, None));
        assert!(matches!(router.resolve(&Method::GET, "/a/1", None), Err(_)));
        assert!(!router.remove_route("/a/:x"));

        assert!(router.remove_route("b"));
        assert!(router.is_empty());
    }

    #[test]
    fn clear_routes_keeps_filters() {
        let mut router = Router::new();
        router.before_all(append("f:"));
        router.get("/a", body("a")).unwrap();

        router.clear_routes();
        assert!(router.is_empty());
        assert!(matches!(router.resolve(&Method::GET, "/a", None), Err(_)));

        router.get("/a", body("again")).unwrap();
        assert_eq!(run(&router, &Method::GET, "/a"), "f:again");
        assert_eq!(router.entries().count(), 1);
    }

    #[test]
    fn after_filters_all_run_when_one_fails() {
        let mut router = Router::new();
        router.get("/x", body("x")).unwrap();
        router.after("/x", filter_fn(|_, _| -> Result<(), HandlerError> { Err("first".into()) }));
        router.after("/x", append("second"));

        let mut request = request(&Method::GET, "/x");
        let mut response = Response::new();
        let entry = router.resolve(&Method::GET, "/x", None).unwrap().entry();

        let error = entry.run_after(&mut request, &mut response).unwrap_err();
        assert_eq!(error.to_string(), "first");
        assert_eq!(response.body().as_ref(), b"second");
    }
}
