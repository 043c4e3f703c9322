//! Wires a [`Router`] into the `sprout-http` engine.
//!
//! [`Server::builder`] collects the router, the configuration and extra exception
//! handlers; [`Server::start`] installs the log subscriber, starts the session watcher when
//! sessions are configured and starts the engine with a dispatcher that resolves every
//! request against the router.

use crate::compress::Encoding;
use crate::error::RouteNotFound;
use crate::router::Router;
use crate::session::{SessionConfig, SessionManager};
use http::StatusCode;
use http::header::ACCEPT;
use serde::Deserialize;
use sprout_http::config::{ConfigError, ServerConfig};
use sprout_http::handler::{ExceptionHandlerRegistry, HandlerError, RequestHandler};
use sprout_http::protocol::{Request, Response};
use sprout_http::server::{HttpServer, ServerError};
use std::error::Error;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Level, debug, info};
use tracing_subscriber::FmtSubscriber;

/// Engine settings plus the web layer's own, read from one JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    #[serde(flatten)]
    pub server: ServerConfig,
    /// Sessions are off unless this is set.
    pub session: Option<SessionConfig>,
    pub log_level: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { server: ServerConfig::default(), session: None, log_level: "info".into() }
    }
}

impl WebConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.level()?;
        Ok(())
    }

    fn level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|e| ConfigError::invalid(format!("log_level {}: {e}", self.log_level)))
    }
}

#[derive(Debug, Error)]
pub enum ServerBuildError {
    #[error("router must be set")]
    MissingRouter,

    #[error("invalid config: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("failed to start session watcher: {source}")]
    Sessions {
        #[from]
        source: io::Error,
    },

    #[error("failed to start server: {source}")]
    Start {
        #[from]
        source: ServerError,
    },
}

pub struct ServerBuilder {
    router: Option<Router>,
    config: WebConfig,
    exceptions: ExceptionHandlerRegistry,
}

impl ServerBuilder {
    fn new() -> Self {
        let mut exceptions = ExceptionHandlerRegistry::default();
        exceptions.register(|e: &RouteNotFound, response: &mut Response| {
            *response = Response::with_status(StatusCode::NOT_FOUND);
            response.set_body(e.to_string());
        });
        Self { router: None, config: WebConfig::default(), exceptions }
    }

    #[must_use]
    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    #[must_use]
    pub fn config(mut self, config: WebConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces only the engine part of the configuration.
    #[must_use]
    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.config.server = config;
        self
    }

    #[must_use]
    pub fn sessions(mut self, config: SessionConfig) -> Self {
        self.config.session = Some(config);
        self
    }

    /// Answers errors of type `E` (anywhere in a handler error's source chain) with `handler`.
    #[must_use]
    pub fn exception_handler<E, F>(mut self, handler: F) -> Self
    where
        E: Error + 'static,
        F: Fn(&E, &mut Response) + Send + Sync + 'static,
    {
        self.exceptions.register(handler);
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        let router = self.router.ok_or(ServerBuildError::MissingRouter)?;
        self.config.validate()?;
        Ok(Server { router, config: self.config, exceptions: self.exceptions })
    }
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder").field("router", &self.router).field("config", &self.config).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Server {
    router: Router,
    config: WebConfig,
    exceptions: ExceptionHandlerRegistry,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Starts serving on the engine's threads and returns once the listener is bound.
    pub fn start(self) -> Result<ServerHandle, ServerBuildError> {
        let level = self.config.level()?;
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            debug!(cause = %e, "keeping the installed tracing subscriber");
        }

        let sessions = self.config.session.map(SessionManager::start).transpose()?.map(Arc::new);
        let dispatcher = Dispatcher { router: self.router, sessions: sessions.clone() };

        let inner = HttpServer::new(self.config.server, dispatcher).exceptions(self.exceptions).start()?;
        inner.await_until_start();
        info!(url = %inner.host_url(), sessions = sessions.is_some(), "web server started");

        Ok(ServerHandle { inner, sessions })
    }
}

/// Runs every request through route resolution, sessions, filters and the handler.
#[derive(Debug)]
struct Dispatcher {
    router: Router,
    sessions: Option<Arc<SessionManager>>,
}

impl RequestHandler for Dispatcher {
    fn handle(&self, request: &mut Request, response: &mut Response) -> Result<(), HandlerError> {
        let accept = request.header(ACCEPT.as_str()).map(str::to_owned);
        let (entry, params) = self.router.resolve(request.method(), request.path(), accept.as_deref())?.into_parts();
        request.set_path_params(params);

        if let Some(sessions) = &self.sessions {
            sessions.register(request, response)?;
        }

        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            entry.run_before(request, response)?;
            entry.run_handler(request, response)
        }));
        let after = entry.run_after(request, response);

        let handled = handled.unwrap_or_else(|payload| panic::resume_unwind(payload));
        match (handled, after) {
            (Err(e), Err(after)) => {
                debug!(route = entry.template(), cause = %after, "after-filter failed behind a failed handler");
                return Err(e);
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e),
            (Ok(()), Ok(())) => {}
        }

        compress_body(response)?;
        Ok(())
    }
}

fn compress_body(response: &mut Response) -> Result<(), HandlerError> {
    let Some(encoding) = response.content_encoding() else {
        return Ok(());
    };
    let encoding: Encoding = encoding.parse()?;
    if encoding == Encoding::Identity || response.body().is_empty() {
        return Ok(());
    }

    let body = encoding.compress(response.body())?;
    response.set_body(body);
    Ok(())
}

/// Controls a started web server.
#[derive(Debug)]
pub struct ServerHandle {
    inner: sprout_http::server::ServerHandle,
    sessions: Option<Arc<SessionManager>>,
}

impl ServerHandle {
    pub fn await_until_stop(&self) {
        self.inner.await_until_stop();
    }

    /// Stops the engine and the session watcher.
    pub fn stop(&self) {
        self.inner.stop();
        if let Some(sessions) = &self.sessions {
            sessions.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn connections(&self) -> usize {
        self.inner.connections()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    pub fn host_url(&self) -> String {
        self.inner.host_url()
    }

    pub fn sessions(&self) -> Option<&SessionManager> {
        self.sessions.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn web_config_flattens_engine_settings() {
        let config = WebConfig::from_json_str(indoc! {r#"
            {
                "port": 0,
                "max_workers": 8,
                "log_level": "debug",
                "session": { "ttl_secs": 60 }
            }
        "#})
        .unwrap();

        assert_eq!(config.server.port, 0);
        assert_eq!(config.server.max_workers, 8);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.session.as_ref().map(|s| s.ttl_secs), Some(60));
        assert_eq!(config.session.map(|s| s.cookie_name), Some("sprout_session_id".to_owned()));
    }

    #[test]
    fn empty_web_config_is_default() {
        assert_eq!(WebConfig::from_json_str("{}").unwrap(), WebConfig::default());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let result = WebConfig::from_json_str(r#"{"log_level": "loud"}"#);

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn build_requires_router() {
        assert!(matches!(Server::builder().build(), Err(ServerBuildError::MissingRouter)));
    }

    #[test]
    fn compresses_only_with_content_encoding() {
        let mut plain = Response::new();
        plain.set_body("hello hello hello hello");
        compress_body(&mut plain).unwrap();
        assert_eq!(plain.body().as_ref(), b"hello hello hello hello");

        let mut gzip = Response::new();
        gzip.set_body("hello hello hello hello");
        gzip.insert_header(http::header::CONTENT_ENCODING, http::HeaderValue::from_static("gzip"));
        compress_body(&mut gzip).unwrap();
        assert!(gzip.body().starts_with(&[0x1f, 0x8b]));

        let mut unknown = Response::new();
        unknown.set_body("x");
        unknown.insert_header(http::header::CONTENT_ENCODING, http::HeaderValue::from_static("lz4"));
        assert!(matches!(compress_body(&mut unknown), Err(_)));
    }
}
