//! Cookie-keyed server-side sessions.
//!
//! The [`SessionManager`] looks for the session cookie on every routed request. A request
//! without one gets a fresh [`Session`] and the cookie on its response; a request carrying
//! one gets the stored session back, or a new session under the same id when the old one
//! is gone. Each access pushes the expiry out by the configured ttl, and a watcher thread
//! evicts expired sessions.
//!
//! Handlers reach the session through [`RequestSession::session`].

use crossbeam_channel::{Receiver, Sender, select};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sprout_http::protocol::{Cookie, Request, Response, StatusError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};
use uuid::Uuid;

pub const DEFAULT_COOKIE_NAME: &str = "sprout_session_id";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which a session expires; `0` keeps sessions forever.
    pub ttl_secs: u64,
    pub cookie_name: String,
    /// `Max-Age` of the session cookie; unset makes it a browser-session cookie.
    pub cookie_max_age_secs: Option<i64>,
    pub check_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 1800, cookie_name: DEFAULT_COOKIE_NAME.into(), cookie_max_age_secs: None, check_interval_secs: 10 }
    }
}

impl SessionConfig {
    fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }

    fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

/// Data kept across the requests of one client, stored as JSON values.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    data: Mutex<HashMap<String, serde_json::Value>>,
    expires: Mutex<Option<Instant>>,
}

impl Session {
    fn new(id: Uuid, ttl: Option<Duration>) -> Self {
        let session = Self { id, data: Mutex::new(HashMap::new()), expires: Mutex::new(None) };
        session.touch(ttl);
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, serde_json::Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` under `key`, replacing what was there.
    pub fn put<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        let value = serde_json::to_value(value)?;
        self.data().insert(key.into(), value);
        Ok(())
    }

    /// The value under `key`; `None` when absent or not a `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.data().remove(key)
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn clear(&self) {
        self.data().clear();
    }

    pub fn expires(&self) -> Option<Instant> {
        *self.expires.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self, ttl: Option<Duration>) {
        *self.expires.lock().unwrap_or_else(PoisonError::into_inner) = ttl.map(|ttl| Instant::now() + ttl);
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires().is_some_and(|expires| now >= expires)
    }
}

/// Access to the session the [`SessionManager`] attached to a request.
pub trait RequestSession {
    fn session(&self) -> Option<Arc<Session>>;
}

impl RequestSession for Request {
    fn session(&self) -> Option<Arc<Session>> {
        self.extensions().get::<Arc<Session>>().cloned()
    }
}

type Sessions = RwLock<HashMap<Uuid, Arc<Session>>>;

#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: Arc<Sessions>,
    stop: Mutex<Option<Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Creates the manager and starts its watcher thread.
    pub fn start(config: SessionConfig) -> std::io::Result<Self> {
        let sessions = Arc::new(Sessions::default());
        let (stop, stopped) = crossbeam_channel::bounded(0);

        let interval = config.check_interval();
        let watched = Arc::clone(&sessions);
        let watcher = thread::Builder::new()
            .name("sprout-session-watcher".into())
            .spawn(move || watch(&watched, &stopped, interval))?;

        Ok(Self { config, sessions, stop: Mutex::new(Some(stop)), watcher: Mutex::new(Some(watcher)) })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Attaches the request's session, creating one (and its cookie) when the request has none.
    pub fn register(&self, request: &mut Request, response: &mut Response) -> Result<Arc<Session>, StatusError> {
        let ttl = self.config.ttl();
        let session = match request.cookie(&self.config.cookie_name) {
            Some(raw_id) => {
                let id = Uuid::parse_str(raw_id).map_err(|e| StatusError::bad_request(format!("invalid session id {raw_id}: {e}")))?;
                self.restore(id, ttl)
            }
            None => {
                let session = self.create(ttl);
                response.add_cookie(self.cookie(session.id()));
                session
            }
        };

        request.extensions_mut().insert(Arc::clone(&session));
        Ok(session)
    }

    fn create(&self, ttl: Option<Duration>) -> Arc<Session> {
        let session = Arc::new(Session::new(Uuid::new_v4(), ttl));
        self.write().insert(session.id(), Arc::clone(&session));
        trace!(session = %session.id(), "session created");
        session
    }

    fn restore(&self, id: Uuid, ttl: Option<Duration>) -> Arc<Session> {
        if let Some(session) = self.read().get(&id) {
            session.touch(ttl);
            return Arc::clone(session);
        }

        let session = Arc::clone(self.write().entry(id).or_insert_with(|| Arc::new(Session::new(id, ttl))));
        session.touch(ttl);
        session
    }

    fn cookie(&self, id: Uuid) -> Cookie {
        let cookie = Cookie::new(self.config.cookie_name.as_str(), id.to_string()).path("/").http_only(true);
        match self.config.cookie_max_age_secs {
            Some(max_age) => cookie.max_age(max_age),
            None => cookie,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.read().get(id).cloned()
    }

    /// Drops the session `id`; the client gets a new one on its next request.
    pub fn invalidate(&self, id: &Uuid) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops the watcher thread; sessions stay readable. Idempotent.
    pub fn close(&self) {
        drop(self.stop.lock().unwrap_or_else(PoisonError::into_inner).take());

        let watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(watcher) = watcher
            && watcher.join().is_err()
        {
            error!("session watcher panicked");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn watch(sessions: &Sessions, stopped: &Receiver<()>, interval: Duration) {
    loop {
        select! {
            recv(stopped) -> _ => return,
            default(interval) => {
                let evicted = evict_expired(sessions, Instant::now());
                if evicted > 0 {
                    debug!(evicted, "expired sessions evicted");
                }
            }
        }
    }
}

fn evict_expired(sessions: &Sessions, now: Instant) -> usize {
    let mut sessions = sessions.write().unwrap_or_else(PoisonError::into_inner);
    let before = sessions.len();
    sessions.retain(|_, session| !session.is_expired(now));
    before - sessions.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use sprout_http::codec::RequestDecoder;
    use tokio_util::codec::Decoder;

    fn request(cookie: Option<&str>) -> Request {
        let cookie = cookie.map(|cookie| format!("cookie: {cookie}\r\n")).unwrap_or_default();
        let raw = format!("GET / HTTP/1.1\r\nhost: localhost\r\n{cookie}\r\n");
        RequestDecoder::new().decode(&mut BytesMut::from(raw.as_str())).unwrap().unwrap()
    }

    fn manager(ttl_secs: u64) -> SessionManager {
        SessionManager::start(SessionConfig { ttl_secs, check_interval_secs: 3600, ..SessionConfig::default() }).unwrap()
    }

    #[test]
    fn new_client_gets_session_and_cookie() {
        let manager = manager(60);
        let mut request = request(None);
        let mut response = Response::new();

        let session = manager.register(&mut request, &mut response).unwrap();

        assert_eq!(response.cookies().len(), 1);
        let cookie = &response.cookies()[0];
        assert_eq!(cookie.name(), DEFAULT_COOKIE_NAME);
        assert_eq!(cookie.value(), session.id().to_string());
        assert!(cookie.to_string().contains("HttpOnly"));
        assert_eq!(request.session().map(|s| s.id()), Some(session.id()));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn known_cookie_restores_session_without_new_cookie() {
        let manager = manager(60);
        let first = manager.register(&mut request(None), &mut Response::new()).unwrap();
        first.put("user", "alice").unwrap();

        let cookie = format!("{DEFAULT_COOKIE_NAME}={}", first.id());
        let mut request = request(Some(&cookie));
        let mut response = Response::new();
        let again = manager.register(&mut request, &mut response).unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(response.cookies().is_empty());
        assert_eq!(request.session().unwrap().get::<String>("user").as_deref(), Some("alice"));
    }

    #[test]
    fn unknown_id_gets_a_session_under_that_id() {
        let manager = manager(60);
        let id = Uuid::new_v4();
        let cookie = format!("{DEFAULT_COOKIE_NAME}={id}");

        let session = manager.register(&mut request(Some(&cookie)), &mut Response::new()).unwrap();

        assert_eq!(session.id(), id);
        assert!(manager.get(&id).is_some());
    }

    #[test]
    fn malformed_id_is_bad_request() {
        let manager = manager(60);
        let cookie = format!("{DEFAULT_COOKIE_NAME}=not-a-uuid");

        let error = manager.register(&mut request(Some(&cookie)), &mut Response::new()).unwrap_err();

        assert_eq!(error.status(), http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn evicts_only_expired_sessions() {
        let manager = manager(1);
        let session = manager.register(&mut request(None), &mut Response::new()).unwrap();

        assert_eq!(evict_expired(&manager.sessions, Instant::now()), 0);
        assert_eq!(evict_expired(&manager.sessions, Instant::now() + Duration::from_secs(2)), 1);
        assert!(manager.get(&session.id()).is_none());
    }

    #[test]
    fn zero_ttl_never_expires() {
        let manager = manager(0);
        let session = manager.register(&mut request(None), &mut Response::new()).unwrap();

        assert_eq!(session.expires(), None);
        assert_eq!(evict_expired(&manager.sessions, Instant::now() + Duration::from_secs(86_400)), 0);
    }

    #[test]
    fn session_values_round_trip_as_json() {
        let session = Session::new(Uuid::new_v4(), None);
        session.put("count", &3).unwrap();

        assert_eq!(session.get::<u32>("count"), Some(3));
        assert_eq!(session.get::<String>("count"), None);
        assert!(session.contains("count"));
        assert!(session.remove("count").is_some());
        assert!(session.is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let manager = manager(60);
        manager.close();
        manager.close();
    }
}
