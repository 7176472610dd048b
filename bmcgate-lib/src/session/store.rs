use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::error::{GatewayError, Result};
use crate::session::{AuthConfigMethods, SessionType, UserSession, SESSION_TOKEN_SIZE};

const DEFAULT_TIMEOUT_SECONDS: u64 = 1800;

struct Inner {
    auth_tokens: HashMap<String, UserSession>,
    last_timeout_update: Instant,
    need_write: bool,
    timeout: Duration,
    auth_config: AuthConfigMethods,
}

/// Process-wide store of live authenticated sessions.
///
/// The store is shared by handle (`Arc<SessionStore>`) and injected into
/// each connection at construction rather than reached as ambient global
/// state.  All access goes through the inner mutex: the executor is
/// multi-threaded, so every connection may touch the map.
pub struct SessionStore {
    inner: Mutex<Inner>,
    // Raised when the TLS auth flag flips so the acceptor can rebuild
    // its TLS context (the in-process equivalent of SIGHUP).
    reconfigure_tx: watch::Sender<()>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (reconfigure_tx, _) = watch::channel(());
        Self {
            inner: Mutex::new(Inner {
                auth_tokens: HashMap::new(),
                last_timeout_update: Instant::now(),
                need_write: false,
                timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
                auth_config: AuthConfigMethods::default(),
            }),
            reconfigure_tx,
        }
    }

    /// Create and register a fresh session for `username`.
    pub fn generate(
        &self,
        username: &str,
        client_ip: &IpAddr,
        client_id: Option<String>,
        session_type: SessionType,
        is_configure_self_only: bool,
    ) -> Result<UserSession> {
        let session =
            UserSession::new(username, client_ip, client_id, session_type, is_configure_self_only)
                .map_err(|e| {
                    error!("failed to generate session tokens: {e}");
                    GatewayError::Internal("failed to generate session tokens".into())
                })?;
        let mut inner = self.lock();
        inner
            .auth_tokens
            .insert(session.session_token.clone(), session.clone());
        // Only short-lived session types skip the disk write.
        if session_type.is_persisted() {
            inner.need_write = true;
        }
        Ok(session)
    }

    /// Look up a session by its bearer token, refreshing its idle timer.
    ///
    /// Tokens of the wrong length are rejected up front; the map walk
    /// compares every stored key with a constant-time equality so lookup
    /// time does not depend on how many leading characters match.
    pub fn login_by_token(&self, token: &str) -> Option<UserSession> {
        let mut inner = self.lock();
        Self::apply_timeouts(&mut inner);
        if token.len() != SESSION_TOKEN_SIZE {
            return None;
        }
        let mut found: Option<&mut UserSession> = None;
        for (key, session) in inner.auth_tokens.iter_mut() {
            let matches: bool = key.as_bytes().ct_eq(token.as_bytes()).into();
            if matches {
                found = Some(session);
            }
        }
        let session = found?;
        session.last_updated = Instant::now();
        Some(session.clone())
    }

    pub fn get_by_uid(&self, uid: &str) -> Option<UserSession> {
        let mut inner = self.lock();
        Self::apply_timeouts(&mut inner);
        inner
            .auth_tokens
            .values()
            .find(|s| s.unique_id == uid)
            .cloned()
    }

    pub fn remove(&self, session: &UserSession) {
        let mut inner = self.lock();
        inner.auth_tokens.remove(&session.session_token);
        inner.need_write = true;
    }

    pub fn remove_by_username(&self, username: &str) {
        let mut inner = self.lock();
        inner.auth_tokens.retain(|_, s| s.username != username);
        inner.need_write = true;
    }

    pub fn remove_by_username_except(&self, username: &str, keep: &UserSession) {
        let mut inner = self.lock();
        inner
            .auth_tokens
            .retain(|_, s| s.username != username || s.unique_id == keep.unique_id);
        inner.need_write = true;
    }

    pub fn get_all_unique_ids(&self) -> Vec<String> {
        let mut inner = self.lock();
        Self::apply_timeouts(&mut inner);
        inner.auth_tokens.values().map(|s| s.unique_id.clone()).collect()
    }

    pub fn get_unique_ids_by_type(&self, session_type: SessionType) -> Vec<String> {
        let mut inner = self.lock();
        Self::apply_timeouts(&mut inner);
        inner
            .auth_tokens
            .values()
            .filter(|s| s.session_type == session_type)
            .map(|s| s.unique_id.clone())
            .collect()
    }

    pub fn get_sessions(&self) -> Vec<UserSession> {
        self.lock().auth_tokens.values().cloned().collect()
    }

    pub fn auth_config(&self) -> AuthConfigMethods {
        self.lock().auth_config.clone()
    }

    /// Replace the auth-method policy.  A change of the TLS flag raises
    /// the reconfigure event so listening sockets rebuild their TLS
    /// context with the new verification mode.
    pub fn update_auth_config(&self, config: AuthConfigMethods) {
        let tls_changed = {
            let mut inner = self.lock();
            let changed = inner.auth_config.tls != config.tls;
            inner.auth_config = config;
            inner.need_write = true;
            changed
        };
        if tls_changed {
            debug!("TLS auth flag changed, requesting TLS context rebuild");
            let _ = self.reconfigure_tx.send(());
        }
    }

    /// Subscribe to TLS-policy reconfigure events.
    pub fn subscribe_reconfigure(&self) -> watch::Receiver<()> {
        self.reconfigure_tx.subscribe()
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.lock().timeout.as_secs()
    }

    pub fn update_timeout(&self, timeout: Duration) {
        let mut inner = self.lock();
        inner.timeout = timeout;
        inner.need_write = true;
    }

    pub fn needs_write(&self) -> bool {
        self.lock().need_write
    }

    pub(crate) fn clear_need_write(&self) {
        self.lock().need_write = false;
    }

    /// Restore a previously persisted session without marking the store
    /// dirty.
    pub(crate) fn restore(&self, session: UserSession) {
        let mut inner = self.lock();
        inner
            .auth_tokens
            .insert(session.session_token.clone(), session);
    }

    /// Restore the persisted auth-method policy without raising the
    /// reconfigure event (the TLS context has not been built yet).
    pub(crate) fn restore_auth_config(&self, config: AuthConfigMethods) {
        self.lock().auth_config = config;
    }

    /// Drop every session idle longer than the configured timeout.
    /// Throttled to at most one sweep per second.
    fn apply_timeouts(inner: &mut Inner) {
        let now = Instant::now();
        if now.duration_since(inner.last_timeout_update) < Duration::from_secs(1) {
            return;
        }
        inner.last_timeout_update = now;
        let timeout = inner.timeout;
        let before = inner.auth_tokens.len();
        inner
            .auth_tokens
            .retain(|_, s| now.duration_since(s.last_updated) < timeout);
        if inner.auth_tokens.len() != before {
            inner.need_write = true;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
