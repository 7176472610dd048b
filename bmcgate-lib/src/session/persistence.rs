use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::session::{AuthConfigMethods, SessionStore, SessionType, UserSession};

/// Reads and writes the persistent-state JSON document.
///
/// The document has three members: `Configuration` (the auth-method
/// policy), `Sessions` (the restorable session records) and
/// `Subscriptions`, which belongs to the event-service collaborator and
/// is carried through this store untouched.
pub struct PersistentStore {
    path: PathBuf,
    subscriptions: Mutex<Value>,
}

impl PersistentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), subscriptions: Mutex::new(Value::Null) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted document, restoring the auth policy and every
    /// complete session record into `store`.  A missing file is not an
    /// error; a corrupt file is logged and skipped.
    pub fn load(&self, store: &SessionStore) -> Result<()> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persistent state to restore");
                return Ok(());
            }
            Err(e) => return Err(GatewayError::Io(e)),
        };
        let doc: Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                error!(path = %self.path.display(), "persistent state unreadable: {e}");
                return Ok(());
            }
        };
        let Some(obj) = doc.as_object() else {
            error!("persistent state root is not an object");
            return Ok(());
        };

        if let Some(config) = obj.get("Configuration").and_then(Value::as_object) {
            let mut auth_config = AuthConfigMethods::default();
            auth_config.apply_json(config);
            store.restore_auth_config(auth_config);
        }

        let mut restored = 0usize;
        if let Some(sessions) = obj.get("Sessions").and_then(Value::as_array) {
            for entry in sessions {
                let Some(entry) = entry.as_object() else {
                    warn!("ignoring non-object session record");
                    continue;
                };
                if let Some(session) = session_from_json(entry) {
                    store.restore(session);
                    restored += 1;
                }
            }
        }

        if let Some(subscriptions) = obj.get("Subscriptions") {
            *self.lock_subscriptions() = subscriptions.clone();
        }

        info!(sessions = restored, "restored persistent state");
        Ok(())
    }

    /// Write the document when the store is dirty.  The file is written
    /// to a sibling temp path and renamed into place so readers never
    /// see a torn document.
    pub fn flush_if_dirty(&self, store: &SessionStore) -> Result<()> {
        if !store.needs_write() {
            return Ok(());
        }
        self.save(store)
    }

    pub fn save(&self, store: &SessionStore) -> Result<()> {
        let sessions: Vec<Value> = store
            .get_sessions()
            .iter()
            .filter(|s| s.session_type.is_persisted())
            .map(session_to_json)
            .collect();
        let doc = json!({
            "Configuration": store.auth_config().to_json(),
            "Sessions": sessions,
            "Subscriptions": self.lock_subscriptions().clone(),
        });

        let tmp = self.path.with_extension("tmp");
        let rendered = serde_json::to_string_pretty(&doc)
            .map_err(|e| GatewayError::Internal(format!("failed to render state: {e}")))?;
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, &self.path)?;
        store.clear_need_write();
        debug!(path = %self.path.display(), "persistent state written");
        Ok(())
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Value> {
        match self.subscriptions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn session_to_json(session: &UserSession) -> Value {
    let mut obj = Map::new();
    obj.insert("unique_id".into(), session.unique_id.clone().into());
    obj.insert("session_token".into(), session.session_token.clone().into());
    obj.insert("csrf_token".into(), session.csrf_token.clone().into());
    obj.insert("username".into(), session.username.clone().into());
    if let Some(client_id) = &session.client_id {
        obj.insert("client_id".into(), client_id.clone().into());
    }
    obj.insert("client_ip".into(), session.client_ip.clone().into());
    Value::Object(obj)
}

/// Rebuild a session from its JSON representation.  Records missing any
/// of the four security-relevant fields cannot be restored.  The idle
/// timer restarts from now and the type is forced to `Session`: steady
/// timestamps don't survive a reboot.
fn session_from_json(obj: &Map<String, Value>) -> Option<UserSession> {
    let mut unique_id = String::new();
    let mut session_token = String::new();
    let mut csrf_token = String::new();
    let mut username = String::new();
    let mut client_id = None;
    let mut client_ip = String::new();

    for (key, value) in obj {
        let Some(value) = value.as_str() else {
            error!(property = %key, "persisted session property was not a string");
            continue;
        };
        match key.as_str() {
            "unique_id" => unique_id = value.to_owned(),
            "session_token" => session_token = value.to_owned(),
            "csrf_token" => csrf_token = value.to_owned(),
            "username" => username = value.to_owned(),
            "client_id" => client_id = Some(value.to_owned()),
            "client_ip" => client_ip = value.to_owned(),
            _ => {
                error!(property = %key, "unexpected property in persisted session");
            }
        }
    }

    if unique_id.is_empty() || username.is_empty() || session_token.is_empty() || csrf_token.is_empty()
    {
        debug!("session missing required security information, refusing to restore");
        return None;
    }

    Some(UserSession {
        unique_id,
        session_token,
        csrf_token,
        username,
        client_id,
        client_ip,
        last_updated: Instant::now(),
        session_type: SessionType::Session,
        is_configure_self_only: false,
    })
}
