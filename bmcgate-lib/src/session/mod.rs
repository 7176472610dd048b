mod auth_config;
pub mod persistence;
mod store;

pub use auth_config::{AuthConfigMethods, MtlsCommonNameParseMode};
pub use store::SessionStore;

use std::net::IpAddr;
use std::time::Instant;

use crate::util;

// 20 characters over a 62-symbol alphabet is log2(62^20) = 119 bits of
// entropy; OWASP recommends at least 64 for session identifiers.
pub const SESSION_TOKEN_SIZE: usize = 20;
pub const UNIQUE_ID_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    None,
    Basic,
    Session,
    Cookie,
    MutualTls,
}

impl SessionType {
    /// Basic and mutual-TLS sessions live for a single request or a
    /// single connection and are never written to disk.
    pub fn is_persisted(self) -> bool {
        matches!(self, SessionType::Session | SessionType::Cookie)
    }
}

/// Identity and liveness of one authenticated principal.
#[derive(Debug, Clone)]
pub struct UserSession {
    /// Opaque ID returned to UIs; never accepted as a credential.
    pub unique_id: String,
    /// The bearer credential and cookie value.
    pub session_token: String,
    /// Required in `X-XSRF-TOKEN` for unsafe methods on cookie sessions.
    pub csrf_token: String,
    pub username: String,
    pub client_id: Option<String>,
    pub client_ip: String,
    pub last_updated: Instant,
    pub session_type: SessionType,
    /// Set when the password has expired; the session may only be used
    /// for a self-service password change.
    pub is_configure_self_only: bool,
}

impl UserSession {
    pub(crate) fn new(
        username: &str,
        client_ip: &IpAddr,
        client_id: Option<String>,
        session_type: SessionType,
        is_configure_self_only: bool,
    ) -> crate::error::Result<Self> {
        let session_token = util::random::random_id(SESSION_TOKEN_SIZE)?;
        let csrf_token = util::random::random_id(SESSION_TOKEN_SIZE)?;
        let unique_id = util::random::random_id(UNIQUE_ID_SIZE)?;
        Ok(Self {
            unique_id,
            session_token,
            csrf_token,
            username: username.to_owned(),
            client_id,
            client_ip: util::ip::to_string(client_ip),
            last_updated: Instant::now(),
            session_type,
            is_configure_self_only,
        })
    }
}
