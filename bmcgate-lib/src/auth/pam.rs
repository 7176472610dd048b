use std::collections::HashMap;

use async_trait::async_trait;

/// Outcome of a credential check against the platform account service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PamStatus {
    Success,
    /// Credentials are valid but the password has expired; the caller
    /// gets a configure-self-only session.
    NewAuthTokenRequired,
    AuthError,
}

/// Seam to the host's pluggable authentication interface.  The concrete
/// PAM binding lives outside this crate; the gateway only needs a
/// username/password check.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn check(&self, username: &str, password: &str) -> PamStatus;
}

/// Table-backed verifier used by the standalone binary and the tests.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
    expired: Vec<String>,
}

impl StaticCredentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users, expired: Vec::new() }
    }

    /// Mark an account as having an expired password.
    pub fn with_expired(mut self, username: &str) -> Self {
        self.expired.push(username.to_owned());
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn check(&self, username: &str, password: &str) -> PamStatus {
        match self.users.get(username) {
            Some(expected) if expected == password => {
                if self.expired.iter().any(|u| u == username) {
                    PamStatus::NewAuthTokenRequired
                } else {
                    PamStatus::Success
                }
            }
            _ => PamStatus::AuthError,
        }
    }
}
