mod cookies;
pub mod pam;
mod unauthorized;

pub use cookies::{clear_session_cookies, set_session_cookies};
pub use unauthorized::send_unauthorized;

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::{HeaderMap, Method};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::http::request::header_value;
use crate::http::response::Response;
use crate::session::{SessionStore, SessionType, UserSession, SESSION_TOKEN_SIZE};

use pam::{CredentialVerifier, PamStatus};

/// Use the identity the TLS handshake established.  Requests that look
/// like they come from a browser (nonempty User-Agent) are promoted to
/// cookie auth so subsequent requests don't depend on renegotiation.
fn perform_tls_auth(
    res: &mut Response,
    headers: &HeaderMap,
    transport_session: Option<&UserSession>,
) -> Option<UserSession> {
    let session = transport_session?;
    if header_value(headers, "User-Agent").is_empty() {
        debug!(session = %session.unique_id, "TLS session will be used for this request");
        return Some(session.clone());
    }
    res.add_header(
        "Set-Cookie",
        &format!("XSRF-TOKEN={}; SameSite=Strict; Secure", session.csrf_token),
    );
    res.add_header(
        "Set-Cookie",
        &format!("SESSION={}; SameSite=Strict; Secure; HttpOnly", session.session_token),
    );
    res.add_header("Set-Cookie", "IsAuthenticated=true; Secure");
    debug!(session = %session.unique_id, "TLS session with cookie will be used for this request");
    Some(session.clone())
}

fn perform_xtoken_auth(headers: &HeaderMap, store: &SessionStore) -> Option<UserSession> {
    let token = header_value(headers, "X-Auth-Token");
    if token.is_empty() {
        return None;
    }
    store.login_by_token(token)
}

fn perform_cookie_auth(
    method: &Method,
    headers: &HeaderMap,
    store: &SessionStore,
) -> Option<UserSession> {
    for cookie_header in headers.get_all(http::header::COOKIE) {
        let Ok(cookie_value) = cookie_header.to_str() else {
            continue;
        };
        let Some(start) = cookie_value.find("SESSION=") else {
            debug!("cookie was present, but didn't look like a session");
            continue;
        };
        let start = start + "SESSION=".len();
        let end = cookie_value[start..]
            .find(';')
            .map_or(cookie_value.len(), |i| start + i);
        let token = &cookie_value[start..end];

        let session = store.login_by_token(token)?;

        // RFC 7231: methods other than GET need CSRF protection
        if *method != Method::GET {
            let csrf = header_value(headers, "X-XSRF-TOKEN");
            if csrf.is_empty() || session.csrf_token.is_empty() {
                return None;
            }
            if csrf.len() != SESSION_TOKEN_SIZE {
                return None;
            }
            let matches: bool = csrf.as_bytes().ct_eq(session.csrf_token.as_bytes()).into();
            if !matches {
                return None;
            }
        }
        return Some(session);
    }
    None
}

fn perform_token_auth(auth_header: &str, store: &SessionStore) -> Option<UserSession> {
    let token = auth_header.strip_prefix("Token ")?;
    store.login_by_token(token)
}

async fn perform_basic_auth(
    client_ip: &IpAddr,
    auth_header: &str,
    store: &SessionStore,
    verifier: &dyn CredentialVerifier,
) -> Option<UserSession> {
    let param = auth_header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(param).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;

    debug!(user, "basic authentication");
    let status = verifier.check(user, pass).await;
    let is_configure_self_only = status == PamStatus::NewAuthTokenRequired;
    if status != PamStatus::Success && !is_configure_self_only {
        return None;
    }

    // Single-request session; the connection removes it once the
    // request completes.
    store
        .generate(user, client_ip, None, SessionType::Basic, is_configure_self_only)
        .ok()
}

/// Run the authentication pipeline over one request.  Methods run in a
/// fixed order with first success winning; each is skipped when the
/// policy disables it.  `None` means no method produced an identity.
pub async fn authenticate(
    client_ip: &IpAddr,
    res: &mut Response,
    method: &Method,
    headers: &HeaderMap,
    transport_session: Option<&UserSession>,
    store: &SessionStore,
    verifier: &dyn CredentialVerifier,
) -> Option<UserSession> {
    let config = store.auth_config();

    let mut session = None;
    if config.tls {
        session = perform_tls_auth(res, headers, transport_session);
    }
    if session.is_none() && config.xtoken {
        session = perform_xtoken_auth(headers, store);
    }
    if session.is_none() && config.cookie {
        session = perform_cookie_auth(method, headers, store);
    }
    if session.is_none() {
        let auth_header = header_value(headers, "Authorization");
        if session.is_none() && config.session_token {
            session = perform_token_auth(auth_header, store);
        }
        if session.is_none() && config.basic {
            session = perform_basic_auth(client_ip, auth_header, store, verifier).await;
        }
    }
    session
}

/// Remove the single-request session a Basic-authenticated request
/// created, once that request has completed.
pub fn cleanup_temp_session(session: Option<&UserSession>, store: &SessionStore) {
    if let Some(session) = session {
        if session.session_type == SessionType::Basic {
            store.remove(session);
        }
    }
}

/// Paths served without authentication: the Redfish service roots, the
/// session-creation endpoints, the login endpoint, and statically
/// registered web-asset routes.
pub fn is_on_allowlist(path: &str, method: &Method, is_webroute: impl Fn(&str) -> bool) -> bool {
    if *method == Method::GET {
        if matches!(
            path,
            "/redfish/v1" | "/redfish/v1/" | "/redfish" | "/redfish/" | "/redfish/v1/odata"
                | "/redfish/v1/odata/"
        ) {
            return true;
        }
        if is_webroute(path) {
            return true;
        }
    }

    if *method == Method::POST {
        if matches!(
            path,
            "/redfish/v1/SessionService/Sessions"
                | "/redfish/v1/SessionService/Sessions/"
                | "/redfish/v1/SessionService/Sessions/Members"
                | "/redfish/v1/SessionService/Sessions/Members/"
                | "/login"
        ) {
            return true;
        }
    }

    false
}
