use http::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::auth::pam::{CredentialVerifier, PamStatus};
use crate::auth::{clear_session_cookies, set_session_cookies};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::session::{SessionStore, SessionType};

/// `POST /login` with JSON `{"username": ..., "password": ...}`.
/// Success sets the session cookies and returns the session token so
/// non-cookie clients can use it directly.
pub async fn handle_login(
    req: &Request,
    store: &SessionStore,
    verifier: &dyn CredentialVerifier,
) -> Response {
    let Ok(credentials) = serde_json::from_slice::<Value>(&req.body) else {
        return Response::with_status(StatusCode::BAD_REQUEST);
    };
    let Some(obj) = credentials.as_object() else {
        debug!("received json was not an object");
        return Response::with_status(StatusCode::BAD_REQUEST);
    };
    let Some(username) = obj.get("username").and_then(Value::as_str) else {
        debug!("couldn't interpret username");
        return Response::with_status(StatusCode::BAD_REQUEST);
    };
    let Some(password) = obj.get("password").and_then(Value::as_str) else {
        debug!("couldn't interpret password");
        return Response::with_status(StatusCode::BAD_REQUEST);
    };

    let status = verifier.check(username, password).await;
    let is_configure_self_only = status == PamStatus::NewAuthTokenRequired;
    if status != PamStatus::Success && !is_configure_self_only {
        return Response::with_status(StatusCode::UNAUTHORIZED);
    }

    let session = match store.generate(
        username,
        &req.client_ip,
        None,
        SessionType::Session,
        is_configure_self_only,
    ) {
        Ok(session) => session,
        Err(_) => return Response::with_status(StatusCode::INTERNAL_SERVER_ERROR),
    };

    let mut res = Response::new();
    set_session_cookies(&mut res, &session);
    res.json_value = json!({"token": session.session_token});
    res
}

/// `POST /logout` removes the caller's session (if any) and clears the
/// session cookie.
pub fn handle_logout(req: &Request, store: &SessionStore) -> Response {
    let mut res = Response::new();
    if let Some(session) = &req.session {
        res.json_value = json!({
            "data": format!("User '{}' logged out", session.username),
            "message": "200 OK",
            "status": "ok",
        });
        clear_session_cookies(&mut res);
        store.remove(session);
    }
    res
}
