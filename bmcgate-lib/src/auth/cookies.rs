use crate::http::response::Response;
use crate::session::UserSession;

/// Attach the session cookies set by the login endpoint.
pub fn set_session_cookies(res: &mut Response, session: &UserSession) {
    res.add_header(
        "Set-Cookie",
        &format!("XSRF-TOKEN={}; Path=/; SameSite=Strict; Secure", session.csrf_token),
    );
    res.add_header(
        "Set-Cookie",
        &format!(
            "BMCWEB-SESSION={}; Path=/; SameSite=Strict; Secure; HttpOnly",
            session.session_token
        ),
    );
}

/// Clear the session cookie by re-setting it with an epoch expiry.
pub fn clear_session_cookies(res: &mut Response) {
    res.add_header(
        "Set-Cookie",
        "BMCWEB-SESSION=; Path=/; SameSite=Strict; Secure; HttpOnly; \
         expires=Thu, 01 Jan 1970 00:00:00 GMT",
    );
}
