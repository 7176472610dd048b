use http::StatusCode;

use crate::http::content_type::request_prefers_html;
use crate::http::response::Response;

/// Fill `res` for a request that failed authentication.
///
/// Browser clients are redirected to the web UI login page when one is
/// installed; everything else gets a uniform 401.  The
/// `WWW-Authenticate: Basic` hint is only offered to clients without a
/// User-Agent: suggesting Basic auth to a browser invites CSRF.
pub fn send_unauthorized(
    url: &str,
    user_agent: &str,
    accept: &str,
    has_webui_route: bool,
    res: &mut Response,
) {
    if request_prefers_html(accept) {
        if has_webui_route {
            res.result(StatusCode::TEMPORARY_REDIRECT);
            res.add_header("Location", &format!("/#/login?next={}", url_encode(url)));
        } else {
            res.result(StatusCode::UNAUTHORIZED);
            res.body = "Unauthorized".to_owned();
        }
    } else {
        res.result(StatusCode::UNAUTHORIZED);
        if user_agent.is_empty() {
            res.add_header("WWW-Authenticate", "Basic");
        }
    }
}

fn url_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
