use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use serde_json::Value;
use tracing::error;

use crate::http::content_type::request_prefers_html;
use crate::http::html;

/// Response under construction.  Handlers fill either `body` or
/// `json_value`; the connection finishes the representation with
/// [`complete_response_fields`] before it goes on the wire.
#[derive(Debug, Default)]
pub struct Response {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: String,
    pub json_value: Value,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: StatusCode) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    pub fn result(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Append a header, keeping any existing values with the same name
    /// (multiple `Set-Cookie` lines are the normal case).
    pub fn add_header(&mut self, name: &str, value: &str) {
        let Ok(name) = HeaderName::try_from(name) else {
            error!(header = name, "invalid response header name");
            return;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            error!(header = %name, "invalid response header value");
            return;
        };
        self.headers.append(name, value);
    }

    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => error!(header = %name, "invalid response header value"),
        }
    }
}

// Response headers attached to every response leaving the gateway.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("Strict-Transport-Security", "max-age=31536000; includeSubdomains"),
    ("X-Frame-Options", "DENY"),
    ("Pragma", "no-cache"),
    ("Cache-Control", "no-store, max-age=0"),
    ("X-Content-Type-Options", "nosniff"),
    ("Referrer-Policy", "no-referrer"),
    ("X-Permitted-Cross-Domain-Policies", "none"),
    ("Cross-Origin-Embedder-Policy", "require-corp"),
    ("Cross-Origin-Opener-Policy", "same-origin"),
    ("Cross-Origin-Resource-Policy", "same-origin"),
    (
        "Permissions-Policy",
        "accelerometer=(), ambient-light-sensor=(), autoplay=(), battery=(), camera=(), \
         display-capture=(), document-domain=(), encrypted-media=(), fullscreen=(), \
         geolocation=(), gyroscope=(), magnetometer=(), microphone=(), midi=(), payment=(), \
         picture-in-picture=(), publickey-credentials-get=(), screen-wake-lock=(), \
         sync-xhr=(self), usb=(), web-share=(), xr-spatial-tracking=()",
    ),
    (
        "Content-Security-Policy",
        "default-src 'none'; img-src 'self' data:; font-src 'self'; style-src 'self'; \
         script-src 'self'; connect-src 'self' wss:; form-action 'none'; \
         frame-ancestors 'none'; object-src 'none'; base-uri 'none'",
    ),
];

pub fn add_security_headers(res: &mut Response) {
    for (name, value) in SECURITY_HEADERS {
        if !res.headers.contains_key(*name) {
            res.add_header(name, value);
        }
    }
}

/// Finish the response representation: security headers, body
/// rendering from the structured JSON value, reason-phrase bodies for
/// empty error responses, empty 204s, and the cached Date header.
pub fn complete_response_fields(accepts: &str, date: &str, res: &mut Response) {
    add_security_headers(res);

    if res.body.is_empty() && !res.json_value.is_null() {
        if request_prefers_html(accepts) {
            res.body = html::dump_html(&res.json_value);
            res.set_header(http::header::CONTENT_TYPE, "text/html;charset=UTF-8");
        } else {
            res.body = pretty_json(&res.json_value);
            res.set_header(http::header::CONTENT_TYPE, "application/json");
        }
    }

    let status = res.status();
    if status.as_u16() >= 400 && res.body.is_empty() {
        res.body = status.canonical_reason().unwrap_or("").to_owned();
    }

    if status == StatusCode::NO_CONTENT && !res.body.is_empty() {
        // content on a no-content response must never reach the wire
        error!("response content provided but code was no-content");
        res.body.clear();
    }

    res.set_header(http::header::DATE, date);
}

/// Two-space-indented JSON with invalid UTF-8 sequences replaced.
fn pretty_json(value: &Value) -> String {
    let rendered = serde_json::to_vec_pretty(value).unwrap_or_default();
    String::from_utf8_lossy(&rendered).into_owned()
}

pub fn into_hyper_response(res: Response) -> hyper::Response<Full<Bytes>> {
    let status = res.status();
    let mut out = hyper::Response::new(Full::new(Bytes::from(res.body)));
    *out.status_mut() = status;
    *out.headers_mut() = res.headers;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn security_headers_present_on_every_response() {
        let mut res = Response::new();
        complete_response_fields("", "Mon, 01 Jan 2024 00:00:00 GMT", &mut res);
        for (name, _) in SECURITY_HEADERS {
            assert!(res.headers.contains_key(*name), "missing {name}");
        }
        assert_eq!(res.headers.get("Date").unwrap(), "Mon, 01 Jan 2024 00:00:00 GMT");
    }

    #[test]
    fn json_value_renders_as_json_by_default() {
        let mut res = Response::new();
        res.json_value = json!({"token": "abc"});
        complete_response_fields("application/json", "d", &mut res);
        assert!(res.body.contains("\"token\""));
        assert_eq!(res.headers.get("Content-Type").unwrap(), "application/json");
    }

    #[test]
    fn json_value_renders_as_html_for_browsers() {
        let mut res = Response::new();
        res.json_value = json!({"token": "abc"});
        complete_response_fields("text/html", "d", &mut res);
        assert!(res.body.starts_with("<html>"));
    }

    #[test]
    fn error_status_gets_reason_phrase_body() {
        let mut res = Response::with_status(StatusCode::UNAUTHORIZED);
        complete_response_fields("", "d", &mut res);
        assert_eq!(res.body, "Unauthorized");
    }

    #[test]
    fn no_content_always_empty() {
        let mut res = Response::with_status(StatusCode::NO_CONTENT);
        res.body = "should vanish".into();
        complete_response_fields("", "d", &mut res);
        assert!(res.body.is_empty());
    }

    #[test]
    fn existing_body_is_not_overwritten() {
        let mut res = Response::with_status(StatusCode::BAD_REQUEST);
        res.body = "explicit".into();
        complete_response_fields("", "d", &mut res);
        assert_eq!(res.body, "explicit");
    }
}
