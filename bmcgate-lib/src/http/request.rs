use bytes::Bytes;
use http::{HeaderMap, Method, Version};
use std::net::IpAddr;

use crate::session::UserSession;

/// One parsed, authenticated request as handed to the router.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version: Version,
    /// Raw request target as it appeared on the wire.
    pub target: String,
    /// Path component of the target.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: IpAddr,
    /// Identity established by the authentication pipeline; None for
    /// allowlisted anonymous requests.
    pub session: Option<UserSession>,
    pub is_secure: bool,
}

impl Request {
    /// Header value as a string, or "" when absent or non-UTF-8, the
    /// way the rest of the pipeline consumes headers.
    pub fn header_value(&self, name: &str) -> &str {
        header_value(&self.headers, name)
    }

    pub fn is_upgrade(&self) -> bool {
        self.headers
            .get(http::header::UPGRADE)
            .is_some_and(|v| v.to_str().is_ok_and(|s| s.eq_ignore_ascii_case("websocket")))
    }
}

pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

pub fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    }
}
