/// Media types the gateway distinguishes when negotiating a response
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    NoMatch,
    /// Accepts: */*
    Any,
    Cbor,
    Html,
    Json,
    OctetStream,
    EventStream,
}

fn known_mime_type(mime: &str) -> Option<ContentType> {
    let mime = mime.trim();
    if mime == "*/*" {
        return Some(ContentType::Any);
    }
    if mime.eq_ignore_ascii_case("application/cbor") {
        return Some(ContentType::Cbor);
    }
    if mime.eq_ignore_ascii_case("application/json") {
        return Some(ContentType::Json);
    }
    if mime.eq_ignore_ascii_case("application/octet-stream") {
        return Some(ContentType::OctetStream);
    }
    if mime.eq_ignore_ascii_case("text/event-stream") {
        return Some(ContentType::EventStream);
    }
    if mime.eq_ignore_ascii_case("text/html") {
        return Some(ContentType::Html);
    }
    None
}

/// Pick the first listed Accept entry that appears in `preferred`.
/// A wildcard entry matches immediately; unknown media types are
/// skipped.  Quality parameters are ignored: clients of this service
/// list types in preference order.
pub fn get_preferred_content_type(accepts: &str, preferred: &[ContentType]) -> ContentType {
    for entry in accepts.split(',') {
        let mime = match entry.split(';').next() {
            Some(m) => m.trim(),
            None => continue,
        };
        if mime.is_empty() {
            continue;
        }
        let Some(parsed) = known_mime_type(mime) else {
            continue;
        };
        if parsed == ContentType::Any {
            return parsed;
        }
        if preferred.contains(&parsed) {
            return parsed;
        }
    }
    ContentType::NoMatch
}

/// True when the client's Accept header prefers an HTML rendering over
/// JSON.  Browsers do; scripts and Redfish clients do not.
pub fn request_prefers_html(accepts: &str) -> bool {
    get_preferred_content_type(accepts, &[ContentType::Html, ContentType::Json])
        == ContentType::Html
}
