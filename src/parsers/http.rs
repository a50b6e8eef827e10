//! HTTP/1.x parser
//!
//! Parses requests and responses out of reassembled payload runs. Lenient on
//! purpose: CTF services speak sloppy HTTP, so a parse failure falls back to
//! "no metadata" rather than an error.

use std::collections::HashMap;

use super::Metadata;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Check if the payload starts with an HTTP request line
pub fn is_http_request(payload: &[u8]) -> bool {
    METHODS
        .iter()
        .any(|m| payload.starts_with(m.as_bytes()) && payload.get(m.len()) == Some(&b' '))
}

/// Check if the payload starts with an HTTP status line
pub fn is_http_response(payload: &[u8]) -> bool {
    payload.starts_with(b"HTTP/")
}

/// Parse an HTTP request
pub fn parse_request(payload: &[u8]) -> Option<Metadata> {
    let text = String::from_utf8_lossy(payload);
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let url = parts.next()?.to_string();
    let protocol = parts.next().unwrap_or("HTTP/1.0").to_string();

    if !METHODS.contains(&method.as_str()) {
        return None;
    }

    let (headers, body) = parse_headers_and_body(lines);
    let host = headers.get("host").cloned().unwrap_or_default();

    Some(Metadata::HttpRequest {
        method,
        url,
        protocol,
        headers,
        host,
        body,
    })
}

/// Parse an HTTP response
pub fn parse_response(payload: &[u8]) -> Option<Metadata> {
    let text = String::from_utf8_lossy(payload);
    let mut lines = text.split("\r\n");

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(2, ' ');
    let protocol = parts.next()?.to_string();
    if !protocol.starts_with("HTTP/") {
        return None;
    }
    let status = parts.next()?.trim().to_string();
    if status.is_empty() {
        return None;
    }

    let (headers, body) = parse_headers_and_body(lines);

    Some(Metadata::HttpResponse {
        protocol,
        status,
        headers,
        body,
    })
}

/// Consume header lines up to the empty separator; the rest is the body.
/// Header names are lowercased.
fn parse_headers_and_body<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> (HashMap<String, String>, String) {
    let mut headers = HashMap::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_body = false;

    for line in lines {
        if in_body {
            body_lines.push(line);
            continue;
        }
        if line.is_empty() {
            in_body = true;
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    (headers, body_lines.join("\r\n"))
}
