//! Application-protocol metadata parsers
//!
//! A contiguous run of same-side payload blocks is handed to the parser
//! family, which sniffs the content and returns a tagged metadata document.
//! Unknown content yields no metadata at all.

pub mod http;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Parsed metadata attached to the first payload of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Metadata {
    HttpRequest {
        method: String,
        url: String,
        protocol: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        host: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
    },
    HttpResponse {
        protocol: String,
        status: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        body: String,
    },
}

/// Sniff the content and run the first parser that recognizes it.
pub fn parse(content: &[u8]) -> Option<Metadata> {
    if http::is_http_request(content) {
        return http::parse_request(content);
    }
    if http::is_http_response(content) {
        return http::parse_response(content);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_request() {
        let metadata = parse(b"GET /flag HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert!(matches!(metadata, Metadata::HttpRequest { .. }));
    }

    #[test]
    fn test_sniff_response() {
        let metadata = parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(matches!(metadata, Metadata::HttpResponse { .. }));
    }

    #[test]
    fn test_unknown_content() {
        assert!(parse(b"\x00\x01\x02 binary junk").is_none());
        assert!(parse(b"").is_none());
    }

    #[test]
    fn test_json_discriminator() {
        let metadata = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["type"], "http-request");
    }
}
