//! HTTP entity body with its entity headers.

use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::collections::BTreeMap;

/// HTTP/1.1 entity headers, plus `etag` which CouchDB treats as one.
const ENTITY_HEADERS: &[&str] = &[
    "allow",
    "content-encoding",
    "content-language",
    "content-length",
    "content-location",
    "content-md5",
    "content-range",
    "content-type",
    "etag",
    "expires",
    "last-modified",
];

/// A response (or request) body: raw content plus its entity headers.
///
/// The JSON interpretation is computed on first use and cached.
#[derive(Clone, Debug, Default)]
pub struct Body {
    content: Bytes,
    headers: BTreeMap<String, String>,
    json: OnceCell<Option<Value>>,
}

impl Body {
    /// Builds a body, keeping only the entity headers from `headers`.
    pub fn new(content: impl Into<Bytes>, headers: &BTreeMap<String, String>) -> Self {
        Body {
            content: content.into(),
            headers: Self::entity_headers_from(headers),
            json: OnceCell::new(),
        }
    }

    pub fn with_content_type(content: impl Into<Bytes>, content_type: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        Body {
            content: content.into(),
            headers,
            json: OnceCell::new(),
        }
    }

    /// Sub-map of `headers` containing only entity headers, keys lowercased.
    pub fn entity_headers_from(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .filter(|(k, _)| ENTITY_HEADERS.contains(&k.as_str()))
            .map(|(k, v)| (k, v.clone()))
            .collect()
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag").map(String::as_str)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.headers.get("last-modified").map(String::as_str)
    }

    /// Content decoded as UTF-8, replacing invalid sequences.
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Content parsed as JSON, or `None` if it isn't valid JSON.
    pub fn from_json(&self) -> Option<&Value> {
        self.json
            .get_or_init(|| serde_json::from_slice(&self.content).ok())
            .as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
