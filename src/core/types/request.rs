//! Outgoing HTTP request description.

use crate::core::error::Result;
use crate::core::types::Credential;
use bytes::Bytes;
use std::collections::BTreeMap;
use url::Url;

/// HTTP methods used against a CouchDB server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
    Copy,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Copy => "COPY",
        }
    }

    /// GET and HEAD do not modify the resource.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = crate::core::error::CouchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            "COPY" => Ok(Method::Copy),
            other => Err(crate::core::error::CouchError::Usage(format!(
                "unsupported HTTP method {}",
                other
            ))),
        }
    }
}

/// A fully-addressed HTTP request.
#[derive(Clone)]
pub struct CouchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub credential: Option<Credential>,
}

impl std::fmt::Debug for CouchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("credential", &self.credential)
            .finish()
    }
}

impl CouchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        CouchRequest {
            method,
            url,
            headers: BTreeMap::new(),
            body: Bytes::new(),
            credential: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as the body and sets `Content-Type: application/json`.
    pub fn with_json<T: serde::Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header("Content-Type", "application/json")
            .with_body(body))
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Appends a query parameter to the URL.
    pub fn with_query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    /// Case-insensitive request header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of a query parameter, if present.
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://localhost:5984/db").unwrap()
    }

    #[test]
    fn test_method_read_only() {
        assert!(Method::Get.is_read_only());
        assert!(Method::Head.is_read_only());
        assert!(!Method::Put.is_read_only());
        assert!(!Method::Delete.is_read_only());
    }

    #[test]
    fn test_method_from_str() {
        assert_eq!("put".parse::<Method>().unwrap(), Method::Put);
        assert_eq!("COPY".parse::<Method>().unwrap(), Method::Copy);
        assert!("PATCH".parse::<Method>().is_err());
    }

    #[test]
    fn test_with_json_sets_content_type() {
        let req = CouchRequest::new(Method::Put, url())
            .with_json(&serde_json::json!({"a": 1}))
            .unwrap();
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(&req.body[..], br#"{"a":1}"#);
    }

    #[test]
    fn test_with_query() {
        let req = CouchRequest::get(url())
            .with_query("feed", "longpoll")
            .with_query("since", "7");
        assert_eq!(req.query_param("feed").as_deref(), Some("longpoll"));
        assert_eq!(req.query_param("since").as_deref(), Some("7"));
        assert_eq!(req.query_param("filter"), None);
    }

    #[test]
    fn test_debug_omits_body() {
        let req = CouchRequest::get(url()).with_body("payload");
        let debug = format!("{:?}", req);
        assert!(debug.contains("body_len: 7"));
        assert!(!debug.contains("payload"));
    }
}
