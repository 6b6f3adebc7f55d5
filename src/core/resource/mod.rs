//! HTTP resources addressed by URL, arranged in a parent/child tree.
//!
//! Root resources are created from an absolute URL; children from a path
//! relative to their parent. Children know their parents, parents don't
//! remember their children (use a [`ResourceCache`] for downward links).
//!
//! A resource hands every request it builds to an [`Operation`]. Credentials
//! and protection spaces set on a resource apply to its whole subtree; a child
//! reads its ancestors' values but never writes them.
//!
//! # Examples
//!
//! ```no_run
//! # async fn demo() -> couch_rs::Result<()> {
//! use couch_rs::{CouchClient, Credential};
//!
//! let client = CouchClient::new();
//! let db = client.resource("http://localhost:5984/recipes")?;
//! db.set_credential(Some(Credential::basic("admin", "secret")));
//!
//! let op = db.child("pancakes").get()?;
//! if op.wait().await {
//!     let body = op.response_body().await.unwrap();
//!     println!("{:?}", body.from_json());
//! }
//! # Ok(())
//! # }
//! ```

mod cache;

pub use cache::ResourceCache;

use crate::core::client::utils::join_path;
use crate::core::client::{CouchClient, Operation};
use crate::core::error::{CouchError, Result};
use crate::core::types::{Body, CouchRequest, Credential, Method};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use url::Url;

/// Conditional-GET validators remembered from the last cached response.
#[derive(Debug, Clone, Default)]
struct HttpCacheState {
    etag: Option<String>,
    last_modified: Option<String>,
    cached_url: Option<Url>,
}

/// An HTTP resource identified by a URL.
pub struct Resource {
    client: CouchClient,
    parent: Option<Arc<Resource>>,
    /// Absolute URL; only set on roots.
    base_url: Option<Url>,
    /// Path relative to the parent; `None` while untitled.
    relative_path: RwLock<Option<String>>,
    pub(crate) owning_cache: Mutex<Option<u64>>,
    credential: RwLock<Option<Credential>>,
    protection_space: RwLock<Option<String>>,
    http_cache: Mutex<HttpCacheState>,
    /// `None` unless active-operation tracking is enabled.
    active: Mutex<Option<HashMap<u64, Operation>>>,
}

impl Resource {
    fn build(
        client: CouchClient,
        parent: Option<Arc<Resource>>,
        base_url: Option<Url>,
        relative_path: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Resource {
            client,
            parent,
            base_url,
            relative_path: RwLock::new(relative_path),
            owning_cache: Mutex::new(None),
            credential: RwLock::new(None),
            protection_space: RwLock::new(None),
            http_cache: Mutex::new(HttpCacheState::default()),
            active: Mutex::new(None),
        })
    }

    /// A resource with an absolute URL and no parent.
    pub fn root(client: CouchClient, url: Url) -> Arc<Self> {
        Self::build(client, None, Some(url), None)
    }

    /// A resource at `path` below `self`.
    ///
    /// The path is appended to the parent's URL joined with `/`; the parent is
    /// treated as a container, so this never produces a sibling URL.
    pub fn child(self: &Arc<Self>, path: &str) -> Arc<Self> {
        Self::build(
            self.client.clone(),
            Some(self.clone()),
            None,
            Some(path.trim_matches('/').to_string()),
        )
    }

    /// A child with no URL yet. Its first PUT is sent as a POST to the parent,
    /// and the `Location` of the response names it.
    pub fn untitled(self: &Arc<Self>) -> Arc<Self> {
        Self::build(self.client.clone(), Some(self.clone()), None, None)
    }

    pub fn client(&self) -> &CouchClient {
        &self.client
    }

    pub fn parent(&self) -> Option<&Arc<Resource>> {
        self.parent.as_ref()
    }

    pub fn relative_path(&self) -> Option<String> {
        self.relative_path.read().clone()
    }

    pub fn is_untitled(&self) -> bool {
        self.base_url.is_none() && self.relative_path.read().is_none()
    }

    /// Absolute URL, or `None` for an untitled resource (or one below it).
    pub fn url(&self) -> Option<Url> {
        if let Some(url) = &self.base_url {
            return Some(url.clone());
        }
        let path = self.relative_path.read().clone()?;
        let parent_url = self.parent.as_ref()?.url()?;
        join_path(&parent_url, &path)
    }

    // ------------------------------------------------------------ credentials

    /// Sets the credential used by this resource and its descendants.
    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write() = credential;
    }

    /// The nearest credential on this resource or an ancestor.
    pub fn credential(&self) -> Option<Credential> {
        if let Some(credential) = self.credential.read().clone() {
            return Some(credential);
        }
        self.parent.as_ref().and_then(|p| p.credential())
    }

    /// Sets the authentication realm for this resource and its descendants.
    pub fn set_protection_space(&self, realm: Option<String>) {
        *self.protection_space.write() = realm;
    }

    pub fn protection_space(&self) -> Option<String> {
        if let Some(realm) = self.protection_space.read().clone() {
            return Some(realm);
        }
        self.parent.as_ref().and_then(|p| p.protection_space())
    }

    // ----------------------------------------------------------- HTTP methods

    /// Starts a GET, conditional if a cached ETag/Last-Modified applies.
    pub fn get(self: &Arc<Self>) -> Result<Operation> {
        self.send_http(Method::Get, &[])
    }

    pub fn head(self: &Arc<Self>) -> Result<Operation> {
        self.send_http(Method::Head, &[])
    }

    pub fn delete(self: &Arc<Self>) -> Result<Operation> {
        self.send_http(Method::Delete, &[])
    }

    /// Starts a PUT. On an untitled resource this is a POST to the parent.
    pub fn put(self: &Arc<Self>, body: impl Into<Bytes>, params: &[(&str, &str)]) -> Result<Operation> {
        let request = self.request_with_method(Method::Put, params)?.with_body(body);
        Ok(self.send_request(request))
    }

    pub fn post(self: &Arc<Self>, body: impl Into<Bytes>, params: &[(&str, &str)]) -> Result<Operation> {
        let request = self.request_with_method(Method::Post, params)?.with_body(body);
        Ok(self.send_request(request))
    }

    /// Starts a PUT with `value` serialized as a JSON body.
    pub fn put_json<T>(self: &Arc<Self>, value: &T, params: &[(&str, &str)]) -> Result<Operation>
    where
        T: serde::Serialize + ?Sized,
    {
        let request = self.request_with_method(Method::Put, params)?.with_json(value)?;
        Ok(self.send_request(request))
    }

    /// Starts a POST with `value` serialized as a JSON body.
    pub fn post_json<T>(self: &Arc<Self>, value: &T, params: &[(&str, &str)]) -> Result<Operation>
    where
        T: serde::Serialize + ?Sized,
    {
        let request = self.request_with_method(Method::Post, params)?.with_json(value)?;
        Ok(self.send_request(request))
    }

    /// Sends an arbitrary request. All other verbs end up here.
    ///
    /// Parameters whose keys start with `?` are added to the URL query; the
    /// rest become request headers.
    pub fn send_http(self: &Arc<Self>, method: Method, params: &[(&str, &str)]) -> Result<Operation> {
        let request = self.request_with_method(method, params)?;
        Ok(self.send_request(request))
    }

    /// Builds a request without sending it.
    pub fn request_with_method(&self, method: Method, params: &[(&str, &str)]) -> Result<CouchRequest> {
        let (method, mut url) = match (method, self.url()) {
            (_, Some(url)) => (method, url),
            (Method::Put, None) if self.is_untitled() => {
                let parent_url = self.parent.as_ref().and_then(|p| p.url()).ok_or_else(|| {
                    CouchError::Usage("untitled resource has no addressable parent".into())
                })?;
                (Method::Post, parent_url)
            }
            (_, None) => {
                return Err(CouchError::Usage(format!(
                    "cannot {} a resource that has no URL yet",
                    method
                )))
            }
        };

        let mut headers = BTreeMap::new();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                match key.strip_prefix('?') {
                    Some(name) => {
                        query.append_pair(name, value);
                    }
                    None => {
                        headers.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        if method == Method::Get {
            let cache = self.http_cache.lock();
            if cache.cached_url.as_ref() == Some(&url) {
                if let Some(etag) = &cache.etag {
                    headers.insert("If-None-Match".to_string(), etag.clone());
                }
                if let Some(last_modified) = &cache.last_modified {
                    headers.insert("If-Modified-Since".to_string(), last_modified.clone());
                }
            }
        }

        let mut request = CouchRequest::new(method, url);
        request.headers = headers;
        Ok(request)
    }

    /// Wraps `request` in an [`Operation`] and starts it.
    pub fn send_request(self: &Arc<Self>, request: CouchRequest) -> Operation {
        let op = Operation::new(self.clone(), request);
        op.start();
        op
    }

    // ---------------------------------------------------------------- caching

    /// Remembers the validators of a successful GET so later GETs of the same
    /// URL are conditional. `None` clears the cached state.
    ///
    /// Returns `true` if the response was cacheable.
    pub fn cache_response(&self, op: Option<&Operation>) -> bool {
        let mut cache = self.http_cache.lock();
        let Some(op) = op else {
            *cache = HttpCacheState::default();
            return false;
        };
        let Some((status, headers)) = op.completed_response() else {
            return false;
        };
        if !op.is_get() || status != 200 || op.error().is_some() {
            return false;
        }
        let etag = headers.get("etag").cloned();
        let last_modified = headers.get("last-modified").cloned();
        if etag.is_none() && last_modified.is_none() {
            return false;
        }
        *cache = HttpCacheState {
            etag,
            last_modified,
            cached_url: Some(op.url()),
        };
        true
    }

    pub fn etag(&self) -> Option<String> {
        self.http_cache.lock().etag.clone()
    }

    pub fn set_etag(&self, etag: Option<String>) {
        self.http_cache.lock().etag = etag;
    }

    pub fn last_modified(&self) -> Option<String> {
        self.http_cache.lock().last_modified.clone()
    }

    pub fn set_last_modified(&self, last_modified: Option<String>) {
        self.http_cache.lock().last_modified = last_modified;
    }

    pub fn cached_url(&self) -> Option<Url> {
        self.http_cache.lock().cached_url.clone()
    }

    pub fn set_cached_url(&self, url: Option<Url>) {
        self.http_cache.lock().cached_url = url;
    }

    // ----------------------------------------------------- operation tracking

    /// Enables or disables [`active_operations`](Self::active_operations).
    pub fn set_tracks_active_operations(&self, tracks: bool) {
        let mut active = self.active.lock();
        match (tracks, active.is_some()) {
            (true, false) => *active = Some(HashMap::new()),
            (false, true) => *active = None,
            _ => {}
        }
    }

    pub fn tracks_active_operations(&self) -> bool {
        self.active.lock().is_some()
    }

    /// In-flight operations on this resource or its descendants, or `None`
    /// when tracking is off.
    pub fn active_operations(&self) -> Option<Vec<Operation>> {
        self.active
            .lock()
            .as_ref()
            .map(|ops| ops.values().cloned().collect())
    }

    fn ancestors_and_self(&self) -> impl Iterator<Item = &Resource> {
        std::iter::successors(Some(self), |r| r.parent.as_deref())
    }

    pub(crate) fn operation_did_start(&self, op: &Operation) {
        for resource in self.ancestors_and_self() {
            if let Some(ops) = resource.active.lock().as_mut() {
                ops.insert(op.id(), op.clone());
            }
        }
    }

    pub(crate) fn operation_did_complete(&self, op: &Operation) {
        for resource in self.ancestors_and_self() {
            if let Some(ops) = resource.active.lock().as_mut() {
                ops.remove(&op.id());
            }
        }
    }

    /// Called before `op` stores its result; returns the error it should keep.
    pub(crate) fn operation_will_complete(
        &self,
        op: &Operation,
        _status: u16,
        headers: &BTreeMap<String, String>,
        body: Option<&Body>,
        error: Option<CouchError>,
    ) -> Option<CouchError> {
        if error.is_none() && op.is_post() && self.is_untitled() {
            if let Err(e) = self.created_by_post(headers, body) {
                return Some(e);
            }
        }
        error
    }

    /// Names an untitled resource after a successful POST to its parent.
    ///
    /// Uses the `Location` header, or the `id` member of a JSON body.
    fn created_by_post(&self, headers: &BTreeMap<String, String>, body: Option<&Body>) -> Result<()> {
        let parent_url = self.parent.as_ref().and_then(|p| p.url());
        let from_location = headers.get("location").and_then(|location| {
            let parent_url = parent_url.as_ref()?;
            let absolute = parent_url.join(location).ok()?;
            let prefix = format!("{}/", parent_url.path().trim_end_matches('/'));
            absolute
                .path()
                .strip_prefix(&prefix)
                .map(|p| p.to_string())
                .filter(|p| !p.is_empty())
        });
        let path = from_location.or_else(|| {
            body.and_then(Body::from_json)
                .and_then(|json| json.get("id"))
                .and_then(|id| id.as_str())
                .map(str::to_string)
        });

        match path {
            Some(path) => {
                tracing::debug!("Untitled resource created as {}", path);
                *self.relative_path.write() = Some(path);
                Ok(())
            }
            None => Err(CouchError::BodyParse(
                "POST response names no created resource".into(),
            )),
        }
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.url().map(|u| u.to_string()))
            .field("relative_path", &self.relative_path())
            .finish()
    }
}
