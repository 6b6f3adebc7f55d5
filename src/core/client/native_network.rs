use crate::core::client::config::ClientConfig;
use crate::core::error::{CouchError, Result};
use crate::core::traits::{CouchNetwork, StreamingResponse};
use crate::core::types::{CouchRequest, CouchResponse, Credential, Method};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;

/// [`CouchNetwork`] over a `reqwest` connection pool.
pub struct NativeNetwork {
    client: Client,
    request_timeout: Duration,
}

impl NativeNetwork {
    pub fn new(client: Client, request_timeout: Duration) -> Self {
        Self {
            client,
            request_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connection_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(config.user_agent.clone());

        if !config.proxy_url.is_empty() {
            match reqwest::Proxy::all(&config.proxy_url) {
                Ok(proxy) => builder = builder.proxy(proxy),
                Err(e) => tracing::warn!("Ignoring invalid proxy {}: {}", config.proxy_url, e),
            }
        }

        let client = builder.build().unwrap_or_default();
        Self::new(client, Duration::from_millis(config.request_timeout_ms))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn build(&self, request: CouchRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Put => reqwest::Method::PUT,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
            Method::Copy => {
                reqwest::Method::from_bytes(b"COPY").unwrap_or(reqwest::Method::POST)
            }
        };

        let mut req_builder = self.client.request(method, request.url);
        for (k, v) in &request.headers {
            req_builder = req_builder.header(k, v);
        }
        match &request.credential {
            Some(Credential::Basic { username, password }) => {
                req_builder = req_builder.basic_auth(username, Some(password));
            }
            Some(Credential::Bearer(token)) => {
                req_builder = req_builder.bearer_auth(token);
            }
            None => {}
        }
        if !request.body.is_empty() {
            req_builder = req_builder.body(request.body);
        }
        req_builder
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (k, v) in headers {
        if let Ok(val) = v.to_str() {
            out.insert(k.as_str().to_ascii_lowercase(), val.to_string());
        }
    }
    out
}

#[async_trait]
impl CouchNetwork for NativeNetwork {
    async fn send(&self, request: CouchRequest) -> Result<CouchResponse> {
        let response = self
            .build(request)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await?;

        Ok(CouchResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_stream(&self, request: CouchRequest) -> Result<StreamingResponse> {
        let response = self.build(request).send().await?;

        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CouchError::from))
            .boxed();

        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}
