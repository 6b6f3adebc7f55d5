//! Main CouchDB client handle.
//!
//! A [`CouchClient`] carries the configuration and the transport. Every
//! resource tree rooted at one of its resources issues its operations through
//! it. Clones share the transport's connection pool but no other state, so
//! independent trees stay independent.

use crate::core::client::config::ClientConfig;
use crate::core::client::native_network::NativeNetwork;
use crate::core::database::Database;
use crate::core::error::Result;
use crate::core::resource::Resource;
use crate::core::traits::CouchNetwork;
use std::sync::Arc;
use url::Url;

#[derive(Clone)]
pub struct CouchClient {
    network: Arc<dyn CouchNetwork>,
    config: Arc<ClientConfig>,
}

impl CouchClient {
    /// Create a client with default configuration.
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a client with custom configuration over `reqwest`.
    pub fn with_config(config: ClientConfig) -> Self {
        let network = Arc::new(NativeNetwork::from_config(&config));
        CouchClient {
            network,
            config: Arc::new(config),
        }
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_network(network: Arc<dyn CouchNetwork>, config: ClientConfig) -> Self {
        CouchClient {
            network,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn config_arc(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub fn network(&self) -> &Arc<dyn CouchNetwork> {
        &self.network
    }

    /// A root resource for an absolute URL.
    pub fn resource(&self, url: &str) -> Result<Arc<Resource>> {
        let url = Url::parse(url)?;
        Ok(Resource::root(self.clone(), url))
    }

    /// A database handle for an absolute database URL.
    pub fn database(&self, url: &str) -> Result<Database> {
        Ok(Database::new(self.resource(url)?))
    }
}

impl Default for CouchClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
