//! Initial server discovery.

use async_trait::async_trait;
use hotrod_core::{Result, ServerAddress};

/// Source of the servers the client bootstraps from.
///
/// Only consulted before the first topology arrives; afterwards the servers
/// themselves describe the cluster.
#[async_trait]
pub trait ServerDiscovery: Send + Sync + std::fmt::Debug {
    /// Returns the servers to try first.
    async fn discover(&self) -> Result<Vec<ServerAddress>>;
}

/// Discovery over a fixed list of addresses.
#[derive(Debug, Clone)]
pub struct StaticServerDiscovery {
    addresses: Vec<ServerAddress>,
}

impl StaticServerDiscovery {
    /// Creates a discovery with the given addresses.
    pub fn new(addresses: Vec<ServerAddress>) -> Self {
        Self { addresses }
    }

    /// Returns the configured addresses.
    pub fn addresses(&self) -> &[ServerAddress] {
        &self.addresses
    }
}

#[async_trait]
impl ServerDiscovery for StaticServerDiscovery {
    async fn discover(&self) -> Result<Vec<ServerAddress>> {
        Ok(self.addresses.clone())
    }
}

impl<T> From<T> for StaticServerDiscovery
where
    T: IntoIterator<Item = ServerAddress>,
{
    fn from(addresses: T) -> Self {
        Self::new(addresses.into_iter().collect())
    }
}
