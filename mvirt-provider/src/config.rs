//! Provider configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{self, RemoteStore, RestClient};
use crate::resource::{ResourceAdapter, ResourceKind};

/// Default cluster API endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://[::1]:8080";

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Default interval between polls while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for each lifecycle operation, including any waiting it does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub create: Duration,
    pub read: Duration,
    pub update: Duration,
    pub delete: Duration,
}

impl Timeouts {
    /// Same timeout for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            read: timeout,
            update: timeout,
            delete: timeout,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(DEFAULT_TIMEOUT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub timeouts: Timeouts,
    pub poll_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeouts: Timeouts::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ProviderConfig {
    pub fn rest_client(&self) -> client::Result<RestClient> {
        RestClient::new(&self.endpoint)
    }

    /// Adapter for kind `K` sharing `store`.
    pub fn adapter<K, S>(&self, store: Arc<S>) -> ResourceAdapter<K, S>
    where
        K: ResourceKind,
        S: RemoteStore<K::Remote> + ?Sized,
    {
        ResourceAdapter::new(store, self.timeouts, self.poll_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.endpoint, "http://[::1]:8080");
        assert_eq!(config.timeouts.create, Duration::from_secs(120));
        assert_eq!(config.timeouts, Timeouts::uniform(Duration::from_secs(120)));
        assert!(config.rest_client().is_ok());
    }
}
