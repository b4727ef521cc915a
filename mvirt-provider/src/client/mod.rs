//! Remote store contract and typed API objects.
//!
//! The provider depends only on [`RemoteStore`]: typed create/get/update/delete
//! of one resource kind in a namespace. [`RestClient`] implements it against
//! the mvirt cluster API.

pub mod rest;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use rest::RestClient;

/// Errors returned by a remote store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists or was modified concurrently.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success API response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Endpoint URL cannot address API objects.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Request could not be sent or the response not received.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was not the expected object.
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// Store-internal failure.
    #[error("internal: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Metadata common to every API object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}

/// A versioned, namespaced API object kind.
pub trait ApiResource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const GROUP: &'static str;
    const VERSION: &'static str;
    const KIND: &'static str;
    /// Collection name used in request paths.
    const PLURAL: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

/// `<group>/<version>` of a kind.
pub fn api_version<K: ApiResource>() -> String {
    format!("{}/{}", K::GROUP, K::VERSION)
}

/// Typed CRUD access to one kind of remote object.
#[async_trait]
pub trait RemoteStore<K: ApiResource>: Send + Sync {
    /// Create `object` in `namespace`, returning the stored object.
    async fn create(&self, namespace: &str, object: &K) -> Result<K>;

    /// Fetch an object; `StoreError::NotFound` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    /// Replace an existing object, returning the stored object.
    async fn update(&self, namespace: &str, object: &K) -> Result<K>;

    /// Delete an object; `StoreError::NotFound` if it does not exist.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}
