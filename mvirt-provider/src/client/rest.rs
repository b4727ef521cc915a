//! REST client for the mvirt cluster API.

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{ApiResource, RemoteStore, Result, StoreError};

/// Error body returned by the API (`{"error": "...", "code": 404}`).
#[derive(Deserialize)]
struct ApiErrorBody {
    error: String,
}

/// Client for namespaced objects under `{endpoint}/apis/{group}/{version}`.
#[derive(Clone)]
pub struct RestClient {
    endpoint: Url,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::with_client(endpoint, reqwest::Client::new())
    }

    pub fn with_client(endpoint: &str, http: reqwest::Client) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| StoreError::InvalidEndpoint(format!("{endpoint}: {e}")))?;
        if endpoint.cannot_be_a_base() {
            return Err(StoreError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self { endpoint, http })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn collection_url<K: ApiResource>(&self, namespace: &str) -> Result<Url> {
        self.url::<K>(&[namespace, K::PLURAL])
    }

    fn object_url<K: ApiResource>(&self, namespace: &str, name: &str) -> Result<Url> {
        self.url::<K>(&[namespace, K::PLURAL, name])
    }

    fn url<K: ApiResource>(&self, tail: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidEndpoint(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(["apis", K::GROUP, K::VERSION, "namespaces"])
            .extend(tail);
        Ok(url)
    }
}

#[async_trait]
impl<K: ApiResource> RemoteStore<K> for RestClient {
    async fn create(&self, namespace: &str, object: &K) -> Result<K> {
        let url = self.collection_url::<K>(namespace)?;
        debug!("Creating {} {}/{}", K::KIND, namespace, object.metadata().name);
        let resp = self.http.post(url).json(object).send().await?;
        decode(resp, K::KIND, &object.metadata().name).await
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let url = self.object_url::<K>(namespace, name)?;
        debug!("Getting {} {}/{}", K::KIND, namespace, name);
        let resp = self.http.get(url).send().await?;
        decode(resp, K::KIND, name).await
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K> {
        let name = &object.metadata().name;
        let url = self.object_url::<K>(namespace, name)?;
        debug!("Updating {} {}/{}", K::KIND, namespace, name);
        let resp = self.http.put(url).json(object).send().await?;
        decode(resp, K::KIND, name).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        let url = self.object_url::<K>(namespace, name)?;
        debug!("Deleting {} {}/{}", K::KIND, namespace, name);
        let resp = self.http.delete(url).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(error_from_status(status, &body, K::KIND, name))
    }
}

async fn decode<T: DeserializeOwned>(resp: Response, kind: &str, name: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        let bytes = resp.bytes().await?;
        return Ok(serde_json::from_slice(&bytes)?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(error_from_status(status, &body, kind, name))
}

fn error_from_status(status: StatusCode, body: &str, kind: &str, name: &str) -> StoreError {
    let message = match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(b) => b.error,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };

    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(format!("{kind} {name}: {message}")),
        StatusCode::CONFLICT => StoreError::Conflict(format!("{kind} {name}: {message}")),
        _ => StoreError::Api {
            status: status.as_u16(),
            message,
        },
    }
}
