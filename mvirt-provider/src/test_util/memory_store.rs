//! In-memory remote store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::{ApiResource, RemoteStore, Result, StoreError};

/// Store operation, for call recording and injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Get,
    Update,
    Delete,
}

/// A recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: StoreOp,
    pub namespace: String,
    pub name: String,
}

type Defaulter<K> = Arc<dyn Fn(&mut K) + Send + Sync>;

struct Inner<K> {
    objects: BTreeMap<(String, String), K>,
    /// Objects being deleted, with the number of reads that still see them.
    deleting: HashMap<(String, String), u32>,
    failures: HashMap<StoreOp, VecDeque<StoreError>>,
    calls: Vec<Call>,
    next_version: u64,
}

/// Store that keeps objects in memory and assigns server-owned metadata
/// (`uid`, `resourceVersion`, `creationTimestamp`) like the cluster API.
///
/// Updates carrying a stale `resourceVersion` fail with `Conflict`.
pub struct MemoryStore<K> {
    inner: RwLock<Inner<K>>,
    defaulter: Option<Defaulter<K>>,
    delete_lag: u32,
    delete_latency: Duration,
}

impl<K: ApiResource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ApiResource> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                objects: BTreeMap::new(),
                deleting: HashMap::new(),
                failures: HashMap::new(),
                calls: Vec::new(),
                next_version: 1,
            }),
            defaulter: None,
            delete_lag: 0,
            delete_latency: Duration::ZERO,
        }
    }

    /// Apply server-side defaults to every created or updated object.
    pub fn with_defaulter(mut self, f: impl Fn(&mut K) + Send + Sync + 'static) -> Self {
        self.defaulter = Some(Arc::new(f));
        self
    }

    /// Deleted objects stay readable for `reads` further gets.
    pub fn with_delete_lag(mut self, reads: u32) -> Self {
        self.delete_lag = reads;
        self
    }

    /// Every delete call takes `latency` before it reaches the store.
    pub fn with_delete_latency(mut self, latency: Duration) -> Self {
        self.delete_latency = latency;
        self
    }

    /// Insert an object directly, as if created by someone else.
    pub async fn seed(&self, namespace: &str, mut object: K) -> K {
        let mut inner = self.inner.write().await;
        object.metadata_mut().namespace = namespace.to_string();
        stamp_new(&mut inner, &mut object);
        let key = key(namespace, &object.metadata().name);
        inner.objects.insert(key, object.clone());
        object
    }

    /// Remove an object directly, as if deleted by someone else.
    pub async fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        let mut inner = self.inner.write().await;
        let key = key(namespace, name);
        inner.deleting.remove(&key);
        inner.objects.remove(&key)
    }

    /// Change a stored object directly, bumping its version.
    pub async fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let mut inner = self.inner.write().await;
        let version = inner.next_version;
        let Some(object) = inner.objects.get_mut(&key(namespace, name)) else {
            return false;
        };
        f(object);
        object.metadata_mut().resource_version = Some(version.to_string());
        inner.next_version += 1;
        true
    }

    pub async fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.inner
            .read()
            .await
            .objects
            .get(&key(namespace, name))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make the next call of `op` fail with `error`.
    pub async fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.inner
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.inner.read().await.calls.clone()
    }

    /// Number of recorded calls of `op`.
    pub async fn count(&self, op: StoreOp) -> usize {
        self.inner
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    fn apply_defaults(&self, object: &mut K) {
        if let Some(defaulter) = &self.defaulter {
            defaulter(object);
        }
    }
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

fn stamp_new<K: ApiResource>(inner: &mut Inner<K>, object: &mut K) {
    let meta = object.metadata_mut();
    meta.uid = Some(Uuid::new_v4().to_string());
    meta.creation_timestamp = Some(chrono::Utc::now().to_rfc3339());
    meta.resource_version = Some(inner.next_version.to_string());
    inner.next_version += 1;
}

impl<K> Inner<K> {
    fn begin(&mut self, op: StoreOp, namespace: &str, name: &str) -> Result<()> {
        self.calls.push(Call {
            op,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<K: ApiResource> RemoteStore<K> for MemoryStore<K> {
    async fn create(&self, namespace: &str, object: &K) -> Result<K> {
        let mut inner = self.inner.write().await;
        let name = object.metadata().name.clone();
        inner.begin(StoreOp::Create, namespace, &name)?;

        let key = key(namespace, &name);
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} {namespace}/{name} already exists",
                K::KIND
            )));
        }

        let mut stored = object.clone();
        stored.metadata_mut().namespace = namespace.to_string();
        stamp_new(&mut inner, &mut stored);
        self.apply_defaults(&mut stored);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        let mut inner = self.inner.write().await;
        inner.begin(StoreOp::Get, namespace, name)?;

        let key = key(namespace, name);
        let expired = match inner.deleting.get_mut(&key) {
            Some(0) => true,
            Some(left) => {
                *left -= 1;
                false
            }
            None => false,
        };
        if expired {
            inner.deleting.remove(&key);
            inner.objects.remove(&key);
        }
        inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {namespace}/{name}", K::KIND)))
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K> {
        let mut inner = self.inner.write().await;
        let name = object.metadata().name.clone();
        inner.begin(StoreOp::Update, namespace, &name)?;

        let key = key(namespace, &name);
        let current = match inner.objects.get(&key) {
            Some(current) if !inner.deleting.contains_key(&key) => current,
            _ => {
                return Err(StoreError::NotFound(format!(
                    "{} {namespace}/{name}",
                    K::KIND
                )))
            }
        };

        let current_meta = current.metadata().clone();
        if let Some(version) = &object.metadata().resource_version {
            if current_meta.resource_version.as_ref() != Some(version) {
                return Err(StoreError::Conflict(format!(
                    "{} {namespace}/{name} was modified (version {version} is stale)",
                    K::KIND
                )));
            }
        }

        let mut stored = object.clone();
        let meta = stored.metadata_mut();
        meta.namespace = namespace.to_string();
        meta.uid = current_meta.uid;
        meta.creation_timestamp = current_meta.creation_timestamp;
        meta.resource_version = Some(inner.next_version.to_string());
        inner.next_version += 1;
        self.apply_defaults(&mut stored);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        if !self.delete_latency.is_zero() {
            tokio::time::sleep(self.delete_latency).await;
        }
        let mut inner = self.inner.write().await;
        inner.begin(StoreOp::Delete, namespace, name)?;

        let key = key(namespace, name);
        if !inner.objects.contains_key(&key) {
            return Err(StoreError::NotFound(format!("{} {namespace}/{name}", K::KIND)));
        }
        if self.delete_lag == 0 {
            inner.objects.remove(&key);
        } else {
            inner.deleting.entry(key).or_insert(self.delete_lag);
        }
        Ok(())
    }
}
