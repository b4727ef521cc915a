//! Resource kinds and the generic lifecycle adapter.
//!
//! Each kind implements [`ResourceKind`]: its schema, semantic validation,
//! and the conversions between its typed configuration and its remote
//! object. [`ResourceAdapter`] drives create/read/update/delete for any kind
//! against a [`RemoteStore`].

pub mod loadbalancer;
pub mod vm;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{self, ApiResource, ObjectMeta, RemoteStore, StoreError};
use crate::config::Timeouts;
use crate::error::{Operation, ProviderError, Result};
use crate::id;
use crate::projection::{self, Drift};
use crate::schema::{ConfigRecord, Field, FieldType, Schema, ValidationError};
use crate::wait::{deadline_after, Poll, WaitError, Waiter};

pub use loadbalancer::LoadBalancerKind;
pub use vm::VirtualMachineKind;

/// Label prefix under which user tags are stored on remote objects.
pub const TAG_LABEL_PREFIX: &str = "tag.mvirt.io/";

/// Annotation holding a resource description.
pub const DESCRIPTION_ANNOTATION: &str = "field.mvirt.io/description";

/// Namespace used when a definition does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Capabilities one resource kind provides to the generic adapter.
///
/// The schema must declare `namespace` and `name` string fields.
pub trait ResourceKind: Send + Sync + 'static {
    /// Remote object type.
    type Remote: ApiResource;
    /// Typed configuration; its serialized form uses the schema's field names.
    type Config: Serialize + DeserializeOwned + Send;

    /// Resource type name used in definitions, e.g. `mvirt_virtualmachine`.
    const TYPE_NAME: &'static str;

    fn schema() -> Schema;

    /// Semantic checks beyond field presence and types.
    fn validate(_config: &Self::Config) -> std::result::Result<(), ValidationError> {
        Ok(())
    }

    fn to_payload(config: &Self::Config, namespace: &str, name: &str) -> Self::Remote;

    fn from_remote(remote: &Self::Remote) -> Self::Config;

    /// Adjust an update payload using the current remote object.
    ///
    /// Server-owned metadata and foreign labels are already carried over.
    fn prepare_update(payload: Self::Remote, _current: &Self::Remote) -> Self::Remote {
        payload
    }
}

/// `namespace` and `name` fields shared by every kind.
pub fn identity_fields(schema: Schema) -> Schema {
    schema
        .field(Field::optional("namespace", FieldType::String).with_default(DEFAULT_NAMESPACE))
        .field(Field::required("name", FieldType::String))
}

/// Lifecycle state of one managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    #[default]
    Absent,
    Creating,
    Present,
    Deleting,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Absent => "absent",
            ResourceState::Creating => "creating",
            ResourceState::Present => "present",
            ResourceState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

/// Local view of one managed instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    /// External identifier, set once the remote object exists.
    pub id: Option<String>,
    pub record: ConfigRecord,
    pub state: ResourceState,
}

impl ResourceData {
    /// New, not yet created instance with the given desired configuration.
    pub fn new(record: ConfigRecord) -> Self {
        Self {
            id: None,
            record,
            state: ResourceState::Absent,
        }
    }
}

/// Result of reading an instance's remote object.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    NotFound,
    Observed {
        record: ConfigRecord,
        drift: Vec<Drift>,
    },
}

/// Generic lifecycle driver for one resource kind.
pub struct ResourceAdapter<K: ResourceKind, S: ?Sized> {
    store: Arc<S>,
    timeouts: Timeouts,
    poll_interval: Duration,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S> ResourceAdapter<K, S>
where
    K: ResourceKind,
    S: RemoteStore<K::Remote> + ?Sized,
{
    pub fn new(store: Arc<S>, timeouts: Timeouts, poll_interval: Duration) -> Self {
        Self {
            store,
            timeouts,
            poll_interval,
            _kind: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create the remote object for a new instance.
    ///
    /// On success the instance is `Present`, its id is set and its record is
    /// the projection of the stored object. On failure it stays `Absent`.
    pub async fn create(&self, data: &mut ResourceData) -> Result<()> {
        let schema = K::schema();
        let (namespace, name) = identity(&schema, &data.record);
        schema
            .validate(&data.record)
            .map_err(|e| invalid::<K>(Operation::Create, &format!("{namespace}/{name}"), e))?;
        let id = id::compose(&namespace, &name)?;

        if data.state != ResourceState::Absent {
            return Err(self.invalid_state(Operation::Create, &id, data.state));
        }

        let payload = projection::build::<K>(&data.record, &namespace, &name)
            .map_err(|e| invalid::<K>(Operation::Create, &id, e))?;

        info!("Creating {} {}", kind::<K>(), id);
        data.state = ResourceState::Creating;

        let result = self
            .bounded(Operation::Create, &id, self.timeouts.create, async {
                self.remote_create(&namespace, &payload)
                    .await
                    .map_err(|e| remote_error::<K>(Operation::Create, &id, e))
            })
            .await;

        match result {
            Ok(created) => {
                data.record = projection::project::<K>(&created);
                data.id = Some(id);
                data.state = ResourceState::Present;
                Ok(())
            }
            Err(e) => {
                warn!("Failed to create {} {}: {}", kind::<K>(), id, e);
                data.state = ResourceState::Absent;
                Err(e)
            }
        }
    }

    /// Observe the remote object and report drift without changing `data`.
    pub async fn read(&self, data: &ResourceData) -> Result<ReadOutcome> {
        let Some(id) = data.id.as_deref() else {
            return Ok(ReadOutcome::NotFound);
        };
        if data.state == ResourceState::Absent {
            return Ok(ReadOutcome::NotFound);
        }
        let (namespace, name) = id::decompose(id)?;

        let fetched = self
            .bounded(Operation::Read, id, self.timeouts.read, async {
                Poll::from_store(self.remote_get(&namespace, &name).await)
                    .map_err(|e| remote_error::<K>(Operation::Read, id, e))
            })
            .await?;

        match fetched {
            Poll::NotFound => {
                debug!("{} {} not found", kind::<K>(), id);
                Ok(ReadOutcome::NotFound)
            }
            Poll::Found(object) => {
                let record = projection::project::<K>(&object);
                let drift = projection::diff(&K::schema(), &data.record, &record);
                if !drift.is_empty() {
                    let fields: Vec<&str> = drift.iter().map(|d| d.field.as_str()).collect();
                    info!("Detected drift on {} {}: {:?}", kind::<K>(), id, fields);
                }
                Ok(ReadOutcome::Observed { record, drift })
            }
        }
    }

    /// Read, then adopt the observed state into `data`.
    ///
    /// A remote object that has disappeared moves the instance to `Absent`.
    pub async fn refresh(&self, data: &mut ResourceData) -> Result<Vec<Drift>> {
        match self.read(data).await? {
            ReadOutcome::NotFound => {
                if let Some(id) = data.id.take() {
                    warn!("{} {} no longer exists", kind::<K>(), id);
                }
                data.state = ResourceState::Absent;
                Ok(Vec::new())
            }
            ReadOutcome::Observed { record, drift } => {
                data.record = record;
                Ok(drift)
            }
        }
    }

    /// Apply `desired` to an existing instance. Returns the fields that changed.
    ///
    /// Nothing is sent when no field changed. `namespace` and `name` cannot change.
    pub async fn update(&self, data: &mut ResourceData, desired: ConfigRecord) -> Result<Vec<Drift>> {
        let id = data.id.clone().unwrap_or_default();
        if data.state != ResourceState::Present || id.is_empty() {
            return Err(self.invalid_state(Operation::Update, &id, data.state));
        }

        let schema = K::schema();
        schema
            .validate(&desired)
            .map_err(|e| invalid::<K>(Operation::Update, &id, e))?;
        let (namespace, name) = id::decompose(&id)?;
        let (desired_namespace, desired_name) = identity(&schema, &desired);
        for (field, wanted, actual) in [
            ("namespace", &desired_namespace, &namespace),
            ("name", &desired_name, &name),
        ] {
            if wanted != actual {
                let err = ValidationError::ImmutableField(field.to_string());
                return Err(invalid::<K>(Operation::Update, &id, err));
            }
        }

        let changes = projection::diff(&schema, &data.record, &desired);
        if changes.is_empty() {
            debug!("No changes for {} {}", kind::<K>(), id);
            return Ok(changes);
        }

        let payload = projection::build::<K>(&desired, &namespace, &name)
            .map_err(|e| invalid::<K>(Operation::Update, &id, e))?;
        info!(
            "Updating {} {} ({} fields changed)",
            kind::<K>(),
            id,
            changes.len()
        );

        let updated = self
            .bounded(Operation::Update, &id, self.timeouts.update, async {
                let current = self
                    .remote_get(&namespace, &name)
                    .await
                    .map_err(|e| not_found_or_remote::<K>(Operation::Update, &id, e))?;
                let payload = K::prepare_update(carry_server_fields(payload, &current), &current);
                self.remote_update(&namespace, &payload)
                    .await
                    .map_err(|e| not_found_or_remote::<K>(Operation::Update, &id, e))
            })
            .await?;

        data.record = projection::project::<K>(&updated);
        Ok(changes)
    }

    /// Delete the remote object and wait until it is gone.
    ///
    /// The delete call and the wait share one deadline. Deleting an absent
    /// instance, or one whose remote object is already gone, succeeds.
    pub async fn delete(
        &self,
        data: &mut ResourceData,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(id) = data.id.clone() else {
            data.state = ResourceState::Absent;
            return Ok(());
        };
        if data.state == ResourceState::Absent {
            data.id = None;
            return Ok(());
        }
        let (namespace, name) = id::decompose(&id)?;

        info!("Deleting {} {}", kind::<K>(), id);
        data.state = ResourceState::Deleting;
        let limit = self.timeouts.delete;
        let deadline = deadline_after(limit);

        let deleted = self
            .bounded_until(Operation::Delete, &id, deadline, limit, async {
                match self.remote_delete(&namespace, &name).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_not_found() => {
                        debug!("{} {} already gone", kind::<K>(), id);
                        Ok(())
                    }
                    Err(e) => Err(remote_error::<K>(Operation::Delete, &id, e)),
                }
            })
            .await;
        if let Err(e) = deleted {
            data.state = ResourceState::Present;
            return Err(e);
        }

        let (ns, nm) = (namespace.as_str(), name.as_str());
        let remaining = deadline.saturating_duration_since(Instant::now());
        Waiter::new(self.poll_interval, remaining)
            .wait_until_gone(
                || async move { Poll::from_store(self.remote_get(ns, nm).await) },
                cancel,
            )
            .await
            .map_err(|e| match e {
                WaitError::Timeout(_) => WaitError::Timeout(limit),
                e => e,
            })
            .map_err(|e| wait_error::<K>(Operation::Delete, &id, e))?;

        info!("Deleted {} {}", kind::<K>(), id);
        data.id = None;
        data.state = ResourceState::Absent;
        Ok(())
    }

    /// Adopt an existing remote object by identifier.
    pub async fn import(&self, id: &str) -> Result<ResourceData> {
        let (namespace, name) = id::decompose(id)?;
        let object = self
            .bounded(Operation::Import, id, self.timeouts.read, async {
                self.remote_get(&namespace, &name)
                    .await
                    .map_err(|e| not_found_or_remote::<K>(Operation::Import, id, e))
            })
            .await?;

        info!("Imported {} {}", kind::<K>(), id);
        Ok(ResourceData {
            id: Some(id.to_string()),
            record: projection::project::<K>(&object),
            state: ResourceState::Present,
        })
    }

    async fn bounded<T>(
        &self,
        operation: Operation,
        id: &str,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.bounded_until(operation, id, deadline_after(limit), limit, fut)
            .await
    }

    /// Run `fut` until `deadline`; a timeout reports the full `limit`.
    async fn bounded_until<T>(
        &self,
        operation: Operation,
        id: &str,
        deadline: Instant,
        limit: Duration,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                operation,
                kind: kind::<K>(),
                id: id.to_string(),
                elapsed: limit,
            }),
        }
    }

    fn invalid_state(&self, operation: Operation, id: &str, state: ResourceState) -> ProviderError {
        ProviderError::InvalidState {
            operation,
            kind: kind::<K>(),
            id: id.to_string(),
            state,
        }
    }

    async fn remote_create(&self, namespace: &str, object: &K::Remote) -> client::Result<K::Remote> {
        RemoteStore::<K::Remote>::create(self.store.as_ref(), namespace, object).await
    }

    async fn remote_get(&self, namespace: &str, name: &str) -> client::Result<K::Remote> {
        RemoteStore::<K::Remote>::get(self.store.as_ref(), namespace, name).await
    }

    async fn remote_update(&self, namespace: &str, object: &K::Remote) -> client::Result<K::Remote> {
        RemoteStore::<K::Remote>::update(self.store.as_ref(), namespace, object).await
    }

    async fn remote_delete(&self, namespace: &str, name: &str) -> client::Result<()> {
        RemoteStore::<K::Remote>::delete(self.store.as_ref(), namespace, name).await
    }
}

/// Identifier a record will have once created.
pub fn record_id<K: ResourceKind>(record: &ConfigRecord) -> Result<String> {
    let (namespace, name) = identity(&K::schema(), record);
    id::compose(&namespace, &name)
}

fn kind<K: ResourceKind>() -> &'static str {
    <K::Remote as ApiResource>::KIND
}

/// `(namespace, name)` of a record, after defaults.
fn identity(schema: &Schema, record: &ConfigRecord) -> (String, String) {
    let filled = schema.with_defaults(record);
    let text = |key: &str| {
        filled
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    (text("namespace"), text("name"))
}

fn remote_error<K: ResourceKind>(operation: Operation, id: &str, source: StoreError) -> ProviderError {
    ProviderError::Remote {
        operation,
        kind: kind::<K>(),
        id: id.to_string(),
        source,
    }
}

fn invalid<K: ResourceKind>(operation: Operation, id: &str, source: ValidationError) -> ProviderError {
    ProviderError::Validation {
        operation,
        kind: kind::<K>(),
        id: id.to_string(),
        source,
    }
}

fn not_found_or_remote<K: ResourceKind>(
    operation: Operation,
    id: &str,
    source: StoreError,
) -> ProviderError {
    if source.is_not_found() {
        ProviderError::NotFound {
            operation,
            kind: kind::<K>(),
            id: id.to_string(),
        }
    } else {
        remote_error::<K>(operation, id, source)
    }
}

fn wait_error<K: ResourceKind>(operation: Operation, id: &str, err: WaitError) -> ProviderError {
    let (kind, id) = (kind::<K>(), id.to_string());
    match err {
        WaitError::Timeout(elapsed) => ProviderError::Timeout {
            operation,
            kind,
            id,
            elapsed,
        },
        WaitError::Cancelled => ProviderError::Cancelled {
            operation,
            kind,
            id,
        },
        WaitError::Poll(source) => ProviderError::PollError {
            operation,
            kind,
            id,
            source,
        },
    }
}

/// Copy server-owned metadata and labels/annotations the provider does not manage.
fn carry_server_fields<R: ApiResource>(mut payload: R, current: &R) -> R {
    let current_meta = current.metadata();
    let meta = payload.metadata_mut();
    meta.uid = current_meta.uid.clone();
    meta.resource_version = current_meta.resource_version.clone();
    meta.creation_timestamp = current_meta.creation_timestamp.clone();

    for (key, value) in &current_meta.labels {
        if !key.starts_with(TAG_LABEL_PREFIX) {
            meta.labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    for (key, value) in &current_meta.annotations {
        if key != DESCRIPTION_ANNOTATION {
            meta.annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
    payload
}

/// Check that `value` is one of the accepted values of an enumerated field.
pub(crate) fn one_of(field: &str, value: &str, allowed: &[&str]) -> std::result::Result<(), ValidationError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::invalid(
            field,
            format!("{value:?} is not one of {}", allowed.join(", ")),
        ))
    }
}

/// Map user tags onto prefixed labels.
pub fn tags_to_labels(tags: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    tags.iter()
        .map(|(k, v)| (format!("{TAG_LABEL_PREFIX}{k}"), v.clone()))
        .collect()
}

/// Recover user tags from prefixed labels, ignoring all other labels.
pub fn labels_to_tags(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(TAG_LABEL_PREFIX)
                .map(|tag| (tag.to_string(), v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::loadbalancer::LoadBalancer;
    use crate::resource::vm::VirtualMachine;
    use crate::test_util::{record, test_timeouts, MemoryStore, StoreOp, TEST_POLL_INTERVAL};
    use serde_json::json;

    type LbAdapter = ResourceAdapter<LoadBalancerKind, MemoryStore<LoadBalancer>>;
    type VmAdapter = ResourceAdapter<VirtualMachineKind, MemoryStore<VirtualMachine>>;

    fn lb_store() -> Arc<MemoryStore<LoadBalancer>> {
        Arc::new(MemoryStore::new().with_defaulter(|lb: &mut LoadBalancer| {
            if lb.status.address.is_empty() {
                lb.status.address = "10.0.0.10".to_string();
            }
        }))
    }

    fn lb_adapter(store: &Arc<MemoryStore<LoadBalancer>>) -> LbAdapter {
        ResourceAdapter::new(store.clone(), test_timeouts(), TEST_POLL_INTERVAL)
    }

    fn vm_adapter(store: &Arc<MemoryStore<VirtualMachine>>) -> VmAdapter {
        ResourceAdapter::new(store.clone(), test_timeouts(), TEST_POLL_INTERVAL)
    }

    fn lb1() -> ConfigRecord {
        record(json!({
            "namespace": "default",
            "name": "lb1",
            "listener": [{"name": "http", "port": 80, "backend_port": 8080}]
        }))
    }

    fn vm1(memory: &str) -> ConfigRecord {
        record(json!({
            "name": "vm1",
            "memory": memory,
            "tags": {"Foobar": "barfoo"},
            "disk": [{"name": "rootdisk", "boot_order": 1, "image": "ubuntu-24.04"}]
        }))
    }

    /// Every key supplied in `supplied` has the same value in `projected`, recursing into blocks.
    fn assert_reproduces(supplied: &ConfigRecord, projected: &ConfigRecord) {
        for (key, value) in supplied {
            match (value, &projected[key]) {
                (Value::Array(want), Value::Array(got)) if want.iter().all(Value::is_object) => {
                    assert_eq!(want.len(), got.len(), "{key}");
                    for (w, g) in want.iter().zip(got) {
                        assert_reproduces(
                            w.as_object().unwrap(),
                            g.as_object().unwrap(),
                        );
                    }
                }
                (want, got) => assert_eq!(want, got, "{key}"),
            }
        }
    }

    #[tokio::test]
    async fn test_create() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let mut data = ResourceData::new(lb1());

        adapter.create(&mut data).await.unwrap();

        assert_eq!(data.id.as_deref(), Some("default/lb1"));
        assert_eq!(data.state, ResourceState::Present);
        assert_eq!(data.record["ip_address"], json!("10.0.0.10"));
        assert_eq!(data.record["workload_type"], json!("vm"));
        assert_eq!(store.count(StoreOp::Create).await, 1);
        assert!(store.object("default", "lb1").await.is_some());
    }

    #[tokio::test]
    async fn test_create_then_project_reproduces_input() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let supplied = record(json!({
            "name": "lb2",
            "description": "public frontend",
            "tags": {"env": "prod"},
            "ipam": "dhcp",
            "listener": [
                {"name": "http", "port": 80, "backend_port": 8080},
                {"name": "dns", "port": 53, "protocol": "UDP", "backend_port": 5353}
            ],
            "backend_selector": [{"key": "app", "values": ["web", "api"]}],
            "healthcheck": [{"port": 8080, "failure_threshold": 5}]
        }));
        let mut data = ResourceData::new(supplied.clone());

        adapter.create(&mut data).await.unwrap();

        assert_reproduces(&supplied, &data.record);
        assert_eq!(data.record["namespace"], json!("default"));
        assert_eq!(data.id.as_deref(), Some("default/lb2"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_record() {
        let store = lb_store();
        let adapter = lb_adapter(&store);

        let mut data = ResourceData::new(record(json!({"name": "lb1"})));
        let err = adapter.create(&mut data).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Validation {
                operation: Operation::Create,
                ref id,
                source: ValidationError::MissingField(ref f),
                ..
            } if f == "listener" && id == "default/lb1"
        ));
        assert!(err.to_string().starts_with("create LoadBalancer default/lb1"));

        let mut r = lb1();
        r.insert("name".to_string(), json!("a/b"));
        let err = adapter.create(&mut ResourceData::new(r)).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidIdentity(_)));

        assert_eq!(data.state, ResourceState::Absent);
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_stays_absent() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        store
            .fail_next(StoreOp::Create, StoreError::Conflict("lb1 exists".to_string()))
            .await;

        let mut data = ResourceData::new(lb1());
        let err = adapter.create(&mut data).await.unwrap_err();

        match err {
            ProviderError::Remote {
                operation, id, source, ..
            } => {
                assert_eq!(operation, Operation::Create);
                assert_eq!(id, "default/lb1");
                assert!(matches!(source, StoreError::Conflict(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(data.state, ResourceState::Absent);
        assert_eq!(data.id, None);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_twice_is_invalid_state() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();

        let err = adapter.create(&mut data).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::InvalidState {
                operation: Operation::Create,
                state: ResourceState::Present,
                ..
            }
        ));
        assert_eq!(store.count(StoreOp::Create).await, 1);
    }

    #[tokio::test]
    async fn test_read_absent_makes_no_call() {
        let store = lb_store();
        let adapter = lb_adapter(&store);

        let outcome = adapter.read(&ResourceData::new(lb1())).await.unwrap();
        assert_eq!(outcome, ReadOutcome::NotFound);
        assert!(store.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_reports_drift_without_mutating() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();

        match adapter.read(&data).await.unwrap() {
            ReadOutcome::Observed { drift, .. } => assert!(drift.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }

        store
            .modify("default", "lb1", |lb| lb.spec.listeners[0].port = 8443)
            .await;
        let before = data.clone();

        let ReadOutcome::Observed { record, drift } = adapter.read(&data).await.unwrap() else {
            panic!("expected observed");
        };
        assert_eq!(data, before);
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].field, "listener");
        assert_eq!(record["listener"][0]["port"], json!(8443));

        let drift = adapter.refresh(&mut data).await.unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(data.record["listener"][0]["port"], json!(8443));
        assert_eq!(data.state, ResourceState::Present);
    }

    #[tokio::test]
    async fn test_read_after_external_delete() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();
        store.remove("default", "lb1").await;

        assert_eq!(adapter.read(&data).await.unwrap(), ReadOutcome::NotFound);
        assert_eq!(data.state, ResourceState::Present);

        adapter.refresh(&mut data).await.unwrap();
        assert_eq!(data.state, ResourceState::Absent);
        assert_eq!(data.id, None);
    }

    #[tokio::test]
    async fn test_read_surfaces_remote_errors() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();
        store
            .fail_next(StoreOp::Get, StoreError::Internal("etcd down".to_string()))
            .await;

        let err = adapter.read(&data).await.unwrap_err();
        assert!(matches!(err, ProviderError::Remote { operation: Operation::Read, .. }));
        assert!(err.to_string().contains("default/lb1"));
        assert!(err.to_string().contains("etcd down"));
    }

    #[tokio::test]
    async fn test_update_memory() {
        let store = Arc::new(MemoryStore::new());
        let adapter = vm_adapter(&store);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();
        let uid = store.object("default", "vm1").await.unwrap().metadata.uid;

        let changes = adapter.update(&mut data, vm1("2Gi")).await.unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "memory");
        assert_eq!(data.record["memory"], json!("2Gi"));
        assert_eq!(data.state, ResourceState::Present);

        let stored = store.object("default", "vm1").await.unwrap();
        assert_eq!(stored.spec.memory, "2Gi");
        assert_eq!(stored.metadata.uid, uid);
        assert_eq!(
            stored.metadata.labels.get("tag.mvirt.io/Foobar").map(String::as_str),
            Some("barfoo")
        );
    }

    #[tokio::test]
    async fn test_update_keeps_foreign_labels() {
        let store = Arc::new(MemoryStore::new());
        let adapter = vm_adapter(&store);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();
        store
            .modify("default", "vm1", |vm| {
                vm.metadata
                    .labels
                    .insert("mvirt.io/node".to_string(), "node-1".to_string());
                vm.status.printable_status = "Running".to_string();
            })
            .await;

        adapter.update(&mut data, vm1("2Gi")).await.unwrap();

        let stored = store.object("default", "vm1").await.unwrap();
        assert_eq!(
            stored.metadata.labels.get("mvirt.io/node").map(String::as_str),
            Some("node-1")
        );
        assert_eq!(stored.status.printable_status, "Running");
        assert_eq!(data.record["state"], json!("Running"));
    }

    #[tokio::test]
    async fn test_update_without_changes_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let adapter = vm_adapter(&store);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();

        let changes = adapter.update(&mut data, vm1("1Gi")).await.unwrap();

        assert!(changes.is_empty());
        assert_eq!(store.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_identity_change() {
        let store = Arc::new(MemoryStore::new());
        let adapter = vm_adapter(&store);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();

        let mut renamed = vm1("1Gi");
        renamed.insert("name".to_string(), json!("vm2"));
        let err = adapter.update(&mut data, renamed).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Validation {
                operation: Operation::Update,
                source: ValidationError::ImmutableField(ref f),
                ..
            } if f == "name"
        ));
        assert!(err.to_string().contains("update VirtualMachine default/vm1"));

        let mut moved = vm1("1Gi");
        moved.insert("namespace".to_string(), json!("prod"));
        let err = adapter.update(&mut data, moved).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Validation {
                source: ValidationError::ImmutableField(ref f),
                ..
            } if f == "namespace"
        ));
    }

    #[tokio::test]
    async fn test_update_requires_present() {
        let store = Arc::new(MemoryStore::new());
        let adapter = vm_adapter(&store);
        let mut data = ResourceData::new(vm1("1Gi"));

        let err = adapter.update(&mut data, vm1("2Gi")).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::InvalidState {
                operation: Operation::Update,
                state: ResourceState::Absent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_update_of_vanished_object() {
        let store = Arc::new(MemoryStore::new());
        let adapter = vm_adapter(&store);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();
        store.remove("default", "vm1").await;

        let err = adapter.update(&mut data, vm1("2Gi")).await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NotFound {
                operation: Operation::Update,
                ref id,
                ..
            } if id == "default/vm1"
        ));
        assert_eq!(err.to_string(), "update VirtualMachine default/vm1: not found");
    }

    #[tokio::test]
    async fn test_delete_twice_succeeds() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();

        adapter.delete(&mut data, &mut cancel).await.unwrap();
        assert_eq!(data.state, ResourceState::Absent);
        assert_eq!(data.id, None);
        assert!(store.is_empty().await);

        adapter.delete(&mut data, &mut cancel).await.unwrap();
        assert_eq!(data.state, ResourceState::Absent);
        assert_eq!(store.count(StoreOp::Delete).await, 1);
    }

    #[tokio::test]
    async fn test_delete_already_gone_remotely() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();
        store.remove("default", "lb1").await;

        adapter.delete(&mut data, &mut cancel).await.unwrap();
        assert_eq!(data.state, ResourceState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_waits_until_gone() {
        let store = Arc::new(MemoryStore::new().with_delete_lag(3));
        let adapter = vm_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();

        adapter.delete(&mut data, &mut cancel).await.unwrap();

        assert_eq!(data.state, ResourceState::Absent);
        assert_eq!(store.count(StoreOp::Get).await, 4);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_wait_times_out() {
        let store = Arc::new(MemoryStore::new().with_delete_lag(u32::MAX));
        let adapter = vm_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();

        let err = adapter.delete(&mut data, &mut cancel).await.unwrap_err();

        assert!(matches!(
            err,
            ProviderError::Timeout {
                operation: Operation::Delete,
                ..
            }
        ));
        assert_eq!(data.state, ResourceState::Deleting);
        assert_eq!(data.id.as_deref(), Some("default/vm1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_delete_shares_deadline_with_wait() {
        let store = Arc::new(
            MemoryStore::new()
                .with_delete_lag(u32::MAX)
                .with_delete_latency(Duration::from_secs(4)),
        );
        let adapter = vm_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();
        let start = Instant::now();

        let err = adapter.delete(&mut data, &mut cancel).await.unwrap_err();

        let limit = test_timeouts().delete;
        assert!(matches!(
            err,
            ProviderError::Timeout {
                operation: Operation::Delete,
                elapsed,
                ..
            } if elapsed == limit
        ));
        assert!(start.elapsed() <= limit);
        assert!(store.count(StoreOp::Get).await > 0);
        assert_eq!(data.state, ResourceState::Deleting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_call_exceeding_deadline() {
        let store = Arc::new(MemoryStore::new().with_delete_latency(Duration::from_secs(6)));
        let adapter = vm_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();
        let start = Instant::now();

        let err = adapter.delete(&mut data, &mut cancel).await.unwrap_err();

        assert!(matches!(err, ProviderError::Timeout { operation: Operation::Delete, .. }));
        assert_eq!(start.elapsed(), test_timeouts().delete);
        assert_eq!(store.count(StoreOp::Get).await, 0);
    }

    #[tokio::test]
    async fn test_delete_cancelled() {
        let store = Arc::new(MemoryStore::new().with_delete_lag(u32::MAX));
        let adapter = vm_adapter(&store);
        let (tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(vm1("1Gi"));
        adapter.create(&mut data).await.unwrap();
        tx.send(true).unwrap();

        let err = adapter.delete(&mut data, &mut cancel).await.unwrap_err();

        assert!(matches!(err, ProviderError::Cancelled { .. }));
        assert_eq!(store.count(StoreOp::Delete).await, 1);
    }

    #[tokio::test]
    async fn test_delete_failure_returns_to_present() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();
        store
            .fail_next(
                StoreOp::Delete,
                StoreError::Api {
                    status: 500,
                    message: "finalizer stuck".to_string(),
                },
            )
            .await;

        let err = adapter.delete(&mut data, &mut cancel).await.unwrap_err();

        assert!(matches!(err, ProviderError::Remote { operation: Operation::Delete, .. }));
        assert_eq!(data.state, ResourceState::Present);
        assert_eq!(data.id.as_deref(), Some("default/lb1"));
    }

    #[tokio::test]
    async fn test_delete_poll_error() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let (_tx, mut cancel) = watch::channel(false);
        let mut data = ResourceData::new(lb1());
        adapter.create(&mut data).await.unwrap();
        store
            .fail_next(StoreOp::Get, StoreError::Internal("boom".to_string()))
            .await;

        let err = adapter.delete(&mut data, &mut cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::PollError { operation: Operation::Delete, .. }));
    }

    #[tokio::test]
    async fn test_import() {
        let store = lb_store();
        let adapter = lb_adapter(&store);
        let mut source = ResourceData::new(lb1());
        adapter.create(&mut source).await.unwrap();

        let imported = adapter.import("default/lb1").await.unwrap();
        assert_eq!(imported.state, ResourceState::Present);
        assert_eq!(imported.id.as_deref(), Some("default/lb1"));
        assert_eq!(imported.record, source.record);

        assert!(matches!(
            adapter.import("default/lb9").await,
            Err(ProviderError::NotFound {
                operation: Operation::Import,
                ..
            })
        ));
        assert!(matches!(
            adapter.import("lb1").await,
            Err(ProviderError::MalformedIdentifier(_))
        ));
    }

    #[test]
    fn test_tags_round_trip() {
        let mut tags = BTreeMap::new();
        tags.insert("Foobar".to_string(), "barfoo".to_string());
        let mut meta = ObjectMeta::new("default", "vm1");
        meta.labels = tags_to_labels(&tags);
        meta.labels
            .insert("mvirt.io/node".to_string(), "node-1".to_string());

        assert_eq!(
            meta.labels.get("tag.mvirt.io/Foobar").map(String::as_str),
            Some("barfoo")
        );
        assert_eq!(labels_to_tags(&meta), tags);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ResourceState::Present.to_string(), "present");
        assert_eq!(ResourceState::default(), ResourceState::Absent);
    }
}
