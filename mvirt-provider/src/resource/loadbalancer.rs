//! `mvirt_loadbalancer`: layer-4 load balancer in front of VMs or a cluster.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{
    identity_fields, labels_to_tags, one_of, tags_to_labels, ResourceKind, DESCRIPTION_ANNOTATION,
};
use crate::client::{api_version, ApiResource, ObjectMeta};
use crate::schema::{Field, FieldType, Schema, ValidationError};

// ============================================================================
// Remote object
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: LoadBalancerSpec,
    #[serde(default)]
    pub status: LoadBalancerStatus,
}

impl ApiResource for LoadBalancer {
    const GROUP: &'static str = "loadbalancer.mvirt.io";
    const VERSION: &'static str = "v1beta1";
    const KIND: &'static str = "LoadBalancer";
    const PLURAL: &'static str = "loadbalancers";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    #[serde(default)]
    pub workload_type: String,
    #[serde(default)]
    pub ipam: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_pool: Option<String>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_server_selector: Vec<BackendSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    pub port: i64,
    pub protocol: String,
    pub backend_port: i64,
}

/// Backends match when label `key` has one of `values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSelector {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub port: i64,
    pub success_threshold: i64,
    pub failure_threshold: i64,
    pub period_seconds: i64,
    pub timeout_seconds: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Allocated frontend address.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub ready: bool,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub namespace: String,
    pub name: String,
    pub description: String,
    pub tags: BTreeMap<String, String>,
    pub workload_type: String,
    pub ipam: String,
    pub ip_pool: String,
    pub listener: Vec<ListenerConfig>,
    pub backend_selector: Vec<BackendSelectorConfig>,
    pub healthcheck: Vec<HealthCheckConfig>,
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub name: String,
    pub port: i64,
    pub protocol: String,
    pub backend_port: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSelectorConfig {
    pub key: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub port: i64,
    pub success_threshold: i64,
    pub failure_threshold: i64,
    pub period_seconds: i64,
    pub timeout_seconds: i64,
}

pub const WORKLOAD_TYPES: &[&str] = &["vm", "cluster"];
pub const IPAM_MODES: &[&str] = &["pool", "dhcp"];
pub const PROTOCOLS: &[&str] = &["TCP", "UDP"];

pub struct LoadBalancerKind;

impl ResourceKind for LoadBalancerKind {
    type Remote = LoadBalancer;
    type Config = LoadBalancerConfig;

    const TYPE_NAME: &'static str = "mvirt_loadbalancer";

    fn schema() -> Schema {
        let listener = Schema::new()
            .field(Field::required("name", FieldType::String))
            .field(Field::required("port", FieldType::Integer))
            .field(Field::optional("protocol", FieldType::String).with_default("TCP"))
            .field(Field::required("backend_port", FieldType::Integer));

        let backend_selector = Schema::new()
            .field(Field::required("key", FieldType::String))
            .field(Field::required("values", FieldType::StringList));

        let healthcheck = Schema::new()
            .field(Field::required("port", FieldType::Integer))
            .field(Field::optional("success_threshold", FieldType::Integer).with_default(1))
            .field(Field::optional("failure_threshold", FieldType::Integer).with_default(3))
            .field(Field::optional("period_seconds", FieldType::Integer).with_default(5))
            .field(Field::optional("timeout_seconds", FieldType::Integer).with_default(3));

        identity_fields(Schema::new())
            .field(Field::optional("description", FieldType::String))
            .field(Field::optional("tags", FieldType::StringMap))
            .field(Field::optional("workload_type", FieldType::String).with_default("vm"))
            .field(Field::optional("ipam", FieldType::String).with_default("pool"))
            .field(Field::optional("ip_pool", FieldType::String))
            .field(Field::required("listener", FieldType::Block(listener)))
            .field(Field::optional(
                "backend_selector",
                FieldType::Block(backend_selector),
            ))
            .field(Field::optional("healthcheck", FieldType::Block(healthcheck)))
            .field(Field::computed("ip_address", FieldType::String))
    }

    fn validate(config: &LoadBalancerConfig) -> Result<(), ValidationError> {
        one_of("workload_type", &config.workload_type, WORKLOAD_TYPES)?;
        one_of("ipam", &config.ipam, IPAM_MODES)?;
        if config.ipam == "dhcp" && !config.ip_pool.is_empty() {
            return Err(ValidationError::invalid(
                "ip_pool",
                "cannot be set when ipam is dhcp",
            ));
        }

        if config.listener.is_empty() {
            return Err(ValidationError::invalid(
                "listener",
                "at least one listener is required",
            ));
        }
        let mut names = HashSet::new();
        for (i, l) in config.listener.iter().enumerate() {
            let field = |f: &str| format!("listener.{i}.{f}");
            if !names.insert(l.name.as_str()) {
                return Err(ValidationError::invalid(
                    field("name"),
                    format!("duplicate listener name {:?}", l.name),
                ));
            }
            port(&field("port"), l.port)?;
            port(&field("backend_port"), l.backend_port)?;
            one_of(&field("protocol"), &l.protocol, PROTOCOLS)?;
        }

        for (i, s) in config.backend_selector.iter().enumerate() {
            if s.key.is_empty() {
                return Err(ValidationError::invalid(
                    format!("backend_selector.{i}.key"),
                    "must not be empty",
                ));
            }
        }

        match config.healthcheck.as_slice() {
            [] => {}
            [hc] => {
                port("healthcheck.0.port", hc.port)?;
                for (name, value) in [
                    ("success_threshold", hc.success_threshold),
                    ("failure_threshold", hc.failure_threshold),
                    ("period_seconds", hc.period_seconds),
                    ("timeout_seconds", hc.timeout_seconds),
                ] {
                    if value < 1 {
                        return Err(ValidationError::invalid(
                            format!("healthcheck.0.{name}"),
                            "must be at least 1",
                        ));
                    }
                }
            }
            _ => {
                return Err(ValidationError::invalid(
                    "healthcheck",
                    "at most one healthcheck block is allowed",
                ))
            }
        }
        Ok(())
    }

    fn to_payload(config: &LoadBalancerConfig, namespace: &str, name: &str) -> LoadBalancer {
        let mut metadata = ObjectMeta::new(namespace, name);
        metadata.labels = tags_to_labels(&config.tags);
        if !config.description.is_empty() {
            metadata
                .annotations
                .insert(DESCRIPTION_ANNOTATION.to_string(), config.description.clone());
        }

        LoadBalancer {
            api_version: api_version::<LoadBalancer>(),
            kind: LoadBalancer::KIND.to_string(),
            metadata,
            spec: LoadBalancerSpec {
                workload_type: config.workload_type.clone(),
                ipam: config.ipam.clone(),
                ip_pool: (!config.ip_pool.is_empty()).then(|| config.ip_pool.clone()),
                listeners: config
                    .listener
                    .iter()
                    .map(|l| Listener {
                        name: l.name.clone(),
                        port: l.port,
                        protocol: l.protocol.clone(),
                        backend_port: l.backend_port,
                    })
                    .collect(),
                backend_server_selector: config
                    .backend_selector
                    .iter()
                    .map(|s| BackendSelector {
                        key: s.key.clone(),
                        values: s.values.clone(),
                    })
                    .collect(),
                health_check: config.healthcheck.first().map(|hc| HealthCheck {
                    port: hc.port,
                    success_threshold: hc.success_threshold,
                    failure_threshold: hc.failure_threshold,
                    period_seconds: hc.period_seconds,
                    timeout_seconds: hc.timeout_seconds,
                }),
            },
            status: LoadBalancerStatus::default(),
        }
    }

    fn from_remote(lb: &LoadBalancer) -> LoadBalancerConfig {
        let spec = &lb.spec;
        LoadBalancerConfig {
            namespace: lb.metadata.namespace.clone(),
            name: lb.metadata.name.clone(),
            description: lb
                .metadata
                .annotations
                .get(DESCRIPTION_ANNOTATION)
                .cloned()
                .unwrap_or_default(),
            tags: labels_to_tags(&lb.metadata),
            workload_type: spec.workload_type.clone(),
            ipam: spec.ipam.clone(),
            ip_pool: spec.ip_pool.clone().unwrap_or_default(),
            listener: spec
                .listeners
                .iter()
                .map(|l| ListenerConfig {
                    name: l.name.clone(),
                    port: l.port,
                    protocol: l.protocol.clone(),
                    backend_port: l.backend_port,
                })
                .collect(),
            backend_selector: spec
                .backend_server_selector
                .iter()
                .map(|s| BackendSelectorConfig {
                    key: s.key.clone(),
                    values: s.values.clone(),
                })
                .collect(),
            healthcheck: spec
                .health_check
                .iter()
                .map(|hc| HealthCheckConfig {
                    port: hc.port,
                    success_threshold: hc.success_threshold,
                    failure_threshold: hc.failure_threshold,
                    period_seconds: hc.period_seconds,
                    timeout_seconds: hc.timeout_seconds,
                })
                .collect(),
            ip_address: lb.status.address.clone(),
        }
    }

    fn prepare_update(mut payload: LoadBalancer, current: &LoadBalancer) -> LoadBalancer {
        payload.status = current.status.clone();
        payload
    }
}

fn port(field: &str, value: i64) -> Result<(), ValidationError> {
    if (1..=65535).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::invalid(
            field,
            format!("port {value} out of range 1-65535"),
        ))
    }
}
