//! `mvirt_virtualmachine`: virtual machine with network interfaces and disks.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{
    identity_fields, labels_to_tags, one_of, tags_to_labels, ResourceKind, DESCRIPTION_ANNOTATION,
};
use crate::client::{api_version, ApiResource, ObjectMeta};
use crate::schema::{Field, FieldType, Schema, ValidationError};

pub const RUN_STRATEGIES: &[&str] = &["Always", "RerunOnFailure", "Manual", "Halted"];
pub const MACHINE_TYPES: &[&str] = &["q35", "pc"];
pub const INTERFACE_MODELS: &[&str] = &["virtio", "e1000", "e1000e", "rtl8139"];
pub const INTERFACE_TYPES: &[&str] = &["bridge", "masquerade"];
pub const DISK_TYPES: &[&str] = &["disk", "cd-rom"];
pub const DISK_BUSES: &[&str] = &["virtio", "sata", "scsi"];

// ============================================================================
// Remote object
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl ApiResource for VirtualMachine {
    const GROUP: &'static str = "vm.mvirt.io";
    const VERSION: &'static str = "v1";
    const KIND: &'static str = "VirtualMachine";
    const PLURAL: &'static str = "virtualmachines";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default)]
    pub run_strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub machine_type: String,
    pub cpu_cores: i64,
    /// Memory as a quantity string (`2Gi`).
    pub memory: String,
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    #[serde(default)]
    pub disks: Vec<Disk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    pub name: String,
    /// Empty for the management network.
    #[serde(default)]
    pub network_name: String,
    pub model: String,
    #[serde(rename = "type")]
    pub interface_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub name: String,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub bus: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default)]
    pub printable_status: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub ready: bool,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineConfig {
    pub namespace: String,
    pub name: String,
    pub description: String,
    pub tags: BTreeMap<String, String>,
    pub cpu: i64,
    pub memory: String,
    pub hostname: String,
    pub machine_type: String,
    pub run_strategy: String,
    pub network_interface: Vec<NetworkInterfaceConfig>,
    pub disk: Vec<DiskConfig>,
    pub state: String,
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaceConfig {
    pub name: String,
    pub network_name: String,
    pub model: String,
    #[serde(rename = "type")]
    pub interface_type: String,
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub size: String,
    pub bus: String,
    /// 0 means not bootable.
    pub boot_order: i64,
    pub container_image_name: String,
    pub image: String,
    pub auto_delete: bool,
}

pub struct VirtualMachineKind;

impl ResourceKind for VirtualMachineKind {
    type Remote = VirtualMachine;
    type Config = VirtualMachineConfig;

    const TYPE_NAME: &'static str = "mvirt_virtualmachine";

    fn schema() -> Schema {
        let network_interface = Schema::new()
            .field(Field::required("name", FieldType::String))
            .field(Field::optional("network_name", FieldType::String))
            .field(Field::optional("model", FieldType::String).with_default("virtio"))
            .field(Field::optional("type", FieldType::String).with_default("bridge"))
            .field(Field::optional("mac_address", FieldType::String));

        let disk = Schema::new()
            .field(Field::required("name", FieldType::String))
            .field(Field::optional("type", FieldType::String).with_default("disk"))
            .field(Field::optional("size", FieldType::String))
            .field(Field::optional("bus", FieldType::String).with_default("virtio"))
            .field(Field::optional("boot_order", FieldType::Integer))
            .field(Field::optional("container_image_name", FieldType::String))
            .field(Field::optional("image", FieldType::String))
            .field(Field::optional("auto_delete", FieldType::Boolean).with_default(true));

        identity_fields(Schema::new())
            .field(Field::optional("description", FieldType::String))
            .field(Field::optional("tags", FieldType::StringMap))
            .field(Field::optional("cpu", FieldType::Integer).with_default(1))
            .field(Field::optional("memory", FieldType::String).with_default("1Gi"))
            .field(Field::optional("hostname", FieldType::String))
            .field(Field::optional("machine_type", FieldType::String).with_default("q35"))
            .field(
                Field::optional("run_strategy", FieldType::String).with_default("RerunOnFailure"),
            )
            .field(Field::optional(
                "network_interface",
                FieldType::Block(network_interface),
            ))
            .field(Field::optional("disk", FieldType::Block(disk)))
            .field(Field::computed("state", FieldType::String))
            .field(Field::computed("node_name", FieldType::String))
    }

    fn validate(config: &VirtualMachineConfig) -> Result<(), ValidationError> {
        if config.cpu < 1 {
            return Err(ValidationError::invalid("cpu", "must be at least 1"));
        }
        match parse_quantity(&config.memory) {
            Some(bytes) if bytes > 0 => {}
            _ => {
                return Err(ValidationError::invalid(
                    "memory",
                    format!("invalid quantity {:?}", config.memory),
                ))
            }
        }
        one_of("machine_type", &config.machine_type, MACHINE_TYPES)?;
        one_of("run_strategy", &config.run_strategy, RUN_STRATEGIES)?;

        let mut names = HashSet::new();
        for (i, nic) in config.network_interface.iter().enumerate() {
            let field = |f: &str| format!("network_interface.{i}.{f}");
            if !names.insert(nic.name.as_str()) {
                return Err(ValidationError::invalid(
                    field("name"),
                    format!("duplicate interface name {:?}", nic.name),
                ));
            }
            one_of(&field("model"), &nic.model, INTERFACE_MODELS)?;
            one_of(&field("type"), &nic.interface_type, INTERFACE_TYPES)?;
            if !nic.mac_address.is_empty() && !is_mac_address(&nic.mac_address) {
                return Err(ValidationError::invalid(
                    field("mac_address"),
                    format!("invalid MAC address {:?}", nic.mac_address),
                ));
            }
        }

        let mut names = HashSet::new();
        let mut boot_orders = HashSet::new();
        for (i, disk) in config.disk.iter().enumerate() {
            let field = |f: &str| format!("disk.{i}.{f}");
            if !names.insert(disk.name.as_str()) {
                return Err(ValidationError::invalid(
                    field("name"),
                    format!("duplicate disk name {:?}", disk.name),
                ));
            }
            one_of(&field("type"), &disk.disk_type, DISK_TYPES)?;
            one_of(&field("bus"), &disk.bus, DISK_BUSES)?;
            if disk.boot_order < 0 {
                return Err(ValidationError::invalid(
                    field("boot_order"),
                    "must not be negative",
                ));
            }
            if disk.boot_order > 0 && !boot_orders.insert(disk.boot_order) {
                return Err(ValidationError::invalid(
                    field("boot_order"),
                    format!("boot order {} is already used", disk.boot_order),
                ));
            }
            match (disk.container_image_name.is_empty(), disk.image.is_empty()) {
                (false, false) => {
                    return Err(ValidationError::invalid(
                        field("image"),
                        "conflicts with container_image_name",
                    ))
                }
                (true, true) if disk.size.is_empty() => {
                    return Err(ValidationError::invalid(
                        field("size"),
                        "required for an empty volume",
                    ))
                }
                _ => {}
            }
            if !disk.size.is_empty() && parse_quantity(&disk.size).is_none() {
                return Err(ValidationError::invalid(
                    field("size"),
                    format!("invalid quantity {:?}", disk.size),
                ));
            }
        }
        Ok(())
    }

    fn to_payload(config: &VirtualMachineConfig, namespace: &str, name: &str) -> VirtualMachine {
        let mut metadata = ObjectMeta::new(namespace, name);
        metadata.labels = tags_to_labels(&config.tags);
        if !config.description.is_empty() {
            metadata
                .annotations
                .insert(DESCRIPTION_ANNOTATION.to_string(), config.description.clone());
        }

        VirtualMachine {
            api_version: api_version::<VirtualMachine>(),
            kind: VirtualMachine::KIND.to_string(),
            metadata,
            spec: VirtualMachineSpec {
                run_strategy: config.run_strategy.clone(),
                hostname: non_empty(&config.hostname),
                machine_type: config.machine_type.clone(),
                cpu_cores: config.cpu,
                memory: config.memory.clone(),
                interfaces: config
                    .network_interface
                    .iter()
                    .map(|nic| Interface {
                        name: nic.name.clone(),
                        network_name: nic.network_name.clone(),
                        model: nic.model.clone(),
                        interface_type: nic.interface_type.clone(),
                        mac_address: non_empty(&nic.mac_address),
                    })
                    .collect(),
                disks: config
                    .disk
                    .iter()
                    .map(|d| Disk {
                        name: d.name.clone(),
                        disk_type: d.disk_type.clone(),
                        bus: d.bus.clone(),
                        boot_order: (d.boot_order > 0).then_some(d.boot_order),
                        size: non_empty(&d.size),
                        container_image: non_empty(&d.container_image_name),
                        image: non_empty(&d.image),
                        auto_delete: d.auto_delete,
                    })
                    .collect(),
            },
            status: VirtualMachineStatus::default(),
        }
    }

    fn from_remote(vm: &VirtualMachine) -> VirtualMachineConfig {
        let spec = &vm.spec;
        VirtualMachineConfig {
            namespace: vm.metadata.namespace.clone(),
            name: vm.metadata.name.clone(),
            description: vm
                .metadata
                .annotations
                .get(DESCRIPTION_ANNOTATION)
                .cloned()
                .unwrap_or_default(),
            tags: labels_to_tags(&vm.metadata),
            cpu: spec.cpu_cores,
            memory: spec.memory.clone(),
            hostname: spec.hostname.clone().unwrap_or_default(),
            machine_type: spec.machine_type.clone(),
            run_strategy: spec.run_strategy.clone(),
            network_interface: spec
                .interfaces
                .iter()
                .map(|nic| NetworkInterfaceConfig {
                    name: nic.name.clone(),
                    network_name: nic.network_name.clone(),
                    model: nic.model.clone(),
                    interface_type: nic.interface_type.clone(),
                    mac_address: nic.mac_address.clone().unwrap_or_default(),
                })
                .collect(),
            disk: spec
                .disks
                .iter()
                .map(|d| DiskConfig {
                    name: d.name.clone(),
                    disk_type: d.disk_type.clone(),
                    size: d.size.clone().unwrap_or_default(),
                    bus: d.bus.clone(),
                    boot_order: d.boot_order.unwrap_or_default(),
                    container_image_name: d.container_image.clone().unwrap_or_default(),
                    image: d.image.clone().unwrap_or_default(),
                    auto_delete: d.auto_delete,
                })
                .collect(),
            state: vm.status.printable_status.clone(),
            node_name: vm.status.node_name.clone(),
        }
    }

    fn prepare_update(mut payload: VirtualMachine, current: &VirtualMachine) -> VirtualMachine {
        payload.status = current.status.clone();
        payload
    }
}

/// Parse a binary or decimal quantity (`512Mi`, `2Gi`, `1G`, `1048576`) into bytes.
pub fn parse_quantity(s: &str) -> Option<u64> {
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() {
        return None;
    }
    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        _ => return None,
    };
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

fn is_mac_address(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
