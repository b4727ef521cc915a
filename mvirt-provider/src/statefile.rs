//! Local state file and resource definition files.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use mvirt_provider::{ConfigRecord, ResourceData, ResourceState};

const STATE_VERSION: u32 = 1;

/// One managed instance in the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(flatten)]
    pub data: ResourceData,
}

/// What `apply` does for a definition.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyStep {
    Create,
    Update(ResourceData),
}

/// Managed instances keyed by address (`<type>.<namespace>/<name>`).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    pub resources: BTreeMap<String, StateEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl StateFile {
    /// Load the state file, starting empty if it does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let mut state = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<StateFile>(&bytes)
                .with_context(|| format!("Failed to parse state file {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", path.display());
                StateFile::default()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state file {}", path.display()))
            }
        };
        state.path = path.to_path_buf();
        Ok(state)
    }

    /// Write the state file atomically.
    pub async fn save(&mut self) -> Result<()> {
        self.version = STATE_VERSION;
        let json = serde_json::to_vec_pretty(&*self)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    pub fn address(type_name: &str, id: &str) -> String {
        format!("{type_name}.{id}")
    }

    pub fn get(&self, address: &str) -> Option<&StateEntry> {
        self.resources.get(address)
    }

    pub fn insert(&mut self, address: String, type_name: &str, data: ResourceData) {
        self.resources.insert(
            address,
            StateEntry {
                type_name: type_name.to_string(),
                data,
            },
        );
    }

    pub fn remove(&mut self, address: &str) -> Option<StateEntry> {
        self.resources.remove(address)
    }

    /// Decide how to apply a definition at `address`.
    ///
    /// An interrupted destroy must finish first: its object may still exist.
    pub fn apply_step(&self, address: &str) -> Result<ApplyStep> {
        let Some(entry) = self.get(address) else {
            return Ok(ApplyStep::Create);
        };
        match entry.data.state {
            ResourceState::Present => Ok(ApplyStep::Update(entry.data.clone())),
            ResourceState::Deleting => bail!(
                "{} is being destroyed; run destroy again before applying",
                address
            ),
            ResourceState::Absent | ResourceState::Creating => Ok(ApplyStep::Create),
        }
    }
}

/// A resource definition: `{"type": "mvirt_virtualmachine", "config": {...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Definition {
    #[serde(rename = "type")]
    pub type_name: String,
    pub config: ConfigRecord,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionFile {
    One(Definition),
    Many(Vec<Definition>),
}

/// Load one definition or a list of definitions from a JSON file.
pub async fn load_definitions(path: &Path) -> Result<Vec<Definition>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: DefinitionFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse definitions in {}", path.display()))?;
    Ok(match file {
        DefinitionFile::One(d) => vec![d],
        DefinitionFile::Many(ds) => ds,
    })
}
