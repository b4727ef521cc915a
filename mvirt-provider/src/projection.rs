//! Mapping between remote objects and configuration records.
//!
//! `project` turns a remote object into the flat record the caller sees;
//! `build` turns a record into a creation payload. The typed configuration
//! struct of each kind sits in the middle: records are deserialized into it
//! and remote objects are converted through it.

use serde_json::Value;

use crate::resource::ResourceKind;
use crate::schema::{ConfigRecord, Presence, Schema, ValidationError};

/// A field whose value differs between two records.
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub field: String,
    pub local: Value,
    pub remote: Value,
}

/// Project a remote object onto every field of the kind's schema.
///
/// Fields the remote object does not carry get their declared default or
/// zero value. Never fails.
pub fn project<K: ResourceKind>(remote: &K::Remote) -> ConfigRecord {
    let observed = match serde_json::to_value(K::from_remote(remote)) {
        Ok(Value::Object(map)) => map,
        _ => ConfigRecord::new(),
    };
    K::schema().with_defaults(&observed)
}

/// Build a creation payload for `namespace/name` from a configuration record.
pub fn build<K: ResourceKind>(
    record: &ConfigRecord,
    namespace: &str,
    name: &str,
) -> Result<K::Remote, ValidationError> {
    let schema = K::schema();
    schema.validate(record)?;

    let mut input = schema.strip_computed(record);
    input.insert("namespace".to_string(), Value::from(namespace));
    input.insert("name".to_string(), Value::from(name));

    let config: K::Config = serde_json::from_value(Value::Object(schema.with_defaults(&input)))
        .map_err(|e| ValidationError::Decode(e.to_string()))?;
    K::validate(&config)?;

    Ok(K::to_payload(&config, namespace, name))
}

/// Fields (excluding computed ones) whose values differ between `local` and `remote`.
///
/// Both records are compared after defaults are applied, so an absent field
/// and a field holding its default are equal.
pub fn diff(schema: &Schema, local: &ConfigRecord, remote: &ConfigRecord) -> Vec<Drift> {
    let local = schema.with_defaults(local);
    let remote = schema.with_defaults(remote);

    schema
        .fields()
        .iter()
        .filter(|f| f.presence != Presence::Computed)
        .filter_map(|f| {
            let (l, r) = (&local[f.name], &remote[f.name]);
            (l != r).then(|| Drift {
                field: f.name.to_string(),
                local: l.clone(),
                remote: r.clone(),
            })
        })
        .collect()
}
