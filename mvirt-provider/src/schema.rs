//! Configuration schema and record validation.
//!
//! A configuration record is the flat, weakly-typed form of a resource's
//! configuration: field name to JSON value. Each resource kind declares a
//! [`Schema`] listing the accepted fields, their types, whether they are
//! required and what value applies when they are absent.

use serde_json::{Map, Value};
use thiserror::Error;

/// Flat mapping from field name to value.
pub type ConfigRecord = Map<String, Value>;

/// Errors raised when a configuration record does not satisfy its schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field {0}")]
    MissingField(String),

    #[error("unknown field {0}")]
    UnknownField(String),

    #[error("field {field}: expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("field {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("field {0} cannot be changed after creation")]
    ImmutableField(String),

    #[error("invalid configuration: {0}")]
    Decode(String),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Declared type of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    StringList,
    StringMap,
    /// Repeated nested block; each item is a record of the inner schema.
    Block(Schema),
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::StringList => "list of strings",
            FieldType::StringMap => "map of strings",
            FieldType::Block(_) => "list of blocks",
        }
    }

    /// Value used when an optional field is absent and declares no default.
    pub fn zero(&self) -> Value {
        match self {
            FieldType::String => Value::String(String::new()),
            FieldType::Integer => Value::from(0),
            FieldType::Boolean => Value::Bool(false),
            FieldType::StringList | FieldType::Block(_) => Value::Array(Vec::new()),
            FieldType::StringMap => Value::Object(Map::new()),
        }
    }
}

/// Whether a field must, may, or cannot be supplied by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    /// Set from the remote object only; ignored on input.
    Computed,
}

/// A single declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub presence: Presence,
    pub default: Option<Value>,
}

impl Field {
    pub fn required(name: &'static str, ty: FieldType) -> Self {
        Self::new(name, ty, Presence::Required)
    }

    pub fn optional(name: &'static str, ty: FieldType) -> Self {
        Self::new(name, ty, Presence::Optional)
    }

    pub fn computed(name: &'static str, ty: FieldType) -> Self {
        Self::new(name, ty, Presence::Computed)
    }

    fn new(name: &'static str, ty: FieldType, presence: Presence) -> Self {
        Self {
            name,
            ty,
            presence,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Declared default, or the type's zero value.
    pub fn default_value(&self) -> Value {
        self.default.clone().unwrap_or_else(|| self.ty.zero())
    }
}

/// Ordered set of declared fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Check keys, required fields and value types, recursing into blocks.
    pub fn validate(&self, record: &ConfigRecord) -> Result<(), ValidationError> {
        self.validate_at("", record)
    }

    fn validate_at(&self, prefix: &str, record: &ConfigRecord) -> Result<(), ValidationError> {
        if let Some(key) = record.keys().find(|k| !self.contains(k)) {
            return Err(ValidationError::UnknownField(path(prefix, key)));
        }

        for field in &self.fields {
            if field.presence == Presence::Computed {
                continue;
            }
            let field_path = path(prefix, field.name);
            match record.get(field.name) {
                None | Some(Value::Null) => {
                    if field.presence == Presence::Required {
                        return Err(ValidationError::MissingField(field_path));
                    }
                }
                Some(value) => check_type(&field_path, &field.ty, value)?,
            }
        }
        Ok(())
    }

    /// Fill absent or null fields with their default, recursing into blocks.
    pub fn with_defaults(&self, record: &ConfigRecord) -> ConfigRecord {
        let mut out = ConfigRecord::new();
        for field in &self.fields {
            let value = match record.get(field.name) {
                None | Some(Value::Null) => field.default_value(),
                Some(Value::Array(items)) => match &field.ty {
                    FieldType::Block(inner) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(obj) => Value::Object(inner.with_defaults(obj)),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    _ => Value::Array(items.clone()),
                },
                Some(value) => value.clone(),
            };
            out.insert(field.name.to_string(), value);
        }
        out
    }

    /// Drop computed fields and undeclared keys.
    pub fn strip_computed(&self, record: &ConfigRecord) -> ConfigRecord {
        record
            .iter()
            .filter(|(k, _)| {
                self.get(k)
                    .is_some_and(|f| f.presence != Presence::Computed)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_type(field: &str, ty: &FieldType, value: &Value) -> Result<(), ValidationError> {
    let mismatch = || ValidationError::TypeMismatch {
        field: field.to_string(),
        expected: ty.name(),
        found: json_type(value),
    };

    match ty {
        FieldType::String if value.is_string() => Ok(()),
        FieldType::Integer if value.is_i64() || value.is_u64() => Ok(()),
        FieldType::Boolean if value.is_boolean() => Ok(()),
        FieldType::StringList => match value {
            Value::Array(items) if items.iter().all(Value::is_string) => Ok(()),
            _ => Err(mismatch()),
        },
        FieldType::StringMap => match value {
            Value::Object(map) if map.values().all(Value::is_string) => Ok(()),
            _ => Err(mismatch()),
        },
        FieldType::Block(inner) => {
            let Value::Array(items) = value else {
                return Err(mismatch());
            };
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{field}.{i}");
                match item {
                    Value::Object(obj) => inner.validate_at(&item_path, obj)?,
                    other => {
                        return Err(ValidationError::TypeMismatch {
                            field: item_path,
                            expected: "block",
                            found: json_type(other),
                        })
                    }
                }
            }
            Ok(())
        }
        _ => Err(mismatch()),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
