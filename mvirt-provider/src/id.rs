//! Resource identifiers.
//!
//! A resource is addressed by `<namespace>/<name>`. Both parts are passed
//! through verbatim; the only rule is that neither is empty and neither
//! contains the separator.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProviderError, Result};

/// Reserved separator between namespace and name.
pub const SEPARATOR: char = '/';

/// Compose the external identifier for `(namespace, name)`.
pub fn compose(namespace: &str, name: &str) -> Result<String> {
    check_part("namespace", namespace)?;
    check_part("name", name)?;
    Ok(format!("{namespace}{SEPARATOR}{name}"))
}

/// Split an external identifier back into `(namespace, name)`.
pub fn decompose(id: &str) -> Result<(String, String)> {
    let mut parts = id.split(SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace.to_string(), name.to_string()))
        }
        _ => Err(ProviderError::MalformedIdentifier(id.to_string())),
    }
}

fn check_part(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ProviderError::InvalidIdentity(format!("{what} is empty")));
    }
    if value.contains(SEPARATOR) {
        return Err(ProviderError::InvalidIdentity(format!(
            "{what} {value:?} contains '{SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Validated `(namespace, name)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let (namespace, name) = (namespace.into(), name.into());
        check_part("namespace", &namespace)?;
        check_part("name", &name)?;
        Ok(Self { namespace, name })
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = decompose(s)?;
        Ok(Self { namespace, name })
    }
}
