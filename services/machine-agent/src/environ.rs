//! Environment configuration held in the state store.
//!
//! The store keeps the configuration as a free-form attribute map so an
//! operator can write anything into it; [`EnvironConfig::from_attrs`] is the
//! single place that decides whether those attributes are usable.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::tools::Version;

/// Raw configuration attributes as stored.
pub type ConfigAttrs = BTreeMap<String, Value>;

/// Series used for new instances when the configuration names none.
pub const DEFAULT_SERIES: &str = "precise";

/// Validation failures for environment configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} attribute is missing")]
    Missing(&'static str),

    #[error("{key} attribute must be {expected}, got {actual}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
        actual: String,
    },

    #[error("{key} attribute cannot be empty")]
    Empty { key: &'static str },

    #[error("agent-version {0:?} is not a valid version")]
    InvalidVersion(String),
}

/// A validated environment configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironConfig {
    /// Environment name.
    pub name: String,

    /// Provider type.
    pub kind: String,

    /// Series for new instances.
    pub default_series: String,

    /// Tools version agents should be running, if one has been proposed.
    pub agent_version: Option<Version>,

    /// All attributes, including ones the agent doesn't interpret.
    pub attrs: ConfigAttrs,
}

impl EnvironConfig {
    /// Validate raw attributes.
    pub fn from_attrs(attrs: &ConfigAttrs) -> Result<Self, ConfigError> {
        let name = required_string(attrs, "name")?;
        let kind = required_string(attrs, "type")?;
        let default_series = optional_string(attrs, "default-series")?
            .unwrap_or_else(|| DEFAULT_SERIES.to_string());
        let agent_version = optional_string(attrs, "agent-version")?
            .map(|v| v.parse().map_err(|_| ConfigError::InvalidVersion(v)))
            .transpose()?;

        Ok(Self {
            name,
            kind,
            default_series,
            agent_version,
            attrs: attrs.clone(),
        })
    }
}

fn required_string(attrs: &ConfigAttrs, key: &'static str) -> Result<String, ConfigError> {
    optional_string(attrs, key)?.ok_or(ConfigError::Missing(key))
}

fn optional_string(attrs: &ConfigAttrs, key: &'static str) -> Result<Option<String>, ConfigError> {
    match attrs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Err(ConfigError::Empty { key }),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ConfigError::WrongType {
            key,
            expected: "a string",
            actual: other.to_string(),
        }),
    }
}

/// Build attributes from `(key, value)` pairs.
pub fn attrs<I, K>(pairs: I) -> ConfigAttrs
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
