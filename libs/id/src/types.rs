//! Typed identifier definitions.
//!
//! Machine ids are allocated by the state store in increasing order; instance
//! ids are opaque strings chosen by the infrastructure provider; entity tags
//! name the principal an agent authenticates as.

use crate::define_id;
use crate::IdError;

// =============================================================================
// Machines and Instances
// =============================================================================

define_id!(MachineId, "machine id", validate_machine_id);
define_id!(InstanceId, "instance id", validate_instance_id);

impl MachineId {
    /// Creates the machine id for a store sequence number.
    #[must_use]
    pub fn from_index(index: u64) -> Self {
        Self(index.to_string())
    }

    /// Returns the numeric value of the id.
    #[must_use]
    pub fn index(&self) -> u64 {
        // Validation guarantees a decimal that fits: see validate_machine_id.
        self.0.parse().unwrap_or_default()
    }
}

fn validate_machine_id(s: &str) -> Result<(), &'static str> {
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err("expected a non-negative integer");
    }
    if s.len() > 1 && s.starts_with('0') {
        return Err("leading zeros are not allowed");
    }
    if s.parse::<u64>().is_err() {
        return Err("value out of range");
    }
    Ok(())
}

fn validate_instance_id(s: &str) -> Result<(), &'static str> {
    if s.chars().any(char::is_whitespace) {
        return Err("whitespace is not allowed");
    }
    Ok(())
}

// =============================================================================
// Entity Tags
// =============================================================================

/// Kinds of entity an agent can run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Machine,
}

impl EntityKind {
    /// Tag prefix for this kind.
    pub const fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Machine => "machine",
        }
    }
}

/// Identity of an agent principal, formatted as `{kind}-{id}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityTag {
    kind: EntityKind,
    id: MachineId,
}

impl EntityTag {
    /// Tag for a machine agent.
    #[must_use]
    pub fn machine(id: &MachineId) -> Self {
        Self {
            kind: EntityKind::Machine,
            id: id.clone(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The machine this tag refers to.
    #[must_use]
    pub fn machine_id(&self) -> &MachineId {
        &self.id
    }

    /// Parses a tag such as `machine-3`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind: "entity tag" });
        }
        let Some((prefix, id)) = s.split_once('-') else {
            return Err(IdError::MissingSeparator(s.to_string()));
        };
        match prefix {
            "machine" => Ok(Self::machine(&MachineId::parse(id)?)),
            _ => Err(IdError::UnknownKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for EntityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.kind.prefix(), self.id)
    }
}

impl std::str::FromStr for EntityTag {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for EntityTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for EntityTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
