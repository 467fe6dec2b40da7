//! Strongly-typed identifiers used across the sync subsystem.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Identifier of an entity in the local commerce system.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(i64);

/// Identifier assigned by the remote fulfillment provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl LocalId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for LocalId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for LocalId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for LocalId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| SyncError::permanent(format!("LocalId: {e}")))
    }
}

impl RemoteId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RemoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RemoteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of entity kept in sync with the provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Order,
    Product,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Order => "order",
            EntityType::Product => "product",
        }
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "order" | "orders" => Ok(EntityType::Order),
            "product" | "products" => Ok(EntityType::Product),
            other => Err(SyncError::permanent(format!("unknown entity type: {other}"))),
        }
    }
}

/// Stable key of the entity a job touches; the unit of lock exclusion.
///
/// Inbound jobs whose remote entity is not yet correlated lock on the remote
/// identifier so that concurrent imports of the same remote entity serialize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKey {
    Local { entity_type: EntityType, id: LocalId },
    Remote { entity_type: EntityType, id: RemoteId },
}

impl EntityKey {
    pub fn local(entity_type: EntityType, id: LocalId) -> Self {
        Self::Local { entity_type, id }
    }

    pub fn remote(entity_type: EntityType, id: RemoteId) -> Self {
        Self::Remote { entity_type, id }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityKey::Local { entity_type, .. } | EntityKey::Remote { entity_type, .. } => {
                *entity_type
            }
        }
    }
}

impl core::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EntityKey::Local { entity_type, id } => write!(f, "{entity_type}:{id}"),
            EntityKey::Remote { entity_type, id } => write!(f, "{entity_type}:remote:{id}"),
        }
    }
}
