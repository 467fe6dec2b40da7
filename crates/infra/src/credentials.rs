//! Credential Store and Config Store collaborators.
//!
//! How secrets are persisted is not this crate's concern; it only reads them
//! through these narrow interfaces.

use std::collections::HashMap;
use std::sync::RwLock;

/// Bearer token for the provider API.
pub const API_TOKEN: &str = "api_token";
/// Shared secret for webhook signatures.
pub const WEBHOOK_SECRET: &str = "webhook_secret";
/// Provider shop the integration is connected to.
pub const SHOP_ID: &str = "shop_id";

pub trait CredentialStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Option<String>;
    fn set_secret(&self, key: &str, value: &str);
}

pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// Process-local key/value store, usable for both secrets and settings.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    values: RwLock<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(self, key: &str, value: impl Into<String>) -> Self {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.into());
        self
    }

    /// Seed `key` from environment variable `var` when it is set and non-empty.
    pub fn with_env(self, key: &str, var: &str) -> Self {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => self.with(key, value),
            _ => self,
        }
    }

    fn read(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap()
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn write(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }
}

impl std::fmt::Debug for InMemoryKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print values: this type holds secrets.
        let keys: Vec<String> = self.values.read().unwrap().keys().cloned().collect();
        f.debug_struct("InMemoryKeyValueStore").field("keys", &keys).finish()
    }
}

impl CredentialStore for InMemoryKeyValueStore {
    fn get_secret(&self, key: &str) -> Option<String> {
        self.read(key)
    }

    fn set_secret(&self, key: &str, value: &str) {
        self.write(key, value)
    }
}

impl ConfigStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.read(key)
    }

    fn set(&self, key: &str, value: &str) {
        self.write(key, value)
    }
}
