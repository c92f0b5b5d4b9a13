//! Device identity resolution.
//!
//! Inbound messages name their device by an external id (serial number, MAC
//! address, ...). Before a document is emitted the external id is translated
//! into the internal id of the device.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::DynmapError;

/// Translates external device ids into internal ones.
#[async_trait]
pub trait DeviceIdentityResolver: Send + Sync {
    /// The internal id registered for `external_id` of `external_id_type`, or
    /// `None` when the device is unknown.
    async fn resolve(
        &self,
        tenant: &str,
        external_id_type: &str,
        external_id: &str,
    ) -> Result<Option<String>, DynmapError>;
}

/// Resolver backed by an in-memory table.
///
/// Entries are keyed by `(external_id_type, external_id)`; entries added
/// without a type match any type.
#[derive(Debug, Default)]
pub struct InMemoryIdentityResolver {
    entries: DashMap<(String, String), String>,
}

impl InMemoryIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `internal_id` for `external_id` of `external_id_type`.
    pub fn register(
        &self,
        external_id_type: impl Into<String>,
        external_id: impl Into<String>,
        internal_id: impl Into<String>,
    ) {
        self.entries
            .insert((external_id_type.into(), external_id.into()), internal_id.into());
    }

    /// Register `internal_id` for `external_id` regardless of its type.
    pub fn register_any(&self, external_id: impl Into<String>, internal_id: impl Into<String>) {
        self.register(String::new(), external_id, internal_id);
    }

    /// Build a resolver from a JSON object `{ "externalId": "internalId" }`.
    pub fn from_json(content: &str) -> Result<Self, DynmapError> {
        let table: HashMap<String, String> = serde_json::from_str(content)?;
        let resolver = Self::new();
        for (external, internal) in table {
            resolver.register_any(external, internal);
        }
        Ok(resolver)
    }

    /// Load a JSON identity table from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DynmapError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| DynmapError::Io(format!("{}: {}", path.display(), e)))?;
        let resolver = Self::from_json(&content)?;
        info!(
            path = %path.display(),
            entries = resolver.len(),
            "Loaded device identities"
        );
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DeviceIdentityResolver for InMemoryIdentityResolver {
    async fn resolve(
        &self,
        tenant: &str,
        external_id_type: &str,
        external_id: &str,
    ) -> Result<Option<String>, DynmapError> {
        let typed = (external_id_type.to_string(), external_id.to_string());
        let untyped = (String::new(), external_id.to_string());
        let found = self
            .entries
            .get(&typed)
            .or_else(|| self.entries.get(&untyped))
            .map(|e| e.value().clone());
        debug!(
            tenant = %tenant,
            external_id_type = %external_id_type,
            external_id = %external_id,
            found = found.is_some(),
            "Resolved device identity"
        );
        Ok(found)
    }
}
