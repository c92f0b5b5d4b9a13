//! Mapping registry.
//!
//! Holds one inbound and one outbound [`TopicResolutionTree`] per tenant and
//! is the entry point for mapping administration: every mapping is validated
//! before it reaches a tree, updates replace a mapping atomically from the
//! caller's point of view. Mapping ids are unique per tenant across both
//! directions.

use dashmap::DashMap;
use dynmap_core::{Direction, Mapping};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::tree::TopicResolutionTree;
use crate::validator::{self, ValidationError};

/// Summary of a bulk load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Ids of the mappings that were added.
    pub loaded: Vec<String>,
    /// Mappings that were rejected, with the reason.
    pub rejected: Vec<(String, RegistryError)>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Per-tenant mapping trees.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    inbound: DashMap<String, Arc<TopicResolutionTree>>,
    outbound: DashMap<String, Arc<TopicResolutionTree>>,
    /// Serialises add/update/delete so the id uniqueness check and the
    /// insert happen together.
    admin: Mutex<()>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn trees(&self, direction: Direction) -> &DashMap<String, Arc<TopicResolutionTree>> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// The tree of `tenant` for `direction`, created on first use.
    pub fn tree(&self, tenant: &str, direction: Direction) -> Arc<TopicResolutionTree> {
        self.trees(direction)
            .entry(tenant.to_string())
            .or_insert_with(|| {
                debug!(tenant = %tenant, ?direction, "Creating topic tree");
                Arc::new(TopicResolutionTree::new(tenant))
            })
            .clone()
    }

    fn existing_tree(&self, tenant: &str, direction: Direction) -> Option<Arc<TopicResolutionTree>> {
        self.trees(direction).get(tenant).map(|t| t.value().clone())
    }

    /// Static checks only; the registry is not changed.
    pub fn validate(&self, mapping: &Mapping) -> Vec<ValidationError> {
        validator::validate(mapping)
    }

    /// Validate `mapping` and add it to the tree of its direction.
    pub fn add_mapping(&self, tenant: &str, mapping: Mapping) -> Result<Arc<Mapping>> {
        self.check(&mapping)?;
        let _guard = self.admin.lock();
        if self.locate(tenant, &mapping.id).is_some() {
            return Err(RegistryError::Duplicate(mapping.id.clone()));
        }
        let mapping = Arc::new(mapping);
        self.tree(tenant, mapping.direction)
            .add_mapping(mapping.clone())?;
        info!(
            tenant = %tenant,
            mapping_id = %mapping.id,
            topic = %mapping.routing_topic(),
            "Mapping added"
        );
        Ok(mapping)
    }

    /// Replace the mapping with the same id. When the new definition cannot be
    /// inserted the previous one is restored.
    pub fn update_mapping(&self, tenant: &str, mapping: Mapping) -> Result<Arc<Mapping>> {
        self.check(&mapping)?;
        let _guard = self.admin.lock();
        let (old_tree, old) = self
            .locate(tenant, &mapping.id)
            .ok_or_else(|| RegistryError::NotFound(mapping.id.clone()))?;

        if !old_tree.delete_mapping(&old) {
            warn!(
                tenant = %tenant,
                mapping_id = %old.id,
                topic = %old.routing_topic(),
                "Previous mapping was not found at its topic during update"
            );
        }
        let mapping = Arc::new(mapping);
        let new_tree = self.tree(tenant, mapping.direction);
        if let Err(e) = new_tree.add_mapping(mapping.clone()) {
            warn!(
                tenant = %tenant,
                mapping_id = %mapping.id,
                error = %e,
                "Update rejected, restoring previous mapping"
            );
            if let Err(restore) = old_tree.add_mapping(old) {
                warn!(tenant = %tenant, error = %restore, "Could not restore previous mapping");
            }
            return Err(e.into());
        }

        info!(tenant = %tenant, mapping_id = %mapping.id, "Mapping updated");
        Ok(mapping)
    }

    /// Remove the mapping with `id` from whichever tree holds it.
    pub fn delete_mapping(&self, tenant: &str, id: &str) -> Result<Arc<Mapping>> {
        let _guard = self.admin.lock();
        let (tree, mapping) = self
            .locate(tenant, id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if !tree.delete_mapping(&mapping) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        info!(tenant = %tenant, mapping_id = %id, "Mapping deleted");
        Ok(mapping)
    }

    pub fn get(&self, tenant: &str, id: &str) -> Option<Arc<Mapping>> {
        self.locate(tenant, id).map(|(_, m)| m)
    }

    /// All mappings of `tenant`, inbound first.
    pub fn mappings(&self, tenant: &str) -> Vec<Arc<Mapping>> {
        [Direction::Inbound, Direction::Outbound]
            .into_iter()
            .filter_map(|d| self.existing_tree(tenant, d))
            .flat_map(|t| t.mappings())
            .collect()
    }

    /// Inbound mappings matching `topic`.
    pub fn resolve(&self, tenant: &str, topic: &str) -> Vec<Arc<Mapping>> {
        self.existing_tree(tenant, Direction::Inbound)
            .map(|t| t.resolve(topic))
            .unwrap_or_default()
    }

    /// Outbound mappings whose publish topic matches `topic`.
    pub fn resolve_outbound(&self, tenant: &str, topic: &str) -> Vec<Arc<Mapping>> {
        self.existing_tree(tenant, Direction::Outbound)
            .map(|t| t.resolve(topic))
            .unwrap_or_default()
    }

    /// Tenants with at least one tree, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self
            .inbound
            .iter()
            .chain(self.outbound.iter())
            .map(|e| e.key().clone())
            .collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }

    /// Add every mapping of a JSON array. Invalid mappings are reported and
    /// skipped, the others are added.
    pub fn load_from_str(&self, tenant: &str, content: &str) -> Result<LoadReport> {
        let mappings: Vec<Mapping> =
            serde_json::from_str(content).map_err(|e| RegistryError::Load(e.to_string()))?;

        let mut report = LoadReport::default();
        for mapping in mappings {
            let id = mapping.id.clone();
            match self.add_mapping(tenant, mapping) {
                Ok(_) => report.loaded.push(id),
                Err(e) => {
                    warn!(tenant = %tenant, mapping_id = %id, error = %e, "Skipping mapping");
                    report.rejected.push((id, e));
                }
            }
        }
        Ok(report)
    }

    /// Load a mapping file (a JSON array of mappings).
    pub fn load_from_file(&self, tenant: &str, path: impl AsRef<Path>) -> Result<LoadReport> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::Load(format!("{}: {}", path.display(), e)))?;
        let report = self.load_from_str(tenant, &content)?;
        info!(
            tenant = %tenant,
            path = %path.display(),
            loaded = report.loaded.len(),
            rejected = report.rejected.len(),
            "Loaded mapping file"
        );
        Ok(report)
    }

    fn check(&self, mapping: &Mapping) -> Result<()> {
        let violations = validator::validate(mapping);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Invalid {
                mapping_id: mapping.id.clone(),
                violations,
            })
        }
    }

    fn locate(&self, tenant: &str, id: &str) -> Option<(Arc<TopicResolutionTree>, Arc<Mapping>)> {
        [Direction::Inbound, Direction::Outbound]
            .into_iter()
            .filter_map(|d| self.existing_tree(tenant, d))
            .find_map(|t| t.find(id).map(|m| (t, m)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynmap_core::config::tokens::IDENTITY_EXTERNAL_ID;
    use dynmap_core::Substitution;

    fn mapping(id: &str, topic: &str) -> Mapping {
        Mapping::new(id, topic)
            .with_id(id)
            .with_external_id("c8y_Serial")
            .with_substitution(Substitution::new("$.id", IDENTITY_EXTERNAL_ID))
    }

    #[test]
    fn test_add_and_resolve() {
        let registry = MappingRegistry::new();
        registry.add_mapping("t1", mapping("m1", "a/+")).unwrap();
        assert_eq!(registry.resolve("t1", "a/b").len(), 1);
        assert!(registry.resolve("t2", "a/b").is_empty());
        assert_eq!(registry.tenants(), vec!["t1".to_string()]);
    }

    #[test]
    fn test_invalid_mapping_reports_all_violations() {
        let registry = MappingRegistry::new();
        let mut bad = mapping("m1", "a/#/b/#");
        bad.substitutions.clear();
        bad.target_template = "{".to_string();

        let err = registry.add_mapping("t1", bad).unwrap_err();
        let RegistryError::Invalid { violations, .. } = err else {
            panic!("expected validation failure");
        };
        assert_eq!(violations.len(), 4);
        assert!(registry.mappings("t1").is_empty());
    }

    #[test]
    fn test_update_moves_topic() {
        let registry = MappingRegistry::new();
        registry.add_mapping("t1", mapping("m1", "a/b")).unwrap();
        registry.update_mapping("t1", mapping("m1", "x/y")).unwrap();
        assert!(registry.resolve("t1", "a/b").is_empty());
        assert_eq!(registry.resolve("t1", "x/y")[0].id, "m1");
    }

    #[test]
    fn test_update_rolls_back_on_conflict() {
        let registry = MappingRegistry::new();
        registry.add_mapping("t1", mapping("m1", "a/b")).unwrap();
        registry.add_mapping("t1", mapping("m2", "x/y")).unwrap();

        let err = registry.update_mapping("t1", mapping("m1", "x/y/z")).unwrap_err();
        assert!(matches!(err, RegistryError::Resolution(_)));
        assert_eq!(registry.resolve("t1", "a/b")[0].id, "m1");
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let registry = MappingRegistry::new();
        registry.add_mapping("t1", mapping("m1", "a/b")).unwrap();

        let err = registry.add_mapping("t1", mapping("m1", "c/d")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref id) if id == "m1"));

        let mut outbound = mapping("m1", "x/y").with_direction(Direction::Outbound);
        outbound.publish_topic = Some("evt/x".to_string());
        assert!(matches!(
            registry.add_mapping("t1", outbound),
            Err(RegistryError::Duplicate(_))
        ));

        assert_eq!(registry.mappings("t1").len(), 1);
        assert!(registry.resolve("t1", "c/d").is_empty());
        // Ids only need to be unique within a tenant.
        registry.add_mapping("t2", mapping("m1", "c/d")).unwrap();
    }

    #[test]
    fn test_load_reports_duplicate_ids() {
        let registry = MappingRegistry::new();
        let content =
            serde_json::to_string(&vec![mapping("m1", "a/b"), mapping("m1", "c/d")]).unwrap();
        let report = registry.load_from_str("t1", &content).unwrap();
        assert_eq!(report.loaded, vec!["m1".to_string()]);
        assert!(matches!(report.rejected[0].1, RegistryError::Duplicate(_)));
    }

    #[test]
    fn test_update_unknown_mapping() {
        let registry = MappingRegistry::new();
        assert!(matches!(
            registry.update_mapping("t1", mapping("m1", "a/b")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete() {
        let registry = MappingRegistry::new();
        registry.add_mapping("t1", mapping("m1", "a/b")).unwrap();
        assert_eq!(registry.delete_mapping("t1", "m1").unwrap().id, "m1");
        assert!(matches!(
            registry.delete_mapping("t1", "m1"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_outbound_tree_is_separate() {
        let registry = MappingRegistry::new();
        let mut outbound = mapping("out", "a/b").with_direction(Direction::Outbound);
        outbound.publish_topic = Some("evt/+".to_string());
        registry.add_mapping("t1", outbound).unwrap();
        registry.add_mapping("t1", mapping("in", "evt/x")).unwrap();

        assert_eq!(registry.resolve_outbound("t1", "evt/x")[0].id, "out");
        assert_eq!(registry.resolve("t1", "evt/x")[0].id, "in");
        assert_eq!(registry.get("t1", "out").unwrap().id, "out");
    }

    #[test]
    fn test_load_from_str_keeps_valid_mappings() {
        let registry = MappingRegistry::new();
        let content = serde_json::to_string(&vec![
            mapping("m1", "a/b"),
            mapping("m2", "a/b/c"),
            mapping("m3", "d/#"),
        ])
        .unwrap();
        let report = registry.load_from_str("t1", &content).unwrap();
        assert_eq!(report.loaded, vec!["m1".to_string(), "m3".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_load_from_str_malformed() {
        let registry = MappingRegistry::new();
        assert!(matches!(
            registry.load_from_str("t1", "{"),
            Err(RegistryError::Load(_))
        ));
    }
}
