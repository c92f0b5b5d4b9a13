//! Inbound message processing.
//!
//! For every mapping a topic resolves to, the processor extracts each
//! substitution from the payload, classifies and caches the values, merges
//! them into the target template and resolves the device identity. A failure
//! in one mapping is recorded in its [`MappingOutcome`] and never stops the
//! other mappings of the same message.

use chrono::{DateTime, Utc};
use dynmap_core::config::tokens::{IDENTITY_EXTERNAL_ID, TOPIC_LEVEL};
use dynmap_core::topic::split_excluding_separator;
use dynmap_core::{Direction, GatewayConfig, Mapping, MappingType, TargetApi};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::SubstitutionCache;
use crate::error::ProcessingError;
use crate::extractor::{ExtractionConfig, Extractor, ExtractorKind, PathExpressionExtractor};
use crate::identity::DeviceIdentityResolver;
use crate::merger::{create_path, parse_path, TemplateMerger};
use crate::tree::TopicResolutionTree;

/// A document ready to be sent to the target API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducedDocument {
    pub mapping_id: String,
    #[serde(rename = "targetAPI")]
    pub target_api: TargetApi,
    pub payload: Value,
    /// Internal id of the device the document belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// The device was unknown and is to be created with the external id.
    pub create_device: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of applying one mapping to a message.
#[derive(Debug, Clone)]
pub struct MappingOutcome {
    pub mapping_id: String,
    pub mapping_name: String,
    pub result: Result<Vec<ProducedDocument>, ProcessingError>,
}

impl MappingOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Produced documents, empty when the mapping failed.
    pub fn documents(&self) -> &[ProducedDocument] {
        self.result.as_deref().unwrap_or(&[])
    }

    /// JSON rendering for reports.
    pub fn to_json(&self) -> Value {
        match &self.result {
            Ok(documents) => json!({
                "mappingId": self.mapping_id,
                "name": self.mapping_name,
                "documents": documents,
            }),
            Err(e) => json!({
                "mappingId": self.mapping_id,
                "name": self.mapping_name,
                "error": e.to_string(),
            }),
        }
    }
}

/// Applies inbound mappings to raw messages.
pub struct InboundProcessor {
    config: GatewayConfig,
    extractors: HashMap<ExtractorKind, Arc<dyn Extractor>>,
    identity: Arc<dyn DeviceIdentityResolver>,
}

impl InboundProcessor {
    /// Create a processor with the built-in path expression extractor.
    pub fn new(config: GatewayConfig, identity: Arc<dyn DeviceIdentityResolver>) -> Self {
        let path_extractor = PathExpressionExtractor::with_config(ExtractionConfig {
            max_depth: config.max_path_depth,
        });
        let mut extractors: HashMap<ExtractorKind, Arc<dyn Extractor>> = HashMap::new();
        extractors.insert(ExtractorKind::PathExpression, Arc::new(path_extractor));
        Self {
            config,
            extractors,
            identity,
        }
    }

    /// Register (or replace) the extractor for its kind.
    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractors.insert(extractor.kind(), extractor);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Resolve `topic` and apply every active inbound mapping to `payload`.
    pub async fn process(
        &self,
        tree: &TopicResolutionTree,
        topic: &str,
        payload: &[u8],
    ) -> Vec<MappingOutcome> {
        let tenant = tree.tenant();
        let mappings = tree.resolve(topic);
        if mappings.is_empty() {
            debug!(tenant = %tenant, topic = %topic, "No mapping resolved for topic");
        }

        let mut outcomes = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            if !mapping.active {
                debug!(tenant = %tenant, mapping_id = %mapping.id, "Skipping inactive mapping");
                continue;
            }
            if mapping.direction != Direction::Inbound {
                debug!(tenant = %tenant, mapping_id = %mapping.id, "Skipping outbound mapping");
                continue;
            }
            let result = self.process_mapping(tenant, &mapping, topic, payload).await;
            if let Err(e) = &result {
                error!(
                    tenant = %tenant,
                    mapping_id = %mapping.id,
                    error = %e,
                    "Mapping failed for message"
                );
            }
            outcomes.push(MappingOutcome {
                mapping_id: mapping.id.clone(),
                mapping_name: mapping.name.clone(),
                result,
            });
        }
        outcomes
    }

    /// Apply a single mapping to a message.
    pub async fn process_mapping(
        &self,
        tenant: &str,
        mapping: &Mapping,
        topic: &str,
        payload: &[u8],
    ) -> Result<Vec<ProducedDocument>, ProcessingError> {
        let kind = ExtractorKind::for_mapping_type(mapping.mapping_type);
        let extractor = self
            .extractors
            .get(&kind)
            .ok_or_else(|| ProcessingError::NoExtractor {
                kind,
                mapping_id: mapping.id.clone(),
            })?;

        let mut message = deserialize_payload(mapping.mapping_type, payload)?;
        if let Value::Object(fields) = &mut message {
            fields.insert(TOPIC_LEVEL.to_string(), json!(split_excluding_separator(topic)));
        }
        if self.config.log_payload || mapping.debug {
            info!(tenant = %tenant, mapping_id = %mapping.id, payload = %message, "Processing message");
        } else {
            debug!(tenant = %tenant, mapping_id = %mapping.id, topic = %topic, "Processing message");
        }

        let mut cache = SubstitutionCache::new();
        for (index, substitution) in mapping.substitutions.iter().enumerate() {
            let raw = match extractor.extract(&substitution.path_source, &message) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        mapping_id = %mapping.id,
                        path = %substitution.path_source,
                        error = %e,
                        "Extraction failed, value ignored"
                    );
                    None
                }
            };
            if raw.is_none() {
                warn!(
                    tenant = %tenant,
                    mapping_id = %mapping.id,
                    path = %substitution.path_source,
                    "No value extracted for substitution"
                );
            }
            cache.add(index, substitution, raw.as_ref());
        }

        let identifier_path = mapping
            .device_identifier_paths()
            .first()
            .map(|p| p.to_string());
        if let Some(path) = &identifier_path {
            cache.pad_device_entries(path);
        }

        let merger = TemplateMerger::new(&mapping.target_template)?;
        let count = cache.max_entries().max(1);
        let mut documents = Vec::with_capacity(count);
        for index in 0..count {
            let mut document = merger.merge_at(&cache, index)?;
            let mut produced = ProducedDocument {
                mapping_id: mapping.id.clone(),
                target_api: mapping.target_api,
                payload: Value::Null,
                source_id: None,
                external_id: None,
                create_device: false,
                created_at: Utc::now(),
            };

            if let Some(path) = &identifier_path {
                let identifier = cache
                    .select(path, index)
                    .filter(|v| !v.is_ignore())
                    .map(|v| v.as_text())
                    .ok_or_else(|| ProcessingError::MissingDeviceIdentifier(mapping.id.clone()))?;
                let source_id = if path == IDENTITY_EXTERNAL_ID {
                    produced.external_id = Some(identifier.clone());
                    self.resolve_device(tenant, mapping, &identifier, &mut produced)
                        .await?
                } else {
                    identifier
                };
                let api_path = mapping.generic_path_to_api_path(path);
                let segments = parse_path(api_path)?;
                create_path(&mut document, api_path, &segments, Value::String(source_id.clone()))?;
                produced.source_id = Some(source_id);
            }

            produced.payload = document;
            documents.push(produced);
        }

        debug!(
            tenant = %tenant,
            mapping_id = %mapping.id,
            documents = documents.len(),
            "Mapping produced documents"
        );
        Ok(documents)
    }

    async fn resolve_device(
        &self,
        tenant: &str,
        mapping: &Mapping,
        external_id: &str,
        produced: &mut ProducedDocument,
    ) -> Result<String, ProcessingError> {
        let resolved = self
            .identity
            .resolve(tenant, &mapping.external_id_type, external_id)
            .await
            .map_err(|e| ProcessingError::Identity(e.to_string()))?;
        match resolved {
            Some(internal) => Ok(internal),
            None if mapping.create_non_existing_device && !self.config.fail_on_unknown_device => {
                info!(
                    tenant = %tenant,
                    mapping_id = %mapping.id,
                    external_id = %external_id,
                    "Unknown device, document marked for implicit creation"
                );
                produced.create_device = true;
                Ok(external_id.to_string())
            }
            None => Err(ProcessingError::DeviceNotFound {
                external_id_type: mapping.external_id_type.clone(),
                external_id: external_id.to_string(),
            }),
        }
    }
}

/// Turn raw bytes into the JSON value substitutions are evaluated against.
///
/// Flat file and hex payloads are exposed as `{"message": "..."}`, hex
/// payloads rendered as lowercase hex digits.
pub fn deserialize_payload(mapping_type: MappingType, payload: &[u8]) -> Result<Value, ProcessingError> {
    match mapping_type {
        MappingType::FlatFile => Ok(json!({ "message": String::from_utf8_lossy(payload) })),
        MappingType::Hex => {
            let hex: String = payload.iter().map(|b| format!("{b:02x}")).collect();
            Ok(json!({ "message": hex }))
        }
        _ => serde_json::from_slice(payload)
            .map_err(|e| ProcessingError::InvalidPayload(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::InMemoryIdentityResolver;
    use dynmap_core::{RepairStrategy, Substitution};

    fn processor() -> InboundProcessor {
        let identity = InMemoryIdentityResolver::new();
        identity.register("c8y_Serial", "berlin_01", "1001");
        InboundProcessor::new(GatewayConfig::default(), Arc::new(identity))
    }

    fn temperature_mapping() -> Mapping {
        Mapping::new("temperature", "devices/+/temperature")
            .with_id("m-temp")
            .with_external_id("c8y_Serial")
            .with_templates(
                r#"{"id":"berlin_01","value":21.5}"#,
                r#"{"type":"c8y_TemperatureMeasurement","c8y_Temperature":{"T":{"value":0,"unit":"C"}}}"#,
            )
            .with_substitution(Substitution::new("$.id", IDENTITY_EXTERNAL_ID))
            .with_substitution(Substitution::new("$.value", "c8y_Temperature.T.value"))
    }

    #[test]
    fn test_deserialize_payload() {
        assert_eq!(
            deserialize_payload(MappingType::Json, br#"{"a":1}"#).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            deserialize_payload(MappingType::FlatFile, b"10,20").unwrap(),
            json!({"message": "10,20"})
        );
        assert_eq!(
            deserialize_payload(MappingType::Hex, &[0x0a, 0xff]).unwrap(),
            json!({"message": "0aff"})
        );
        assert!(matches!(
            deserialize_payload(MappingType::Json, b"not json"),
            Err(ProcessingError::InvalidPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_process_mapping_resolves_device() {
        let docs = processor()
            .process_mapping(
                "t1",
                &temperature_mapping(),
                "devices/berlin_01/temperature",
                br#"{"id":"berlin_01","value":23.1}"#,
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id.as_deref(), Some("1001"));
        assert_eq!(docs[0].external_id.as_deref(), Some("berlin_01"));
        assert_eq!(docs[0].payload["source"]["id"], "1001");
        assert_eq!(docs[0].payload["c8y_Temperature"]["T"]["value"], 23.1);
        assert_eq!(docs[0].payload["c8y_Temperature"]["T"]["unit"], "C");
    }

    #[tokio::test]
    async fn test_unknown_device_without_creation_fails() {
        let err = processor()
            .process_mapping(
                "t1",
                &temperature_mapping(),
                "devices/x/temperature",
                br#"{"id":"unknown","value":1}"#,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessingError::DeviceNotFound { ref external_id, .. } if external_id == "unknown"));
    }

    #[tokio::test]
    async fn test_unknown_device_with_creation() {
        let mapping = temperature_mapping().with_create_non_existing_device(true);
        let docs = processor()
            .process_mapping("t1", &mapping, "devices/x/temperature", br#"{"id":"new_dev","value":1}"#)
            .await
            .unwrap();
        assert!(docs[0].create_device);
        assert_eq!(docs[0].source_id.as_deref(), Some("new_dev"));
    }

    #[tokio::test]
    async fn test_fail_on_unknown_device_overrides_creation() {
        let config = GatewayConfig {
            fail_on_unknown_device: true,
            ..GatewayConfig::default()
        };
        let processor = InboundProcessor::new(config, Arc::new(InMemoryIdentityResolver::new()));
        let mapping = temperature_mapping().with_create_non_existing_device(true);
        let result = processor
            .process_mapping("t1", &mapping, "devices/x/temperature", br#"{"id":"new_dev","value":1}"#)
            .await;
        assert!(matches!(result, Err(ProcessingError::DeviceNotFound { .. })));
    }

    #[tokio::test]
    async fn test_missing_device_identifier() {
        let result = processor()
            .process_mapping("t1", &temperature_mapping(), "devices/x/temperature", br#"{"value":1}"#)
            .await;
        assert_eq!(
            result.unwrap_err(),
            ProcessingError::MissingDeviceIdentifier("m-temp".to_string())
        );
    }

    #[tokio::test]
    async fn test_topic_level_is_available() {
        let mut mapping = temperature_mapping();
        mapping.substitutions[0] = Substitution::new("_TOPIC_LEVEL_[1]", IDENTITY_EXTERNAL_ID);
        let docs = processor()
            .process_mapping("t1", &mapping, "devices/berlin_01/temperature", br#"{"value":2}"#)
            .await
            .unwrap();
        assert_eq!(docs[0].source_id.as_deref(), Some("1001"));
    }

    #[tokio::test]
    async fn test_source_id_used_directly() {
        let mut mapping = temperature_mapping().with_target_api(TargetApi::Event);
        mapping.use_external_id = false;
        mapping.substitutions[0] = Substitution::new("$.id", "_IDENTITY_.c8ySourceId");
        mapping.target_template = r#"{"type":"e","text":"t"}"#.to_string();
        mapping.substitutions[1] = Substitution::new("$.value", "text")
            .with_repair_strategy(RepairStrategy::CreateIfMissing);
        let docs = processor()
            .process_mapping("t1", &mapping, "devices/x/temperature", br#"{"id":"777","value":"hot"}"#)
            .await
            .unwrap();
        assert_eq!(docs[0].payload, json!({"type": "e", "text": "hot", "source": {"id": "777"}}));
    }

    #[tokio::test]
    async fn test_no_extractor_for_code_based() {
        let mapping = temperature_mapping().with_mapping_type(MappingType::CodeBased);
        let result = processor()
            .process_mapping("t1", &mapping, "devices/x/temperature", br#"{}"#)
            .await;
        assert!(matches!(
            result,
            Err(ProcessingError::NoExtractor { kind: ExtractorKind::Script, .. })
        ));
    }
}
