//! Mapping definitions.
//!
//! A [`Mapping`] ties a topic pattern to a list of [`Substitution`]s that copy
//! values from an inbound payload into a target template. The JSON layout
//! matches the mapping files exported by the configuration API.

use serde::{Deserialize, Serialize};

use crate::config::tokens::{IDENTITY_EXTERNAL_ID, IDENTITY_SOURCE_ID};

/// Direction a mapping applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

/// Payload format / processing mode of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingType {
    #[default]
    Json,
    FlatFile,
    Hex,
    ProtobufInternal,
    ExtensionSource,
    ExtensionSourceTarget,
    CodeBased,
}

impl MappingType {
    /// Types whose payload is handed to an extension or script instead of the
    /// substitution engine. These do not need a device identifier substitution.
    pub fn is_pass_through(&self) -> bool {
        matches!(
            self,
            Self::ExtensionSource
                | Self::ExtensionSourceTarget
                | Self::ProtobufInternal
                | Self::CodeBased
        )
    }

    /// Types whose target template is produced outside the engine.
    pub fn skips_target_template(&self) -> bool {
        matches!(self, Self::ExtensionSource | Self::ProtobufInternal)
    }
}

/// Platform API a produced document is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetApi {
    #[default]
    Measurement,
    Event,
    Alarm,
    Inventory,
    Operation,
}

impl TargetApi {
    /// Path inside the target document that holds the internal device id.
    pub fn identifier(&self) -> &'static str {
        match self {
            Self::Measurement | Self::Event | Self::Alarm => "source.id",
            Self::Inventory => "id",
            Self::Operation => "deviceId",
        }
    }
}

/// Merge policy of a single substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepairStrategy {
    /// Overwrite in place; a missing parent is an error.
    #[default]
    Default,
    /// Create missing intermediate objects.
    CreateIfMissing,
    /// Delete the target path when the extracted value is null or absent.
    RemoveIfMissingOrNull,
    /// Reuse the first value when fewer values than devices were extracted.
    UseFirstValueOfArray,
    /// Reuse the last value when fewer values than devices were extracted.
    UseLastValueOfArray,
    Ignore,
}

/// One field-level extract-then-merge rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    /// Expression understood by the extractor.
    pub path_source: String,
    /// Dot path into the target template, or `$` for the root.
    pub path_target: String,
    #[serde(default)]
    pub repair_strategy: RepairStrategy,
    #[serde(default)]
    pub expand_array: bool,
}

impl Substitution {
    pub fn new(path_source: impl Into<String>, path_target: impl Into<String>) -> Self {
        Self {
            path_source: path_source.into(),
            path_target: path_target.into(),
            repair_strategy: RepairStrategy::Default,
            expand_array: false,
        }
    }

    pub fn with_repair_strategy(mut self, strategy: RepairStrategy) -> Self {
        self.repair_strategy = strategy;
        self
    }

    pub fn with_expand_array(mut self, expand: bool) -> Self {
        self.expand_array = expand;
        self
    }
}

/// A named, versioned mapping rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub id: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    /// Inbound routing pattern, may contain `+` and `#`.
    #[serde(default)]
    pub mapping_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_topic_sample: Option<String>,
    /// Outbound publish topic template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_topic_sample: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub mapping_type: MappingType,
    #[serde(default, rename = "targetAPI")]
    pub target_api: TargetApi,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
    #[serde(default)]
    pub use_external_id: bool,
    #[serde(default)]
    pub external_id_type: String,
    #[serde(default)]
    pub source_template: String,
    #[serde(default)]
    pub target_template: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub create_non_existing_device: bool,
}

fn default_true() -> bool {
    true
}

impl Mapping {
    /// Create an active inbound JSON mapping with a generated id.
    pub fn new(name: impl Into<String>, mapping_topic: impl Into<String>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            identifier: id.chars().take(8).collect(),
            id,
            name: name.into(),
            mapping_topic: mapping_topic.into(),
            mapping_topic_sample: None,
            publish_topic: None,
            publish_topic_sample: None,
            direction: Direction::Inbound,
            mapping_type: MappingType::Json,
            target_api: TargetApi::Measurement,
            substitutions: Vec::new(),
            use_external_id: false,
            external_id_type: String::new(),
            source_template: "{}".to_string(),
            target_template: "{}".to_string(),
            active: true,
            debug: false,
            create_non_existing_device: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_mapping_type(mut self, mapping_type: MappingType) -> Self {
        self.mapping_type = mapping_type;
        self
    }

    pub fn with_target_api(mut self, api: TargetApi) -> Self {
        self.target_api = api;
        self
    }

    pub fn with_templates(
        mut self,
        source_template: impl Into<String>,
        target_template: impl Into<String>,
    ) -> Self {
        self.source_template = source_template.into();
        self.target_template = target_template.into();
        self
    }

    pub fn with_external_id(mut self, external_id_type: impl Into<String>) -> Self {
        self.use_external_id = true;
        self.external_id_type = external_id_type.into();
        self
    }

    pub fn with_substitution(mut self, substitution: Substitution) -> Self {
        self.substitutions.push(substitution);
        self
    }

    pub fn with_create_non_existing_device(mut self, create: bool) -> Self {
        self.create_non_existing_device = create;
        self
    }

    /// The topic pattern this mapping is routed by: the mapping topic for
    /// inbound mappings, the publish topic for outbound ones.
    pub fn routing_topic(&self) -> &str {
        match self.direction {
            Direction::Inbound => &self.mapping_topic,
            Direction::Outbound => self
                .publish_topic
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or(&self.mapping_topic),
        }
    }

    /// The pseudo path that carries the device identity for this mapping.
    ///
    /// An external id is only used when its type is known as well.
    pub fn generic_device_identifier(&self) -> &'static str {
        if self.use_external_id && !self.external_id_type.is_empty() {
            IDENTITY_EXTERNAL_ID
        } else {
            IDENTITY_SOURCE_ID
        }
    }

    /// Whether `substitution` establishes which device a message belongs to.
    pub fn defines_device_identifier(&self, substitution: &Substitution) -> bool {
        let expected = self.generic_device_identifier();
        match self.direction {
            Direction::Inbound => substitution.path_target == expected,
            Direction::Outbound => substitution.path_source == expected,
        }
    }

    /// Number of substitutions defining the device identifier.
    pub fn device_identifier_count(&self) -> usize {
        self.substitutions
            .iter()
            .filter(|s| self.defines_device_identifier(s))
            .count()
    }

    /// Target paths of the device identifier substitutions, in order.
    pub fn device_identifier_paths(&self) -> Vec<&str> {
        self.substitutions
            .iter()
            .filter(|s| self.defines_device_identifier(s))
            .map(|s| s.path_target.as_str())
            .collect()
    }

    /// Map the generic identity path onto the identifier path of the target
    /// API, e.g. `_IDENTITY_.externalId` to `source.id`.
    pub fn generic_path_to_api_path<'a>(&self, path: &'a str) -> &'a str {
        if path == self.generic_device_identifier() {
            self.target_api.identifier()
        } else {
            path
        }
    }
}
