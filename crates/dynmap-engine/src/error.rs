//! Error types for the mapping engine.

use thiserror::Error;

// Re-export the core error type
pub use dynmap_core::Error as DynmapError;

use crate::extractor::ExtractorKind;
use crate::validator::ValidationError;

/// Structural conflicts while changing the topic tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// The mapping has no routing topic.
    #[error("Mapping {mapping_id} has an empty topic")]
    EmptyTopic { mapping_id: String },

    /// A terminal node already ends at a level the new topic has to pass through.
    #[error("Could not add mapping {mapping_id}: path {path} is already blocked by mapping {blocking_id}")]
    BlockedByMapping {
        mapping_id: String,
        path: String,
        blocking_id: String,
    },

    /// An inner node occupies the level where the new topic has to end.
    #[error("Could not add mapping {mapping_id}: path {path} is a prefix of other mappings")]
    BlockedByInnerNode { mapping_id: String, path: String },

    /// More than one child lives at a level that must have exactly one inner node.
    #[error("Could not add mapping {mapping_id}: multiple mappings are only allowed at the end of the tree, {path} already contains {count} nodes")]
    AmbiguousInnerNode {
        mapping_id: String,
        path: String,
        count: usize,
    },

    /// The same mapping id already terminates at this topic.
    #[error("Mapping {mapping_id} is already registered for {path}")]
    AlreadyRegistered { mapping_id: String, path: String },
}

/// Failures while writing substituted values into a target template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// The target template is not valid JSON.
    #[error("Target template is not valid JSON: {0}")]
    InvalidTemplate(String),

    /// A DEFAULT substitution targets a path whose parent does not exist.
    #[error("Path {path} not found in target template")]
    PathNotFound { path: String },

    /// A path segment could not be parsed.
    #[error("Invalid target path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Failures reported by an extractor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    /// The source expression is malformed.
    #[error("Malformed expression '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    /// The expression nests deeper than allowed.
    #[error("Max depth {max} exceeded by '{path}'")]
    MaxDepthExceeded { path: String, max: usize },

    /// The evaluator failed for another reason.
    #[error("Evaluation of '{path}' failed: {reason}")]
    Evaluation { path: String, reason: String },
}

/// Per-mapping processing failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    #[error("Payload could not be parsed: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// No extractor is registered for the evaluator family of the mapping.
    #[error("No {kind:?} extractor available for mapping {mapping_id}")]
    NoExtractor {
        kind: ExtractorKind,
        mapping_id: String,
    },

    /// No value was extracted for the device identifier.
    #[error("No device identifier extracted for mapping {0}")]
    MissingDeviceIdentifier(String),

    /// The external id does not resolve to a device and implicit creation is off.
    #[error("Device not found for external id {external_id_type}:{external_id}")]
    DeviceNotFound {
        external_id_type: String,
        external_id: String,
    },

    /// The identity resolver itself failed.
    #[error("Device identity lookup failed: {0}")]
    Identity(String),
}

/// Registry failures.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The mapping violates static rules; every violation is reported.
    #[error("Mapping {mapping_id} is invalid: {}", .violations.iter().map(|v| v.code()).collect::<Vec<_>>().join(", "))]
    Invalid {
        mapping_id: String,
        violations: Vec<ValidationError>,
    },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Mapping not found: {0}")]
    NotFound(String),

    #[error("Mapping {0} already exists")]
    Duplicate(String),

    #[error("Could not load mappings: {0}")]
    Load(String),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

impl From<ResolutionError> for DynmapError {
    fn from(e: ResolutionError) -> Self {
        DynmapError::Resolution(e.to_string())
    }
}

impl From<MergeError> for DynmapError {
    fn from(e: MergeError) -> Self {
        DynmapError::Merge(e.to_string())
    }
}

impl From<ExtractionError> for DynmapError {
    fn from(e: ExtractionError) -> Self {
        DynmapError::Extraction(e.to_string())
    }
}

impl From<ProcessingError> for DynmapError {
    fn from(e: ProcessingError) -> Self {
        match e {
            ProcessingError::Merge(m) => m.into(),
            ProcessingError::DeviceNotFound { .. } => DynmapError::DeviceNotFound(e.to_string()),
            other => DynmapError::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for DynmapError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Invalid { violations, .. } => DynmapError::Validation(
                violations.iter().map(|v| v.code().to_string()).collect(),
            ),
            RegistryError::Resolution(r) => r.into(),
            RegistryError::NotFound(id) => DynmapError::NotFound(id),
            e @ RegistryError::Duplicate(_) => DynmapError::Resolution(e.to_string()),
            RegistryError::Load(msg) => DynmapError::Io(msg),
        }
    }
}
