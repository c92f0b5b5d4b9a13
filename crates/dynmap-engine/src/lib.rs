//! Mapping resolution and substitution engine.
//!
//! ## Architecture
//!
//! - **TopicResolutionTree**: wildcard-aware topic trie, one per tenant and direction
//! - **MappingValidator**: static checks run before a mapping reaches a tree
//! - **SubstitutionCache**: message-scoped, classified values per target path
//! - **TemplateMerger**: writes cached values into the target template
//! - **InboundProcessor**: ties extraction, merging and device identity together
//! - **MappingRegistry**: per-tenant administration entry point
//!
//! ```text
//! topic ──▶ tree.resolve ──▶ [Mapping] ──▶ extract ──▶ classify ──▶ cache ──▶ merge ──▶ document
//! ```

pub mod cache;
pub mod classifier;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod merger;
pub mod processor;
pub mod registry;
pub mod tree;
pub mod validator;

pub use cache::{CacheEntry, SubstitutionCache};
pub use classifier::{classify, ClassifiedValue, ValueKind};
pub use error::{
    DynmapError, ExtractionError, MergeError, ProcessingError, RegistryError, ResolutionError,
};
pub use extractor::{ExtractionConfig, Extractor, ExtractorKind, PathExpressionExtractor};
pub use identity::{DeviceIdentityResolver, InMemoryIdentityResolver};
pub use merger::{merge, TemplateMerger};
pub use processor::{InboundProcessor, MappingOutcome, ProducedDocument};
pub use registry::{LoadReport, MappingRegistry};
pub use tree::{TopicResolutionTree, TreeNode};
pub use validator::{validate, ValidationError};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::{
        classify, merge, validate, ClassifiedValue, DeviceIdentityResolver, Extractor,
        InMemoryIdentityResolver, InboundProcessor, MappingRegistry, SubstitutionCache,
        TemplateMerger, TopicResolutionTree, ValidationError, ValueKind,
    };
    pub use dynmap_core::prelude::*;
}
