//! Core types for the dynmap mapping gateway.
//!
//! This crate defines the mapping model, topic helpers, the unified error type
//! and shared configuration used by the engine and the CLI.

pub mod config;
pub mod error;
pub mod model;
pub mod topic;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use model::{Direction, Mapping, MappingType, RepairStrategy, Substitution, TargetApi};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, tokens, GatewayConfig};
    pub use crate::error::{Error, Result};
    pub use crate::model::{
        Direction, Mapping, MappingType, RepairStrategy, Substitution, TargetApi,
    };
    pub use crate::topic::{split_excluding_separator, split_including_separator};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
