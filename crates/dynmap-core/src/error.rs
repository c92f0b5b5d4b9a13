//! Unified error handling for dynmap.
//!
//! Every crate in the workspace defines its own narrow error enum and converts
//! it into [`Error`] when it crosses a crate boundary.

/// Unified error type for dynmap.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A mapping failed static validation. Carries every violation code.
    #[error("Validation error: {}", .0.join(", "))]
    Validation(Vec<String>),

    /// A mapping could not be placed in (or removed from) the topic tree.
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// A substitution could not be merged into the target template.
    #[error("Merge error: {0}")]
    Merge(String),

    /// The external evaluator could not extract a value.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// An external device identifier has no internal counterpart.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File system errors.
    #[error("IO error: {0}")]
    Io(String),

    /// Not found errors.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Violation codes carried by a validation error, empty for other kinds.
    pub fn violations(&self) -> &[String] {
        match self {
            Self::Validation(codes) => codes,
            _ => &[],
        }
    }
}
