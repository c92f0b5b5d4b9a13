//! Value extraction from inbound payloads.
//!
//! The engine only depends on the [`Extractor`] contract. Evaluators for
//! scripts or extensions live outside this crate and are plugged in per
//! [`ExtractorKind`]; the built-in [`PathExpressionExtractor`] understands dot
//! notation paths such as `$.values.battery` or `sensors[0].temp`.

use dynmap_core::config::defaults;
use dynmap_core::config::tokens::ROOT_PATH;
use dynmap_core::MappingType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use tracing::trace;

use crate::error::ExtractionError;

/// Evaluator family an extractor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Path expressions evaluated against the JSON payload.
    PathExpression,
    /// User supplied code.
    Script,
    /// Compiled processor extensions.
    Extension,
}

impl ExtractorKind {
    /// The evaluator family used for payloads of `mapping_type`.
    pub fn for_mapping_type(mapping_type: MappingType) -> Self {
        match mapping_type {
            MappingType::Json | MappingType::FlatFile | MappingType::Hex => Self::PathExpression,
            MappingType::CodeBased => Self::Script,
            MappingType::ProtobufInternal
            | MappingType::ExtensionSource
            | MappingType::ExtensionSourceTarget => Self::Extension,
        }
    }
}

/// Evaluates a source path against a payload.
///
/// `Ok(None)` means nothing was found at `path`, which is not an error.
pub trait Extractor: Send + Sync {
    fn kind(&self) -> ExtractorKind;

    fn extract(&self, path: &str, payload: &Value) -> Result<Option<Value>, ExtractionError>;
}

/// Configuration for the path expression evaluator.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Maximum number of path segments
    pub max_depth: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_depth: defaults::MAX_PATH_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
    /// `[*]`, keeps the whole array.
    All,
}

/// Dot/bracket path evaluator.
///
/// Supports:
/// - Root notation: `$`, with an optional `$.` prefix on other paths
/// - Nested objects: `values.battery`
/// - Array indices: `sensors[0]`, `matrix[0][1]`, `sensors[*]`
/// - Keys applied to arrays map over the elements: `sensors.value` on
///   `{"sensors":[{"value":1},{"value":2}]}` yields `[1,2]`
#[derive(Debug, Clone, Default)]
pub struct PathExpressionExtractor {
    config: ExtractionConfig,
}

impl PathExpressionExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ExtractionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    fn parse(&self, path: &str) -> Result<Vec<Step>, ExtractionError> {
        let malformed = |reason: &str| ExtractionError::MalformedPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(malformed("empty path"));
        }
        if trimmed == ROOT_PATH {
            return Ok(Vec::new());
        }
        let body = trimmed.strip_prefix("$.").unwrap_or(trimmed);
        if body.ends_with('.') || body.starts_with('.') {
            return Err(malformed("dangling '.'"));
        }

        let mut steps = Vec::new();
        for part in body.split('.') {
            let part = part.trim();
            if part.is_empty() {
                return Err(malformed("empty segment"));
            }
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !key.is_empty() {
                steps.push(Step::Key(key.to_string()));
            }
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| malformed("unclosed '['"))?;
                if !rest.starts_with('[') {
                    return Err(malformed("unexpected characters after ']'"));
                }
                let inner = rest[1..close].trim();
                if inner == "*" {
                    steps.push(Step::All);
                } else {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| malformed("invalid array index"))?;
                    steps.push(Step::Index(index));
                }
                rest = &rest[close + 1..];
            }
        }

        if steps.len() > self.config.max_depth {
            return Err(ExtractionError::MaxDepthExceeded {
                path: path.to_string(),
                max: self.config.max_depth,
            });
        }
        Ok(steps)
    }
}

impl Extractor for PathExpressionExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::PathExpression
    }

    fn extract(&self, path: &str, payload: &Value) -> Result<Option<Value>, ExtractionError> {
        let steps = self.parse(path)?;
        let mut current: Cow<'_, Value> = Cow::Borrowed(payload);
        for step in &steps {
            let next = match current {
                Cow::Borrowed(v) => apply_step(v, step),
                Cow::Owned(v) => apply_step(&v, step).map(|c| Cow::Owned(c.into_owned())),
            };
            match next {
                Some(v) => current = v,
                None => {
                    trace!(path = %path, "Path not found in payload");
                    return Ok(None);
                }
            }
        }
        Ok(Some(current.into_owned()))
    }
}

fn apply_step<'a>(value: &'a Value, step: &Step) -> Option<Cow<'a, Value>> {
    match (step, value) {
        (Step::Key(k), Value::Object(map)) => map.get(k).map(Cow::Borrowed),
        (Step::Key(k), Value::Array(items)) => {
            let mut found: Vec<Value> = items
                .iter()
                .filter_map(|item| item.as_object().and_then(|m| m.get(k)))
                .cloned()
                .collect();
            match found.len() {
                0 => None,
                1 => found.pop().map(Cow::Owned),
                _ => Some(Cow::Owned(Value::Array(found))),
            }
        }
        (Step::Index(i), Value::Array(items)) => items.get(*i).map(Cow::Borrowed),
        (Step::All, Value::Array(_)) => Some(Cow::Borrowed(value)),
        _ => None,
    }
}
