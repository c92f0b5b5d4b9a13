//! Merging of cached substitution values into a target template.
//!
//! Target paths use dot notation with optional array indices, for example
//! `c8y_Temperature.value` or `fragments[0].name`. The single token `$`
//! addresses the document root.
//!
//! Paths below `_IDENTITY_` are pseudo paths. They never end up in the
//! document; the caller resolves them and writes the result to the identifier
//! path of the target API.

use dynmap_core::config::defaults::MAX_ARRAY_LEN;
use dynmap_core::config::tokens::{IDENTITY, ROOT_PATH};
use dynmap_core::RepairStrategy;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::cache::SubstitutionCache;
use crate::classifier::{ClassifiedValue, ValueKind};
use crate::error::MergeError;

/// One step of a parsed target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Parse a dot/bracket path. `$` yields an empty segment list.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, MergeError> {
    let trimmed = path.trim();
    let invalid = |reason: &str| MergeError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };

    let body = if trimmed == ROOT_PATH {
        return Ok(Vec::new());
    } else if let Some(rest) = trimmed.strip_prefix("$.") {
        rest
    } else {
        trimmed
    };
    if body.is_empty() {
        return Err(invalid("empty path"));
    }

    let mut segments = Vec::new();
    for part in body.split('.') {
        if part.is_empty() {
            return Err(invalid("empty segment"));
        }
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(PathSegment::Key(key.to_string()));
        } else if rest.is_empty() {
            return Err(invalid("empty segment"));
        }
        while !rest.is_empty() {
            let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
            if !rest.starts_with('[') {
                return Err(invalid("unexpected characters after ']'"));
            }
            let index = rest[1..close]
                .trim()
                .parse::<usize>()
                .map_err(|_| invalid("array index is not a number"))?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Ok(segments)
}

/// Whether `path` is an identity pseudo path such as `_IDENTITY_.externalId`.
pub fn is_identity_path(path: &str) -> bool {
    path == IDENTITY || path.starts_with(&format!("{IDENTITY}."))
}

/// A parsed target template, reusable for several documents of one message.
#[derive(Debug, Clone)]
pub struct TemplateMerger {
    template: Value,
}

impl TemplateMerger {
    /// Parse the target template once.
    pub fn new(template: &str) -> Result<Self, MergeError> {
        let template = serde_json::from_str(template)
            .map_err(|e| MergeError::InvalidTemplate(e.to_string()))?;
        Ok(Self { template })
    }

    pub fn template(&self) -> &Value {
        &self.template
    }

    /// Apply the first value cached for every target path.
    pub fn merge(&self, cache: &SubstitutionCache) -> Result<Value, MergeError> {
        self.merge_at(cache, 0)
    }

    /// Produce document number `index` of a fanned-out message.
    pub fn merge_at(&self, cache: &SubstitutionCache, index: usize) -> Result<Value, MergeError> {
        let mut document = self.template.clone();
        for path in cache.paths() {
            if is_identity_path(path) {
                continue;
            }
            let Some(value) = cache.select(path, index) else {
                continue;
            };
            trace!(path = %path, kind = ?value.kind, index, "Merging substitution");
            apply(&mut document, path, value)?;
        }
        Ok(document)
    }
}

/// Parse `template` and merge the first value of every cached path.
pub fn merge(template: &str, cache: &SubstitutionCache) -> Result<Value, MergeError> {
    TemplateMerger::new(template)?.merge(cache)
}

/// Write one classified value into `document` according to its repair strategy.
pub fn apply(document: &mut Value, path: &str, value: &ClassifiedValue) -> Result<(), MergeError> {
    let segments = parse_path(path)?;

    // Only objects are spread into the root; anything else leaves the
    // document as it is.
    if segments.is_empty() {
        match &value.value {
            Value::Object(fields) => {
                if !document.is_object() {
                    *document = Value::Object(Map::new());
                }
                if let Value::Object(root) = document {
                    for (k, v) in fields {
                        root.insert(k.clone(), v.clone());
                    }
                }
            }
            other => {
                debug!(
                    path = %path,
                    kind = ?value.kind,
                    value = %other,
                    "Root target needs an object, value skipped"
                );
            }
        }
        return Ok(());
    }

    match value.repair_strategy {
        RepairStrategy::RemoveIfMissingOrNull if value.kind == ValueKind::Ignore => {
            if remove_path(document, &segments) {
                debug!(path = %path, "Removed target path for missing value");
            }
            Ok(())
        }
        RepairStrategy::Ignore if value.kind == ValueKind::Ignore => {
            trace!(path = %path, "Nothing extracted, template value kept");
            Ok(())
        }
        RepairStrategy::CreateIfMissing => create_path(document, path, &segments, value.value.clone()),
        _ => set_path(document, path, &segments, value.value.clone()),
    }
}

/// Set a value at an existing parent. The leaf itself may be missing.
pub fn set_path(
    document: &mut Value,
    path: &str,
    segments: &[PathSegment],
    value: Value,
) -> Result<(), MergeError> {
    let not_found = || MergeError::PathNotFound {
        path: path.to_string(),
    };
    let Some((last, parents)) = segments.split_last() else {
        *document = value;
        return Ok(());
    };

    let mut current = document;
    for segment in parents {
        current = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k).ok_or_else(not_found)?,
            (PathSegment::Index(i), Value::Array(items)) => {
                items.get_mut(*i).ok_or_else(not_found)?
            }
            _ => return Err(not_found()),
        };
    }

    match (last, current) {
        (PathSegment::Key(k), Value::Object(map)) => {
            map.insert(k.clone(), value);
            Ok(())
        }
        (PathSegment::Index(i), Value::Array(items)) => {
            let slot = items.get_mut(*i).ok_or_else(not_found)?;
            *slot = value;
            Ok(())
        }
        _ => Err(not_found()),
    }
}

/// Set a value, creating missing objects and extending arrays with nulls.
///
/// Arrays are never grown beyond [`MAX_ARRAY_LEN`] elements.
pub fn create_path(
    document: &mut Value,
    path: &str,
    segments: &[PathSegment],
    value: Value,
) -> Result<(), MergeError> {
    let mut current = document;
    for (pos, segment) in segments.iter().enumerate() {
        let next_is_index = matches!(segments.get(pos + 1), Some(PathSegment::Index(_)));
        let is_last = pos + 1 == segments.len();
        if current.is_null() {
            *current = match segment {
                PathSegment::Key(_) => Value::Object(Map::new()),
                PathSegment::Index(_) => Value::Array(Vec::new()),
            };
        }
        let empty_child = || {
            if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        };
        current = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => {
                if is_last {
                    map.insert(k.clone(), value);
                    return Ok(());
                }
                map.entry(k.clone()).or_insert_with(empty_child)
            }
            (PathSegment::Index(i), Value::Array(items)) => {
                if items.len() <= *i {
                    let len = i
                        .checked_add(1)
                        .filter(|len| *len <= MAX_ARRAY_LEN)
                        .ok_or_else(|| MergeError::InvalidPath {
                            path: path.to_string(),
                            reason: format!("index {} exceeds the array limit of {}", i, MAX_ARRAY_LEN),
                        })?;
                    items.resize(len, Value::Null);
                }
                if is_last {
                    items[*i] = value;
                    return Ok(());
                }
                &mut items[*i]
            }
            (_, other) => {
                return Err(MergeError::InvalidPath {
                    path: path.to_string(),
                    reason: format!("cannot descend into {}", json_type(other)),
                })
            }
        };
    }
    Ok(())
}

/// Remove the value at `segments`. Returns whether anything was removed.
pub fn remove_path(document: &mut Value, segments: &[PathSegment]) -> bool {
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let mut current = document;
    for segment in parents {
        let next = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get_mut(k),
            (PathSegment::Index(i), Value::Array(items)) => items.get_mut(*i),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return false,
        }
    }
    match (last, current) {
        (PathSegment::Key(k), Value::Object(map)) => map.shift_remove(k).is_some(),
        (PathSegment::Index(i), Value::Array(items)) if *i < items.len() => {
            items.remove(*i);
            true
        }
        _ => false,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use dynmap_core::Substitution;
    use serde_json::json;

    fn cache_with(entries: &[(&str, Value, RepairStrategy)]) -> SubstitutionCache {
        let mut cache = SubstitutionCache::new();
        for (i, (path, value, strategy)) in entries.iter().enumerate() {
            let sub = Substitution::new("$.x", *path).with_repair_strategy(*strategy);
            let raw = if value.is_null() { None } else { Some(value) };
            cache.add(i, &sub, raw);
        }
        cache
    }

    #[test]
    fn test_parse_path() {
        assert!(parse_path("$").unwrap().is_empty());
        assert_eq!(
            parse_path("a.b[2].c").unwrap(),
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(2),
                PathSegment::Key("c".into()),
            ]
        );
        assert_eq!(
            parse_path("$.m[0][1]").unwrap(),
            vec![
                PathSegment::Key("m".into()),
                PathSegment::Index(0),
                PathSegment::Index(1),
            ]
        );
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path("a[1").is_err());
        assert!(parse_path("").is_err());
    }

    #[test]
    fn test_merge_default_overwrites_existing() {
        let cache = cache_with(&[("c8y_Temperature.value", json!(21.5), RepairStrategy::Default)]);
        let doc = merge(r#"{"c8y_Temperature":{"value":0,"unit":"C"}}"#, &cache).unwrap();
        assert_eq!(doc, json!({"c8y_Temperature": {"value": 21.5, "unit": "C"}}));
    }

    #[test]
    fn test_merge_default_inserts_missing_leaf() {
        let cache = cache_with(&[("a.c", json!(1), RepairStrategy::Default)]);
        let doc = merge(r#"{"a":{"b":0}}"#, &cache).unwrap();
        assert_eq!(doc, json!({"a": {"b": 0, "c": 1}}));
    }

    #[test]
    fn test_merge_default_missing_parent_fails() {
        let cache = cache_with(&[("x.y.z", json!(1), RepairStrategy::Default)]);
        let err = merge(r#"{"a":1}"#, &cache).unwrap_err();
        assert_eq!(
            err,
            MergeError::PathNotFound {
                path: "x.y.z".to_string()
            }
        );
    }

    #[test]
    fn test_merge_create_if_missing() {
        let cache = cache_with(&[("x.y.z", json!("v"), RepairStrategy::CreateIfMissing)]);
        let doc = merge("{}", &cache).unwrap();
        assert_eq!(doc, json!({"x": {"y": {"z": "v"}}}));
    }

    #[test]
    fn test_merge_create_if_missing_extends_arrays() {
        let cache = cache_with(&[("list[2].name", json!("n"), RepairStrategy::CreateIfMissing)]);
        let doc = merge(r#"{"list":[1]}"#, &cache).unwrap();
        assert_eq!(doc, json!({"list": [1, null, {"name": "n"}]}));
    }

    #[test]
    fn test_merge_remove_if_missing() {
        let cache = cache_with(&[
            ("a.b", Value::Null, RepairStrategy::RemoveIfMissingOrNull),
            ("gone", Value::Null, RepairStrategy::RemoveIfMissingOrNull),
        ]);
        let doc = merge(r#"{"a":{"b":1,"c":2}}"#, &cache).unwrap();
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }

    #[test]
    fn test_merge_remove_if_missing_keeps_present_value() {
        let cache = cache_with(&[("a", json!(5), RepairStrategy::RemoveIfMissingOrNull)]);
        let doc = merge(r#"{"a":1}"#, &cache).unwrap();
        assert_eq!(doc, json!({"a": 5}));
    }

    #[test]
    fn test_merge_root_spread() {
        let cache = cache_with(&[("$", json!({"type": "t", "extra": true}), RepairStrategy::Default)]);
        let doc = merge(r#"{"type":"old","keep":1}"#, &cache).unwrap();
        assert_eq!(doc, json!({"type": "t", "keep": 1, "extra": true}));
    }

    #[test]
    fn test_merge_root_with_nothing_extracted_keeps_document() {
        let mut cache = SubstitutionCache::new();
        cache.add(0, &Substitution::new("$.extra", "$"), None);
        let doc = merge(r#"{"type":"t","keep":1}"#, &cache).unwrap();
        assert_eq!(doc, json!({"type": "t", "keep": 1}));
    }

    #[test]
    fn test_merge_root_with_scalar_keeps_document() {
        for scalar in [json!(true), json!(42), json!("text"), json!([1, 2])] {
            let mut cache = SubstitutionCache::new();
            cache.add(0, &Substitution::new("$.extra", "$"), Some(&scalar));
            let doc = merge(r#"{"type":"t","keep":1}"#, &cache).unwrap();
            assert_eq!(doc, json!({"type": "t", "keep": 1}), "{scalar}");
        }
    }

    #[test]
    fn test_merge_create_if_missing_rejects_huge_index() {
        for path in ["list[18446744073709551615]", "list[100000000000]"] {
            let cache = cache_with(&[(path, json!(1), RepairStrategy::CreateIfMissing)]);
            let err = merge(r#"{"list":[]}"#, &cache).unwrap_err();
            assert!(matches!(err, MergeError::InvalidPath { .. }), "{path}");
        }
    }

    #[test]
    fn test_merge_create_if_missing_up_to_array_limit() {
        let path = format!("list[{}]", MAX_ARRAY_LEN - 1);
        let cache = cache_with(&[(path.as_str(), json!(1), RepairStrategy::CreateIfMissing)]);
        let doc = merge(r#"{"list":[]}"#, &cache).unwrap();
        assert_eq!(doc["list"].as_array().unwrap().len(), MAX_ARRAY_LEN);
        assert_eq!(doc["list"][MAX_ARRAY_LEN - 1], json!(1));
    }

    #[test]
    fn test_merge_ignore_strategy_keeps_template_value() {
        let cache = cache_with(&[
            ("a", Value::Null, RepairStrategy::Ignore),
            ("b", Value::Null, RepairStrategy::Default),
        ]);
        let doc = merge(r#"{"a":1,"b":2}"#, &cache).unwrap();
        assert_eq!(doc, json!({"a": 1, "b": null}));
    }

    #[test]
    fn test_merge_keeps_template_key_order() {
        let cache = cache_with(&[("b", json!(2), RepairStrategy::Default)]);
        let doc = merge(r#"{"z":0,"b":0,"a":0}"#, &cache).unwrap();
        let keys: Vec<_> = doc.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "b", "a"]);
    }

    #[test]
    fn test_merge_skips_identity_paths() {
        let cache = cache_with(&[("_IDENTITY_.externalId", json!("dev"), RepairStrategy::Default)]);
        let doc = merge(r#"{"a":1}"#, &cache).unwrap();
        assert_eq!(doc, json!({"a": 1}));
    }

    #[test]
    fn test_merge_invalid_template() {
        let cache = SubstitutionCache::new();
        assert!(matches!(
            merge("{not json", &cache),
            Err(MergeError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_merge_at_fans_out() {
        let mut cache = SubstitutionCache::new();
        cache.add(
            0,
            &Substitution::new("$.v", "value").with_expand_array(true),
            Some(&json!([1, 2])),
        );
        cache.add(1, &Substitution::new("$.u", "unit"), Some(&json!("C")));
        let merger = TemplateMerger::new(r#"{"value":0,"unit":""}"#).unwrap();
        assert_eq!(merger.merge_at(&cache, 0).unwrap(), json!({"value": 1, "unit": "C"}));
        assert_eq!(merger.merge_at(&cache, 1).unwrap(), json!({"value": 2, "unit": "C"}));
    }

    #[test]
    fn test_apply_boolean_object_kind() {
        let mut doc = json!({"flag": false});
        let value = classify(Some(&json!(true)), RepairStrategy::Default, false);
        apply(&mut doc, "flag", &value).unwrap();
        assert_eq!(doc, json!({"flag": true}));
    }
}
