//! Classification of extracted values.

use dynmap_core::RepairStrategy;
use serde::Serialize;
use serde_json::Value;

/// Shape of an extracted value.
///
/// There is no boolean kind: booleans are passed through as [`ValueKind::Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Textual,
    Number,
    Array,
    Object,
    /// Nothing was extracted.
    Ignore,
}

/// An extracted value together with the policy of the substitution that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedValue {
    pub value: Value,
    pub kind: ValueKind,
    pub repair_strategy: RepairStrategy,
    pub expand_array: bool,
}

impl ClassifiedValue {
    pub fn is_ignore(&self) -> bool {
        self.kind == ValueKind::Ignore
    }

    /// Textual rendering used for device identifiers: strings without quotes,
    /// everything else as compact JSON.
    pub fn as_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Classify a raw value. `None` and JSON `null` both mean nothing was found.
pub fn classify(
    raw: Option<&Value>,
    repair_strategy: RepairStrategy,
    expand_array: bool,
) -> ClassifiedValue {
    let (value, kind) = match raw {
        None | Some(Value::Null) => (Value::Null, ValueKind::Ignore),
        Some(v @ Value::String(_)) => (v.clone(), ValueKind::Textual),
        Some(v @ Value::Number(_)) => (v.clone(), ValueKind::Number),
        Some(v @ Value::Array(_)) => (v.clone(), ValueKind::Array),
        Some(v) => (v.clone(), ValueKind::Object),
    };
    ClassifiedValue {
        value,
        kind,
        repair_strategy,
        expand_array,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind_of(v: Value) -> ValueKind {
        classify(Some(&v), RepairStrategy::Default, false).kind
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(kind_of(json!("abc")), ValueKind::Textual);
        assert_eq!(kind_of(json!(21.5)), ValueKind::Number);
        assert_eq!(kind_of(json!(-3)), ValueKind::Number);
        assert_eq!(kind_of(json!([1, 2])), ValueKind::Array);
        assert_eq!(kind_of(json!({"a": 1})), ValueKind::Object);
        assert_eq!(kind_of(Value::Null), ValueKind::Ignore);
    }

    #[test]
    fn test_absent_is_ignore_and_keeps_strategy() {
        let cv = classify(None, RepairStrategy::RemoveIfMissingOrNull, true);
        assert!(cv.is_ignore());
        assert_eq!(cv.value, Value::Null);
        assert_eq!(cv.repair_strategy, RepairStrategy::RemoveIfMissingOrNull);
        assert!(cv.expand_array);
    }

    #[test]
    fn test_boolean_passes_through_as_object() {
        let cv = classify(Some(&json!(true)), RepairStrategy::Default, false);
        assert_eq!(cv.kind, ValueKind::Object);
        assert_eq!(cv.value, json!(true));
    }

    #[test]
    fn test_as_text() {
        assert_eq!(
            classify(Some(&json!("berlin_01")), RepairStrategy::Default, false).as_text(),
            "berlin_01"
        );
        assert_eq!(
            classify(Some(&json!(4711)), RepairStrategy::Default, false).as_text(),
            "4711"
        );
    }
}
