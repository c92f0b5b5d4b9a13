//! Message-scoped cache of classified substitution values.
//!
//! Values are grouped by target path in the order the paths were first
//! written. Within one path only the values contributed by the *first*
//! substitution that wrote the path are applied; values from later
//! substitutions are kept for inspection but never merged.

use dynmap_core::{RepairStrategy, Substitution};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::classifier::{classify, ClassifiedValue};

/// One cached value and the index of the substitution that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub substitution: usize,
    pub value: ClassifiedValue,
}

#[derive(Debug, Clone)]
struct PathSlot {
    path: String,
    entries: Vec<CacheEntry>,
}

impl PathSlot {
    fn first_writer(&self) -> Option<usize> {
        self.entries.first().map(|e| e.substitution)
    }

    fn applicable(&self) -> impl Iterator<Item = &ClassifiedValue> {
        let writer = self.first_writer();
        self.entries
            .iter()
            .filter(move |e| Some(e.substitution) == writer)
            .map(|e| &e.value)
    }
}

/// Target path → classified values awaiting merge.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionCache {
    slots: Vec<PathSlot>,
    index: HashMap<String, usize>,
}

impl SubstitutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `raw` for substitution number `substitution_index` and store it
    /// under the substitution's target path.
    ///
    /// With `expand_array` set and an array extracted, every element is
    /// classified and stored on its own.
    pub fn add(&mut self, substitution_index: usize, substitution: &Substitution, raw: Option<&Value>) {
        let strategy = substitution.repair_strategy;
        let expand = substitution.expand_array;
        match raw {
            Some(Value::Array(items)) if expand => {
                trace!(
                    path = %substitution.path_target,
                    count = items.len(),
                    "Expanding array substitution"
                );
                for item in items {
                    self.push(
                        &substitution.path_target,
                        substitution_index,
                        classify(Some(item), strategy, expand),
                    );
                }
            }
            _ => self.push(
                &substitution.path_target,
                substitution_index,
                classify(raw, strategy, expand),
            ),
        }
    }

    /// Append an already classified value.
    pub fn push(&mut self, path: &str, substitution_index: usize, value: ClassifiedValue) {
        let slot = match self.index.get(path).copied() {
            Some(i) => i,
            None => {
                self.slots.push(PathSlot {
                    path: path.to_string(),
                    entries: Vec::new(),
                });
                self.index.insert(path.to_string(), self.slots.len() - 1);
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[slot];
        if let Some(writer) = slot.first_writer() {
            if writer != substitution_index {
                debug!(
                    path = %path,
                    first = writer,
                    later = substitution_index,
                    "Target path already written, later value is kept but not applied"
                );
            }
        }
        slot.entries.push(CacheEntry {
            substitution: substitution_index,
            value,
        });
    }

    /// Target paths in first-write order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.path.as_str())
    }

    /// Every value stored under `path`, including ones that will not be applied.
    pub fn values(&self, path: &str) -> Vec<&ClassifiedValue> {
        self.slot(path)
            .map(|s| s.entries.iter().map(|e| &e.value).collect())
            .unwrap_or_default()
    }

    /// Raw entries under `path` with their producing substitution.
    pub fn entries(&self, path: &str) -> &[CacheEntry] {
        self.slot(path).map(|s| s.entries.as_slice()).unwrap_or(&[])
    }

    /// Values of the first substitution that wrote `path`.
    pub fn applicable(&self, path: &str) -> Vec<&ClassifiedValue> {
        self.slot(path)
            .map(|s| s.applicable().collect())
            .unwrap_or_default()
    }

    /// The value a single-document merge applies to `path`.
    pub fn first(&self, path: &str) -> Option<&ClassifiedValue> {
        self.slot(path).and_then(|s| s.entries.first()).map(|e| &e.value)
    }

    /// The value to apply for document number `index` when one message fans
    /// out into several documents.
    ///
    /// When fewer values were extracted than documents are produced, the
    /// substitution's repair strategy picks the fallback: the last value for
    /// `USE_LAST_VALUE_OF_ARRAY`, nothing for `IGNORE`, the first otherwise.
    pub fn select(&self, path: &str, index: usize) -> Option<&ClassifiedValue> {
        let values = self.applicable(path);
        if let Some(v) = values.get(index).copied() {
            return Some(v);
        }
        let first = values.first().copied()?;
        let fallback = match first.repair_strategy {
            RepairStrategy::UseLastValueOfArray => values.last().copied(),
            RepairStrategy::Ignore => None,
            RepairStrategy::UseFirstValueOfArray
            | RepairStrategy::Default
            | RepairStrategy::CreateIfMissing
            | RepairStrategy::RemoveIfMissingOrNull => Some(first),
        };
        trace!(
            path = %path,
            index,
            strategy = ?first.repair_strategy,
            applied = fallback.is_some(),
            "Repair strategy used for missing value"
        );
        fallback
    }

    /// Length of the longest applicable value list.
    pub fn max_entries(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.applicable().count())
            .max()
            .unwrap_or(0)
    }

    /// Repeat the first value under `path` until it has as many values as the
    /// longest list, so every produced document gets a device identifier.
    pub fn pad_device_entries(&mut self, path: &str) {
        let target = self.max_entries();
        let Some(&i) = self.index.get(path) else {
            return;
        };
        let slot = &mut self.slots[i];
        let Some(first) = slot.entries.first().cloned() else {
            return;
        };
        let mut count = slot.applicable().count();
        while count < target {
            slot.entries.push(first.clone());
            count += 1;
        }
    }

    /// Number of distinct target paths.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, path: &str) -> Option<&PathSlot> {
        self.index.get(path).map(|&i| &self.slots[i])
    }
}
