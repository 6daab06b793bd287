//! Purpose: Recursive merge of nested count records across stores.
//! Exports: `merge_nested`, `merge_transcript`, `merge_stores`, `MergeOptions`,
//! `MergeReport`, `Anomaly`, `MergeObserver`.
//! Role: The policy core; everything else in the crate is plumbing around it.
//! Invariants: Scalar and map merging is commutative and associative, so input
//! order never changes summed totals.
//! Invariants: Shape anomalies are recorded and skipped; only overflow, depth,
//! and store I/O abort a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};
use crate::core::store::CountStore;
use crate::core::value::{Value, ValueShape};

/// Nesting budget for record maps. Real quantification records are three or
/// four levels deep; anything past this is treated as corrupt input.
pub const MAX_MERGE_DEPTH: usize = 64;

pub const DEFAULT_TRANSCRIPT_PREFIX: &str = "ENST";
pub const DEFAULT_PROGRESS_EVERY: usize = 1000;

#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// Keys with this prefix follow the two-level categorical merge.
    pub transcript_prefix: String,
    /// Emit a progress event every N keys per input store.
    pub progress_every: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            transcript_prefix: DEFAULT_TRANSCRIPT_PREFIX.to_string(),
            progress_every: DEFAULT_PROGRESS_EVERY,
        }
    }
}

/// Why a key or element was skipped instead of merged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnomalyKind {
    /// Existing and incoming shapes cannot be combined.
    ShapeMismatch,
    /// Both sides are lists but their lengths differ.
    ListLengthMismatch,
    /// A new element whose shape the element rules refuse to copy.
    UnmergeableNewElement,
    /// A colliding top-level value no branch accepts.
    UnmergeableKey,
}

impl AnomalyKind {
    pub fn name(self) -> &'static str {
        match self {
            AnomalyKind::ShapeMismatch => "shape-mismatch",
            AnomalyKind::ListLengthMismatch => "list-length-mismatch",
            AnomalyKind::UnmergeableNewElement => "unmergeable-new-element",
            AnomalyKind::UnmergeableKey => "unmergeable-key",
        }
    }
}

/// One non-fatal merge skip, with enough context to chase the offending
/// record afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub key: String,
    /// Path of element names below the store key, outermost first.
    pub path: Vec<String>,
    pub existing: Option<ValueShape>,
    pub incoming: ValueShape,
}

impl Anomaly {
    pub fn describe(&self) -> String {
        let at = if self.path.is_empty() {
            self.key.clone()
        } else {
            format!("{}.{}", self.key, self.path.join("."))
        };
        let existing = self
            .existing
            .map(ValueShape::name)
            .unwrap_or("absent");
        format!(
            "{} at {at} (existing: {existing}, incoming: {})",
            self.kind.name(),
            self.incoming.name()
        )
    }
}

/// Streaming seam for progress and diagnostics. The CLI emits notices;
/// library callers and tests usually keep the defaults.
pub trait MergeObserver {
    fn on_progress(&mut self, _store: &Path, _index: usize, _total: usize) {}
    fn on_anomaly(&mut self, _anomaly: &Anomaly) {}
    fn on_generic_key(&mut self, _key: &str) {}
}

/// Observer that drops every event.
pub struct NullObserver;

impl MergeObserver for NullObserver {}

#[derive(Clone, Debug, Default)]
pub struct MergeReport {
    pub inputs: usize,
    pub keys_seen: usize,
    pub keys_copied: usize,
    pub keys_merged: usize,
    pub generic_keys: usize,
    pub anomalies: Vec<Anomaly>,
}

/// Per-key working state for one merge: the store key, the element path
/// leading to the current position, and the anomalies collected so far.
pub struct MergeScope {
    key: String,
    path: Vec<String>,
    anomalies: Vec<Anomaly>,
}

impl MergeScope {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            path: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    pub fn into_anomalies(self) -> Vec<Anomaly> {
        self.anomalies
    }

    fn note(&mut self, kind: AnomalyKind, element: &str, existing: Option<ValueShape>, incoming: ValueShape) {
        let mut path = self.path.clone();
        path.push(element.to_string());
        self.anomalies.push(Anomaly {
            kind,
            key: self.key.clone(),
            path,
            existing,
            incoming,
        });
    }

    fn note_key(&mut self, kind: AnomalyKind, existing: Option<ValueShape>, incoming: ValueShape) {
        self.anomalies.push(Anomaly {
            kind,
            key: self.key.clone(),
            path: self.path.clone(),
            existing,
            incoming,
        });
    }

    fn location(&self, element: Option<&str>) -> String {
        let mut parts = vec![self.key.as_str()];
        parts.extend(self.path.iter().map(String::as_str));
        if let Some(element) = element {
            parts.push(element);
        }
        parts.join(".")
    }
}

fn checked_sum(a: i64, b: i64, scope: &MergeScope, element: Option<&str>) -> Result<i64, Error> {
    a.checked_add(b).ok_or_else(|| {
        Error::new(ErrorKind::Type)
            .with_message(format!(
                "count addition overflowed at {}",
                scope.location(element)
            ))
            .with_key(&scope.key)
    })
}

/// Combine two values that live under the same element name. Shape pairs
/// with no defined combination are recorded as anomalies and the existing
/// value is kept.
fn merge_leaf(
    existing: &mut Value,
    incoming: &Value,
    element: &str,
    scope: &mut MergeScope,
    depth: usize,
) -> Result<(), Error> {
    match (existing, incoming) {
        (Value::Scalar(base), Value::Scalar(add)) => {
            *base = checked_sum(*base, *add, scope, Some(element))?;
        }
        (Value::List(base), Value::List(add)) => {
            if base.len() != add.len() {
                scope.note(
                    AnomalyKind::ListLengthMismatch,
                    element,
                    Some(ValueShape::List),
                    ValueShape::List,
                );
                return Ok(());
            }
            for (slot, add) in base.iter_mut().zip(add) {
                *slot = checked_sum(*slot, *add, scope, Some(element))?;
            }
        }
        (Value::Map(base), Value::Map(add)) => {
            scope.path.push(element.to_string());
            merge_nested_at(base, add, scope, depth + 1)?;
            scope.path.pop();
        }
        (existing, incoming) => {
            let existing = existing.shape();
            scope.note(
                AnomalyKind::ShapeMismatch,
                element,
                Some(existing),
                incoming.shape(),
            );
        }
    }
    Ok(())
}

/// Recursively merge `incoming` into `base`: matching leaves are summed,
/// keys unique to one side are kept as-is.
pub fn merge_nested(
    base: &mut BTreeMap<String, Value>,
    incoming: &BTreeMap<String, Value>,
    scope: &mut MergeScope,
) -> Result<(), Error> {
    merge_nested_at(base, incoming, scope, 0)
}

fn merge_nested_at(
    base: &mut BTreeMap<String, Value>,
    incoming: &BTreeMap<String, Value>,
    scope: &mut MergeScope,
    depth: usize,
) -> Result<(), Error> {
    if depth > MAX_MERGE_DEPTH {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!(
                "record nesting exceeds {MAX_MERGE_DEPTH} levels at {}",
                scope.location(None)
            ))
            .with_key(&scope.key));
    }

    for (element, add) in incoming {
        match base.get_mut(element) {
            None => {
                base.insert(element.clone(), add.clone());
            }
            Some(existing) => merge_leaf(existing, add, element, scope, depth)?,
        }
    }
    Ok(())
}

/// Merge two transcript records: `data_type -> length_bucket -> leaves`.
/// Whole branches missing from `base` are copied; colliding buckets are
/// combined leaf-by-leaf.
pub fn merge_transcript(
    base: &mut BTreeMap<String, Value>,
    incoming: &BTreeMap<String, Value>,
    scope: &mut MergeScope,
) -> Result<(), Error> {
    for (data_type, add) in incoming {
        match base.get_mut(data_type) {
            None => {
                base.insert(data_type.clone(), add.clone());
            }
            Some(Value::Map(base_buckets)) => {
                let Value::Map(add_buckets) = add else {
                    scope.note(
                        AnomalyKind::ShapeMismatch,
                        data_type,
                        Some(ValueShape::Map),
                        add.shape(),
                    );
                    continue;
                };
                scope.path.push(data_type.clone());
                for (bucket, add_leaf) in add_buckets {
                    match base_buckets.get_mut(bucket) {
                        None => {
                            base_buckets.insert(bucket.clone(), add_leaf.clone());
                        }
                        Some(existing) => merge_leaf(existing, add_leaf, bucket, scope, 1)?,
                    }
                }
                scope.path.pop();
            }
            Some(existing) => {
                let existing = existing.shape();
                scope.note(AnomalyKind::ShapeMismatch, data_type, Some(existing), add.shape());
            }
        }
    }
    Ok(())
}

/// Per-element rules for colliding non-transcript map values. Unlike the
/// nested merger, new elements are only copied when they are maps or lists;
/// anything else is reported and skipped.
fn merge_generic_map(
    base: &mut BTreeMap<String, Value>,
    incoming: &BTreeMap<String, Value>,
    scope: &mut MergeScope,
) -> Result<(), Error> {
    for (element, add) in incoming {
        match base.get_mut(element) {
            None => match add {
                Value::Map(_) | Value::List(_) => {
                    base.insert(element.clone(), add.clone());
                }
                other => {
                    scope.note(
                        AnomalyKind::UnmergeableNewElement,
                        element,
                        None,
                        other.shape(),
                    );
                }
            },
            Some(Value::Map(existing)) => match add {
                Value::Map(add) => {
                    scope.path.push(element.clone());
                    merge_nested_at(existing, add, scope, 1)?;
                    scope.path.pop();
                }
                other => {
                    scope.note(
                        AnomalyKind::ShapeMismatch,
                        element,
                        Some(ValueShape::Map),
                        other.shape(),
                    );
                }
            },
            Some(Value::List(existing)) => match add {
                Value::List(add) if existing.len() == add.len() => {
                    for (slot, add) in existing.iter_mut().zip(add) {
                        *slot = checked_sum(*slot, *add, scope, Some(element))?;
                    }
                }
                Value::List(_) => {
                    scope.note(
                        AnomalyKind::ListLengthMismatch,
                        element,
                        Some(ValueShape::List),
                        ValueShape::List,
                    );
                }
                other => {
                    scope.note(
                        AnomalyKind::ShapeMismatch,
                        element,
                        Some(ValueShape::List),
                        other.shape(),
                    );
                }
            },
            Some(existing) => {
                let existing = existing.shape();
                scope.note(AnomalyKind::ShapeMismatch, element, Some(existing), add.shape());
            }
        }
    }
    Ok(())
}

/// Merge one colliding key. Returns the merged value to write back, or
/// `None` when the existing value should stand unchanged.
fn merge_collision(
    key: &str,
    mut existing: Value,
    incoming: &Value,
    options: &MergeOptions,
    scope: &mut MergeScope,
) -> Result<Option<Value>, Error> {
    let merged = if key.starts_with(&options.transcript_prefix) {
        match (&mut existing, incoming) {
            (Value::Map(base), Value::Map(add)) => {
                merge_transcript(base, add, scope)?;
                true
            }
            (existing, incoming) => {
                let existing = existing.shape();
                scope.note_key(AnomalyKind::ShapeMismatch, Some(existing), incoming.shape());
                false
            }
        }
    } else {
        match (&mut existing, incoming) {
            (Value::Map(base), Value::Map(add)) => {
                merge_generic_map(base, add, scope)?;
                true
            }
            (Value::Scalar(base), Value::Scalar(add)) => {
                *base = checked_sum(*base, *add, scope, None)?;
                true
            }
            (existing, incoming) => {
                let existing = existing.shape();
                scope.note_key(AnomalyKind::UnmergeableKey, Some(existing), incoming.shape());
                false
            }
        }
    };
    Ok(if merged { Some(existing) } else { None })
}

/// Drain each input store in order into `output`, then close it. New keys
/// are copied verbatim; colliding keys are combined per the transcript or
/// generic rules. The merged value is what lands in the store — anomalies
/// leave the existing value in place.
pub fn merge_stores(
    inputs: &[PathBuf],
    mut output: CountStore,
    options: &MergeOptions,
    observer: &mut dyn MergeObserver,
) -> Result<MergeReport, Error> {
    let mut report = MergeReport {
        inputs: inputs.len(),
        ..MergeReport::default()
    };

    for input_path in inputs {
        let input = CountStore::open(input_path)?;
        let total = input.len();
        let keys = input.keys().map(str::to_string).collect::<Vec<_>>();

        for (index, key) in keys.iter().enumerate() {
            if options.progress_every > 0 && index % options.progress_every == 0 {
                observer.on_progress(input_path, index, total);
            }
            report.keys_seen += 1;

            let incoming = input.get(key)?;
            if !output.contains(key) {
                output.set(key, incoming)?;
                report.keys_copied += 1;
            } else {
                let existing = output.get(key)?;
                let mut scope = MergeScope::new(key.as_str());
                let merged = merge_collision(key, existing, &incoming, options, &mut scope)?;
                for anomaly in scope.anomalies() {
                    observer.on_anomaly(anomaly);
                }
                report.anomalies.extend(scope.into_anomalies());
                if let Some(merged) = merged {
                    output.set(key, merged)?;
                }
                report.keys_merged += 1;
            }

            if !key.starts_with(&options.transcript_prefix) {
                report.generic_keys += 1;
                observer.on_generic_key(key);
            }
        }

        input.close()?;
    }

    output.close()?;
    Ok(report)
}
