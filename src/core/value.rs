//! Purpose: Tagged value model for count-store records.
//! Exports: `Value`, `ValueShape`.
//! Role: Canonical shape union the merge logic pattern-matches over.
//! Invariants: JSON round-trips losslessly; unrecognized shapes land in
//! `Other` instead of failing decode, so they stay reportable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A store record value.
///
/// Counts are integer leaves, either bare (`Scalar`), per-slot (`List`,
/// e.g. one count per frame or strand), or grouped under categorical keys
/// (`Map`, arbitrarily nested). Anything else decodes as `Other` and is
/// never merged, only reported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(i64),
    List(Vec<i64>),
    Map(BTreeMap<String, Value>),
    Other(serde_json::Value),
}

/// Shape discriminant used in anomaly reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueShape {
    Scalar,
    List,
    Map,
    Other,
}

impl ValueShape {
    pub fn name(self) -> &'static str {
        match self {
            ValueShape::Scalar => "scalar",
            ValueShape::List => "list",
            ValueShape::Map => "map",
            ValueShape::Other => "other",
        }
    }
}

impl Value {
    pub fn shape(&self) -> ValueShape {
        match self {
            Value::Scalar(_) => ValueShape::Scalar,
            Value::List(_) => ValueShape::List,
            Value::Map(_) => ValueShape::Map,
            Value::Other(_) => ValueShape::Other,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<i64> {
        match self {
            Value::Scalar(count) => Some(*count),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(count: i64) -> Self {
        Value::Scalar(count)
    }
}

impl From<Vec<i64>> for Value {
    fn from(counts: Vec<i64>) -> Self {
        Value::List(counts)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}
