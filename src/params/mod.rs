//! Versioned parameter store
//!
//! The single source of truth for instrument configuration. Every edit goes
//! through [`ParameterStore::apply`], which applies a whole batch under one
//! version bump so no reader ever sees a half-applied batch.

pub mod catalog;
pub mod file;

pub use catalog::{ParamSpec, CATALOG};
pub use file::load_parameter_file;

use crate::error::{ForgeError, ForgeResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A parameter value: a scalar, an enum choice, or a list of numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    FloatList(Vec<f64>),
}

impl ParamValue {
    /// Short type name used in validation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::FloatList(_) => "float list",
        }
    }

    /// Numeric view of scalar values
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Parse a command-line style value (`true`, `12`, `25.5`, `1,2,3`, text)
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(b) = raw.parse::<bool>() {
            return Self::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Self::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Self::Float(f);
        }
        if raw.contains(',') {
            let parsed: Result<Vec<f64>, _> =
                raw.split(',').map(|s| s.trim().parse::<f64>()).collect();
            if let Ok(list) = parsed {
                return Self::FloatList(list);
            }
        }
        Self::Text(raw.to_string())
    }

    fn is_finite(&self) -> bool {
        match self {
            Self::Float(f) => f.is_finite(),
            Self::FloatList(list) => list.iter().all(|f| f.is_finite()),
            _ => true,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::FloatList(list) => {
                let parts: Vec<String> = list.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// A stored parameter and the store version at which it last changed
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: ParamValue,
    pub version: u64,
}

/// Immutable copy of every parameter value at one store version.
///
/// Build passes resolve all fingerprints from a single snapshot, which is
/// what keeps an artifact from ever mixing pre- and post-edit values.
#[derive(Debug, Clone, Default)]
pub struct ParamSnapshot {
    pub version: u64,
    values: BTreeMap<String, ParamValue>,
}

impl ParamSnapshot {
    /// Value of one parameter
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Number of parameters captured
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot holds no parameters
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Versioned mapping of parameter name to value
#[derive(Debug, Default)]
pub struct ParameterStore {
    params: BTreeMap<String, Parameter>,
    version: u64,
    validate_catalog: bool,
}

impl ParameterStore {
    /// Empty store that accepts any parameter name
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the instrument catalogue defaults.
    ///
    /// Edits to catalogued parameters are type- and choice-checked.
    pub fn with_catalog() -> Self {
        let params = CATALOG
            .iter()
            .map(|spec| {
                (
                    spec.name.to_string(),
                    Parameter {
                        name: spec.name.to_string(),
                        value: spec.default_value(),
                        version: 0,
                    },
                )
            })
            .collect();

        Self {
            params,
            version: 0,
            validate_catalog: true,
        }
    }

    /// Current store version (bumped once per effective batch)
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Iterate parameters in name order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    /// Capture every value at the current version
    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot {
            version: self.version,
            values: self
                .params
                .iter()
                .map(|(k, p)| (k.clone(), p.value.clone()))
                .collect(),
        }
    }

    /// Apply a batch of edits atomically.
    ///
    /// The whole batch is validated first; nothing is applied if any edit is
    /// rejected. Edits that do not change a value are dropped. Returns the
    /// names that actually changed, in name order, and bumps the version once
    /// if that list is non-empty. Later edits to the same name win.
    pub fn apply(&mut self, edits: Vec<(String, ParamValue)>) -> ForgeResult<Vec<String>> {
        let mut pending: BTreeMap<String, ParamValue> = BTreeMap::new();
        for (name, value) in edits {
            let value = self.validate(&name, value)?;
            pending.insert(name, value);
        }

        let changed: Vec<String> = pending
            .iter()
            .filter(|(name, value)| self.params.get(*name).map(|p| &p.value) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect();

        if changed.is_empty() {
            return Ok(changed);
        }

        self.version += 1;
        for name in &changed {
            if let Some(value) = pending.remove(name) {
                self.params.insert(
                    name.clone(),
                    Parameter {
                        name: name.clone(),
                        value,
                        version: self.version,
                    },
                );
            }
        }

        Ok(changed)
    }

    fn validate(&self, name: &str, value: ParamValue) -> ForgeResult<ParamValue> {
        if name.trim().is_empty() {
            return Err(ForgeError::InvalidParameter {
                name: name.to_string(),
                reason: "name cannot be empty".to_string(),
            });
        }
        if !value.is_finite() {
            return Err(ForgeError::InvalidParameter {
                name: name.to_string(),
                reason: "value must be finite".to_string(),
            });
        }
        if !self.validate_catalog {
            return Ok(value);
        }
        match catalog::lookup(name) {
            Some(spec) => spec.coerce(value),
            None => match value {
                ParamValue::Float(_) => Ok(value),
                ParamValue::Int(i) => Ok(ParamValue::Float(i as f64)),
                other => Err(ForgeError::InvalidParameter {
                    name: name.to_string(),
                    reason: format!(
                        "custom parameters must be numbers, got {}",
                        other.type_name()
                    ),
                }),
            },
        }
    }
}
