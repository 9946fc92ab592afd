//! Fingerprint engine
//!
//! A fingerprint identifies a node's effective inputs: its id and kind, the
//! values of its declared parameters, and the fingerprints of its
//! dependencies in declared order. Kernels see the node id, so two nodes
//! with identical kind and inputs still get distinct artifacts. Inputs are serialized to canonical JSON (parameters
//! sorted by name) and hashed with SHA-256, so the result never depends on
//! memory addresses or hash-map iteration order.

use crate::error::{ForgeError, ForgeResult};
use crate::graph::BuildNode;
use crate::params::{ParamSnapshot, ParamValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Version tag mixed into every fingerprint; bump when the encoding changes
const FINGERPRINT_FORMAT: u32 = 2;

/// Stable identity of a node's effective inputs
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Full lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the full hex form
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let digest: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(digest))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid fingerprint"))
    }
}

/// The shape that gets canonicalized and hashed
#[derive(Serialize)]
struct FingerprintInput<'a> {
    format: u32,
    epoch: u64,
    node: &'a str,
    kind: String,
    params: BTreeMap<&'a str, &'a ParamValue>,
    deps: Vec<String>,
}

/// Resolve the values of a node's declared parameters from a snapshot.
///
/// Fails with [`ForgeError::MissingParameter`] if any has no value.
pub fn resolve_params<'a>(
    node: &BuildNode,
    snapshot: &'a ParamSnapshot,
) -> ForgeResult<BTreeMap<String, &'a ParamValue>> {
    node.param_deps
        .iter()
        .map(|name| {
            snapshot
                .get(name)
                .map(|value| (name.clone(), value))
                .ok_or_else(|| ForgeError::MissingParameter {
                    node: node.id.clone(),
                    parameter: name.clone(),
                })
        })
        .collect()
}

/// Compute a node's fingerprint.
///
/// `dependency_fingerprints` must follow `node.node_deps` order. `epoch`
/// salts every fingerprint so a forced full rebuild never hits old entries.
pub fn fingerprint(
    node: &BuildNode,
    params: &BTreeMap<String, &ParamValue>,
    dependency_fingerprints: &[Fingerprint],
    epoch: u64,
) -> ForgeResult<Fingerprint> {
    if dependency_fingerprints.len() != node.node_deps.len() {
        return Err(ForgeError::Internal(format!(
            "{} has {} dependencies but {} fingerprints were supplied",
            node.id,
            node.node_deps.len(),
            dependency_fingerprints.len()
        )));
    }

    let input = FingerprintInput {
        format: FINGERPRINT_FORMAT,
        epoch,
        node: &node.id,
        kind: node.kind.to_string(),
        params: params.iter().map(|(k, v)| (k.as_str(), *v)).collect(),
        deps: dependency_fingerprints.iter().map(Fingerprint::to_hex).collect(),
    };

    let canonical = serde_json::to_vec(&input)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(Fingerprint(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use crate::params::ParameterStore;

    fn snapshot(edits: &[(&str, f64)]) -> ParamSnapshot {
        let mut store = ParameterStore::new();
        store
            .apply(
                edits
                    .iter()
                    .map(|(k, v)| (k.to_string(), ParamValue::Float(*v)))
                    .collect(),
            )
            .unwrap();
        store.snapshot()
    }

    fn node() -> BuildNode {
        BuildNode::new("neck", NodeKind::Neck).params(["scale_length", "neck_angle"])
    }

    #[test]
    fn deterministic_regardless_of_edit_order() {
        let a = snapshot(&[("scale_length", 25.5), ("neck_angle", 3.0)]);
        let b = snapshot(&[("neck_angle", 3.0), ("scale_length", 25.5)]);

        let fa = fingerprint(&node(), &resolve_params(&node(), &a).unwrap(), &[], 0).unwrap();
        let fb = fingerprint(&node(), &resolve_params(&node(), &b).unwrap(), &[], 0).unwrap();
        assert_eq!(fa, fb);
    }

    #[test]
    fn undeclared_parameters_are_ignored() {
        let a = snapshot(&[("scale_length", 25.5), ("neck_angle", 3.0)]);
        let b = snapshot(&[("scale_length", 25.5), ("neck_angle", 3.0), ("body_width", 1.0)]);

        let fa = fingerprint(&node(), &resolve_params(&node(), &a).unwrap(), &[], 0).unwrap();
        let fb = fingerprint(&node(), &resolve_params(&node(), &b).unwrap(), &[], 0).unwrap();
        assert_eq!(fa, fb);
    }

    #[test]
    fn inputs_change_the_fingerprint() {
        let snap = snapshot(&[("scale_length", 25.5), ("neck_angle", 3.0)]);
        let params = resolve_params(&node(), &snap).unwrap();
        let base = fingerprint(&node(), &params, &[], 0).unwrap();

        let other = snapshot(&[("scale_length", 24.75), ("neck_angle", 3.0)]);
        let changed =
            fingerprint(&node(), &resolve_params(&node(), &other).unwrap(), &[], 0).unwrap();
        assert_ne!(base, changed);

        let salted = fingerprint(&node(), &params, &[], 1).unwrap();
        assert_ne!(base, salted);

        let mut body = node();
        body.kind = NodeKind::Body;
        assert_ne!(base, fingerprint(&body, &params, &[], 0).unwrap());
    }

    #[test]
    fn same_kind_and_inputs_differ_by_node() {
        let snap = snapshot(&[("nut_width", 43.0)]);
        let a = BuildNode::new("nut_a", NodeKind::Nut).params(["nut_width"]);
        let b = BuildNode::new("nut_b", NodeKind::Nut).params(["nut_width"]);

        let fa = fingerprint(&a, &resolve_params(&a, &snap).unwrap(), &[], 0).unwrap();
        let fb = fingerprint(&b, &resolve_params(&b, &snap).unwrap(), &[], 0).unwrap();
        assert_ne!(fa, fb);
    }

    #[test]
    fn dependency_order_matters() {
        let snap = snapshot(&[]);
        let a = fingerprint(&BuildNode::new("a", NodeKind::Nut), &BTreeMap::new(), &[], 0).unwrap();
        let b = fingerprint(&BuildNode::new("b", NodeKind::Bridge), &BTreeMap::new(), &[], 0).unwrap();
        let joined = BuildNode::new("j", NodeKind::Assembly).after(["a", "b"]);
        let params = resolve_params(&joined, &snap).unwrap();

        let ab = fingerprint(&joined, &params, &[a, b], 0).unwrap();
        let ba = fingerprint(&joined, &params, &[b, a], 0).unwrap();
        assert_ne!(ab, ba);
    }

    #[test]
    fn missing_parameter_is_reported() {
        let snap = snapshot(&[("scale_length", 25.5)]);
        let err = resolve_params(&node(), &snap).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::MissingParameter { ref parameter, .. } if parameter == "neck_angle"
        ));
    }

    #[test]
    fn hex_roundtrip() {
        let f = fingerprint(&BuildNode::new("a", NodeKind::Nut), &BTreeMap::new(), &[], 0).unwrap();
        assert_eq!(Fingerprint::from_hex(&f.to_hex()), Some(f));
        assert_eq!(f.short().len(), 12);
    }
}
