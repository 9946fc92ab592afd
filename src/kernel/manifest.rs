//! Manifest kernel
//!
//! A deterministic stand-in for a solid modeler. Instead of geometry it
//! produces a build manifest: the part's resolved parameters, the digests of
//! the parts it was built from, and a SHA-256 digest over all of it. Two
//! builds from identical inputs yield byte-identical manifests.

use super::{GeometryKernel, ResolvedInputs};
use crate::error::KernelError;
use crate::graph::NodeKind;
use crate::params::ParamValue;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Digest of an upstream part consumed by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDigest {
    pub node: String,
    pub digest: String,
}

/// Output of [`ManifestKernel`] for one part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartManifest {
    pub node: String,
    pub kind: NodeKind,
    pub params: BTreeMap<String, ParamValue>,
    pub inputs: Vec<InputDigest>,
    /// SHA-256 over kind, parameters and input digests
    pub digest: String,
}

impl PartManifest {
    /// Short digest for display
    pub fn short_digest(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }
}

#[derive(Serialize)]
struct DigestInput<'a> {
    kind: &'a NodeKind,
    params: &'a BTreeMap<String, ParamValue>,
    inputs: &'a [InputDigest],
}

/// Kernel that builds [`PartManifest`]s
#[derive(Debug, Clone, Default)]
pub struct ManifestKernel {
    build_delay: Duration,
}

impl ManifestKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block each build for `delay`, to stand in for an expensive operation
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }
}

impl GeometryKernel for ManifestKernel {
    type Shape = PartManifest;

    fn build(
        &self,
        kind: &NodeKind,
        inputs: &ResolvedInputs<PartManifest>,
    ) -> Result<PartManifest, KernelError> {
        if !self.build_delay.is_zero() {
            std::thread::sleep(self.build_delay);
        }

        let upstream: Vec<InputDigest> = inputs
            .dependencies()
            .map(|(node, part)| InputDigest {
                node: node.to_string(),
                digest: part.digest.clone(),
            })
            .collect();

        let canonical = serde_json::to_vec(&DigestInput {
            kind,
            params: inputs.params(),
            inputs: &upstream,
        })
        .map_err(|e| KernelError::new(format!("encoding {} manifest: {}", inputs.node(), e)))?;

        Ok(PartManifest {
            node: inputs.node().to_string(),
            kind: kind.clone(),
            params: inputs.params().clone(),
            inputs: upstream,
            digest: hex::encode(Sha256::digest(&canonical)),
        })
    }

    fn weight(&self, shape: &PartManifest) -> u64 {
        serde_json::to_vec(shape).map_or(1, |bytes| bytes.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    fn inputs(value: f64) -> ResolvedInputs<PartManifest> {
        let params = BTreeMap::from([("headStock.angle".to_string(), ParamValue::Float(value))]);
        let fingerprint = Fingerprint::from_hex(&"1".repeat(64)).unwrap();
        ResolvedInputs::new("headstock", fingerprint, params, Vec::new())
    }

    #[test]
    fn identical_inputs_identical_manifest() {
        let kernel = ManifestKernel::new();
        let a = kernel.build(&NodeKind::Headstock, &inputs(9.0)).unwrap();
        let b = kernel.build(&NodeKind::Headstock, &inputs(9.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 64);
        assert_eq!(a.short_digest().len(), 12);
    }

    #[test]
    fn digest_tracks_parameters() {
        let kernel = ManifestKernel::new();
        let a = kernel.build(&NodeKind::Headstock, &inputs(9.0)).unwrap();
        let b = kernel.build(&NodeKind::Headstock, &inputs(12.0)).unwrap();
        assert_ne!(a.digest, b.digest);
        assert!(kernel.weight(&a) > 0);
    }
}
