//! fretforge - incremental, parallel part builds for parametric instruments
//!
//! A [`Pipeline`] keeps every built part in a content-addressed cache keyed
//! by a fingerprint of the part's kind, its parameters and the fingerprints
//! of its inputs. Parameter edits mark only the parts that read them, and a
//! request rebuilds only what the edit actually changed, running
//! independent parts concurrently on a bounded worker pool.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod invalidate;
pub mod kernel;
pub mod params;
pub mod pipeline;
pub mod scheduler;
pub mod ui;

pub use error::{ForgeError, ForgeResult, KernelError};
pub use fingerprint::Fingerprint;
pub use graph::{BuildNode, DependencyGraph, NodeKind};
pub use kernel::{BuilderTable, GeometryKernel, ManifestKernel, PartManifest, ResolvedInputs};
pub use params::{ParamValue, ParameterStore};
pub use pipeline::{Pipeline, PipelineOptions};
