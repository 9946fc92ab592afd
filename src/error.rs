//! Error types for fretforge
//!
//! All modules use `ForgeResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for fretforge operations
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Failure reported by the geometry kernel for one build.
///
/// Cloneable so a single failed build can be handed to every caller that
/// was waiting on the same fingerprint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct KernelError {
    message: String,
}

impl KernelError {
    /// Create a kernel error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The kernel's failure message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// All errors that can occur in fretforge
#[derive(Error, Debug, Clone)]
pub enum ForgeError {
    // Graph errors
    #[error("Dependency cycle through node {node}: {}", path.join(" -> "))]
    Cycle { node: String, path: Vec<String> },

    #[error("Unknown build node: {0}")]
    UnknownNode(String),

    #[error("Node {node} lists dependency {dependency} more than once")]
    DuplicateDependency { node: String, dependency: String },

    #[error("Node {node} is still required by: {}", dependents.join(", "))]
    NodeInUse {
        node: String,
        dependents: Vec<String>,
    },

    // Parameter errors
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Node {node} depends on parameter {parameter}, which has no value")]
    MissingParameter { node: String, parameter: String },

    #[error("Invalid value for parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    // Build errors
    #[error("Build of {node} failed: {source}")]
    Kernel {
        node: String,
        #[source]
        source: KernelError,
    },

    #[error("Build of {node} skipped: dependency {dependency} failed")]
    DependencyFailed { node: String, dependency: String },

    #[error("Build of {node} was abandoned before producing a result")]
    BuildAbandoned { node: String },

    #[error("Worker pool is shut down")]
    WorkerPoolClosed,

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}: {message}")]
    Io { context: String, message: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ForgeError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: source.to_string(),
        }
    }

    /// Create a kernel failure for a node
    pub fn kernel(node: impl Into<String>, source: KernelError) -> Self {
        Self::Kernel {
            node: node.into(),
            source,
        }
    }

    /// Whether this error came out of a part build rather than from the
    /// request itself (graph shape, parameters, configuration)
    pub fn is_build_failure(&self) -> bool {
        matches!(
            self,
            Self::Kernel { .. } | Self::DependencyFailed { .. } | Self::BuildAbandoned { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::Cycle { .. } => Some("Remove one of the dependencies on the reported path"),
            Self::NodeInUse { .. } => Some("Remove or re-register the dependent nodes first"),
            Self::UnknownParameter(_) => Some("Run: fretforge params"),
            Self::UnknownNode(_) => Some("Run: fretforge graph"),
            Self::ConfigInvalid { .. } => Some("Run: fretforge config init --force"),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<toml::de::Error> for ForgeError {
    fn from(err: toml::de::Error) -> Self {
        Self::TomlParse(err.to_string())
    }
}

impl From<toml::ser::Error> for ForgeError {
    fn from(err: toml::ser::Error) -> Self {
        Self::TomlSerialize(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Internal("shared state lock poisoned by a panicked thread".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ForgeError::Cycle {
            node: "neck".to_string(),
            path: vec!["neck".into(), "headstock".into(), "neck".into()],
        };
        assert!(err.to_string().contains("neck -> headstock -> neck"));
    }

    #[test]
    fn error_hint() {
        let err = ForgeError::UnknownParameter("scale.alto".to_string());
        assert_eq!(err.hint(), Some("Run: fretforge params"));
        assert_eq!(ForgeError::WorkerPoolClosed.hint(), None);
    }

    #[test]
    fn build_failures_classified() {
        let kernel = ForgeError::kernel("body", KernelError::new("non-manifold result"));
        assert!(kernel.is_build_failure());
        assert!(kernel.to_string().contains("non-manifold result"));
        assert!(!ForgeError::UnknownNode("x".into()).is_build_failure());
    }
}
