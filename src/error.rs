use thiserror::Error;

use crate::token::TokenError;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Invalid identifier: {0}")]
    Token(#[from] TokenError),

    #[error("Unknown module kind: {0}")]
    UnknownModuleKind(String),

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown connector '{connector}' on {owner}")]
    UnknownConnector { owner: String, connector: String },

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Cannot connect {producer} -> {consumer}: {reason}")]
    IncompatibleConnection {
        producer: String,
        consumer: String,
        reason: String,
    },

    #[error("Connector {0} is already connected")]
    AlreadyConnected(String),

    #[error("Input connector {0} is not connected")]
    Unconnected(String),

    #[error("Connector {0} has no resolved ROI")]
    UnresolvedRoi(String),

    #[error("Capacity exceeded: {what} (limit {limit})")]
    CapacityExceeded { what: &'static str, limit: usize },

    #[error("Cycle detected through {0}")]
    Cycle(String),

    #[error("ROI negotiation did not converge after {0} sweeps")]
    RoiNotConverged(usize),

    #[error("Failed to build module {module}: {source}")]
    Build {
        module: String,
        #[source]
        source: Box<GraphError>,
    },

    #[error("Graph has not been built")]
    NotBuilt,

    #[error("Node {node} failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Execution cancelled by pool shutdown")]
    Cancelled,

    #[error("Source size mismatch: expected {expected} bytes, found {found}")]
    SourceSize { expected: usize, found: usize },

    #[error("Buffer size mismatch on {connector}: expected {expected} elements, found {found}")]
    BufferSize {
        connector: String,
        expected: usize,
        found: usize,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl GraphError {
    /// Attach the failing module's name to a build error
    pub fn in_module(self, module: impl Into<String>) -> Self {
        match self {
            // keep the innermost module name
            GraphError::Build { .. } => self,
            other => GraphError::Build {
                module: module.into(),
                source: Box::new(other),
            },
        }
    }

    /// Build-fatal errors abort graph construction; everything else is a
    /// runtime or data error.
    pub fn is_build_fatal(&self) -> bool {
        matches!(
            self,
            GraphError::Build { .. }
                | GraphError::IncompatibleConnection { .. }
                | GraphError::AlreadyConnected(_)
                | GraphError::Unconnected(_)
                | GraphError::UnresolvedRoi(_)
                | GraphError::CapacityExceeded { .. }
                | GraphError::Cycle(_)
                | GraphError::RoiNotConverged(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::CapacityExceeded {
            what: "nodes",
            limit: 4,
        };
        assert_eq!(err.to_string(), "Capacity exceeded: nodes (limit 4)");
    }

    #[test]
    fn test_in_module_keeps_innermost() {
        let err = GraphError::Cycle("hilite:main/reduce".to_string())
            .in_module("hilite:main")
            .in_module("outer:main");
        let msg = err.to_string();
        assert!(msg.contains("hilite:main"));
        assert!(!msg.contains("outer"));
        assert!(err.is_build_fatal());
    }

    #[test]
    fn test_runtime_errors_not_build_fatal() {
        assert!(!GraphError::Cancelled.is_build_fatal());
        assert!(!GraphError::SourceSize {
            expected: 8,
            found: 4
        }
        .is_build_fatal());
    }
}
