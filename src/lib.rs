//! pipegraph - per-frame compute graph for image and video pipelines
//!
//! Modules are configured into a chain, negotiate their regions of interest,
//! expand into nodes and run level by level on a fixed worker pool. Feedback
//! edges carry values from one frame into the next.

pub mod arena;
pub mod buffer;
pub mod config;
pub mod connector;
pub mod error;
pub mod execute;
pub mod graph;
pub mod metrics;
pub mod module;
pub mod modules;
pub mod negotiate;
pub mod node;
pub mod pyramid;
pub mod registry;
pub mod roi;
pub mod schedule;
pub mod threads;
pub mod token;
pub mod validation;

pub use arena::NodeArena;
pub use buffer::Buffer;
pub use config::{GraphConfig, PipelineConfig};
pub use connector::{ConnectorDecl, ConnectorKind, Format};
pub use error::{GraphError, Result};
pub use execute::KernelIo;
pub use graph::{BuildReport, FrameStats, Graph};
pub use metrics::{GraphMetrics, MetricsSnapshot};
pub use module::{ConnectorTemplate, Module, ModuleFlags, ModuleId, ModuleOps, ParamSpec, ParamType};
pub use node::{Node, NodeId};
pub use registry::ModuleRegistry;
pub use roi::Roi;
pub use threads::{Job, ThreadPool, WorkItems, WorkerContext};
pub use token::Token;
