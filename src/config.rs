//! Pipeline configuration files

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::error::{GraphError, Result};
use crate::module::RoiContext;
use crate::token::Token;

/// Graph-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Output bound; 0 means unbounded
    #[serde(default)]
    pub max_width: u32,
    #[serde(default)]
    pub max_height: u32,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    #[serde(default = "default_frames")]
    pub frames: u64,
    /// Worker threads; defaults to the available parallelism
    #[serde(default)]
    pub threads: Option<usize>,
}

fn default_max_nodes() -> usize {
    1024
}

fn default_frames() -> u64 {
    1
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_width: 0,
            max_height: 0,
            max_nodes: default_max_nodes(),
            frames: default_frames(),
            threads: None,
        }
    }
}

impl GraphConfig {
    pub fn roi_context(&self) -> RoiContext {
        RoiContext {
            max_width: self.max_width,
            max_height: self.max_height,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub kind: String,
    #[serde(default = "default_instance")]
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

fn default_instance() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// `kind:name:connector` of the producing output
    pub from: String,
    /// `kind:name:connector` of the consuming input
    pub to: String,
}

/// Parsed `kind:name:connector` reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: Token,
    pub name: Token,
    pub connector: Token,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let [kind, name, connector] = parts.as_slice() else {
            return Err(GraphError::Config(format!(
                "endpoint '{}' must be kind:name:connector",
                s
            )));
        };
        let token = |part: &str| {
            Token::new(part).map_err(|e| GraphError::Config(format!("endpoint '{}': {}", s, e)))
        };
        Ok(Self {
            kind: token(kind)?,
            name: token(name)?,
            connector: token(connector)?,
        })
    }
}

/// A complete pipeline file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("i-blob:main:output").unwrap();
        assert_eq!(ep.kind, "i-blob");
        assert_eq!(ep.connector, "output");
        assert!(Endpoint::parse("i-blob:output").is_err());
        assert!(Endpoint::parse("i-blob:main:bad name").is_err());
    }

    #[test]
    fn test_defaults() {
        let json = r#"{ "modules": [{ "kind": "demosaic" }] }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        assert_eq!(config.graph.max_nodes, 1024);
        assert_eq!(config.graph.frames, 1);
        assert_eq!(config.modules[0].name, "main");
        assert!(config.connections.is_empty());
    }
}
