//! Lookup of module kinds by name

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{GraphError, Result};
use crate::module::{ModuleFlags, ModuleOps};
use crate::modules::BUILTINS;
use crate::token::Token;

#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    kinds: HashMap<Token, &'static ModuleOps>,
}

impl ModuleRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every module kind shipped with the crate
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for ops in BUILTINS {
            if let Err(e) = registry.register(*ops) {
                warn!("Skipping builtin module kind {}: {}", ops.kind, e);
            }
        }
        registry
    }

    /// Add a module kind. A kind name may only be registered once, and the
    /// source and sink flags must match the callbacks the table provides.
    pub fn register(&mut self, ops: &'static ModuleOps) -> Result<()> {
        let kind = Token::new(ops.kind)?;
        check_flags(ops)?;
        if self.kinds.contains_key(&kind) {
            return Err(GraphError::Config(format!(
                "module kind '{}' registered twice",
                kind
            )));
        }
        debug!("Registered module kind {}", kind);
        self.kinds.insert(kind, ops);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<&'static ModuleOps> {
        Token::new(kind)
            .ok()
            .and_then(|t| self.kinds.get(&t).copied())
            .ok_or_else(|| {
                let known = self.kinds().join(", ");
                GraphError::UnknownModuleKind(format!("{} (known: {})", kind, known))
            })
    }

    /// Registered kind names, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kinds.keys().map(Token::to_string).collect();
        kinds.sort();
        kinds
    }
}

fn check_flags(ops: &ModuleOps) -> Result<()> {
    let pairs = [
        (ModuleFlags::READ_SOURCE, "READ_SOURCE", ops.read_source.is_some(), "read_source"),
        (ModuleFlags::WRITE_SINK, "WRITE_SINK", ops.write_sink.is_some(), "write_sink"),
    ];
    for (flag, flag_name, present, callback) in pairs {
        if ops.flags.contains(flag) != present {
            return Err(GraphError::Config(format!(
                "module kind '{}': {} flag and {} callback must come together",
                ops.kind, flag_name, callback
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, WriteSinkParams};

    static CUSTOM: ModuleOps = ModuleOps::new("custom");

    static UNFLAGGED_SINK: ModuleOps = ModuleOps {
        write_sink: Some(ignore_sink),
        ..ModuleOps::new("sink")
    };

    static FLAG_ONLY: ModuleOps = ModuleOps {
        flags: ModuleFlags::READ_SOURCE,
        ..ModuleOps::new("source")
    };

    fn ignore_sink(_module: &Module, _data: &[u8], _params: &WriteSinkParams) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ModuleRegistry::with_builtins();
        for kind in ["i-blob", "demosaic", "hilite", "accum", "diff", "o-yuv", "o-png"] {
            assert!(registry.get(kind).is_ok(), "{} missing", kind);
        }
        assert!(matches!(
            registry.get("nope"),
            Err(GraphError::UnknownModuleKind(_))
        ));
    }

    #[test]
    fn test_register_twice() {
        let mut registry = ModuleRegistry::new();
        registry.register(&CUSTOM).unwrap();
        assert!(registry.register(&CUSTOM).is_err());
        assert_eq!(registry.kinds(), vec!["custom".to_string()]);
    }

    #[test]
    fn test_flags_must_match_callbacks() {
        let mut registry = ModuleRegistry::new();
        let err = registry.register(&UNFLAGGED_SINK).unwrap_err();
        assert!(err.to_string().contains("WRITE_SINK"));
        let err = registry.register(&FLAG_ONLY).unwrap_err();
        assert!(err.to_string().contains("read_source"));
        assert!(registry.kinds().is_empty());
    }

    #[test]
    fn test_unknown_kind_lists_known() {
        let registry = ModuleRegistry::with_builtins();
        let err = registry.get("o-jpeg").unwrap_err();
        assert!(err.to_string().contains("o-png"));
    }
}
