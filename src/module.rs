//! Modules: configured pipeline stages and their capability tables.
//!
//! A module kind is described by a static [`ModuleOps`] table of optional
//! callbacks. Which callbacks are present decides whether a module is a plain
//! processing stage, a source, a sink or keeps feedback state; there is no
//! trait object per module instance.

use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::arena::NodeArena;
use crate::connector::{ConnectorKind, Format};
use crate::error::{GraphError, Result};
use crate::execute::KernelIo;
use crate::node::Node;
use crate::roi::Roi;
use crate::token::Token;

/// Index into the graph's module list.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ModuleId(pub u32);

impl ModuleId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({})", self.0)
    }
}

/// Module flag set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleFlags(u32);

impl ModuleFlags {
    pub const NONE: ModuleFlags = ModuleFlags(0);
    /// Loads external data once per build; needs `read_source`
    pub const READ_SOURCE: ModuleFlags = ModuleFlags(1);
    /// Hands buffers to an external consumer; needs `write_sink`
    pub const WRITE_SINK: ModuleFlags = ModuleFlags(1 << 1);
    /// Reads previous-frame values. Builds reject feedback edges in modules
    /// without it.
    pub const FEEDBACK: ModuleFlags = ModuleFlags(1 << 2);

    pub fn contains(self, other: ModuleFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Boundary connector declared by a module kind
#[derive(Debug, Clone, Copy)]
pub struct ConnectorTemplate {
    pub name: &'static str,
    pub kind: ConnectorKind,
    pub chan: &'static str,
    pub format: Format,
}

impl ConnectorTemplate {
    pub const fn read(name: &'static str, chan: &'static str, format: Format) -> Self {
        Self { name, kind: ConnectorKind::Read, chan, format }
    }

    pub const fn write(name: &'static str, chan: &'static str, format: Format) -> Self {
        Self { name, kind: ConnectorKind::Write, chan, format }
    }
}

/// JSON type of a module parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    Number,
    String,
    Boolean,
}

impl ParamType {
    pub fn as_str(&self) -> &str {
        match self {
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::String => "string",
            ParamType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub ty: ParamType,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, ty: ParamType) -> Self {
        Self { name, ty, required: true }
    }

    pub const fn optional(name: &'static str, ty: ParamType) -> Self {
        Self { name, ty, required: false }
    }
}

/// Handed to `read_source`
#[derive(Debug, Clone, Copy)]
pub struct ReadSourceParams {
    pub roi: Roi,
    pub node: Token,
    pub connector: Token,
    pub chan: Token,
    pub format: Format,
}

/// Handed to `write_sink`
#[derive(Debug, Clone, Copy)]
pub struct WriteSinkParams {
    pub roi: Roi,
    pub node: Token,
    pub connector: Token,
    pub chan: Token,
    pub format: Format,
    pub frame: u64,
}

pub type InitFn = fn(&mut Module) -> Result<()>;
pub type CleanupFn = fn(&mut Module);
pub type RoiFn = fn(&mut Module, &RoiContext);
pub type CreateNodesFn = fn(&mut NodeArena, &Module) -> Result<()>;
pub type ReadSourceFn = fn(&Module, &mut [u8], &ReadSourceParams) -> Result<()>;
pub type WriteSinkFn = fn(&Module, &[u8], &WriteSinkParams) -> Result<()>;
pub type CommitParamsFn = fn(&Module, &mut Node);
pub type KernelFn = fn(&Module, &Node, &mut KernelIo<'_>) -> Result<()>;

/// Graph-wide settings visible during ROI negotiation
#[derive(Debug, Clone, Copy)]
pub struct RoiContext {
    pub max_width: u32,
    pub max_height: u32,
}

impl RoiContext {
    /// Scale at which a `full_wd` x `full_ht` image fits the output bounds
    pub fn output_scale(&self, full_wd: u32, full_ht: u32) -> f32 {
        let mut scale = 1.0f32;
        if self.max_width > 0 && full_wd > self.max_width {
            scale = scale.min(self.max_width as f32 / full_wd as f32);
        }
        if self.max_height > 0 && full_ht > self.max_height {
            scale = scale.min(self.max_height as f32 / full_ht as f32);
        }
        scale
    }
}

/// Capability table of a module kind
#[derive(Debug, Clone, Copy)]
pub struct ModuleOps {
    pub kind: &'static str,
    pub connectors: &'static [ConnectorTemplate],
    pub params: &'static [ParamSpec],
    pub flags: ModuleFlags,
    pub init: Option<InitFn>,
    pub cleanup: Option<CleanupFn>,
    pub modify_roi_out: Option<RoiFn>,
    pub modify_roi_in: Option<RoiFn>,
    pub create_nodes: Option<CreateNodesFn>,
    pub read_source: Option<ReadSourceFn>,
    pub write_sink: Option<WriteSinkFn>,
    pub commit_params: Option<CommitParamsFn>,
    pub kernel: Option<KernelFn>,
}

impl ModuleOps {
    /// Table without any callbacks; fill in with struct update syntax
    pub const fn new(kind: &'static str) -> Self {
        Self {
            kind,
            connectors: &[],
            params: &[],
            flags: ModuleFlags::NONE,
            init: None,
            cleanup: None,
            modify_roi_out: None,
            modify_roi_in: None,
            create_nodes: None,
            read_source: None,
            write_sink: None,
            commit_params: None,
            kernel: None,
        }
    }
}

/// Where a module input gets its data from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLink {
    pub module: ModuleId,
    pub connector: usize,
}

/// Boundary connector of a module instance
#[derive(Debug, Clone)]
pub struct ModuleConnector {
    pub name: Token,
    pub kind: ConnectorKind,
    pub chan: Token,
    pub format: Format,
    pub roi: Roi,
    pub producer: Option<ModuleLink>,
}

type State = Arc<Mutex<Option<Box<dyn Any + Send>>>>;

/// Configured instance of a module kind
#[derive(Clone)]
pub struct Module {
    pub id: ModuleId,
    pub kind: Token,
    pub name: Token,
    pub ops: &'static ModuleOps,
    pub connectors: Vec<ModuleConnector>,
    pub params: Value,
    pub flags: ModuleFlags,
    state: State,
}

impl Module {
    pub fn new(id: ModuleId, name: Token, ops: &'static ModuleOps, params: Value) -> Result<Self> {
        let connectors = ops
            .connectors
            .iter()
            .map(|t| {
                Ok(ModuleConnector {
                    name: Token::new(t.name)?,
                    kind: t.kind,
                    chan: Token::new(t.chan)?,
                    format: t.format,
                    roi: Roi::default(),
                    producer: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            kind: Token::new(ops.kind)?,
            name,
            ops,
            connectors,
            params,
            flags: ops.flags,
            state: Arc::new(Mutex::new(None)),
        })
    }

    /// `kind:name`
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    pub fn connector_index(&self, name: Token) -> Option<usize> {
        self.connectors.iter().position(|c| c.name == name)
    }

    pub fn connector_named(&self, name: &str) -> Result<usize> {
        Token::new(name)
            .ok()
            .and_then(|t| self.connector_index(t))
            .ok_or_else(|| GraphError::UnknownConnector {
                owner: self.label(),
                connector: name.to_string(),
            })
    }

    pub fn inputs(&self) -> impl Iterator<Item = (usize, &ModuleConnector)> {
        self.connectors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind.is_input())
    }

    pub fn outputs(&self) -> impl Iterator<Item = (usize, &ModuleConnector)> {
        self.connectors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind.is_output())
    }

    /// Declared with a wildcard channel tag in the module kind
    pub fn is_wildcard(&self, connector: usize) -> bool {
        self.ops
            .connectors
            .get(connector)
            .map_or(false, |t| t.chan == "*" || t.format == Format::Any)
    }

    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params[key].as_u64().unwrap_or(default)
    }

    pub fn param_f32(&self, key: &str, default: f32) -> f32 {
        self.params[key].as_f64().map_or(default, |v| v as f32)
    }

    pub fn param_str<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.params[key].as_str().unwrap_or(default)
    }

    pub fn param_bool(&self, key: &str, default: bool) -> bool {
        self.params[key].as_bool().unwrap_or(default)
    }

    pub fn set_state<T: Any + Send>(&self, value: T) {
        *self.lock_state() = Some(Box::new(value));
    }

    pub fn clear_state(&self) {
        self.lock_state().take();
    }

    /// Run `f` on the per-instance state if it holds a `T`
    pub fn with_state<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.lock_state();
        guard.as_mut().and_then(|s| s.downcast_mut::<T>()).map(f)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn Any + Send>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("connectors", &self.connectors)
            .field("params", &self.params)
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    static TEST_OPS: ModuleOps = ModuleOps {
        connectors: &[
            ConnectorTemplate::read("input", "*", Format::F32),
            ConnectorTemplate::write("output", "rgba", Format::F32),
        ],
        flags: ModuleFlags::FEEDBACK,
        ..ModuleOps::new("test")
    };

    fn module() -> Module {
        let name = Token::new("main").unwrap();
        Module::new(ModuleId(0), name, &TEST_OPS, json!({ "weight": 0.5, "size": 3 })).unwrap()
    }

    #[test]
    fn test_module_from_template() {
        let m = module();
        assert_eq!(m.label(), "test:main");
        assert_eq!(m.inputs().count(), 1);
        assert_eq!(m.outputs().count(), 1);
        assert_eq!(m.connector_named("output").unwrap(), 1);
        assert!(m.connector_named("missing").is_err());
        assert!(m.is_wildcard(0));
        assert!(!m.is_wildcard(1));
        assert!(m.flags.contains(ModuleFlags::FEEDBACK));
    }

    #[test]
    fn test_params() {
        let m = module();
        assert_eq!(m.param_f32("weight", 0.1), 0.5);
        assert_eq!(m.param_u64("size", 1), 3);
        assert_eq!(m.param_u64("missing", 7), 7);
        assert_eq!(m.param_str("path", "out"), "out");
    }

    #[test]
    fn test_state_is_shared_between_clones() {
        let m = module();
        m.set_state(0u32);
        let copy = m.clone();
        copy.with_state(|n: &mut u32| *n += 2);
        assert_eq!(m.with_state(|n: &mut u32| *n), Some(2));
        assert_eq!(m.with_state(|s: &mut String| s.len()), None);
        m.clear_state();
        assert_eq!(copy.with_state(|n: &mut u32| *n), None);
    }

    #[test]
    fn test_output_scale() {
        let ctx = RoiContext { max_width: 32, max_height: 0 };
        assert_eq!(ctx.output_scale(64, 48), 0.5);
        assert_eq!(ctx.output_scale(16, 16), 1.0);
    }
}
