//! The module graph: configuration, build and per-frame execution.
//!
//! A [`Graph`] owns the module chain. [`Graph::build`] negotiates ROIs,
//! expands every module into nodes, wires the module boundaries together,
//! compiles the schedule and allocates buffers. [`Graph::run_frame`] then
//! executes the compiled runtime on a [`ThreadPool`] until the module chain
//! changes and the graph is built again.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::arena::{Binding, NodeArena};
use crate::config::{Endpoint, GraphConfig, PipelineConfig};
use crate::connector::{check_compatible, ensure_compatible, ConnectorDecl, Format, ProducerRef};
use crate::error::{GraphError, Result};
use crate::execute::{load_sources, run_levels, BufferStore, FrameShared, Runtime};
use crate::metrics::{GraphMetrics, Timer};
use crate::module::{Module, ModuleFlags, ModuleId, ModuleLink};
use crate::negotiate::{module_order, negotiate};
use crate::node::{Node, NodeId};
use crate::registry::ModuleRegistry;
use crate::schedule::Schedule;
use crate::threads::ThreadPool;
use crate::token::Token;
use crate::validation::validate_params;

/// Summary of a successful build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub nodes: usize,
    pub levels: usize,
    pub sweeps: usize,
    pub feedback_edges: usize,
    pub buffer_bytes: usize,
}

/// Summary of one executed frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameStats {
    pub frame: u64,
    pub levels: usize,
    pub nodes_executed: usize,
    pub sources_loaded: usize,
    pub elapsed_ms: u64,
}

pub struct Graph {
    config: GraphConfig,
    registry: ModuleRegistry,
    modules: Vec<Module>,
    runtime: Option<Runtime>,
    frame: u64,
    metrics: Arc<GraphMetrics>,
}

impl Graph {
    /// Empty graph knowing the builtin module kinds
    pub fn new(config: GraphConfig) -> Self {
        Self::with_registry(config, ModuleRegistry::with_builtins())
    }

    pub fn with_registry(config: GraphConfig, registry: ModuleRegistry) -> Self {
        Self {
            config,
            registry,
            modules: Vec::new(),
            runtime: None,
            frame: 0,
            metrics: GraphMetrics::new(),
        }
    }

    /// Instantiate and connect every module of a pipeline file
    pub fn from_config(pipeline: &PipelineConfig) -> Result<Self> {
        Self::from_config_with_registry(pipeline, ModuleRegistry::with_builtins())
    }

    pub fn from_config_with_registry(
        pipeline: &PipelineConfig,
        registry: ModuleRegistry,
    ) -> Result<Self> {
        let mut graph = Self::with_registry(pipeline.graph.clone(), registry);
        for m in &pipeline.modules {
            graph.add_module(&m.kind, &m.name, m.params.clone())?;
        }
        for conn in &pipeline.connections {
            let from = Endpoint::parse(&conn.from)?;
            let to = Endpoint::parse(&conn.to)?;
            let producer = graph.endpoint_module(&from)?;
            let consumer = graph.endpoint_module(&to)?;
            let (output, input) = (from.connector.to_string(), to.connector.to_string());
            graph.connect(producer, &output, consumer, &input)?;
        }
        info!(
            "Loaded pipeline: {} modules, {} connections",
            pipeline.modules.len(),
            pipeline.connections.len()
        );
        Ok(graph)
    }

    fn endpoint_module(&self, ep: &Endpoint) -> Result<ModuleId> {
        self.modules
            .iter()
            .find(|m| m.kind == ep.kind && m.name == ep.name)
            .map(|m| m.id)
            .ok_or_else(|| GraphError::UnknownModule(format!("{}:{}", ep.kind, ep.name)))
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GraphConfig {
        self.invalidate();
        &mut self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Create a module instance of a registered kind and run its `init`
    pub fn add_module(&mut self, kind: &str, name: &str, params: Value) -> Result<ModuleId> {
        let ops = self.registry.get(kind)?;
        let kind_token = Token::new(ops.kind)?;
        let name_token = Token::new(name)?;
        let label = format!("{}:{}", kind, name);
        if self
            .modules
            .iter()
            .any(|m| m.kind == kind_token && m.name == name_token)
        {
            return Err(GraphError::Config(format!("duplicate module {}", label)));
        }
        validate_params(&label, &params, ops.params)?;

        let id = ModuleId(self.modules.len() as u32);
        let mut module = Module::new(id, name_token, ops, params)?;
        if let Some(init) = ops.init {
            init(&mut module).map_err(|e| e.in_module(label.as_str()))?;
        }
        debug!("Added module {}", label);
        self.modules.push(module);
        self.invalidate();
        Ok(id)
    }

    pub fn module(&self, id: ModuleId) -> Result<&Module> {
        self.modules
            .get(id.index())
            .ok_or_else(|| GraphError::UnknownModule(format!("{:?}", id)))
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn find_module(&self, kind: &str, name: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .find(|m| m.kind == kind && m.name == name)
            .map(|m| m.id)
    }

    /// Feed module input `input` of `consumer` from output `output` of
    /// `producer`
    pub fn connect(
        &mut self,
        producer: ModuleId,
        output: &str,
        consumer: ModuleId,
        input: &str,
    ) -> Result<()> {
        let p = self.module(producer)?;
        let c = self.module(consumer)?;
        let pc = p.connector_named(output)?;
        let cc = c.connector_named(input)?;
        let (pconn, cconn) = (&p.connectors[pc], &c.connectors[cc]);
        let producer_end = format!("{}:{}", p.label(), pconn.name);
        let consumer_end = format!("{}:{}", c.label(), cconn.name);

        if producer == consumer {
            return Err(GraphError::Cycle(consumer_end));
        }
        if cconn.producer.is_some() {
            return Err(GraphError::AlreadyConnected(consumer_end));
        }
        check_compatible(
            (pconn.kind, pconn.chan, pconn.format),
            (cconn.kind, cconn.chan, cconn.format),
        )
        .map_err(|reason| GraphError::IncompatibleConnection {
            producer: producer_end.clone(),
            consumer: consumer_end.clone(),
            reason,
        })?;

        self.modules[consumer.index()].connectors[cc].producer = Some(ModuleLink {
            module: producer,
            connector: pc,
        });
        debug!("Connected {} -> {}", producer_end, consumer_end);
        self.invalidate();
        Ok(())
    }

    /// Change one parameter. Parameters reach the nodes through
    /// `commit_params` on the next frame; changes that alter the node
    /// structure need [`Graph::invalidate`] and a new build.
    pub fn set_param(&mut self, id: ModuleId, key: &str, value: Value) -> Result<()> {
        let module = self.module(id)?;
        let mut params = match &module.params {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        params.insert(key.to_string(), value);
        let params = Value::Object(params);
        validate_params(&module.label(), &params, module.ops.params)?;
        self.modules[id.index()].params = params;
        Ok(())
    }

    /// Drop the compiled runtime; the next frame needs a build
    pub fn invalidate(&mut self) {
        if self.runtime.take().is_some() {
            debug!("Graph invalidated");
        }
    }

    pub fn is_built(&self) -> bool {
        self.runtime.is_some()
    }

    /// Negotiate, expand, wire, schedule and allocate. On failure no runtime
    /// remains.
    pub fn build(&mut self) -> Result<BuildReport> {
        let timer = Timer::new();
        self.runtime = None;
        match self.compile() {
            Ok((runtime, report)) => {
                self.runtime = Some(runtime);
                self.metrics.record_build(true);
                info!(
                    "Built graph: {} modules, {} nodes in {} levels, {} sweeps, {} bytes ({} ms)",
                    self.modules.len(),
                    report.nodes,
                    report.levels,
                    report.sweeps,
                    report.buffer_bytes,
                    timer.elapsed_ms()
                );
                Ok(report)
            }
            Err(e) => {
                self.metrics.record_build(false);
                warn!("Graph build failed: {}", e);
                Err(e)
            }
        }
    }

    fn compile(&mut self) -> Result<(Runtime, BuildReport)> {
        for m in &self.modules {
            for (_, c) in m.inputs() {
                if c.producer.is_none() {
                    return Err(GraphError::Unconnected(format!("{}:{}", m.label(), c.name)));
                }
            }
        }

        let sweeps = negotiate(&mut self.modules, &self.config.roi_context())?;
        for m in &self.modules {
            for c in &m.connectors {
                if c.roi.is_empty() {
                    return Err(GraphError::UnresolvedRoi(format!("{}:{}", m.label(), c.name)));
                }
            }
        }

        let mut arena = NodeArena::new(self.config.max_nodes);
        for m in module_order(&self.modules)? {
            let module = &self.modules[m];
            let created = match module.ops.create_nodes {
                Some(create) => create(&mut arena, module),
                None => default_nodes(&mut arena, module),
            };
            created.map_err(|e| e.in_module(module.label()))?;
        }

        let (mut nodes, bindings) = arena.into_parts();
        wire_modules(&self.modules, &mut nodes, &bindings)?;
        for node in &nodes {
            let module = &self.modules[node.module.index()];
            let owner = || module.label();
            for c in &node.connectors {
                let end = || format!("{}:{}", node.label(), c.name);
                if c.kind.is_input() && c.producer.is_none() {
                    return Err(GraphError::Unconnected(end()).in_module(owner()));
                }
                let feedback = c.producer.map_or(false, |p| p.feedback);
                if feedback && !module.flags.contains(ModuleFlags::FEEDBACK) {
                    let reason =
                        format!("{} reads the previous frame without the FEEDBACK flag", end());
                    return Err(GraphError::Config(reason).in_module(owner()));
                }
                if c.roi.is_none() {
                    return Err(GraphError::UnresolvedRoi(end()).in_module(owner()));
                }
            }
        }

        let schedule = Schedule::compile(&nodes)?;
        let store = BufferStore::allocate(&nodes);
        let report = BuildReport {
            nodes: nodes.len(),
            levels: schedule.len(),
            sweeps,
            feedback_edges: nodes
                .iter()
                .flat_map(|n| &n.connectors)
                .filter(|c| c.producer.map_or(false, |p| p.feedback))
                .count(),
            buffer_bytes: store.allocated_bytes(),
        };
        let runtime = Runtime {
            nodes: Arc::new(nodes),
            schedule,
            store: Arc::new(store),
            sources_loaded: false,
            frames_run: 0,
        };
        Ok((runtime, report))
    }

    /// Execute one frame of the compiled graph
    pub fn run_frame(&mut self, pool: &ThreadPool) -> Result<FrameStats> {
        let timer = Timer::new();
        let Some(runtime) = self.runtime.as_mut() else {
            return Err(GraphError::NotBuilt);
        };
        if pool.shutting_down() {
            return Err(GraphError::Cancelled);
        }

        let nodes = Arc::make_mut(&mut runtime.nodes);
        for node in nodes.iter_mut() {
            let module = &self.modules[node.module.index()];
            if let Some(commit) = module.ops.commit_params {
                commit(module, node);
            }
        }

        let shared = Arc::new(FrameShared {
            modules: self.modules.clone(),
            nodes: Arc::clone(&runtime.nodes),
            store: Arc::clone(&runtime.store),
            frame: self.frame,
            first_frame: runtime.frames_run == 0,
            metrics: Arc::clone(&self.metrics),
        });

        match execute_frame(pool, runtime, &shared) {
            Ok((sources_loaded, nodes_executed)) => {
                let committed = runtime.store.commit_history();
                runtime.frames_run += 1;
                let stats = FrameStats {
                    frame: self.frame,
                    levels: runtime.schedule.len(),
                    nodes_executed,
                    sources_loaded,
                    elapsed_ms: timer.elapsed_ms(),
                };
                self.frame += 1;
                self.metrics.record_frame(true, stats.elapsed_ms);
                info!(
                    "Frame {}: {} nodes, {} feedback buffers committed ({} ms)",
                    stats.frame, stats.nodes_executed, committed, stats.elapsed_ms
                );
                Ok(stats)
            }
            Err(e) => {
                self.metrics.record_frame(false, timer.elapsed_ms());
                warn!("Frame {} failed: {}", self.frame, e);
                Err(e)
            }
        }
    }

    /// Compiled nodes, empty before a build
    pub fn nodes(&self) -> &[Node] {
        self.runtime.as_ref().map_or(&[], |r| r.nodes.as_slice())
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.runtime.as_ref().map(|r| &r.schedule)
    }

    pub fn buffers(&self) -> Option<&BufferStore> {
        self.runtime.as_ref().map(|r| r.store.as_ref())
    }

    pub fn find_node(&self, kind: &str, name: &str, kernel: &str) -> Option<NodeId> {
        self.nodes()
            .iter()
            .position(|n| n.kind == kind && n.name == name && n.kernel == kernel)
            .map(|i| NodeId(i as u32))
    }

    /// Graphviz rendering of the compiled nodes, one cluster per module
    pub fn write_dot(&self, out: &mut impl Write) -> Result<()> {
        let runtime = self.runtime.as_ref().ok_or(GraphError::NotBuilt)?;
        writeln!(out, "digraph pipegraph {{")?;
        writeln!(out, "  rankdir=LR;")?;
        for module in &self.modules {
            writeln!(out, "  subgraph cluster_{} {{", module.id.index())?;
            writeln!(out, "    label=\"{}\";", module.label())?;
            for (i, node) in runtime.nodes.iter().enumerate() {
                if node.module == module.id {
                    writeln!(
                        out,
                        "    n{} [label=\"{}\\n{}x{}\"];",
                        i, node.kernel, node.wd, node.ht
                    )?;
                }
            }
            writeln!(out, "  }}")?;
        }
        for (i, node) in runtime.nodes.iter().enumerate() {
            for c in &node.connectors {
                let Some(p) = c.producer else { continue };
                let style = if p.feedback { ", style=dashed" } else { "" };
                let from = &runtime.nodes[p.node.index()].connectors[p.connector];
                writeln!(
                    out,
                    "  n{} -> n{} [label=\"{} -> {}\"{}];",
                    p.node.index(),
                    i,
                    from.name,
                    c.name,
                    style
                )?;
            }
        }
        writeln!(out, "}}")?;
        Ok(())
    }

    pub fn metrics(&self) -> &Arc<GraphMetrics> {
        &self.metrics
    }

    /// Index of the next frame to run
    pub fn frame(&self) -> u64 {
        self.frame
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.runtime = None;
        for module in &mut self.modules {
            if let Some(cleanup) = module.ops.cleanup {
                cleanup(module);
            }
        }
    }
}

fn execute_frame(
    pool: &ThreadPool,
    runtime: &mut Runtime,
    shared: &Arc<FrameShared>,
) -> Result<(usize, usize)> {
    let mut sources = 0;
    if !runtime.sources_loaded {
        sources = load_sources(pool, shared)?;
        runtime.sources_loaded = true;
    }
    let executed = run_levels(pool, shared, &runtime.schedule)?;
    Ok((sources, executed))
}

/// Single `main` node mirroring the module's connectors
fn default_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let decls: Vec<ConnectorDecl> = module
        .connectors
        .iter()
        .zip(module.ops.connectors)
        .map(|(c, template)| ConnectorDecl {
            name: template.name,
            kind: c.kind,
            chan: c.chan,
            format: c.format,
            roi: if c.kind.is_input() { None } else { Some(c.roi) },
        })
        .collect();
    let roi = module
        .outputs()
        .chain(module.inputs())
        .next()
        .map(|(_, c)| c.roi)
        .unwrap_or_default();

    let id = arena.add_node(module, "main", [roi.wd, roi.ht, 1], &[], &decls)?;
    for c in 0..decls.len() {
        arena.copy_connector(module, c, id, c)?;
    }
    Ok(())
}

fn endpoint(nodes: &[Node], node: NodeId, c: usize) -> String {
    let n = &nodes[node.index()];
    format!("{}:{}", n.label(), n.connectors[c].name)
}

/// Resolve every input binding to the node bound to the upstream module
/// output
fn wire_modules(modules: &[Module], nodes: &mut [Node], bindings: &[Binding]) -> Result<()> {
    for b in bindings {
        let module = &modules[b.module.index()];
        let mconn = &module.connectors[b.module_connector];
        if !mconn.kind.is_input() {
            continue;
        }
        let link = mconn
            .producer
            .ok_or_else(|| GraphError::Unconnected(format!("{}:{}", module.label(), mconn.name)))?;
        let upstream = &modules[link.module.index()];
        let out = bindings
            .iter()
            .find(|o| o.module == link.module && o.module_connector == link.connector)
            .ok_or_else(|| {
                GraphError::Unconnected(format!(
                    "{}:{} has no node writing it",
                    upstream.label(),
                    upstream.connectors[link.connector].name
                ))
                .in_module(upstream.label())
            })?;

        let (pn, pc) = (out.node, out.node_connector);
        let (cn, cc) = (b.node, b.node_connector);
        let (roi, chan, format) = {
            let view: &[Node] = nodes;
            let src = &view[pn.index()].connectors[pc];
            let dst = &view[cn.index()].connectors[cc];
            ensure_compatible(|| endpoint(view, pn, pc), src, || endpoint(view, cn, cc), dst)?;
            if let (Some(p), Some(c)) = (src.roi, dst.roi) {
                if (p.wd, p.ht) != (c.wd, c.ht) {
                    return Err(GraphError::IncompatibleConnection {
                        producer: endpoint(view, pn, pc),
                        consumer: endpoint(view, cn, cc),
                        reason: format!("roi {}x{} does not match {}x{}", p.wd, p.ht, c.wd, c.ht),
                    });
                }
            }
            (src.roi, src.chan, src.format)
        };

        let dst = &mut nodes[cn.index()].connectors[cc];
        dst.producer = Some(ProducerRef {
            node: pn,
            connector: pc,
            feedback: b.feedback,
        });
        if dst.roi.is_none() {
            dst.roi = roi;
        }
        if dst.chan.is_wildcard() {
            dst.chan = chan;
        }
        if dst.format == Format::Any {
            dst.format = format;
        }
        if b.feedback {
            nodes[pn.index()].connectors[pc].keep_history = true;
        }
        debug!(
            "Wired {} -> {}{}",
            endpoint(nodes, pn, pc),
            endpoint(nodes, cn, cc),
            if b.feedback { " (feedback)" } else { "" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::ConnectorKind;
    use crate::execute::KernelIo;
    use crate::module::{ConnectorTemplate, ModuleOps, RoiContext};
    use crate::roi::Roi;
    use serde_json::json;

    static CONST: ModuleOps = ModuleOps {
        connectors: &[ConnectorTemplate::write("output", "r", Format::F32)],
        modify_roi_out: Some(const_roi_out),
        kernel: Some(const_kernel),
        ..ModuleOps::new("const")
    };

    static ADD: ModuleOps = ModuleOps {
        connectors: &[
            ConnectorTemplate::read("input", "*", Format::Any),
            ConnectorTemplate::write("output", "*", Format::Any),
        ],
        kernel: Some(add_kernel),
        ..ModuleOps::new("add")
    };

    static READER: ModuleOps = ModuleOps {
        connectors: &[ConnectorTemplate::read("input", "r", Format::F32)],
        ..ModuleOps::new("reader")
    };

    /// Reads its own previous output but does not declare FEEDBACK
    static ECHO: ModuleOps = ModuleOps {
        connectors: &[
            ConnectorTemplate::read("input", "r", Format::F32),
            ConnectorTemplate::write("output", "r", Format::F32),
        ],
        create_nodes: Some(echo_nodes),
        ..ModuleOps::new("echo")
    };

    fn echo_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
        let (input, output) = (&module.connectors[0], &module.connectors[1]);
        let roi = output.roi;
        let node = arena.add_node(
            module,
            "echo",
            [roi.wd, roi.ht, 1],
            &[],
            &[
                ConnectorDecl::read("input", input.chan, Format::F32, None),
                ConnectorDecl::read("prev", output.chan, Format::F32, Some(roi)),
                ConnectorDecl::write("output", output.chan, Format::F32, roi),
            ],
        )?;
        arena.copy_connector(module, 0, node, 0)?;
        arena.connect_feedback(node, 2, node, 1)?;
        arena.copy_connector(module, 1, node, 2)
    }

    fn const_roi_out(module: &mut Module, _ctx: &RoiContext) {
        let out = &mut module.connectors[0];
        out.roi = Roi::scaled(8, 4, out.roi.scale);
    }

    fn const_kernel(module: &Module, _node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
        let value = module.param_f32("value", 1.0);
        io.take_output(0)?.as_f32_mut().fill(value);
        Ok(())
    }

    fn add_kernel(_module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
        let offset = node.push_f32(0).unwrap_or(1.0);
        let mut out = io.take_output(1)?;
        for (o, i) in out.as_f32_mut().iter_mut().zip(io.input(0)?.as_f32()) {
            *o = i + offset;
        }
        Ok(())
    }

    fn registry() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        for ops in [&CONST, &ADD, &READER, &ECHO] {
            registry.register(ops).unwrap();
        }
        registry
    }

    fn chain(config: GraphConfig) -> Graph {
        let mut graph = Graph::with_registry(config, registry());
        let c = graph.add_module("const", "main", json!({ "value": 2.0 })).unwrap();
        let a = graph.add_module("add", "main", Value::Null).unwrap();
        let p = graph.add_module("reader", "main", Value::Null).unwrap();
        graph.connect(c, "output", a, "input").unwrap();
        graph.connect(a, "output", p, "input").unwrap();
        graph
    }

    #[test]
    fn test_build_and_run_default_nodes() {
        let mut graph = chain(GraphConfig::default());
        let report = graph.build().unwrap();
        assert_eq!(report.nodes, 3);
        assert_eq!(report.levels, 3);
        assert_eq!(report.feedback_edges, 0);

        let pool = ThreadPool::new(2).unwrap();
        let stats = graph.run_frame(&pool).unwrap();
        assert_eq!(stats.frame, 0);
        assert_eq!(stats.nodes_executed, 3);
        assert_eq!(graph.frame(), 1);

        let add = graph.find_node("add", "main", "main").unwrap();
        let out = graph.buffers().unwrap().current(add, 1).unwrap();
        assert_eq!(out.roi, Roi::full(8, 4));
        assert!(out.as_f32().iter().all(|&v| v == 3.0));
        // wildcard output resolved from the input
        assert_eq!(graph.nodes()[add.index()].connectors[1].chan, Token::new("r").unwrap());
    }

    #[test]
    fn test_roi_bounded_by_max_width() {
        let mut graph = chain(GraphConfig {
            max_width: 4,
            ..GraphConfig::default()
        });
        graph.build().unwrap();
        let reader = graph.find_node("reader", "main", "main").unwrap();
        let roi = graph.nodes()[reader.index()].connectors[0].roi.unwrap();
        assert_eq!((roi.wd, roi.ht, roi.full_wd, roi.full_ht), (4, 2, 8, 4));
    }

    #[test]
    fn test_unconnected_input_fails_build() {
        let mut graph = Graph::with_registry(GraphConfig::default(), registry());
        graph.add_module("add", "main", Value::Null).unwrap();
        let err = graph.build().unwrap_err();
        assert!(matches!(err, GraphError::Unconnected(_)));
        assert!(!graph.is_built());
        let pool = ThreadPool::new(1).unwrap();
        assert!(matches!(graph.run_frame(&pool), Err(GraphError::NotBuilt)));
        assert_eq!(graph.metrics().snapshot().failed_builds, 1);
    }

    #[test]
    fn test_feedback_needs_flag() {
        let mut graph = Graph::with_registry(GraphConfig::default(), registry());
        let c = graph.add_module("const", "main", Value::Null).unwrap();
        let e = graph.add_module("echo", "main", Value::Null).unwrap();
        let p = graph.add_module("reader", "main", Value::Null).unwrap();
        graph.connect(c, "output", e, "input").unwrap();
        graph.connect(e, "output", p, "input").unwrap();

        let err = graph.build().unwrap_err();
        assert!(matches!(err, GraphError::Build { .. }));
        let msg = err.to_string();
        assert!(msg.contains("echo:main"));
        assert!(msg.contains("FEEDBACK"));
        assert!(!graph.is_built());
    }

    #[test]
    fn test_node_capacity() {
        let mut graph = chain(GraphConfig {
            max_nodes: 2,
            ..GraphConfig::default()
        });
        let err = graph.build().unwrap_err();
        assert!(err.is_build_fatal());
        assert!(err.to_string().contains("reader:main"));
        assert!(graph.nodes().is_empty());
    }

    #[test]
    fn test_connect_rejects_mismatch_and_duplicates() {
        let mut graph = Graph::with_registry(GraphConfig::default(), registry());
        let c = graph.add_module("const", "main", Value::Null).unwrap();
        let d = graph.add_module("const", "other", Value::Null).unwrap();
        let p = graph.add_module("reader", "main", Value::Null).unwrap();
        assert!(graph.add_module("const", "main", Value::Null).is_err());

        graph.connect(c, "output", p, "input").unwrap();
        assert!(matches!(
            graph.connect(d, "output", p, "input"),
            Err(GraphError::AlreadyConnected(_))
        ));
        assert!(matches!(
            graph.connect(p, "input", d, "output"),
            Err(GraphError::IncompatibleConnection { .. })
        ));
        assert!(graph.connect(c, "missing", p, "input").is_err());
    }

    #[test]
    fn test_set_param_applies_without_rebuild() {
        let mut graph = chain(GraphConfig::default());
        graph.build().unwrap();
        let pool = ThreadPool::new(1).unwrap();
        graph.run_frame(&pool).unwrap();

        let c = graph.find_module("const", "main").unwrap();
        graph.set_param(c, "value", json!(5.0)).unwrap();
        assert!(graph.is_built());
        graph.run_frame(&pool).unwrap();
        let add = graph.find_node("add", "main", "main").unwrap();
        assert_eq!(graph.buffers().unwrap().current(add, 1).unwrap().as_f32()[0], 6.0);
    }

    #[test]
    fn test_write_dot() {
        let mut graph = chain(GraphConfig::default());
        let mut dot = Vec::new();
        assert!(graph.write_dot(&mut dot).is_err());
        graph.build().unwrap();
        graph.write_dot(&mut dot).unwrap();
        let dot = String::from_utf8(dot).unwrap();
        assert!(dot.starts_with("digraph pipegraph {"));
        assert!(dot.contains("n0 -> n1"));
        assert!(dot.contains("label=\"add:main\""));
    }

    #[test]
    fn test_from_config() {
        let pipeline = PipelineConfig::from_json(
            r#"{
                "modules": [
                    { "kind": "const", "params": { "value": 1.5 } },
                    { "kind": "reader" }
                ],
                "connections": [{ "from": "const:main:output", "to": "reader:main:input" }]
            }"#,
        )
        .unwrap();
        let mut graph = Graph::from_config_with_registry(&pipeline, registry()).unwrap();
        graph.build().unwrap();
        let reader = graph.find_module("reader", "main").unwrap();
        let link = graph.module(reader).unwrap().connectors[0].producer.unwrap();
        assert_eq!(link.connector, 0);
        assert_eq!(graph.nodes()[1].connectors[0].kind, ConnectorKind::Read);
    }
}
