//! Frame execution: buffers, source loading, level-by-level node dispatch
//! and feedback commits.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::connector::{ConnectorKind, ProducerRef};
use crate::error::{GraphError, Result};
use crate::metrics::GraphMetrics;
use crate::module::{Module, ModuleFlags, ReadSourceParams, WriteSinkParams};
use crate::node::{Node, NodeId};
use crate::schedule::Schedule;
use crate::threads::{Job, ThreadPool, WorkItems, WorkerContext};

type Slots = Vec<Vec<Option<RwLock<Buffer>>>>;

/// Output buffers of every node, plus the retained previous-frame generation
/// of connectors read through feedback edges.
pub struct BufferStore {
    current: Slots,
    history: Slots,
}

impl BufferStore {
    pub fn allocate(nodes: &[Node]) -> Self {
        let slots = |keep: fn(&crate::connector::Connector) -> bool| -> Slots {
            nodes
                .iter()
                .map(|node| {
                    node.connectors
                        .iter()
                        .map(|c| {
                            if keep(c) {
                                Buffer::for_connector(c).map(RwLock::new)
                            } else {
                                None
                            }
                        })
                        .collect()
                })
                .collect()
        };
        Self {
            current: slots(|c| c.kind.is_output()),
            history: slots(|c| c.kind.is_output() && c.keep_history),
        }
    }

    /// Total bytes allocated, both generations
    pub fn allocated_bytes(&self) -> usize {
        let sum = |slots: &Slots| -> usize {
            slots
                .iter()
                .flatten()
                .flatten()
                .map(|b| read_lock(b).len())
                .sum()
        };
        sum(&self.current) + sum(&self.history)
    }

    fn slot(slots: &Slots, node: NodeId, c: usize) -> Option<&RwLock<Buffer>> {
        slots.get(node.index())?.get(c)?.as_ref()
    }

    /// Current-frame output buffer
    pub fn current(&self, node: NodeId, c: usize) -> Option<RwLockReadGuard<'_, Buffer>> {
        Self::slot(&self.current, node, c).map(read_lock)
    }

    /// Retained previous-frame buffer
    pub fn history(&self, node: NodeId, c: usize) -> Option<RwLockReadGuard<'_, Buffer>> {
        Self::slot(&self.history, node, c).map(read_lock)
    }

    fn read(&self, producer: ProducerRef) -> Option<RwLockReadGuard<'_, Buffer>> {
        if producer.feedback {
            self.history(producer.node, producer.connector)
        } else {
            self.current(producer.node, producer.connector)
        }
    }

    fn write(&self, node: NodeId, c: usize) -> Option<RwLockWriteGuard<'_, Buffer>> {
        Self::slot(&self.current, node, c).map(write_lock)
    }

    /// Copy every history-keeping buffer into its retained generation
    pub fn commit_history(&self) -> usize {
        let mut committed = 0;
        for (node, slots) in self.history.iter().enumerate() {
            for (c, slot) in slots.iter().enumerate() {
                let current = Self::slot(&self.current, NodeId(node as u32), c);
                let (Some(retained), Some(current)) = (slot, current) else {
                    continue;
                };
                write_lock(retained).copy_from(&read_lock(current));
                committed += 1;
            }
        }
        committed
    }
}

fn read_lock(lock: &RwLock<Buffer>) -> RwLockReadGuard<'_, Buffer> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(lock: &RwLock<Buffer>) -> RwLockWriteGuard<'_, Buffer> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Buffers a kernel sees, indexed by the node's connector index.
pub struct KernelIo<'a> {
    node: &'a Node,
    inputs: Vec<Option<RwLockReadGuard<'a, Buffer>>>,
    outputs: Vec<Option<RwLockWriteGuard<'a, Buffer>>>,
    pub frame: u64,
    /// No frame has run since the graph was built; history buffers are zero
    pub first_frame: bool,
}

impl<'a> KernelIo<'a> {
    pub fn input(&self, c: usize) -> Result<&Buffer> {
        self.inputs
            .get(c)
            .and_then(|g| g.as_deref())
            .ok_or_else(|| self.missing(c))
    }

    /// Move the write guard of output `c` out, so inputs stay readable while
    /// the kernel writes
    pub fn take_output(&mut self, c: usize) -> Result<RwLockWriteGuard<'a, Buffer>> {
        self.outputs
            .get_mut(c)
            .and_then(Option::take)
            .ok_or_else(|| self.missing(c))
    }

    /// Fail unless connector `c` delivered the `expected` element count
    pub fn expect_len(&self, c: usize, expected: usize, found: usize) -> Result<()> {
        if expected == found {
            return Ok(());
        }
        let name = self
            .node
            .connectors
            .get(c)
            .map_or_else(|| format!("#{}", c), |n| n.name.to_string());
        Err(GraphError::BufferSize {
            connector: format!("{}:{}", self.node.label(), name),
            expected,
            found,
        })
    }

    fn missing(&self, c: usize) -> GraphError {
        GraphError::UnknownConnector {
            owner: self.node.label(),
            connector: format!("#{}", c),
        }
    }
}

/// Compiled, executable form of a graph
pub struct Runtime {
    pub nodes: Arc<Vec<Node>>,
    pub schedule: Schedule,
    pub store: Arc<BufferStore>,
    pub sources_loaded: bool,
    /// Frames run since this runtime was built
    pub frames_run: u64,
}

/// Everything node jobs share during one frame
pub struct FrameShared {
    pub modules: Vec<Module>,
    pub nodes: Arc<Vec<Node>>,
    pub store: Arc<BufferStore>,
    pub frame: u64,
    pub first_frame: bool,
    pub metrics: Arc<GraphMetrics>,
}

struct LevelItems {
    shared: Arc<FrameShared>,
    level: Vec<NodeId>,
    failures: Mutex<Vec<(NodeId, String)>>,
}

impl WorkItems for LevelItems {
    fn run(&self, worker: &WorkerContext, item: u32) {
        let Some(&id) = self.level.get(item as usize) else {
            return;
        };
        match execute_node(&self.shared, id) {
            Ok(()) => self.shared.metrics.record_node(true),
            Err(e) => {
                let node = &self.shared.nodes[id.index()];
                warn!("Node {} failed on worker {}: {}", node.label(), worker.id(), e);
                self.fail(id, e.to_string());
            }
        }
    }

    fn panicked(&self, _worker: &WorkerContext, item: u32, message: &str) {
        if let Some(&id) = self.level.get(item as usize) {
            self.fail(id, format!("panicked: {}", message));
        }
    }
}

impl LevelItems {
    fn fail(&self, id: NodeId, message: String) {
        self.shared.metrics.record_node(false);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, message));
    }
}

struct SourceItems {
    shared: Arc<FrameShared>,
    sources: Vec<(NodeId, usize)>,
}

impl WorkItems for SourceItems {
    fn run(&self, _worker: &WorkerContext, item: u32) {
        let Some(&(id, c)) = self.sources.get(item as usize) else {
            return;
        };
        let shared = &self.shared;
        let node = &shared.nodes[id.index()];
        let module = &shared.modules[node.module.index()];
        let (Some(read_source), Some(mut buffer)) =
            (module.ops.read_source, shared.store.write(id, c))
        else {
            return;
        };
        let conn = &node.connectors[c];
        let params = ReadSourceParams {
            roi: buffer.roi,
            node: node.kernel,
            connector: conn.name,
            chan: conn.chan,
            format: conn.format,
        };
        match read_source(module, buffer.bytes_mut(), &params) {
            Ok(()) => {
                debug!("Loaded source {}:{}", node.label(), conn.name);
                shared.metrics.record_source(true);
            }
            Err(e) => {
                // the buffer keeps its previous contents
                warn!("Rejected source for {}:{}: {}", node.label(), conn.name, e);
                shared.metrics.record_source(false);
            }
        }
    }

    fn panicked(&self, _worker: &WorkerContext, item: u32, message: &str) {
        if let Some(&(id, _)) = self.sources.get(item as usize) {
            let node = &self.shared.nodes[id.index()];
            warn!("Source load for {} panicked: {}", node.label(), message);
            self.shared.metrics.record_source(false);
        }
    }
}

/// Fill every source connector once
pub fn load_sources(pool: &ThreadPool, shared: &Arc<FrameShared>) -> Result<usize> {
    let sources: Vec<(NodeId, usize)> = shared
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| {
            shared.modules[node.module.index()]
                .flags
                .contains(ModuleFlags::READ_SOURCE)
        })
        .flat_map(|(i, node)| {
            node.connectors
                .iter()
                .enumerate()
                .filter(|(_, c)| c.kind == ConnectorKind::Source)
                .map(move |(c, _)| (NodeId(i as u32), c))
        })
        .collect();
    if sources.is_empty() {
        return Ok(0);
    }

    let count = sources.len();
    let items = Arc::new(SourceItems {
        shared: Arc::clone(shared),
        sources,
    });
    let job = Job::new(count as u32, items);
    pool.run(&job, count)?;
    if job.progress() < job.count() {
        return Err(GraphError::Cancelled);
    }
    Ok(count)
}

/// Run the schedule level by level. Returns the number of executed nodes.
pub fn run_levels(
    pool: &ThreadPool,
    shared: &Arc<FrameShared>,
    schedule: &Schedule,
) -> Result<usize> {
    let mut executed = 0usize;
    for level in &schedule.levels {
        if pool.shutting_down() {
            return Err(GraphError::Cancelled);
        }
        let items = Arc::new(LevelItems {
            shared: Arc::clone(shared),
            level: level.clone(),
            failures: Mutex::new(Vec::new()),
        });
        let job = Job::new(level.len() as u32, Arc::clone(&items));
        pool.run(&job, level.len())?;
        executed += job.progress() as usize;

        let failures = items.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, message)) = failures.first() {
            return Err(GraphError::NodeFailed {
                node: shared.nodes[id.index()].label(),
                message: message.clone(),
            });
        }
        if job.progress() < job.count() {
            return Err(GraphError::Cancelled);
        }
    }
    Ok(executed)
}

fn execute_node(shared: &FrameShared, id: NodeId) -> Result<()> {
    let node = &shared.nodes[id.index()];
    let module = &shared.modules[node.module.index()];

    let mut inputs = Vec::with_capacity(node.connectors.len());
    let mut outputs = Vec::with_capacity(node.connectors.len());
    for (c, conn) in node.connectors.iter().enumerate() {
        if conn.kind.is_input() {
            let producer = conn
                .producer
                .ok_or_else(|| GraphError::Unconnected(format!("{}:{}", node.label(), conn.name)))?;
            inputs.push(shared.store.read(producer));
            outputs.push(None);
        } else {
            inputs.push(None);
            outputs.push(shared.store.write(id, c));
        }
    }

    let mut io = KernelIo {
        node,
        inputs,
        outputs,
        frame: shared.frame,
        first_frame: shared.first_frame,
    };
    if let Some(kernel) = module.ops.kernel {
        kernel(module, node, &mut io)?;
    }

    let write_sink = match module.ops.write_sink {
        Some(write) if module.flags.contains(ModuleFlags::WRITE_SINK) => write,
        _ => return Ok(()),
    };
    for (c, conn) in node.connectors.iter().enumerate() {
        if conn.kind != ConnectorKind::Sink {
            continue;
        }
        let buffer = io.input(c)?;
        let params = WriteSinkParams {
            roi: buffer.roi,
            node: node.kernel,
            connector: conn.name,
            chan: buffer.chan,
            format: buffer.format,
            frame: shared.frame,
        };
        write_sink(module, buffer.bytes(), &params)?;
        shared.metrics.record_sink();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, Format};
    use crate::module::ModuleId;
    use crate::roi::Roi;
    use crate::token::Token;

    fn node(connectors: Vec<Connector>) -> Node {
        Node {
            kind: Token::new("test").unwrap(),
            name: Token::new("main").unwrap(),
            kernel: Token::new("main").unwrap(),
            module: ModuleId(0),
            wd: 2,
            ht: 2,
            dp: 1,
            connectors,
            push_constants: Vec::new(),
        }
    }

    fn output(keep_history: bool) -> Connector {
        Connector {
            name: Token::new("output").unwrap(),
            kind: ConnectorKind::Write,
            chan: Token::new("r").unwrap(),
            format: Format::F32,
            roi: Some(Roi::full(2, 2)),
            producer: None,
            keep_history,
        }
    }

    #[test]
    fn test_history_commit() {
        let nodes = vec![node(vec![output(true)]), node(vec![output(false)])];
        let store = BufferStore::allocate(&nodes);
        assert!(store.history(NodeId(0), 0).is_some());
        assert!(store.history(NodeId(1), 0).is_none());
        assert_eq!(store.allocated_bytes(), 3 * 16);

        store.write(NodeId(0), 0).unwrap().as_f32_mut()[3] = 2.0;
        assert_eq!(store.history(NodeId(0), 0).unwrap().as_f32()[3], 0.0);
        assert_eq!(store.commit_history(), 1);
        assert_eq!(store.history(NodeId(0), 0).unwrap().as_f32()[3], 2.0);
    }
}
