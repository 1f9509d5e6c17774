//! Node arena and the wiring protocol modules use while expanding.
//!
//! Every operation validates before it mutates, so a failed call leaves all
//! previously established edges untouched.

use tracing::debug;

use crate::connector::{
    check_compatible, ensure_compatible, Connector, ConnectorDecl, ConnectorKind, Format,
    ProducerRef,
};
use crate::error::{GraphError, Result};
use crate::module::Module;
use crate::module::ModuleId;
use crate::node::{Node, NodeId};
use crate::token::Token;

/// A module boundary connector bound to a node connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub module: ModuleId,
    pub module_connector: usize,
    pub node: NodeId,
    pub node_connector: usize,
    /// Node reads the upstream producer's previous-frame value
    pub feedback: bool,
}

#[derive(Debug)]
pub struct NodeArena {
    nodes: Vec<Node>,
    capacity: usize,
    bindings: Vec<Binding>,
}

impl NodeArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            capacity,
            bindings: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
    }

    pub fn into_parts(self) -> (Vec<Node>, Vec<Binding>) {
        (self.nodes, self.bindings)
    }

    /// Append a node owned by `module`
    pub fn add_node(
        &mut self,
        module: &Module,
        kernel: &str,
        extent: [u32; 3],
        push_constants: &[u32],
        connectors: &[ConnectorDecl],
    ) -> Result<NodeId> {
        if self.nodes.len() >= self.capacity {
            return Err(GraphError::CapacityExceeded {
                what: "nodes",
                limit: self.capacity,
            });
        }
        if connectors.len() > Node::MAX_CONNECTORS {
            return Err(GraphError::CapacityExceeded {
                what: "connectors per node",
                limit: Node::MAX_CONNECTORS,
            });
        }
        if push_constants.len() > Node::MAX_PUSH_CONSTANTS {
            return Err(GraphError::CapacityExceeded {
                what: "push constant words",
                limit: Node::MAX_PUSH_CONSTANTS,
            });
        }

        let connectors = connectors
            .iter()
            .map(Connector::from_decl)
            .collect::<Result<Vec<_>>>()?;

        let id = NodeId(self.nodes.len() as u32);
        let [wd, ht, dp] = extent;
        self.nodes.push(Node {
            kind: module.kind,
            name: module.name,
            kernel: Token::new(kernel)?,
            module: module.id,
            wd,
            ht,
            dp: dp.max(1),
            connectors,
            push_constants: push_constants.to_vec(),
        });
        Ok(id)
    }

    /// Same-frame edge from output `sc` of `src` to input `dc` of `dst`
    pub fn connect(&mut self, src: NodeId, sc: usize, dst: NodeId, dc: usize) -> Result<()> {
        self.link(src, sc, dst, dc, false)
    }

    /// Edge through the previous-frame generation of `src`'s output. A node
    /// may read its own output this way.
    pub fn connect_feedback(
        &mut self,
        src: NodeId,
        sc: usize,
        dst: NodeId,
        dc: usize,
    ) -> Result<()> {
        self.link(src, sc, dst, dc, true)
    }

    /// [`NodeArena::connect`] addressing connectors by name
    pub fn connect_named(&mut self, src: NodeId, sc: &str, dst: NodeId, dc: &str) -> Result<()> {
        let sc = self.connector_named(src, sc)?;
        let dc = self.connector_named(dst, dc)?;
        self.link(src, sc, dst, dc, false)
    }

    pub fn connector_named(&self, node: NodeId, name: &str) -> Result<usize> {
        let n = self.node(node)?;
        Token::new(name)
            .ok()
            .and_then(|t| n.connector_index(t))
            .ok_or_else(|| GraphError::UnknownConnector {
                owner: n.label(),
                connector: name.to_string(),
            })
    }

    /// Bind module connector `mc` to node connector `nc`, same frame
    pub fn copy_connector(
        &mut self,
        module: &Module,
        mc: usize,
        node: NodeId,
        nc: usize,
    ) -> Result<()> {
        self.bind(module, mc, node, nc, false)
    }

    /// Bind module input `mc` so that the node reads the upstream producer's
    /// value from the previous frame
    pub fn copy_connector_feedback(
        &mut self,
        module: &Module,
        mc: usize,
        node: NodeId,
        nc: usize,
    ) -> Result<()> {
        self.bind(module, mc, node, nc, true)
    }

    /// `kind:name/kernel:connector`
    pub fn endpoint(&self, node: NodeId, c: usize) -> String {
        match self.nodes.get(node.index()) {
            Some(n) => match n.connectors.get(c) {
                Some(conn) => format!("{}:{}", n.label(), conn.name),
                None => format!("{}:#{}", n.label(), c),
            },
            None => format!("node {}:#{}", node, c),
        }
    }

    fn connector(&self, node: NodeId, c: usize) -> Result<&Connector> {
        let n = self.node(node)?;
        n.connectors
            .get(c)
            .ok_or_else(|| GraphError::UnknownConnector {
                owner: n.label(),
                connector: format!("#{}", c),
            })
    }

    fn link(
        &mut self,
        src: NodeId,
        sc: usize,
        dst: NodeId,
        dc: usize,
        feedback: bool,
    ) -> Result<()> {
        let producer = self.connector(src, sc)?;
        let consumer = self.connector(dst, dc)?;

        if src == dst && !feedback {
            return Err(GraphError::Cycle(self.endpoint(dst, dc)));
        }
        if consumer.is_connected() || self.is_bound(dst, dc) {
            return Err(GraphError::AlreadyConnected(self.endpoint(dst, dc)));
        }
        ensure_compatible(
            || self.endpoint(src, sc),
            producer,
            || self.endpoint(dst, dc),
            consumer,
        )?;
        let roi = producer
            .roi
            .ok_or_else(|| GraphError::UnresolvedRoi(self.endpoint(src, sc)))?;
        let (chan, format) = (producer.chan, producer.format);

        // validated, now mutate
        let consumer = &mut self.nodes[dst.index()].connectors[dc];
        consumer.producer = Some(ProducerRef {
            node: src,
            connector: sc,
            feedback,
        });
        resolve_wildcards(consumer, chan, format);
        if consumer.roi.is_none() {
            consumer.roi = Some(roi);
        }
        if feedback {
            self.nodes[src.index()].connectors[sc].keep_history = true;
        }

        debug!(
            "Connected {} -> {}{}",
            self.endpoint(src, sc),
            self.endpoint(dst, dc),
            if feedback { " (feedback)" } else { "" }
        );
        Ok(())
    }

    fn bind(
        &mut self,
        module: &Module,
        mc: usize,
        node: NodeId,
        nc: usize,
        feedback: bool,
    ) -> Result<()> {
        let mconn = module
            .connectors
            .get(mc)
            .ok_or_else(|| GraphError::UnknownConnector {
                owner: module.label(),
                connector: format!("#{}", mc),
            })?;
        let nconn = self.connector(node, nc)?;
        let module_end = || format!("{}:{}", module.label(), mconn.name);

        let checked = if mconn.kind.is_input() {
            if !nconn.kind.is_input() {
                Err("module input bound to a node output".to_string())
            } else {
                check_compatible(
                    (ConnectorKind::Write, mconn.chan, mconn.format),
                    (nconn.kind, nconn.chan, nconn.format),
                )
            }
        } else if feedback {
            Err("feedback binding on a module output".to_string())
        } else if !nconn.kind.is_output() {
            Err("module output bound to a node input".to_string())
        } else {
            check_compatible(
                (nconn.kind, nconn.chan, nconn.format),
                (ConnectorKind::Read, mconn.chan, mconn.format),
            )
        };
        checked.map_err(|reason| GraphError::IncompatibleConnection {
            producer: module_end(),
            consumer: self.endpoint(node, nc),
            reason,
        })?;

        if mconn.kind.is_output()
            && self
                .bindings
                .iter()
                .any(|b| b.module == module.id && b.module_connector == mc)
        {
            return Err(GraphError::AlreadyConnected(module_end()));
        }
        if nconn.kind.is_input() && (nconn.is_connected() || self.is_bound(node, nc)) {
            return Err(GraphError::AlreadyConnected(self.endpoint(node, nc)));
        }

        if mconn.kind.is_input() {
            let (chan, format, roi) = (mconn.chan, mconn.format, mconn.roi);
            let target = &mut self.nodes[node.index()].connectors[nc];
            resolve_wildcards(target, chan, format);
            if target.roi.is_none() {
                target.roi = Some(roi);
            }
        }
        self.bindings.push(Binding {
            module: module.id,
            module_connector: mc,
            node,
            node_connector: nc,
            feedback,
        });
        Ok(())
    }

    fn is_bound(&self, node: NodeId, nc: usize) -> bool {
        self.bindings
            .iter()
            .any(|b| b.node == node && b.node_connector == nc)
    }
}

fn resolve_wildcards(connector: &mut Connector, chan: Token, format: Format) {
    if connector.chan.is_wildcard() {
        connector.chan = chan;
    }
    if connector.format == Format::Any {
        connector.format = format;
    }
}
