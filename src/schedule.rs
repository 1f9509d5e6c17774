//! Execution order of a compiled node list.

use tracing::debug;

use crate::error::{GraphError, Result};
use crate::node::{Node, NodeId};

/// Kahn's algorithm, one frontier at a time. Returns the levels, or a vertex
/// that lies on (or behind) a cycle.
pub fn topo_levels(
    n: usize,
    edges: &[(usize, usize)],
) -> std::result::Result<Vec<Vec<usize>>, usize> {
    let mut adj = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    for &(from, to) in edges {
        adj[from].push(to);
        in_degree[to] += 1;
    }

    let mut frontier: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut levels = Vec::new();
    let mut visited = 0;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &v in &frontier {
            for &w in &adj[v] {
                in_degree[w] -= 1;
                if in_degree[w] == 0 {
                    next.push(w);
                }
            }
        }
        visited += frontier.len();
        levels.push(std::mem::replace(&mut frontier, next));
    }

    if visited < n {
        // any vertex still holding in-degree is on or downstream of a cycle
        let stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or(0);
        return Err(stuck);
    }
    Ok(levels)
}

/// Nodes grouped into levels: every producer of a node sits in an earlier
/// level, nodes within a level are independent.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub levels: Vec<Vec<NodeId>>,
}

impl Schedule {
    /// Levelise along same-frame producer references. Feedback references
    /// only order frames and are ignored here.
    pub fn compile(nodes: &[Node]) -> Result<Self> {
        let edges: Vec<(usize, usize)> = nodes
            .iter()
            .enumerate()
            .flat_map(|(i, node)| {
                node.connectors
                    .iter()
                    .filter_map(|c| c.producer)
                    .filter(|p| !p.feedback)
                    .map(move |p| (p.node.index(), i))
            })
            .collect();

        let levels = topo_levels(nodes.len(), &edges).map_err(|i| {
            GraphError::Cycle(nodes.get(i).map_or_else(|| format!("node {}", i), |n| n.label()))
        })?;

        let levels: Vec<Vec<NodeId>> = levels
            .into_iter()
            .map(|level| level.into_iter().map(|i| NodeId(i as u32)).collect())
            .collect();

        debug!("Compiled schedule: {} nodes in {} levels", nodes.len(), levels.len());
        Ok(Self { levels })
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }
}
