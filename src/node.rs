//! Nodes: the schedulable units a module expands into.

use std::fmt;

use crate::connector::Connector;
use crate::module::ModuleId;
use crate::token::Token;

/// Index into the node arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    /// Kind of the owning module
    pub kind: Token,
    /// Instance name of the owning module
    pub name: Token,
    pub kernel: Token,
    pub module: ModuleId,
    pub wd: u32,
    pub ht: u32,
    pub dp: u32,
    pub connectors: Vec<Connector>,
    pub push_constants: Vec<u32>,
}

impl Node {
    pub const MAX_CONNECTORS: usize = 16;
    pub const MAX_PUSH_CONSTANTS: usize = 64;

    /// `kind:name/kernel`
    pub fn label(&self) -> String {
        format!("{}:{}/{}", self.kind, self.name, self.kernel)
    }

    pub fn connector_index(&self, name: Token) -> Option<usize> {
        self.connectors.iter().position(|c| c.name == name)
    }

    /// Push constant word reinterpreted as `f32`
    pub fn push_f32(&self, index: usize) -> Option<f32> {
        self.push_constants.get(index).copied().map(f32::from_bits)
    }

    pub fn set_push(&mut self, index: usize, word: u32) {
        if index < Self::MAX_PUSH_CONSTANTS {
            if self.push_constants.len() <= index {
                self.push_constants.resize(index + 1, 0);
            }
            self.push_constants[index] = word;
        }
    }
}

/// Pack `f32` values into push constant words
pub fn push_words(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constants() {
        let mut node = Node {
            kind: Token::new("accum").unwrap(),
            name: Token::new("main").unwrap(),
            kernel: Token::new("blend").unwrap(),
            module: ModuleId(0),
            wd: 1,
            ht: 1,
            dp: 1,
            connectors: Vec::new(),
            push_constants: push_words(&[0.25]),
        };
        assert_eq!(node.push_f32(0), Some(0.25));
        node.set_push(2, 7);
        assert_eq!(node.push_constants, vec![0.25f32.to_bits(), 0, 7]);
        node.set_push(Node::MAX_PUSH_CONSTANTS, 1);
        assert_eq!(node.push_constants.len(), 3);
        assert_eq!(node.label(), "accum:main/blend");
    }
}
