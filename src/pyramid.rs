//! Convergence-driven multi-resolution expansion.
//!
//! Planning and wiring are separate: [`PyramidPlan::new`] halves the base
//! resolution until the stopping predicate holds and records one
//! [`PyramidLevel`] per reduce/assemble pair, then [`wire_pyramid`] creates
//! and connects the nodes for a finished plan.

use crate::arena::NodeArena;
use crate::connector::{ConnectorDecl, Format};
use crate::error::Result;
use crate::module::Module;
use crate::node::NodeId;
use crate::roi::Roi;
use crate::token::Token;

/// Why the halving loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The next coarse level would be a single row or column
    ResolutionFloor,
    /// The configured number of levels was reached
    LevelCap,
}

/// One reduce/assemble pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PyramidLevel {
    /// 0 is the finest pair
    pub index: u32,
    pub fine: Roi,
    pub coarse: Roi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PyramidPlan {
    pub levels: Vec<PyramidLevel>,
    pub stop: StopReason,
}

impl PyramidPlan {
    /// Plan levels below `base`. Always yields at least one level.
    pub fn new(base: Roi, max_levels: u32) -> Self {
        let max_levels = max_levels.max(1);
        let mut levels = Vec::new();
        let mut fine = base;
        let mut coarse = base.halved();

        loop {
            let index = levels.len() as u32;
            levels.push(PyramidLevel { index, fine, coarse });

            fine = coarse;
            coarse = coarse.halved();
            if coarse.wd <= 1 || coarse.ht <= 1 {
                return Self { levels, stop: StopReason::ResolutionFloor };
            }
            if index + 1 == max_levels {
                return Self { levels, stop: StopReason::LevelCap };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn last(&self) -> Option<&PyramidLevel> {
        self.levels.last()
    }
}

/// Kernel names and data layout of the pyramid nodes
#[derive(Debug, Clone, Copy)]
pub struct PyramidNodes {
    pub reduce: &'static str,
    pub assemble: &'static str,
    pub chan: Token,
    pub format: Format,
}

/// Node ids created for one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WiredLevel {
    pub reduce: NodeId,
    pub assemble: NodeId,
}

/// Create and wire the reduce/assemble pairs of `plan`.
///
/// `input` is the finest producer (feeds the first reduce `input` and the
/// first assemble `fine`), `upward` is the consumer connector receiving the
/// finest assemble `output`. Push constants of every node are
/// `push(level)`.
pub fn wire_pyramid(
    arena: &mut NodeArena,
    module: &Module,
    plan: &PyramidPlan,
    nodes: &PyramidNodes,
    input: (NodeId, usize),
    upward: (NodeId, usize),
    push: impl Fn(&PyramidLevel) -> Vec<u32>,
) -> Result<Vec<WiredLevel>> {
    let mut wired = Vec::with_capacity(plan.len());
    let (mut node_in, mut conn_in) = input;
    let (mut node_up, mut conn_up) = upward;

    for level in &plan.levels {
        let words = push(level);
        let reduce = arena.add_node(
            module,
            nodes.reduce,
            [level.coarse.wd, level.coarse.ht, 1],
            &words,
            &[
                ConnectorDecl::read("input", nodes.chan, nodes.format, Some(level.fine)),
                ConnectorDecl::write("output", nodes.chan, nodes.format, level.coarse),
            ],
        )?;
        let assemble = arena.add_node(
            module,
            nodes.assemble,
            [level.fine.wd, level.fine.ht, 1],
            &words,
            &[
                ConnectorDecl::read("fine", nodes.chan, nodes.format, Some(level.fine)),
                ConnectorDecl::read("coarse", nodes.chan, nodes.format, Some(level.coarse)),
                ConnectorDecl::write("output", nodes.chan, nodes.format, level.fine),
            ],
        )?;

        arena.connect(node_in, conn_in, reduce, 0)?;
        arena.connect(node_in, conn_in, assemble, 0)?;
        arena.connect(assemble, 2, node_up, conn_up)?;
        (node_in, conn_in) = (reduce, 1);
        (node_up, conn_up) = (assemble, 1);
        wired.push(WiredLevel { reduce, assemble });
    }

    // terminal branch: the coarsest reduce feeds the coarsest assemble
    if let Some(last) = wired.last() {
        arena.connect(last.reduce, 1, last.assemble, 1)?;
    }
    Ok(wired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ModuleId, ModuleOps};
    use proptest::prelude::*;
    use serde_json::Value;

    #[test]
    fn test_plan_resolution_floor() {
        let plan = PyramidPlan::new(Roi::full(16, 16), 8);
        // 16 -> 8 -> 4 -> 2, the next coarse would be 1
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.stop, StopReason::ResolutionFloor);
        let last = plan.last().unwrap();
        assert_eq!((last.fine.wd, last.coarse.wd), (4, 2));
    }

    #[test]
    fn test_plan_level_cap() {
        let plan = PyramidPlan::new(Roi::full(1024, 1024), 3);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.stop, StopReason::LevelCap);
        let plan = PyramidPlan::new(Roi::full(1024, 1024), 0);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_plan_tiny_input_still_has_one_level() {
        let plan = PyramidPlan::new(Roi::full(1, 1), 8);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.stop, StopReason::ResolutionFloor);
    }

    #[test]
    fn test_plan_rounds_odd_sizes_up() {
        let plan = PyramidPlan::new(Roi::full(13, 7), 8);
        let sizes: Vec<_> = plan.levels.iter().map(|l| (l.coarse.wd, l.coarse.ht)).collect();
        assert_eq!(sizes, vec![(7, 4), (4, 2)]);
    }

    static OPS: ModuleOps = ModuleOps::new("pyr");

    #[test]
    fn test_wire_pyramid_terminal_branch() {
        let module =
            Module::new(ModuleId(0), Token::new("main").unwrap(), &OPS, Value::Null).unwrap();
        let base = Roi::full(16, 16);
        let mut arena = NodeArena::new(64);
        let rgb = Token::new("rgb").unwrap();
        let output = ConnectorDecl::write("output", rgb, Format::F32, base);
        let src = arena.add_node(&module, "half", [16, 16, 1], &[], &[output]).unwrap();
        let dst = arena
            .add_node(
                &module,
                "doub",
                [16, 16, 1],
                &[],
                &[
                    ConnectorDecl::read("coarse", rgb, Format::F32, Some(base)),
                    ConnectorDecl::write("output", rgb, Format::F32, base),
                ],
            )
            .unwrap();

        let plan = PyramidPlan::new(base, 8);
        let nodes = PyramidNodes {
            reduce: "reduce",
            assemble: "assemble",
            chan: rgb,
            format: Format::F32,
        };
        let wired =
            wire_pyramid(&mut arena, &module, &plan, &nodes, (src, 0), (dst, 0), |l| vec![l.index])
                .unwrap();

        assert_eq!(wired.len(), plan.len());
        assert_eq!(arena.len(), 2 + 2 * plan.len());

        // every input of every pyramid node is connected
        for level in &wired {
            for id in [level.reduce, level.assemble] {
                let node = arena.node(id).unwrap();
                for c in node.connectors.iter().filter(|c| c.kind.is_input()) {
                    assert!(c.producer.is_some(), "{} has a dangling input", node.label());
                }
            }
        }
        let last = wired.last().unwrap();
        let coarse = arena.node(last.assemble).unwrap().connectors[1].producer.unwrap();
        assert_eq!((coarse.node, coarse.connector), (last.reduce, 1));
        // finest assemble feeds the upward consumer
        let producer = arena.node(dst).unwrap().connectors[0].producer.unwrap();
        assert_eq!(producer.node, wired[0].assemble);
    }

    proptest! {
        #[test]
        fn prop_pyramid_terminates(wd in 2u32..5000, ht in 2u32..5000, cap in 1u32..12) {
            let plan = PyramidPlan::new(Roi::full(wd, ht), cap);
            let levels = plan.len() as u32;
            prop_assert!(levels >= 1 && levels <= cap);
            match plan.stop {
                StopReason::ResolutionFloor => prop_assert!(1u64 << levels <= wd.min(ht) as u64),
                StopReason::LevelCap => prop_assert_eq!(levels, cap),
            }
            // levels chain fine <- coarse
            for pair in plan.levels.windows(2) {
                prop_assert_eq!(pair[0].coarse, pair[1].fine);
            }
        }
    }
}
