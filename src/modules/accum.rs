//! `accum`: exponential moving average over frames.
//!
//! The single `blend` node reads its own output from the previous frame
//! through a node-level feedback edge.

use crate::arena::NodeArena;
use crate::connector::{ConnectorDecl, Format};
use crate::error::Result;
use crate::execute::KernelIo;
use crate::module::{ConnectorTemplate, Module, ModuleFlags, ModuleOps, ParamSpec, ParamType};
use crate::node::{push_words, Node};

use super::{bind_input, resample, RESAMPLE};

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[
        ConnectorTemplate::read("input", "*", Format::F32),
        ConnectorTemplate::write("output", "*", Format::F32),
    ],
    params: &[ParamSpec::optional("weight", ParamType::Number)],
    flags: ModuleFlags::FEEDBACK,
    create_nodes: Some(create_nodes),
    commit_params: Some(commit_params),
    kernel: Some(kernel),
    ..ModuleOps::new("accum")
};

fn weight(module: &Module) -> f32 {
    module.param_f32("weight", 0.1).clamp(0.0, 1.0)
}

fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let (input, output) = (&module.connectors[0], &module.connectors[1]);
    let roi = output.roi;
    let blend = arena.add_node(
        module,
        "blend",
        [roi.wd, roi.ht, 1],
        &push_words(&[weight(module)]),
        &[
            ConnectorDecl::read("input", input.chan, Format::F32, None),
            ConnectorDecl::read("prev", output.chan, Format::F32, Some(roi)),
            ConnectorDecl::write("output", output.chan, Format::F32, roi),
        ],
    )?;
    bind_input(arena, module, 0, (blend, 0), roi, false)?;
    arena.connect_feedback(blend, 2, blend, 1)?;
    arena.copy_connector(module, 1, blend, 2)
}

fn commit_params(module: &Module, node: &mut Node) {
    if node.kernel != RESAMPLE {
        node.set_push(0, weight(module).to_bits());
    }
}

fn kernel(_module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
    if node.kernel == RESAMPLE {
        return resample(io);
    }
    let w = node.push_f32(0).unwrap_or(0.1);
    let mut out = io.take_output(2)?;
    let len = out.as_f32().len();
    let input = io.input(0)?.as_f32();
    io.expect_len(0, len, input.len())?;
    if io.first_frame {
        out.as_f32_mut().copy_from_slice(input);
        return Ok(());
    }
    let prev = io.input(1)?.as_f32();
    io.expect_len(1, len, prev.len())?;
    for ((o, i), p) in out.as_f32_mut().iter_mut().zip(input).zip(prev) {
        *o = p + w * (i - p);
    }
    Ok(())
}
