//! `diff`: difference between the current and the previous frame of its
//! input. The previous frame arrives through a feedback binding of the
//! module input, so the upstream producer keeps one extra generation.
//! Both bindings are resampled when the producer delivers a different size.

use crate::arena::NodeArena;
use crate::connector::{ConnectorDecl, Format};
use crate::error::Result;
use crate::execute::KernelIo;
use crate::module::{ConnectorTemplate, Module, ModuleFlags, ModuleOps};
use crate::node::Node;

use super::{bind_input, resample, RESAMPLE};

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[
        ConnectorTemplate::read("input", "*", Format::F32),
        ConnectorTemplate::write("output", "*", Format::F32),
    ],
    flags: ModuleFlags::FEEDBACK,
    create_nodes: Some(create_nodes),
    kernel: Some(kernel),
    ..ModuleOps::new("diff")
};

fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let (input, output) = (&module.connectors[0], &module.connectors[1]);
    let roi = output.roi;
    let node = arena.add_node(
        module,
        "diff",
        [roi.wd, roi.ht, 1],
        &[],
        &[
            ConnectorDecl::read("input", input.chan, Format::F32, None),
            ConnectorDecl::read("prev", input.chan, Format::F32, None),
            ConnectorDecl::write("output", output.chan, Format::F32, roi),
        ],
    )?;
    bind_input(arena, module, 0, (node, 0), roi, false)?;
    bind_input(arena, module, 0, (node, 1), roi, true)?;
    arena.copy_connector(module, 1, node, 2)
}

fn kernel(_module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
    if node.kernel == RESAMPLE {
        return resample(io);
    }
    let mut out = io.take_output(2)?;
    let len = out.as_f32().len();
    let current = io.input(0)?.as_f32();
    let prev = io.input(1)?.as_f32();
    io.expect_len(0, len, current.len())?;
    io.expect_len(1, len, prev.len())?;
    for ((o, c), p) in out.as_f32_mut().iter_mut().zip(current).zip(prev) {
        *o = c - p;
    }
    Ok(())
}
