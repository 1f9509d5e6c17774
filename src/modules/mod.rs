//! Builtin module kinds

use rayon::prelude::*;

use crate::arena::NodeArena;
use crate::connector::{element_size, ConnectorDecl, Format};
use crate::error::Result;
use crate::execute::KernelIo;
use crate::module::{Module, ModuleOps};
use crate::node::NodeId;
use crate::roi::Roi;
use crate::token::Token;

pub mod accum;
pub mod blob;
pub mod demosaic;
pub mod diff;
pub mod hilite;
pub mod png;
pub mod yuv;

/// Every module kind a registry starts out with
pub static BUILTINS: &[&ModuleOps] = &[
    &blob::OPS,
    &demosaic::OPS,
    &hilite::OPS,
    &accum::OPS,
    &diff::OPS,
    &yuv::OPS,
    &png::OPS,
];

pub(crate) const RESAMPLE: Token = Token::from_static("resample");

/// Append a nearest-neighbour `resample` node reading `input` and writing
/// `working`. Returns the node; its output is connector 1.
pub(crate) fn add_resample(
    arena: &mut NodeArena,
    module: &Module,
    input: (NodeId, usize),
    chan: Token,
    format: Format,
    working: Roi,
) -> Result<NodeId> {
    let node = resample_node(arena, module, chan, format, working)?;
    arena.connect(input.0, input.1, node, 0)?;
    Ok(node)
}

/// Bind module input `mc` to input `nc` of `node`. When the negotiated input
/// differs in size from `working`, a `resample` node goes in between.
pub(crate) fn bind_input(
    arena: &mut NodeArena,
    module: &Module,
    mc: usize,
    (node, nc): (NodeId, usize),
    working: Roi,
    feedback: bool,
) -> Result<()> {
    let input = &module.connectors[mc];
    let target = if (input.roi.wd, input.roi.ht) == (working.wd, working.ht) {
        (node, nc)
    } else {
        let resampled = resample_node(arena, module, input.chan, input.format, working)?;
        arena.connect(resampled, 1, node, nc)?;
        (resampled, 0)
    };
    if feedback {
        arena.copy_connector_feedback(module, mc, target.0, target.1)
    } else {
        arena.copy_connector(module, mc, target.0, target.1)
    }
}

fn resample_node(
    arena: &mut NodeArena,
    module: &Module,
    chan: Token,
    format: Format,
    working: Roi,
) -> Result<NodeId> {
    arena.add_node(
        module,
        "resample",
        [working.wd, working.ht, 1],
        &[],
        &[
            ConnectorDecl::read("input", chan, format, None),
            ConnectorDecl::write("output", chan, format, working),
        ],
    )
}

/// Kernel of the nodes made by [`add_resample`]. Copies whole pixels, so it
/// works for any channel layout and format.
pub(crate) fn resample(io: &mut KernelIo<'_>) -> Result<()> {
    let mut out = io.take_output(1)?;
    let input = io.input(0)?;
    let bpp = element_size(input.chan, input.format);
    let (iw, ih) = (input.roi.wd as usize, input.roi.ht as usize);
    let (ow, oh) = (out.roi.wd as usize, out.roi.ht as usize);
    if iw == 0 || ih == 0 || ow == 0 || oh == 0 {
        return Ok(());
    }

    let src = input.bytes();
    out.bytes_mut()
        .par_chunks_mut(ow * bpp)
        .enumerate()
        .for_each(|(y, row)| {
            let sy = (y * ih / oh).min(ih - 1);
            for (x, px) in row.chunks_exact_mut(bpp).enumerate() {
                let sx = (x * iw / ow).min(iw - 1);
                let at = (sy * iw + sx) * bpp;
                px.copy_from_slice(&src[at..at + bpp]);
            }
        });
    Ok(())
}
