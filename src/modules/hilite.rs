//! `hilite`: highlight reconstruction on the Bayer mosaic.
//!
//! `half` collapses the mosaic into RGBA superpixels where alpha is 1 for
//! unclipped blocks and 0 for blocks with a clipped photosite. A pyramid of
//! `reduce`/`assemble` pairs diffuses unclipped colour into the clipped
//! regions, and `doub` writes the reconstructed values back into the clipped
//! photosites of the mosaic. The pyramid depth depends on the input size.

use rayon::prelude::*;
use tracing::debug;

use crate::arena::NodeArena;
use crate::buffer::Buffer;
use crate::connector::{ConnectorDecl, Format};
use crate::error::Result;
use crate::execute::KernelIo;
use crate::module::{ConnectorTemplate, Module, ModuleOps, ParamSpec, ParamType, RoiContext};
use crate::node::{push_words, Node};
use crate::pyramid::{wire_pyramid, PyramidNodes, PyramidPlan};
use crate::roi::Roi;
use crate::token::Token;

use super::demosaic::BayerPattern;

const RGGB: Token = Token::from_static("rggb");
const RGBA: Token = Token::from_static("rgba");
const HALF: Token = Token::from_static("half");
const DOUB: Token = Token::from_static("doub");
const REDUCE: Token = Token::from_static("reduce");
const ASSEMBLE: Token = Token::from_static("assemble");

pub const DEFAULT_LEVELS: u64 = 7;

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[
        ConnectorTemplate::read("input", "rggb", Format::Ui16),
        ConnectorTemplate::write("output", "rggb", Format::Ui16),
    ],
    params: &[
        ParamSpec::optional("white", ParamType::Number),
        ParamSpec::optional("clip", ParamType::Number),
        ParamSpec::optional("levels", ParamType::Integer),
    ],
    modify_roi_out: Some(modify_roi_out),
    modify_roi_in: Some(modify_roi_in),
    create_nodes: Some(create_nodes),
    commit_params: Some(commit_params),
    kernel: Some(kernel),
    ..ModuleOps::new("hilite")
};

fn modify_roi_out(module: &mut Module, _ctx: &RoiContext) {
    let input = module.connectors[0].roi;
    module.connectors[1].roi = Roi::full(input.full_wd, input.full_ht);
}

fn modify_roi_in(module: &mut Module, _ctx: &RoiContext) {
    let input = &mut module.connectors[0];
    input.roi = input.roi.with_scale(1.0);
}

/// White point and clip threshold
fn thresholds(module: &Module) -> [f32; 2] {
    [module.param_f32("white", 65535.0), module.param_f32("clip", 0.95)]
}

fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let input = module.connectors[0].roi;
    let half_roi = input.downsampled(2);
    let push = push_words(&thresholds(module));

    let half = arena.add_node(
        module,
        "half",
        [half_roi.wd, half_roi.ht, 1],
        &push,
        &[
            ConnectorDecl::read("input", RGGB, Format::Ui16, None),
            ConnectorDecl::write("output", RGBA, Format::F32, half_roi),
        ],
    )?;
    let doub = arena.add_node(
        module,
        "doub",
        [input.wd, input.ht, 1],
        &push,
        &[
            ConnectorDecl::read("input", RGGB, Format::Ui16, None),
            ConnectorDecl::read("coarse", RGBA, Format::F32, Some(half_roi)),
            ConnectorDecl::write("output", RGGB, Format::Ui16, input),
        ],
    )?;
    arena.copy_connector(module, 0, half, 0)?;
    arena.copy_connector(module, 0, doub, 0)?;
    arena.copy_connector(module, 1, doub, 2)?;

    let max_levels = module.param_u64("levels", DEFAULT_LEVELS).min(u32::MAX as u64) as u32;
    let plan = PyramidPlan::new(half_roi, max_levels);
    debug!(
        "{}: {} pyramid levels below {}x{} ({:?})",
        module.label(),
        plan.len(),
        half_roi.wd,
        half_roi.ht,
        plan.stop
    );
    let nodes = PyramidNodes {
        reduce: "reduce",
        assemble: "assemble",
        chan: RGBA,
        format: Format::F32,
    };
    wire_pyramid(arena, module, &plan, &nodes, (half, 1), (doub, 1), |level| vec![level.index])?;
    Ok(())
}

fn commit_params(module: &Module, node: &mut Node) {
    if node.kernel == HALF || node.kernel == DOUB {
        for (i, v) in thresholds(module).into_iter().enumerate() {
            node.set_push(i, v.to_bits());
        }
    }
}

fn kernel(_module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
    let white = node.push_f32(0).unwrap_or(65535.0).max(1.0);
    let clip = node.push_f32(1).unwrap_or(0.95) * white;
    match node.kernel {
        k if k == HALF => {
            let mut out = io.take_output(1)?;
            half_kernel(io.input(0)?, &mut out, white, clip);
        }
        k if k == REDUCE => {
            let mut out = io.take_output(1)?;
            reduce_kernel(io.input(0)?, &mut out);
        }
        k if k == ASSEMBLE => {
            let mut out = io.take_output(2)?;
            let fine = io.input(0)?;
            io.expect_len(0, out.len(), fine.len())?;
            assemble_kernel(fine, io.input(1)?, &mut out);
        }
        k if k == DOUB => {
            let mut out = io.take_output(2)?;
            doub_kernel(io.input(0)?, io.input(1)?, &mut out, white, clip);
        }
        _ => {}
    }
    Ok(())
}

fn half_kernel(mosaic: &Buffer, out: &mut Buffer, white: f32, clip: f32) {
    let iw = mosaic.roi.wd as usize;
    let ow = out.roi.wd as usize;
    if ow == 0 {
        return;
    }
    let raw = mosaic.as_u16();
    out.as_f32_mut()
        .par_chunks_mut(ow * 4)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let mut sum = [0.0f32; 3];
                let mut count = [0.0f32; 3];
                let mut clipped = false;
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (sx, sy) = (2 * x + dx, 2 * y + dy);
                    let v = raw.get(sy * iw + sx).copied().unwrap_or(0) as f32;
                    let c = BayerPattern::RGGB.color_at(sx, sy);
                    clipped |= v >= clip;
                    sum[c] += v / white;
                    count[c] += 1.0;
                }
                for c in 0..3 {
                    px[c] = sum[c] / count[c].max(1.0);
                }
                px[3] = if clipped { 0.0 } else { 1.0 };
            }
        });
}

/// Alpha-weighted 2x2 average; alpha becomes the mean support
fn reduce_kernel(fine: &Buffer, out: &mut Buffer) {
    let (fw, fh) = (fine.roi.wd as usize, fine.roi.ht as usize);
    let ow = out.roi.wd as usize;
    if ow == 0 || fw == 0 || fh == 0 {
        return;
    }
    let src = fine.as_f32();
    out.as_f32_mut()
        .par_chunks_mut(ow * 4)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let mut acc = [0.0f32; 3];
                let mut weight = 0.0f32;
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let sx = (2 * x + dx).min(fw - 1);
                    let sy = (2 * y + dy).min(fh - 1);
                    let p = &src[(sy * fw + sx) * 4..][..4];
                    for c in 0..3 {
                        acc[c] += p[3] * p[c];
                    }
                    weight += p[3];
                }
                for c in 0..3 {
                    px[c] = if weight > 0.0 { acc[c] / weight } else { 0.0 };
                }
                px[3] = weight / 4.0;
            }
        });
}

/// Keep supported fine pixels, fill the rest from the coarse level
fn assemble_kernel(fine: &Buffer, coarse: &Buffer, out: &mut Buffer) {
    let fw = fine.roi.wd as usize;
    let (cw, ch) = (coarse.roi.wd as usize, coarse.roi.ht as usize);
    if fw == 0 || cw == 0 || ch == 0 {
        return;
    }
    let (f, c) = (fine.as_f32(), coarse.as_f32());
    out.as_f32_mut()
        .par_chunks_mut(fw * 4)
        .enumerate()
        .for_each(|(y, row)| {
            let cy = (y / 2).min(ch - 1);
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let cx = (x / 2).min(cw - 1);
                let p = &f[(y * fw + x) * 4..][..4];
                let q = &c[(cy * cw + cx) * 4..][..4];
                let a = p[3].clamp(0.0, 1.0);
                for k in 0..3 {
                    px[k] = a * p[k] + (1.0 - a) * q[k];
                }
                px[3] = p[3].max(q[3]);
            }
        });
}

/// Raise clipped photosites to the reconstructed value, never lower them
fn doub_kernel(mosaic: &Buffer, coarse: &Buffer, out: &mut Buffer, white: f32, clip: f32) {
    let w = mosaic.roi.wd as usize;
    let (cw, ch) = (coarse.roi.wd as usize, coarse.roi.ht as usize);
    if w == 0 || cw == 0 || ch == 0 {
        return;
    }
    let raw = mosaic.as_u16();
    let c = coarse.as_f32();
    out.as_u16_mut()
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let cy = (y / 2).min(ch - 1);
            for (x, px) in row.iter_mut().enumerate() {
                let v = raw.get(y * w + x).copied().unwrap_or(0);
                if (v as f32) < clip {
                    *px = v;
                    continue;
                }
                let cx = (x / 2).min(cw - 1);
                let q = &c[(cy * cw + cx) * 4..][..4];
                let rebuilt = q[BayerPattern::RGGB.color_at(x, y)] * white;
                *px = rebuilt.max(v as f32).min(u16::MAX as f32) as u16;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(wd: u32, ht: u32, pixels: &[[f32; 4]]) -> Buffer {
        let mut b = Buffer::new(Roi::full(wd, ht), RGBA, Format::F32);
        for (dst, src) in b.as_f32_mut().chunks_exact_mut(4).zip(pixels) {
            dst.copy_from_slice(src);
        }
        b
    }

    #[test]
    fn test_reduce_ignores_unsupported_pixels() {
        let fine = rgba(
            2,
            2,
            &[
                [1.0, 0.5, 0.25, 1.0],
                [9.0, 9.0, 9.0, 0.0],
                [1.0, 0.5, 0.25, 1.0],
                [9.0, 9.0, 9.0, 0.0],
            ],
        );
        let mut out = rgba(1, 1, &[]);
        reduce_kernel(&fine, &mut out);
        assert_eq!(out.as_f32(), &[1.0, 0.5, 0.25, 0.5]);
    }

    #[test]
    fn test_assemble_fills_from_coarse() {
        let fine = rgba(2, 1, &[[1.0, 1.0, 1.0, 1.0], [0.0, 0.0, 0.0, 0.0]]);
        let coarse = rgba(1, 1, &[[0.5, 0.5, 0.5, 1.0]]);
        let mut out = rgba(2, 1, &[]);
        assemble_kernel(&fine, &coarse, &mut out);
        assert_eq!(&out.as_f32()[..4], &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&out.as_f32()[4..], &[0.5, 0.5, 0.5, 1.0]);
    }

    #[test]
    fn test_doub_only_touches_clipped_sites() {
        let mut mosaic = Buffer::new(Roi::full(2, 2), RGGB, Format::Ui16);
        mosaic.as_u16_mut().copy_from_slice(&[1000, 100, 100, 50]);
        let coarse = rgba(1, 1, &[[2.0, 0.5, 0.5, 1.0]]);
        let mut out = Buffer::new(Roi::full(2, 2), RGGB, Format::Ui16);
        doub_kernel(&mosaic, &coarse, &mut out, 1000.0, 950.0);
        assert_eq!(out.as_u16(), &[2000, 100, 100, 50]);
    }
}
