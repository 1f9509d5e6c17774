//! `demosaic`: Bayer mosaic to RGBA.
//!
//! Each 2x2 block of the mosaic becomes one output pixel, so the output has
//! half the full resolution of the input. The mosaic is always read at full
//! resolution; a `resample` node follows when the graph works smaller.

use rayon::prelude::*;

use crate::arena::NodeArena;
use crate::connector::{ConnectorDecl, Format};
use crate::error::{GraphError, Result};
use crate::execute::KernelIo;
use crate::module::{ConnectorTemplate, Module, ModuleOps, ParamSpec, ParamType, RoiContext};
use crate::node::{push_words, Node};
use crate::roi::Roi;
use crate::token::Token;

use super::{add_resample, resample, RESAMPLE};

const RGGB: Token = Token::from_static("rggb");
const RGBA: Token = Token::from_static("rgba");
const DEMOSAIC: Token = Token::from_static("demosaic");

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[
        ConnectorTemplate::read("input", "rggb", Format::Ui16),
        ConnectorTemplate::write("output", "rgba", Format::F32),
    ],
    params: &[
        ParamSpec::optional("pattern", ParamType::String),
        ParamSpec::optional("black", ParamType::Number),
        ParamSpec::optional("white", ParamType::Number),
    ],
    init: Some(init),
    modify_roi_out: Some(modify_roi_out),
    modify_roi_in: Some(modify_roi_in),
    create_nodes: Some(create_nodes),
    commit_params: Some(commit_params),
    kernel: Some(kernel),
    ..ModuleOps::new("demosaic")
};

/// Bayer pattern types
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BayerPattern {
    /// Red-Green-Green-Blue (Canon, Nikon)
    RGGB = 0,
    /// Green-Red-Blue-Green (Sony, Pentax)
    GRBG = 1,
    /// Green-Blue-Red-Green
    GBRG = 2,
    /// Blue-Green-Green-Red
    BGGR = 3,
}

impl BayerPattern {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RGGB" => Some(BayerPattern::RGGB),
            "GRBG" => Some(BayerPattern::GRBG),
            "GBRG" => Some(BayerPattern::GBRG),
            "BGGR" => Some(BayerPattern::BGGR),
            _ => None,
        }
    }

    /// Get color at position (x, y)
    /// Returns: 0=Red, 1=Green, 2=Blue
    #[inline]
    pub fn color_at(&self, x: usize, y: usize) -> usize {
        match (self, x & 1, y & 1) {
            (BayerPattern::RGGB, 0, 0) | (BayerPattern::GRBG, 1, 0) => 0,
            (BayerPattern::GBRG, 0, 1) | (BayerPattern::BGGR, 1, 1) => 0,
            (BayerPattern::RGGB, 1, 1) | (BayerPattern::GRBG, 0, 1) => 2,
            (BayerPattern::GBRG, 1, 0) | (BayerPattern::BGGR, 0, 0) => 2,
            _ => 1,
        }
    }
}

fn pattern(module: &Module) -> Result<BayerPattern> {
    let name = module.param_str("pattern", "RGGB");
    BayerPattern::parse(name).ok_or_else(|| {
        GraphError::InvalidParams(format!("{}: unknown Bayer pattern '{}'", module.label(), name))
    })
}

fn init(module: &mut Module) -> Result<()> {
    pattern(module)?;
    Ok(())
}

fn modify_roi_out(module: &mut Module, _ctx: &RoiContext) {
    let input = module.connectors[0].roi;
    let out = &mut module.connectors[1];
    out.roi = out
        .roi
        .with_full((input.full_wd / 2).max(1), (input.full_ht / 2).max(1));
}

fn modify_roi_in(module: &mut Module, _ctx: &RoiContext) {
    let input = &mut module.connectors[0];
    input.roi = input.roi.with_scale(1.0);
}

fn levels(module: &Module) -> (f32, f32) {
    (module.param_f32("black", 0.0), module.param_f32("white", 65535.0))
}

fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let input = module.connectors[0].roi;
    let out = module.connectors[1].roi;
    let half = Roi::full((input.wd / 2).max(1), (input.ht / 2).max(1));
    let (black, white) = levels(module);

    let node = arena.add_node(
        module,
        "demosaic",
        [half.wd, half.ht, 1],
        &push_words(&[black, white]),
        &[
            ConnectorDecl::read("input", RGGB, Format::Ui16, None),
            ConnectorDecl::write("output", RGBA, Format::F32, half),
        ],
    )?;
    arena.copy_connector(module, 0, node, 0)?;

    if (out.wd, out.ht) == (half.wd, half.ht) {
        return arena.copy_connector(module, 1, node, 1);
    }
    let resampled = add_resample(arena, module, (node, 1), RGBA, Format::F32, out)?;
    arena.copy_connector(module, 1, resampled, 1)
}

fn commit_params(module: &Module, node: &mut Node) {
    if node.kernel == DEMOSAIC {
        let (black, white) = levels(module);
        node.set_push(0, black.to_bits());
        node.set_push(1, white.to_bits());
    }
}

fn kernel(module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
    if node.kernel == RESAMPLE {
        return resample(io);
    }
    let pattern = pattern(module)?;
    let black = node.push_f32(0).unwrap_or(0.0);
    let white = node.push_f32(1).unwrap_or(65535.0);
    let norm = 1.0 / (white - black).max(1.0);

    let mut out = io.take_output(1)?;
    let input = io.input(0)?;
    let iw = input.roi.wd as usize;
    let ow = out.roi.wd as usize;
    if ow == 0 {
        return Ok(());
    }
    let raw = input.as_u16();

    out.as_f32_mut()
        .par_chunks_mut(ow * 4)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let mut sum = [0.0f32; 3];
                let mut count = [0u32; 3];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (sx, sy) = (2 * x + dx, 2 * y + dy);
                    let c = pattern.color_at(sx, sy);
                    let v = raw.get(sy * iw + sx).copied().unwrap_or(0) as f32;
                    sum[c] += ((v - black) * norm).max(0.0);
                    count[c] += 1;
                }
                for c in 0..3 {
                    px[c] = sum[c] / count[c].max(1) as f32;
                }
                px[3] = 1.0;
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(p: BayerPattern) -> [usize; 4] {
        [p.color_at(0, 0), p.color_at(1, 0), p.color_at(0, 1), p.color_at(1, 1)]
    }

    #[test]
    fn test_color_at() {
        let p = BayerPattern::RGGB;
        assert_eq!(quad(p), [0, 1, 1, 2]);
        let p = BayerPattern::BGGR;
        assert_eq!(quad(p), [2, 1, 1, 0]);
        let p = BayerPattern::GRBG;
        assert_eq!(quad(p), [1, 0, 2, 1]);
        let p = BayerPattern::GBRG;
        assert_eq!(quad(p), [1, 2, 0, 1]);
        // pattern repeats every two pixels
        assert_eq!(p.color_at(2, 3), p.color_at(0, 1));
    }

    #[test]
    fn test_parse_pattern() {
        assert_eq!(BayerPattern::parse("rggb"), Some(BayerPattern::RGGB));
        assert_eq!(BayerPattern::parse("XYZW"), None);
    }
}
