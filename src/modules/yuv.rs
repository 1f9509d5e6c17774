//! `o-yuv`: YUV4MPEG2 video sink.
//!
//! `enc` converts RGBA to 4:2:0 planes (BT.601, full range) and each plane
//! goes to its own sink node. The sink nodes complete in any order, so the
//! module state collects the planes and appends a frame to the stream once
//! all three of them have arrived.

use rayon::prelude::*;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::arena::NodeArena;
use crate::buffer::Buffer;
use crate::connector::{ConnectorDecl, Format};
use crate::error::{GraphError, Result};
use crate::execute::KernelIo;
use crate::module::{
    ConnectorTemplate, Module, ModuleFlags, ModuleOps, ParamSpec, ParamType, WriteSinkParams,
};
use crate::node::Node;
use crate::token::Token;

const RGBA: Token = Token::from_static("rgba");
const PLANE: Token = Token::from_static("y");
const ENC: Token = Token::from_static("enc");
const PLANES: [&str; 3] = ["y", "cb", "cr"];

pub const DEFAULT_FRAME_RATE: u64 = 24;

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[ConnectorTemplate::read("input", "rgba", Format::F32)],
    params: &[
        ParamSpec::required("path", ParamType::String),
        ParamSpec::optional("frame_rate", ParamType::Integer),
    ],
    flags: ModuleFlags::WRITE_SINK,
    init: Some(init),
    cleanup: Some(cleanup),
    create_nodes: Some(create_nodes),
    write_sink: Some(write_sink),
    kernel: Some(kernel),
    ..ModuleOps::new("o-yuv")
};

/// Planes of the frame being assembled
struct YuvState {
    path: PathBuf,
    frame_rate: u64,
    out: Option<BufWriter<File>>,
    planes: [Vec<u8>; 3],
    have: [bool; 3],
    size: (u32, u32),
    frames: u64,
}

impl YuvState {
    fn accept(&mut self, plane: usize, data: &[u8], params: &WriteSinkParams) -> Result<()> {
        if plane == 0 {
            self.size = (params.roi.wd, params.roi.ht);
        }
        self.planes[plane].clear();
        self.planes[plane].extend_from_slice(data);
        self.have[plane] = true;
        if self.have.iter().all(|&h| h) {
            self.emit()?;
            self.have = [false; 3];
        }
        Ok(())
    }

    fn emit(&mut self) -> Result<()> {
        let (wd, ht) = self.size;
        if self.out.is_none() {
            let mut out = BufWriter::new(File::create(&self.path)?);
            writeln!(out, "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C420jpeg", wd, ht, self.frame_rate)?;
            info!("Writing {}x{} video to {}", wd, ht, self.path.display());
            self.out = Some(out);
        }
        let Some(out) = self.out.as_mut() else {
            return Ok(());
        };
        out.write_all(b"FRAME\n")?;
        for plane in &self.planes {
            out.write_all(plane)?;
        }
        out.flush()?;
        self.frames += 1;
        debug!("Wrote frame {} to {}", self.frames, self.path.display());
        Ok(())
    }
}

fn init(module: &mut Module) -> Result<()> {
    let state = YuvState {
        path: PathBuf::from(module.param_str("path", "")),
        frame_rate: module.param_u64("frame_rate", DEFAULT_FRAME_RATE).max(1),
        out: None,
        planes: Default::default(),
        have: [false; 3],
        size: (0, 0),
        frames: 0,
    };
    module.set_state(state);
    Ok(())
}

fn cleanup(module: &mut Module) {
    module.with_state(|s: &mut YuvState| {
        if let Some(out) = s.out.as_mut() {
            if let Err(e) = out.flush() {
                warn!("Failed to flush {}: {}", s.path.display(), e);
            }
        }
    });
    module.clear_state();
}

fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let input = module.connectors[0].roi;
    let luma_roi = input.even();
    let chroma_roi = luma_roi.halved();

    let enc = arena.add_node(
        module,
        "enc",
        [luma_roi.wd, luma_roi.ht, 1],
        &[],
        &[
            ConnectorDecl::read("input", RGBA, Format::F32, None),
            ConnectorDecl::write("y", PLANE, Format::Ui8, luma_roi),
            ConnectorDecl::write("cb", PLANE, Format::Ui8, chroma_roi),
            ConnectorDecl::write("cr", PLANE, Format::Ui8, chroma_roi),
        ],
    )?;
    arena.copy_connector(module, 0, enc, 0)?;

    for (i, plane) in PLANES.into_iter().enumerate() {
        let roi = if i == 0 { luma_roi } else { chroma_roi };
        let sink = arena.add_node(
            module,
            plane,
            [roi.wd, roi.ht, 1],
            &[],
            &[ConnectorDecl::sink("input", PLANE, Format::Ui8)],
        )?;
        arena.connect(enc, i + 1, sink, 0)?;
    }
    Ok(())
}

fn write_sink(module: &Module, data: &[u8], params: &WriteSinkParams) -> Result<()> {
    let plane = PLANES
        .iter()
        .position(|p| params.node == *p)
        .ok_or_else(|| GraphError::UnknownNode(format!("{}/{}", module.label(), params.node)))?;
    module
        .with_state(|s: &mut YuvState| s.accept(plane, data, params))
        .unwrap_or_else(|| Err(GraphError::Config(format!("{}: no stream state", module.label()))))
}

fn kernel(_module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
    if node.kernel != ENC {
        return Ok(());
    }
    let mut y = io.take_output(1)?;
    let mut cb = io.take_output(2)?;
    let mut cr = io.take_output(3)?;
    encode(io.input(0)?, &mut y, &mut cb, &mut cr);
    Ok(())
}

fn luma(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

fn chroma(v: f32) -> u8 {
    (128.0 + v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// BT.601 full range, chroma averaged over 2x2 blocks
fn encode(rgba: &Buffer, y: &mut Buffer, cb: &mut Buffer, cr: &mut Buffer) {
    let stride = rgba.roi.wd as usize;
    let (wd, ht) = (y.roi.wd as usize, y.roi.ht as usize);
    let cw = cb.roi.wd as usize;
    if wd == 0 || ht == 0 || cw == 0 {
        return;
    }
    let src = rgba.as_f32();
    let px = |x: usize, yy: usize| -> [f32; 3] {
        let p = &src[(yy * stride + x) * 4..][..3];
        [p[0], p[1], p[2]]
    };

    y.bytes_mut()
        .par_chunks_mut(wd)
        .enumerate()
        .for_each(|(row, line)| {
            for (x, out) in line.iter_mut().enumerate() {
                let [r, g, b] = px(x, row);
                *out = luma(0.299 * r + 0.587 * g + 0.114 * b);
            }
        });

    cb.bytes_mut()
        .par_chunks_mut(cw)
        .zip(cr.bytes_mut().par_chunks_mut(cw))
        .enumerate()
        .for_each(|(row, (cb_line, cr_line))| {
            for x in 0..cw {
                let mut sum = [0.0f32; 3];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let p = px((2 * x + dx).min(wd - 1), (2 * row + dy).min(ht - 1));
                    for c in 0..3 {
                        sum[c] += p[c] / 4.0;
                    }
                }
                let [r, g, b] = sum;
                cb_line[x] = chroma(-0.168736 * r - 0.331264 * g + 0.5 * b);
                cr_line[x] = chroma(0.5 * r - 0.418688 * g - 0.081312 * b);
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::Roi;

    #[test]
    fn test_encode_grey_and_red() {
        let mut rgba = Buffer::new(Roi::full(2, 2), RGBA, Format::F32);
        rgba.as_f32_mut().copy_from_slice(&[
            1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, //
            1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0,
        ]);
        let mut y = Buffer::new(Roi::full(2, 2), PLANE, Format::Ui8);
        let mut cb = Buffer::new(Roi::full(1, 1), PLANE, Format::Ui8);
        let mut cr = Buffer::new(Roi::full(1, 1), PLANE, Format::Ui8);
        encode(&rgba, &mut y, &mut cb, &mut cr);
        assert_eq!(y.bytes(), &[76, 76, 76, 76]);
        assert_eq!(cb.bytes(), &[85]);
        assert_eq!(cr.bytes(), &[255]);

        rgba.as_f32_mut().fill(0.4);
        encode(&rgba, &mut y, &mut cb, &mut cr);
        assert_eq!(y.bytes(), &[102, 102, 102, 102]);
        assert_eq!((cb.bytes()[0], cr.bytes()[0]), (128, 128));
    }
}
