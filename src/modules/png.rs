//! `o-png`: writes every frame of its input as an 8-bit PNG.

use image::{DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, RgbImage, RgbaImage};
use std::path::PathBuf;
use tracing::debug;

use crate::arena::NodeArena;
use crate::connector::{channel_count, ConnectorDecl, Format};
use crate::error::{GraphError, Result};
use crate::module::{
    ConnectorTemplate, Module, ModuleFlags, ModuleOps, ParamSpec, ParamType, WriteSinkParams,
};

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[ConnectorTemplate::read("input", "*", Format::F32)],
    params: &[ParamSpec::required("path", ParamType::String)],
    flags: ModuleFlags::WRITE_SINK,
    create_nodes: Some(create_nodes),
    write_sink: Some(write_sink),
    ..ModuleOps::new("o-png")
};

fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let input = &module.connectors[0];
    match channel_count(input.chan) {
        Some(1..=4) => {}
        _ => {
            return Err(GraphError::Config(format!(
                "{}: cannot store '{}' data as PNG",
                module.label(),
                input.chan
            )))
        }
    }
    let roi = input.roi;
    let node = arena.add_node(
        module,
        "write",
        [roi.wd, roi.ht, 1],
        &[],
        &[ConnectorDecl::sink("input", input.chan, Format::F32)],
    )?;
    arena.copy_connector(module, 0, node, 0)
}

/// `{path}_{frame:04}.png`
pub fn frame_path(prefix: &str, frame: u64) -> PathBuf {
    PathBuf::from(format!("{}_{:04}.png", prefix, frame))
}

fn write_sink(module: &Module, data: &[u8], params: &WriteSinkParams) -> Result<()> {
    let (wd, ht) = (params.roi.wd, params.roi.ht);
    let pixels: Vec<u8> = data
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect();

    let too_short = || GraphError::SourceSize {
        expected: params.roi.pixels() * channel_count(params.chan).unwrap_or(1) * 4,
        found: data.len(),
    };
    let img = match channel_count(params.chan) {
        Some(1) => GrayImage::from_raw(wd, ht, pixels).map(DynamicImage::ImageLuma8),
        Some(2) => GrayAlphaImage::from_raw(wd, ht, pixels).map(DynamicImage::ImageLumaA8),
        Some(3) => RgbImage::from_raw(wd, ht, pixels).map(DynamicImage::ImageRgb8),
        _ => RgbaImage::from_raw(wd, ht, pixels).map(DynamicImage::ImageRgba8),
    }
    .ok_or_else(too_short)?;

    let path = frame_path(module.param_str("path", "out"), params.frame);
    img.save_with_format(&path, ImageFormat::Png)?;
    debug!("Saved {}x{} frame {} to {}", wd, ht, params.frame, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleId;
    use crate::roi::Roi;
    use crate::token::Token;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_write_sink_saves_png() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("still");
        let prefix = prefix.to_str().unwrap();
        let params = json!({ "path": prefix });
        let module = Module::new(ModuleId(0), Token::new("main").unwrap(), &OPS, params).unwrap();

        let values: Vec<f32> = vec![0.0, 0.5, 1.0, 2.0];
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        let params = WriteSinkParams {
            roi: Roi::full(2, 2),
            node: Token::new("write").unwrap(),
            connector: Token::new("input").unwrap(),
            chan: Token::new("y").unwrap(),
            format: Format::F32,
            frame: 3,
        };
        write_sink(&module, &data, &params).unwrap();

        let img = image::open(frame_path(prefix, 3)).unwrap().to_luma8();
        assert_eq!(img.as_raw(), &vec![0, 128, 255, 255]);
    }
}
