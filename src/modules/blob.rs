//! `i-blob`: flat binary image source.
//!
//! The file holds exactly `width * height` pixels of the configured channel
//! layout and format, row major, native byte order, nothing else.

use std::path::Path;
use tracing::debug;

use crate::arena::NodeArena;
use crate::connector::{ConnectorDecl, Format};
use crate::error::{GraphError, Result};
use crate::execute::KernelIo;
use crate::module::{
    ConnectorTemplate, Module, ModuleFlags, ModuleOps, ParamSpec, ParamType, ReadSourceParams,
    RoiContext,
};
use crate::node::Node;
use crate::roi::Roi;
use crate::token::Token;

use super::{add_resample, resample, RESAMPLE};

pub static OPS: ModuleOps = ModuleOps {
    connectors: &[ConnectorTemplate::write("output", "*", Format::Any)],
    params: &[
        ParamSpec::required("path", ParamType::String),
        ParamSpec::required("width", ParamType::Integer),
        ParamSpec::required("height", ParamType::Integer),
        ParamSpec::optional("format", ParamType::String),
        ParamSpec::optional("chan", ParamType::String),
    ],
    flags: ModuleFlags::READ_SOURCE,
    init: Some(init),
    modify_roi_out: Some(modify_roi_out),
    create_nodes: Some(create_nodes),
    read_source: Some(read_source),
    kernel: Some(kernel),
    ..ModuleOps::new("i-blob")
};

fn dimensions(module: &Module) -> (u32, u32) {
    let clamp = |v: u64| v.min(u32::MAX as u64) as u32;
    (clamp(module.param_u64("width", 0)), clamp(module.param_u64("height", 0)))
}

fn init(module: &mut Module) -> Result<()> {
    let (wd, ht) = dimensions(module);
    if wd == 0 || ht == 0 {
        return Err(GraphError::InvalidParams(format!(
            "{}: width and height must be positive",
            module.label()
        )));
    }
    let format = match Format::parse(module.param_str("format", "ui16")) {
        Some(Format::Any) | None => {
            return Err(GraphError::InvalidParams(format!(
                "{}: unsupported format '{}'",
                module.label(),
                module.param_str("format", "ui16")
            )))
        }
        Some(format) => format,
    };
    let chan = Token::new(module.param_str("chan", "rggb"))?;
    if chan.is_wildcard() {
        return Err(GraphError::InvalidParams(format!(
            "{}: channel layout must be concrete",
            module.label()
        )));
    }

    let out = &mut module.connectors[0];
    out.chan = chan;
    out.format = format;
    out.roi = Roi::full(wd, ht);
    Ok(())
}

fn modify_roi_out(module: &mut Module, _ctx: &RoiContext) {
    let (wd, ht) = dimensions(module);
    let out = &mut module.connectors[0];
    out.roi = Roi::scaled(wd, ht, out.roi.scale);
}

/// `load` always reads the whole file; `resample` follows when the graph
/// works below full resolution.
fn create_nodes(arena: &mut NodeArena, module: &Module) -> Result<()> {
    let out = &module.connectors[0];
    let full = Roi::full(out.roi.full_wd, out.roi.full_ht);
    let load = arena.add_node(
        module,
        "load",
        [full.wd, full.ht, 1],
        &[],
        &[ConnectorDecl::source("source", out.chan, out.format, full)],
    )?;

    if out.roi.is_full_res() {
        return arena.copy_connector(module, 0, load, 0);
    }
    debug!(
        "{}: resampling {}x{} to {}x{}",
        module.label(),
        full.wd,
        full.ht,
        out.roi.wd,
        out.roi.ht
    );
    let resampled = add_resample(arena, module, (load, 0), out.chan, out.format, out.roi)?;
    arena.copy_connector(module, 0, resampled, 1)
}

fn read_source(module: &Module, dst: &mut [u8], _params: &ReadSourceParams) -> Result<()> {
    load_blob(Path::new(module.param_str("path", "")), dst)
}

fn kernel(_module: &Module, node: &Node, io: &mut KernelIo<'_>) -> Result<()> {
    if node.kernel == RESAMPLE {
        resample(io)?;
    }
    Ok(())
}

/// Fill `dst` from the file at `path`. The file must be exactly as large as
/// `dst`; otherwise `dst` is left untouched.
pub fn load_blob(path: &Path, dst: &mut [u8]) -> Result<()> {
    let data = std::fs::read(path)?;
    if data.len() != dst.len() {
        return Err(GraphError::SourceSize {
            expected: dst.len(),
            found: data.len(),
        });
    }
    dst.copy_from_slice(&data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleId;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn blob(params: serde_json::Value) -> Result<Module> {
        let mut module = Module::new(ModuleId(0), Token::new("main").unwrap(), &OPS, params)?;
        init(&mut module)?;
        Ok(module)
    }

    #[test]
    fn test_init_sets_output() {
        let params =
            json!({ "path": "x", "width": 6, "height": 4, "format": "f32", "chan": "rgba" });
        let m = blob(params).unwrap();
        let out = &m.connectors[0];
        assert_eq!(out.roi, Roi::full(6, 4));
        assert_eq!(out.format, Format::F32);
        assert_eq!(out.chan, Token::new("rgba").unwrap());
    }

    #[test]
    fn test_init_rejects_bad_params() {
        assert!(blob(json!({ "path": "x", "width": 0, "height": 4 })).is_err());
        assert!(blob(json!({ "path": "x", "width": 2, "height": 4, "format": "u7" })).is_err());
        assert!(blob(json!({ "path": "x", "width": 2, "height": 4, "chan": "*" })).is_err());
    }

    #[test]
    fn test_load_blob_size_check() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();

        let mut dst = [9u8; 4];
        load_blob(file.path(), &mut dst).unwrap();
        assert_eq!(dst, [1, 2, 3, 4]);

        let mut wrong = [9u8; 8];
        let err = load_blob(file.path(), &mut wrong).unwrap_err();
        assert!(matches!(err, GraphError::SourceSize { expected: 8, found: 4 }));
        assert_eq!(wrong, [9u8; 8]);
    }
}
