//! Two-pass ROI negotiation over the module chain.
//!
//! A sweep is a forward pass in module order (inputs copy their producer's
//! ROI, then `modify_roi_out` computes the outputs) followed by a backward
//! pass in reverse order (outputs take the largest scale any consumer asked
//! for, then `modify_roi_in` computes the inputs). Sweeps repeat until the
//! whole assignment stops changing; a closing forward pass makes every input
//! equal to what its producer will actually write.

use std::collections::HashMap;
use tracing::debug;

use crate::connector::Format;
use crate::error::{GraphError, Result};
use crate::module::{Module, RoiContext};
use crate::roi::Roi;
use crate::schedule::topo_levels;
use crate::token::Token;

pub const MAX_SWEEPS: usize = 8;

type Consumers = HashMap<(usize, usize), Vec<(usize, usize)>>;

/// Modules in producer-before-consumer order
pub fn module_order(modules: &[Module]) -> Result<Vec<usize>> {
    let edges: Vec<(usize, usize)> = modules
        .iter()
        .enumerate()
        .flat_map(|(i, m)| {
            m.connectors
                .iter()
                .filter_map(|c| c.producer)
                .map(move |link| (link.module.index(), i))
        })
        .collect();

    topo_levels(modules.len(), &edges)
        .map(|levels| levels.into_iter().flatten().collect())
        .map_err(|i| {
            GraphError::Cycle(modules.get(i).map_or_else(|| format!("module {}", i), Module::label))
        })
}

/// Run sweeps to a fixed point. Returns the number of sweeps it took.
pub fn negotiate(modules: &mut [Module], ctx: &RoiContext) -> Result<usize> {
    let order = module_order(modules)?;
    let consumers = consumers(modules);

    let mut previous = snapshot(modules);
    for sweep in 1..=MAX_SWEEPS {
        forward(modules, &order, ctx);
        backward(modules, &order, &consumers, ctx);
        let current = snapshot(modules);
        debug!("ROI sweep {} over {} modules", sweep, modules.len());
        if current == previous {
            forward(modules, &order, ctx);
            return Ok(sweep);
        }
        previous = current;
    }
    Err(GraphError::RoiNotConverged(MAX_SWEEPS))
}

fn consumers(modules: &[Module]) -> Consumers {
    let mut map: Consumers = HashMap::new();
    for (i, m) in modules.iter().enumerate() {
        for (c, conn) in m.inputs() {
            if let Some(link) = conn.producer {
                map.entry((link.module.index(), link.connector))
                    .or_default()
                    .push((i, c));
            }
        }
    }
    map
}

fn snapshot(modules: &[Module]) -> Vec<(Roi, Token, Format)> {
    modules
        .iter()
        .flat_map(|m| m.connectors.iter().map(|c| (c.roi, c.chan, c.format)))
        .collect()
}

fn forward(modules: &mut [Module], order: &[usize], ctx: &RoiContext) {
    for &m in order {
        let links: Vec<(usize, usize, usize)> = modules[m]
            .inputs()
            .filter_map(|(c, conn)| conn.producer.map(|l| (c, l.module.index(), l.connector)))
            .collect();
        for (c, pm, pc) in links {
            let (roi, chan, format) = {
                let p = &modules[pm].connectors[pc];
                (p.roi, p.chan, p.format)
            };
            let wildcard = modules[m].is_wildcard(c);
            let input = &mut modules[m].connectors[c];
            input.roi = roi;
            if wildcard {
                input.chan = chan;
                input.format = format;
            }
        }

        let module = &mut modules[m];
        resolve_wildcard_outputs(module);
        match module.ops.modify_roi_out {
            Some(modify) => modify(module, ctx),
            None => default_roi_out(module),
        }
    }
}

fn backward(modules: &mut [Module], order: &[usize], consumers: &Consumers, ctx: &RoiContext) {
    for &m in order.iter().rev() {
        let outputs: Vec<usize> = modules[m].outputs().map(|(c, _)| c).collect();
        for o in outputs {
            let scale = match consumers.get(&(m, o)) {
                Some(list) if !list.is_empty() => list
                    .iter()
                    .map(|&(cm, cc)| modules[cm].connectors[cc].roi.scale)
                    .fold(f32::MIN, f32::max),
                _ => {
                    let roi = modules[m].connectors[o].roi;
                    ctx.output_scale(roi.full_wd, roi.full_ht)
                }
            };
            let out = &mut modules[m].connectors[o];
            out.roi = out.roi.with_scale(scale);
        }

        let module = &mut modules[m];
        match module.ops.modify_roi_in {
            Some(modify) => modify(module, ctx),
            None => default_roi_in(module, ctx),
        }
    }
}

fn resolve_wildcard_outputs(module: &mut Module) {
    let Some((chan, format)) = module.inputs().next().map(|(_, c)| (c.chan, c.format)) else {
        return;
    };
    for o in 0..module.connectors.len() {
        if module.connectors[o].kind.is_output() && module.is_wildcard(o) {
            let out = &mut module.connectors[o];
            out.chan = chan;
            out.format = format;
        }
    }
}

/// Outputs take the full size of the first input at their own scale.
/// Modules without inputs keep what they set themselves.
pub fn default_roi_out(module: &mut Module) {
    let Some(full) = module.inputs().next().map(|(_, c)| (c.roi.full_wd, c.roi.full_ht)) else {
        return;
    };
    for conn in module.connectors.iter_mut().filter(|c| c.kind.is_output()) {
        conn.roi = conn.roi.with_full(full.0, full.1);
    }
}

/// Inputs take the scale of the first output, or the graph output scale
/// when the module has no outputs.
pub fn default_roi_in(module: &mut Module, ctx: &RoiContext) {
    let out_scale = module.outputs().next().map(|(_, c)| c.roi.scale);
    for conn in module.connectors.iter_mut().filter(|c| c.kind.is_input()) {
        let scale =
            out_scale.unwrap_or_else(|| ctx.output_scale(conn.roi.full_wd, conn.roi.full_ht));
        conn.roi = conn.roi.with_scale(scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ConnectorTemplate, ModuleId, ModuleLink, ModuleOps};
    use serde_json::Value;

    static SOURCE: ModuleOps = ModuleOps {
        connectors: &[ConnectorTemplate::write("output", "rgba", Format::F32)],
        modify_roi_out: Some(source_roi_out),
        ..ModuleOps::new("src")
    };

    static PASS: ModuleOps = ModuleOps {
        connectors: &[
            ConnectorTemplate::read("input", "*", Format::Any),
            ConnectorTemplate::write("output", "*", Format::Any),
        ],
        ..ModuleOps::new("pass")
    };

    static HALF: ModuleOps = ModuleOps {
        connectors: &[
            ConnectorTemplate::read("input", "rgba", Format::F32),
            ConnectorTemplate::write("output", "rgba", Format::F32),
        ],
        modify_roi_out: Some(half_roi_out),
        modify_roi_in: Some(full_res_in),
        ..ModuleOps::new("half")
    };

    static SINK: ModuleOps = ModuleOps {
        connectors: &[ConnectorTemplate::read("input", "rgba", Format::F32)],
        ..ModuleOps::new("sink")
    };

    fn source_roi_out(module: &mut Module, _ctx: &RoiContext) {
        let out = &mut module.connectors[0];
        out.roi = Roi::scaled(64, 48, out.roi.scale);
    }

    fn half_roi_out(module: &mut Module, _ctx: &RoiContext) {
        let input = module.connectors[0].roi;
        let out = &mut module.connectors[1];
        out.roi = out.roi.with_full(input.full_wd / 2, input.full_ht / 2);
    }

    fn full_res_in(module: &mut Module, _ctx: &RoiContext) {
        let input = &mut module.connectors[0];
        input.roi = input.roi.with_scale(1.0);
    }

    fn chain(ops: &[&'static ModuleOps]) -> Vec<Module> {
        let mut modules: Vec<Module> = ops
            .iter()
            .enumerate()
            .map(|(i, ops)| {
                let name = Token::new("main").unwrap();
                Module::new(ModuleId(i as u32), name, ops, Value::Null).unwrap()
            })
            .collect();
        for i in 1..modules.len() {
            let producer = modules[i - 1].outputs().next().unwrap().0;
            let input = modules[i].inputs().next().unwrap().0;
            modules[i].connectors[input].producer = Some(ModuleLink {
                module: ModuleId(i as u32 - 1),
                connector: producer,
            });
        }
        modules
    }

    #[test]
    fn test_linear_chain_converges_in_two_sweeps() {
        let mut modules = chain(&[&SOURCE, &PASS, &SINK]);
        let ctx = RoiContext { max_width: 32, max_height: 32 };
        let sweeps = negotiate(&mut modules, &ctx).unwrap();
        assert_eq!(sweeps, 2);

        let sink_in = modules[2].connectors[0].roi;
        assert_eq!((sink_in.full_wd, sink_in.full_ht), (64, 48));
        assert_eq!((sink_in.wd, sink_in.ht), (32, 24));
        assert_eq!(modules[0].connectors[0].roi, sink_in);
        // wildcards resolved from the producer
        assert_eq!(modules[1].connectors[1].chan, Token::new("rgba").unwrap());
        assert_eq!(modules[1].connectors[1].format, Format::F32);
    }

    #[test]
    fn test_resolution_change_updates_full_and_working() {
        let mut modules = chain(&[&SOURCE, &HALF, &SINK]);
        let ctx = RoiContext { max_width: 16, max_height: 0 };
        negotiate(&mut modules, &ctx).unwrap();

        // the half module needs its input at full resolution
        assert_eq!(modules[0].connectors[0].roi, Roi::full(64, 48));
        let out = modules[1].connectors[1].roi;
        assert_eq!((out.full_wd, out.full_ht), (32, 24));
        assert_eq!((out.wd, out.ht), (16, 12));
        assert_eq!(modules[2].connectors[0].roi, out);
    }

    #[test]
    fn test_no_bounds_keeps_full_resolution() {
        let mut modules = chain(&[&SOURCE, &SINK]);
        let ctx = RoiContext { max_width: 0, max_height: 0 };
        negotiate(&mut modules, &ctx).unwrap();
        assert_eq!(modules[1].connectors[0].roi, Roi::full(64, 48));
    }

    #[test]
    fn test_module_cycle() {
        let mut modules = chain(&[&PASS, &PASS]);
        modules[0].connectors[0].producer = Some(ModuleLink { module: ModuleId(1), connector: 1 });
        assert!(matches!(module_order(&modules), Err(GraphError::Cycle(_))));
    }
}
