// pipegraph - pipeline runner
// Loads a JSON pipeline, builds the node graph and runs a number of frames

use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipegraph::{Graph, PipelineConfig, ThreadPool};

#[derive(Parser)]
#[command(name = "pipegraph", version, about = "Build and run a per-frame compute graph")]
struct Args {
    /// Pipeline description (JSON)
    pipeline: PathBuf,

    /// Number of frames to run (overrides the pipeline file)
    #[arg(long)]
    frames: Option<u64>,

    /// Worker threads (defaults to the available parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Output width bound, 0 for none
    #[arg(long)]
    max_width: Option<u32>,

    /// Output height bound, 0 for none
    #[arg(long)]
    max_height: Option<u32>,

    /// Write the compiled node graph as Graphviz dot
    #[arg(long)]
    dot: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();

    let mut pipeline = PipelineConfig::load(&args.pipeline)
        .with_context(|| format!("Failed to load pipeline {}", args.pipeline.display()))?;
    if let Some(frames) = args.frames {
        pipeline.graph.frames = frames;
    }
    if let Some(threads) = args.threads {
        pipeline.graph.threads = Some(threads);
    }
    if let Some(wd) = args.max_width {
        pipeline.graph.max_width = wd;
    }
    if let Some(ht) = args.max_height {
        pipeline.graph.max_height = ht;
    }

    info!("Starting pipegraph");
    info!("   Pipeline: {}", args.pipeline.display());

    let pool = match pipeline.graph.threads {
        Some(n) => ThreadPool::new(n),
        None => ThreadPool::with_available_parallelism(),
    }
    .context("Failed to start worker pool")?;
    info!("   ✓ {} worker threads", pool.num_threads());

    let mut graph = Graph::from_config(&pipeline).context("Failed to configure graph")?;
    let report = graph.build().context("Failed to build graph")?;
    info!(
        "   ✓ {} nodes in {} levels, {} feedback edges",
        report.nodes, report.levels, report.feedback_edges
    );

    if let Some(path) = &args.dot {
        let mut out = BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        );
        graph.write_dot(&mut out).context("Failed to write dot graph")?;
        info!("   ✓ Node graph written to {}", path.display());
    }

    let mut failure = None;
    for _ in 0..pipeline.graph.frames {
        match graph.run_frame(&pool) {
            Ok(stats) => info!(
                "Frame {}: {} nodes in {} levels ({} ms)",
                stats.frame, stats.nodes_executed, stats.levels, stats.elapsed_ms
            ),
            Err(e) => {
                warn!("Stopping after frame failure: {}", e);
                failure = Some(e);
                break;
            }
        }
    }

    let snapshot = graph.metrics().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    drop(graph);
    pool.join();
    match failure {
        Some(e) => Err(e).context("Frame execution failed"),
        None => Ok(()),
    }
}
