//! Cairn CLI - run synthetic graphs through the runtime and inspect plans.

use anyhow::{Context, Result};
use cairn_core::{Layer, Model, ModelBuilder, Tensor};
use cairn_runtime::{
    AllocationPolicy, AllocatorStats, CachePolicy, CpuBackend, LivenessPlan, RuntimeConfig,
    Session, StepResult,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Memory planning and scheduling for tensor graphs", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (twice for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GraphKind {
    /// Alternating Relu/Neg layers
    Chain,
    /// Repeated fork/join blocks
    Diamond,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a synthetic graph and report allocator statistics
    Run {
        /// Allocation policy: always-persist, single-slot, three-tier
        #[arg(short, long, default_value = "always-persist")]
        policy: AllocationPolicy,

        /// Buffer cache: size-bucketed, shape-exact
        #[arg(short, long, default_value = "size-bucketed")]
        cache: CachePolicy,

        /// Graph topology
        #[arg(short, long, value_enum, default_value = "chain")]
        graph: GraphKind,

        /// Number of layers (chain) or blocks (diamond)
        #[arg(long, default_value = "16")]
        depth: usize,

        /// Elements per tensor
        #[arg(long, default_value = "1024")]
        width: usize,

        /// Number of runs
        #[arg(long, default_value = "1")]
        runs: usize,

        /// Destroy cached buffers between runs
        #[arg(long)]
        no_keep_cache: bool,

        /// Step layers one at a time and print progress
        #[arg(long)]
        manual: bool,
    },
    /// Print the liveness plan of a synthetic graph
    Plan {
        /// Graph topology
        #[arg(short, long, value_enum, default_value = "diamond")]
        graph: GraphKind,

        /// Number of layers (chain) or blocks (diamond)
        #[arg(long, default_value = "2")]
        depth: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    match cli.command {
        Commands::Run {
            policy,
            cache,
            graph,
            depth,
            width,
            runs,
            no_keep_cache,
            manual,
        } => {
            let config = RuntimeConfig::default()
                .with_policy(policy)
                .with_cache(cache)
                .with_keep_cache(!no_keep_cache)
                .with_verbose_teardown(cli.verbose > 0);
            cmd_run(graph, depth, width, runs, manual, config)?;
        }
        Commands::Plan { graph, depth } => {
            cmd_plan(graph, depth)?;
        }
    }

    Ok(())
}

fn build_graph(kind: GraphKind, depth: usize, width: usize) -> Result<Model> {
    anyhow::ensure!(depth > 0, "depth must be at least 1");
    let mut builder = ModelBuilder::new().input("x", [width]);
    let mut previous = "x".to_string();

    match kind {
        GraphKind::Chain => {
            for i in 0..depth {
                let name = format!("l{i}");
                let op = if i % 2 == 0 { "Relu" } else { "Neg" };
                builder = builder.layer(Layer::new(&name, op).with_inputs([previous.as_str()]));
                previous = name;
            }
        }
        GraphKind::Diamond => {
            for i in 0..depth {
                let (left, right, join) = (format!("b{i}.neg"), format!("b{i}.relu"), format!("b{i}.add"));
                builder = builder
                    .layer(Layer::new(&left, "Neg").with_inputs([previous.as_str()]))
                    .layer(Layer::new(&right, "Relu").with_inputs([previous.as_str()]))
                    .layer(Layer::new(&join, "Add").with_inputs([left.as_str(), right.as_str()]));
                previous = join;
            }
        }
    }

    builder.build().context("Failed to build synthetic graph")
}

fn input_tensor(width: usize, run: usize) -> Result<Tensor> {
    let data: Vec<f32> = (0..width)
        .map(|i| ((i + run) % 7) as f32 - 3.0)
        .collect();
    Tensor::from_vec(data, [width]).context("Failed to create input tensor")
}

fn cmd_run(
    kind: GraphKind,
    depth: usize,
    width: usize,
    runs: usize,
    manual: bool,
    config: RuntimeConfig,
) -> Result<()> {
    let model = build_graph(kind, depth, width)?;
    let layers = model.len();
    println!(
        "Graph: {kind:?}, {layers} layers, {width} elements, policy {}, cache {}",
        config.policy, config.cache
    );

    let mut session =
        Session::new(model, CpuBackend::new(), config).context("Failed to create session")?;

    for run in 0..runs {
        let input = input_tensor(width, run)?;
        let start = std::time::Instant::now();
        if manual {
            let handle = session.progress_handle();
            let mut schedule = session
                .start_manual_schedule(&[("x", input)])
                .with_context(|| format!("Failed to start run {run}"))?;
            while let StepResult::Continue(step) = schedule.next_step()? {
                println!(
                    "  [{:>3}/{layers}] {:<12} on {} ({:.0}%)",
                    step.index + 1,
                    step.layer,
                    step.backend,
                    handle.fraction() * 100.0
                );
            }
        } else {
            session
                .execute(&[("x", input)])
                .with_context(|| format!("Run {run} failed"))?;
        }
        let elapsed = start.elapsed();

        let output = session.output()?;
        let values = output.to_vec::<f32>()?;
        let checksum: f32 = values.iter().sum();
        println!(
            "Run {run}: {:.2}ms, output {} checksum {checksum:.3}",
            elapsed.as_secs_f64() * 1000.0,
            output.shape()
        );
    }

    let stats = session.stats();
    println!();
    print_stats("persistent", &stats.persistent);
    if let Some(ping_pong) = &stats.ping_pong {
        print_stats("ping-pong", ping_pong);
    }
    if let Some(ephemeral) = &stats.ephemeral {
        print_stats("ephemeral", ephemeral);
    }
    println!("  bound outputs: {}", stats.bindings);

    let report = session.dispose();
    println!("Teardown released {} tensors", report.released);
    Ok(())
}

fn print_stats(label: &str, stats: &AllocatorStats) {
    println!("{label}:");
    println!(
        "  busy: {} tensors in {} buffers ({} bytes)",
        stats.busy_tensors, stats.busy_buffers, stats.busy_bytes
    );
    println!(
        "  cached: {} buffers ({} bytes)",
        stats.cached_buffers, stats.cached_bytes
    );
    println!("  peak: {} bytes", stats.peak_bytes);
    println!(
        "  buffers created/destroyed: {}/{}",
        stats.buffers_created, stats.buffers_destroyed
    );
    println!("  cache hits/misses: {}/{}", stats.cache_hits, stats.cache_misses);
}

fn cmd_plan(kind: GraphKind, depth: usize) -> Result<()> {
    let model = build_graph(kind, depth, 1)?;
    let plan = LivenessPlan::build(&model);

    println!("Layers ({}):", model.len());
    for (index, layer) in model.layers().iter().enumerate() {
        let disposed = plan.dispose_after(index);
        if disposed.is_empty() {
            println!("  {index}. {} ({})", layer.name, layer.op_type);
        } else {
            println!(
                "  {index}. {} ({}) -> release {}",
                layer.name,
                layer.op_type,
                disposed.join(", ")
            );
        }
    }
    println!();
    println!("Preserved: x, {}", model.outputs().join(", "));
    Ok(())
}
