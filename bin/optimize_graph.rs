use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use graph_optimizer::core::{OptimizableGraph, RobustKernelRegistry};
use graph_optimizer::io::{load_graph, save_graph};
use graph_optimizer::optimizer::{
    DriverConfig, GaugePolicy, OptimizationStatus, OptimizerType, SparseOptimizer,
    create_algorithm,
};
use graph_optimizer::types::default_registry;
use graph_optimizer::{GraphOptimizerError, LinearSolverType, init_logger_with_level};
use tracing::{Level, info, warn};

#[derive(Parser)]
#[command(name = "optimize_graph")]
#[command(about = "Optimize a graph file with Gauss-Newton, Levenberg-Marquardt or Dog Leg")]
struct Args {
    /// Graph file to optimize
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Maximum number of optimization iterations
    #[arg(short, long, default_value = "20")]
    max_iterations: usize,

    /// Optimizer type: "lm" (Levenberg-Marquardt), "gn" (Gauss-Newton) or "dl" (Dog Leg)
    #[arg(short, long, default_value = "lm")]
    optimizer: String,

    /// Linear solver: "cholesky" or "pcg"
    #[arg(short, long, default_value = "cholesky")]
    linear_solver: String,

    /// Robust kernel applied to every edge, e.g. "Huber" or "Cauchy"
    #[arg(long)]
    robust_kernel: Option<String>,

    /// Width of the robust kernel
    #[arg(long, default_value = "1.0")]
    robust_kernel_width: f64,

    /// Optimize only the edges of this level
    #[arg(long, default_value = "0")]
    level: usize,

    /// Stop when the relative chi2 gain of an iteration drops below this value
    #[arg(long)]
    chi2_tolerance: Option<f64>,

    /// Wall clock limit in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Fail instead of fixing a vertex when the problem has gauge freedom
    #[arg(long)]
    no_gauge_fix: bool,

    /// Optional path to save the optimized graph
    #[arg(long)]
    save_output: Option<PathBuf>,

    /// Print registered vertex, edge and robust kernel names, then exit
    #[arg(long)]
    list_types: bool,

    /// Enable per-iteration output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_optimizer(name: &str) -> Result<OptimizerType, String> {
    match name.to_lowercase().as_str() {
        "lm" => Ok(OptimizerType::LevenbergMarquardt),
        "gn" => Ok(OptimizerType::GaussNewton),
        "dl" => Ok(OptimizerType::DogLeg),
        other => Err(format!(
            "Unknown optimizer '{}'. Valid options: lm, gn, dl",
            other
        )),
    }
}

fn parse_linear_solver(name: &str) -> Result<LinearSolverType, String> {
    match name.to_lowercase().as_str() {
        "cholesky" => Ok(LinearSolverType::SparseCholesky),
        "pcg" => Ok(LinearSolverType::Pcg),
        other => Err(format!(
            "Unknown linear solver '{}'. Valid options: cholesky, pcg",
            other
        )),
    }
}

fn apply_robust_kernel(
    graph: &mut OptimizableGraph,
    name: &str,
    width: f64,
) -> Result<usize, GraphOptimizerError> {
    let kernels = RobustKernelRegistry::with_defaults();
    let edge_ids: Vec<_> = graph.edge_ids().collect();
    for &edge_id in &edge_ids {
        let kernel = kernels.create(name, width)?;
        if let Some(edge) = graph.edge_mut(edge_id) {
            edge.set_robust_kernel(Some(kernel));
        }
    }
    Ok(edge_ids.len())
}

fn list_types() -> Result<(), Box<dyn std::error::Error>> {
    let registry = default_registry()?;
    info!("Vertex tags:");
    for tag in registry.vertex_tags() {
        info!("  {}", tag);
    }
    info!("Edge tags:");
    for tag in registry.edge_tags() {
        info!("  {}", tag);
    }
    info!("Robust kernels:");
    for name in RobustKernelRegistry::with_defaults().names() {
        info!("  {}", name);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger_with_level(if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    });

    if args.list_types {
        return list_types();
    }
    let input = args
        .input
        .ok_or("No input file given. Use --input <FILE> or --list-types")?;
    let optimizer_type = parse_optimizer(&args.optimizer)?;
    let linear_solver_type = parse_linear_solver(&args.linear_solver)?;

    info!("GRAPH OPTIMIZATION");
    let registry = default_registry()?;
    let mut graph = load_graph(&input, &registry)?;

    if let Some(kernel) = &args.robust_kernel {
        let count = apply_robust_kernel(&mut graph, kernel, args.robust_kernel_width)?;
        info!(
            "Robust kernel {} (width {}) set on {} edges",
            kernel, args.robust_kernel_width, count
        );
    }

    let mut config = DriverConfig::new().with_gauge_policy(if args.no_gauge_fix {
        GaugePolicy::Fail
    } else {
        GaugePolicy::AutoFix
    });
    if let Some(tolerance) = args.chi2_tolerance {
        config = config.with_chi2_tolerance(tolerance);
    }
    if let Some(seconds) = args.timeout {
        config = config.with_timeout(Duration::from_secs_f64(seconds));
    }

    let mut optimizer = SparseOptimizer::new(graph)
        .with_algorithm(create_algorithm(optimizer_type, linear_solver_type))
        .with_config(config);
    optimizer.initialize_optimization_at_level(args.level)?;

    let subset = optimizer.active_subset().ok_or("optimizer not initialized")?;
    info!("Optimizer:      {}", optimizer_type);
    info!("Linear solver:  {}", linear_solver_type);
    info!(
        "Active:         {} vertices, {} edges, dimension {}",
        subset.vertices().len(),
        subset.edges().len(),
        subset.dimension()
    );
    if !optimizer.unreachable_vertices().is_empty() {
        warn!(
            "{} vertices are not connected to the rest of the graph",
            optimizer.unreachable_vertices().len()
        );
    }

    let result = optimizer.optimize(args.max_iterations)?;

    info!("{}", "-".repeat(60));
    for line in result.to_string().lines() {
        info!("{}", line);
    }
    info!("{}", "-".repeat(60));
    if matches!(result.status, OptimizationStatus::InvalidNumericalValues) {
        warn!("Optimization produced non-finite values, estimates are not usable");
    }

    if let Some(path) = &args.save_output {
        save_graph(optimizer.graph(), path, &registry)?;
    }
    Ok(())
}
