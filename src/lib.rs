//! # Graph Optimizer
//!
//! A general graph optimization library: sparse nonlinear least squares over a
//! hypergraph of variables ("vertices") connected by measurement constraints
//! ("edges"). Typical problems are pose-graph SLAM, bundle adjustment and sensor
//! calibration.
//!
//! ## Features
//!
//! - **Hypergraph model**: user-defined vertex and edge types behind the [`Vertex`] and
//!   [`Edge`] traits, fixed and marginalized vertices, levels and active subsets
//! - **Multiple Optimization Algorithms**: Gauss-Newton, Levenberg-Marquardt and Dog Leg
//! - **Block sparse assembly**: the Hessian is built block by block from per-edge
//!   Jacobians, in parallel with the `parallel` feature
//! - **Robust kernels**: Huber, Cauchy, Tukey, DCS and more, with first or second order
//!   reweighting
//! - **Linear Algebra Backends**: sparse Cholesky (faer) and block-Jacobi PCG, with
//!   Schur complement elimination of marginalized vertices
//! - **Persistence**: g2o-style text files through an explicit [`TypeRegistry`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use graph_optimizer::{OptimizableGraph, SparseOptimizer, OptimizerType, LinearSolverType};
//!
//! let mut optimizer = SparseOptimizer::with_algorithm_type(
//!     graph,
//!     OptimizerType::LevenbergMarquardt,
//!     LinearSolverType::SparseCholesky,
//! );
//! optimizer.initialize_optimization()?;
//! let result = optimizer.optimize(50)?;
//! println!("{}", result);
//! ```

pub mod core;
pub mod error;
#[cfg(feature = "io")]
pub mod io;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod optimizer;
pub mod types;

pub use core::{
    ActiveSubset, CoreError, Edge, GraphEdge, OptimizableGraph, RobustInformation,
    RobustKernel, RobustKernelRegistry, Selection, TypeRegistry, Vertex, VertexState,
};
pub use error::{GraphOptimizerError, GraphOptimizerResult};

pub use linalg::{LinearSolver, LinearSolverType, PcgSolver, SparseCholeskySolver};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::{
    DogLeg, DogLegConfig, DriverConfig, GaussNewton, GaussNewtonConfig, LevenbergMarquardt,
    LevenbergMarquardtConfig, OptimizationStatus, OptimizerType, SolverResult, SparseOptimizer,
    StopToken,
};
