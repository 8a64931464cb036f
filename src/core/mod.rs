//! Core graph components for the graph-optimizer library
//!
//! This module contains the hypergraph that the optimizer works on:
//! - Vertex and edge contracts implemented by concrete type libraries
//! - The owning graph arena with fixed/marginalized state and backup stacks
//! - Active subsets with Hessian index mapping, gauge and connectivity analysis
//! - Robust kernels and the information reweighting strategies built on them
//! - The Jacobian scratch workspace shared by all edges
//! - Type and robust-kernel registries used by persistence

pub mod active_subset;
pub mod edge;
pub mod graph;
pub mod jacobian_workspace;
pub mod registry;
pub mod robust_information;
pub mod robust_kernel;
pub mod token_reader;
pub mod vertex;

use thiserror::Error;
use tracing::error;

pub use active_subset::{ActiveSubset, IndexedVertex, Selection};
pub use edge::{Arity, Edge, GraphEdge};
pub use graph::{OptimizableGraph, VertexState};
pub use jacobian_workspace::JacobianWorkspace;
pub use registry::{RobustKernelRegistry, TypeRegistry};
pub use robust_information::RobustInformation;
pub use robust_kernel::RobustKernel;
pub use token_reader::TokenReader;
pub use vertex::Vertex;

/// Identifier of a vertex, unique within a graph.
pub type VertexId = usize;

/// Handle of an edge inside a graph, assigned on insertion.
pub type EdgeId = usize;

/// Core module error types for graph construction and analysis
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A vertex with the same id already exists
    #[error("Duplicate vertex id: {id}")]
    DuplicateVertex { id: VertexId },

    /// Referenced vertex does not exist in the graph
    #[error("Vertex {id} not found in graph")]
    VertexNotFound { id: VertexId },

    /// Referenced edge does not exist in the graph
    #[error("Edge {id} not found in graph")]
    EdgeNotFound { id: EdgeId },

    /// Edge is structurally invalid (arity, repeated vertices, marginalized pairs)
    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    /// Dimension mismatch between errors, Jacobians, information or vertices
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Vertex or edge is not of the expected concrete type
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Token stream could not be parsed into vertex or edge data
    #[error("Parse error: {0}")]
    Parse(String),

    /// Gauge freedom detected and the policy forbids fixing a vertex automatically
    #[error("Gauge freedom: {0}")]
    GaugeFreedom(String),

    /// Active vertices not connected to any anchored vertex
    #[error("Disconnected graph: {} vertices unreachable from fixed vertices: {unreachable:?}", unreachable.len())]
    DisconnectedGraph { unreachable: Vec<VertexId> },

    /// Type or kernel registry lookup failed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Robust kernel parameter error
    #[error("Robust kernel error: {0}")]
    RobustKernel(String),

    /// Jacobian workspace too small for the requested block
    #[error("Jacobian workspace error: {0}")]
    Workspace(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// graph.vertex(id)
    ///     .ok_or_else(|| CoreError::VertexNotFound { id }.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error that caused it
    ///
    /// # Example
    /// ```ignore
    /// token.parse::<f64>()
    ///     .map_err(|e| CoreError::Parse(format!("invalid number '{token}'")).log_with_source(e))?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
