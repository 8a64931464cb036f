//! Edge contract and the graph-side edge record.
//!
//! An [`Edge`] is a measurement constraint over an ordered list of vertices. It knows
//! how to compute its error from the current estimates and, optionally, its
//! Jacobians. [`GraphEdge`] is what the graph stores: the edge plus the ids of its
//! vertices, its level, its optional robust kernel and the cached error.

use crate::core::{
    CoreError, CoreResult, JacobianWorkspace, RobustKernel, TokenReader, Vertex, VertexId,
};
use nalgebra::{DMatrix, DVector};
use std::any::Any;
use std::fmt;

/// Step used by the default numeric Jacobian.
pub const NUMERIC_JACOBIAN_DELTA: f64 = 1e-9;

/// Number of vertices an edge connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    /// Decided per instance through [`Edge::set_num_vertices`]
    Variable,
}

/// A measurement constraint between vertices.
pub trait Edge: Send + Sync + fmt::Debug {
    /// Dimension of the error vector.
    fn dimension(&self) -> usize;

    fn arity(&self) -> Arity;

    /// Information matrix, `dimension() x dimension()`, symmetric positive semi-definite.
    fn information(&self) -> &DMatrix<f64>;

    /// Tangent dimension expected for vertex `index`, when the edge type pins it.
    fn expected_vertex_dimension(&self, _index: usize) -> Option<usize> {
        None
    }

    /// Compute the error from the connected vertices, in edge order.
    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>>;

    /// Write `∂error/∂Δx_i` into `workspace.jacobian_mut(i, dimension, dim_i)` for every
    /// vertex `i` with `fixed[i] == false`.
    ///
    /// The default implementation uses central differences through `oplus`, perturbing
    /// a clone of each vertex by `±NUMERIC_JACOBIAN_DELTA`.
    fn linearize_oplus(
        &self,
        vertices: &[&dyn Vertex],
        fixed: &[bool],
        workspace: &mut JacobianWorkspace,
    ) -> CoreResult<()> {
        numeric_jacobians(self, vertices, fixed, workspace)
    }

    /// Parse measurement and information from a graph file line (vertex ids already consumed).
    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()>;

    /// Write measurement and information in the format accepted by [`Edge::read`].
    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    /// Resize a variable-arity edge.
    fn set_num_vertices(&mut self, num_vertices: usize) -> CoreResult<()> {
        Err(CoreError::InvalidEdge(format!(
            "edge with arity {:?} cannot connect {} vertices",
            self.arity(),
            num_vertices
        )))
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Central-difference Jacobians, shared by the default [`Edge::linearize_oplus`].
pub fn numeric_jacobians<E: Edge + ?Sized>(
    edge: &E,
    vertices: &[&dyn Vertex],
    fixed: &[bool],
    workspace: &mut JacobianWorkspace,
) -> CoreResult<()> {
    let rows = edge.dimension();
    let scalar = 0.5 / NUMERIC_JACOBIAN_DELTA;

    for (i, vertex) in vertices.iter().enumerate() {
        if fixed.get(i).copied().unwrap_or(false) {
            continue;
        }
        let cols = vertex.dimension();
        let mut delta = vec![0.0; cols];
        let mut columns = Vec::with_capacity(cols);

        for k in 0..cols {
            delta[k] = NUMERIC_JACOBIAN_DELTA;
            let mut plus = vertex.clone_box();
            plus.oplus(&delta);
            delta[k] = -NUMERIC_JACOBIAN_DELTA;
            let mut minus = vertex.clone_box();
            minus.oplus(&delta);
            delta[k] = 0.0;

            let mut perturbed: Vec<&dyn Vertex> = vertices.to_vec();
            perturbed[i] = plus.as_ref();
            let error_plus = edge.compute_error(&perturbed)?;
            perturbed[i] = minus.as_ref();
            let error_minus = edge.compute_error(&perturbed)?;
            columns.push((error_plus - error_minus) * scalar);
        }

        let mut jacobian = workspace.jacobian_mut(i, rows, cols)?;
        for (k, column) in columns.iter().enumerate() {
            if column.len() != rows {
                return Err(CoreError::DimensionMismatch(format!(
                    "error has {} rows, edge dimension is {}",
                    column.len(),
                    rows
                )));
            }
            jacobian.column_mut(k).copy_from(column);
        }
    }
    Ok(())
}

/// An edge as stored in the graph.
#[derive(Debug)]
pub struct GraphEdge {
    vertex_ids: Vec<VertexId>,
    level: usize,
    robust_kernel: Option<Box<dyn RobustKernel>>,
    edge: Box<dyn Edge>,
    error: DVector<f64>,
}

impl GraphEdge {
    pub fn new(vertex_ids: Vec<VertexId>, edge: impl Edge + 'static) -> Self {
        Self::from_boxed(vertex_ids, Box::new(edge))
    }

    pub fn from_boxed(vertex_ids: Vec<VertexId>, edge: Box<dyn Edge>) -> Self {
        let dimension = edge.dimension();
        Self {
            vertex_ids,
            level: 0,
            robust_kernel: None,
            edge,
            error: DVector::zeros(dimension),
        }
    }

    pub fn with_level(mut self, level: usize) -> Self {
        self.level = level;
        self
    }

    pub fn with_robust_kernel(mut self, kernel: impl RobustKernel + 'static) -> Self {
        self.robust_kernel = Some(Box::new(kernel));
        self
    }

    pub fn with_boxed_robust_kernel(mut self, kernel: Option<Box<dyn RobustKernel>>) -> Self {
        self.robust_kernel = kernel;
        self
    }

    pub fn vertex_ids(&self) -> &[VertexId] {
        &self.vertex_ids
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) {
        self.level = level;
    }

    pub fn robust_kernel(&self) -> Option<&dyn RobustKernel> {
        self.robust_kernel.as_deref()
    }

    pub fn set_robust_kernel(&mut self, kernel: Option<Box<dyn RobustKernel>>) {
        self.robust_kernel = kernel;
    }

    pub fn robust_kernel_mut(&mut self) -> Option<&mut (dyn RobustKernel + 'static)> {
        self.robust_kernel.as_deref_mut()
    }

    pub fn edge(&self) -> &dyn Edge {
        self.edge.as_ref()
    }

    pub fn edge_mut(&mut self) -> &mut dyn Edge {
        self.edge.as_mut()
    }

    /// Downcast the measurement model to its concrete type.
    pub fn edge_as<T: Edge + 'static>(&self) -> Option<&T> {
        self.edge.as_any().downcast_ref::<T>()
    }

    pub fn edge_as_mut<T: Edge + 'static>(&mut self) -> Option<&mut T> {
        self.edge.as_any_mut().downcast_mut::<T>()
    }

    pub fn dimension(&self) -> usize {
        self.edge.dimension()
    }

    /// Error cached by the last error computation.
    pub fn error(&self) -> &DVector<f64> {
        &self.error
    }

    pub fn set_error(&mut self, error: DVector<f64>) -> CoreResult<()> {
        if error.len() != self.edge.dimension() {
            return Err(CoreError::DimensionMismatch(format!(
                "error of length {} for edge of dimension {}",
                error.len(),
                self.edge.dimension()
            )));
        }
        self.error = error;
        Ok(())
    }

    /// `eᵀΩe` of the cached error.
    pub fn chi2(&self) -> f64 {
        squared_error(self.edge.information(), &self.error)
    }

    /// Robust cost `ρ(eᵀΩe)` of the cached error, plain chi2 without a kernel.
    pub fn robust_chi2(&self) -> f64 {
        let chi2 = self.chi2();
        match &self.robust_kernel {
            Some(kernel) => kernel.robustify(chi2)[0],
            None => chi2,
        }
    }
}

/// `eᵀΩe`
pub fn squared_error(information: &DMatrix<f64>, error: &DVector<f64>) -> f64 {
    error.dot(&(information * error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::robust_kernel::HuberKernel;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[derive(Debug, Clone, Default)]
    struct ScalarVertex {
        value: f64,
    }

    impl Vertex for ScalarVertex {
        fn dimension(&self) -> usize {
            1
        }
        fn oplus(&mut self, delta: &[f64]) {
            self.value += delta[0];
        }
        fn set_to_origin(&mut self) {
            self.value = 0.0;
        }
        fn estimate(&self) -> DVector<f64> {
            DVector::from_element(1, self.value)
        }
        fn set_estimate(&mut self, estimate: &DVector<f64>) -> CoreResult<()> {
            self.value = estimate[0];
            Ok(())
        }
        fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
            self.value = tokens.next_f64()?;
            Ok(())
        }
        fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
            write!(out, "{}", self.value)
        }
        fn clone_box(&self) -> Box<dyn Vertex> {
            Box::new(self.clone())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// error = a² · b - measurement
    #[derive(Debug)]
    struct ProductEdge {
        measurement: f64,
        information: DMatrix<f64>,
    }

    impl Edge for ProductEdge {
        fn dimension(&self) -> usize {
            1
        }
        fn arity(&self) -> Arity {
            Arity::Fixed(2)
        }
        fn information(&self) -> &DMatrix<f64> {
            &self.information
        }
        fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
            let a = vertices[0].estimate()[0];
            let b = vertices[1].estimate()[0];
            Ok(DVector::from_element(1, a * a * b - self.measurement))
        }
        fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
            self.measurement = tokens.next_f64()?;
            Ok(())
        }
        fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
            write!(out, "{}", self.measurement)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn test_numeric_jacobian_matches_analytic() -> TestResult {
        let edge = ProductEdge {
            measurement: 1.0,
            information: DMatrix::identity(1, 1),
        };
        let a = ScalarVertex { value: 1.5 };
        let b = ScalarVertex { value: -2.0 };
        let vertices: Vec<&dyn Vertex> = vec![&a, &b];

        let mut workspace = JacobianWorkspace::new();
        workspace.update_size_for_edge(1, &[1, 1]);
        workspace.allocate();
        edge.linearize_oplus(&vertices, &[false, false], &mut workspace)?;

        let d_a = workspace.jacobian(0, 1, 1)?[(0, 0)];
        let d_b = workspace.jacobian(1, 1, 1)?[(0, 0)];
        assert!((d_a - 2.0 * 1.5 * -2.0).abs() < 1e-5);
        assert!((d_b - 1.5 * 1.5).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_fixed_vertices_are_skipped() -> TestResult {
        let edge = ProductEdge {
            measurement: 0.0,
            information: DMatrix::identity(1, 1),
        };
        let a = ScalarVertex { value: 1.0 };
        let b = ScalarVertex { value: 1.0 };
        let vertices: Vec<&dyn Vertex> = vec![&a, &b];

        let mut workspace = JacobianWorkspace::new();
        workspace.update_size_for_edge(1, &[1, 1]);
        workspace.allocate();
        edge.linearize_oplus(&vertices, &[true, false], &mut workspace)?;
        assert_eq!(workspace.jacobian(0, 1, 1)?[(0, 0)], 0.0);
        assert!(workspace.jacobian(1, 1, 1)?[(0, 0)] > 0.9);
        Ok(())
    }

    #[test]
    fn test_graph_edge_chi2_with_kernel() -> TestResult {
        let edge = ProductEdge {
            measurement: 0.0,
            information: DMatrix::from_element(1, 1, 4.0),
        };
        let mut graph_edge = GraphEdge::new(vec![0, 1], edge)
            .with_level(2)
            .with_robust_kernel(HuberKernel::new(1.0)?);
        graph_edge.set_error(DVector::from_element(1, 2.0))?;

        assert_eq!(graph_edge.level(), 2);
        assert_eq!(graph_edge.chi2(), 16.0);
        // Huber(16) with δ = 1: 2·4·1 - 1
        assert_eq!(graph_edge.robust_chi2(), 7.0);
        assert!(graph_edge.set_error(DVector::zeros(2)).is_err());
        assert!(graph_edge.edge_as::<ProductEdge>().is_some());
        Ok(())
    }
}
