//! Scratch memory for edge Jacobians.
//!
//! Edges write their per-vertex Jacobian blocks into a shared workspace instead of
//! owning matrices. The workspace is sized once for the largest edge of the active
//! subset and then reused for every linearization. Parallel linearization gives each
//! worker its own clone.

use crate::core::{CoreError, CoreResult, OptimizableGraph};
use nalgebra::{DMatrixView, DMatrixViewMut};

#[derive(Debug, Clone, Default)]
pub struct JacobianWorkspace {
    buffers: Vec<Vec<f64>>,
    max_num_vertices: usize,
    max_dimension: usize,
}

impl JacobianWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grow the requirements to hold `num_vertices` blocks of `dimension` scalars each.
    pub fn update_size(&mut self, num_vertices: usize, dimension: usize) {
        self.max_num_vertices = self.max_num_vertices.max(num_vertices);
        self.max_dimension = self.max_dimension.max(dimension);
    }

    /// Grow the requirements for an edge of `edge_dimension` rows over vertices of
    /// the given tangent dimensions.
    pub fn update_size_for_edge(&mut self, edge_dimension: usize, vertex_dimensions: &[usize]) {
        let widest = vertex_dimensions.iter().copied().max().unwrap_or(0);
        self.update_size(vertex_dimensions.len(), edge_dimension * widest);
    }

    /// Recompute the requirements from every edge of `graph`, forgetting edges that
    /// have been removed since.
    pub fn update_size_for_graph(&mut self, graph: &OptimizableGraph) {
        self.reset();
        for (_, edge) in graph.edges() {
            let dimensions: Vec<usize> = edge
                .vertex_ids()
                .iter()
                .filter_map(|id| graph.vertex(*id).map(|v| v.dimension()))
                .collect();
            self.update_size_for_edge(edge.dimension(), &dimensions);
        }
    }

    /// Drop all size requirements and buffers.
    pub fn reset(&mut self) {
        self.buffers.clear();
        self.max_num_vertices = 0;
        self.max_dimension = 0;
    }

    /// Allocate buffers for the recorded requirements. Returns false when nothing
    /// has been recorded yet.
    pub fn allocate(&mut self) -> bool {
        if self.max_num_vertices == 0 || self.max_dimension == 0 {
            return false;
        }
        self.buffers = vec![vec![0.0; self.max_dimension]; self.max_num_vertices];
        true
    }

    pub fn set_zero(&mut self) {
        for buffer in &mut self.buffers {
            buffer.fill(0.0);
        }
    }

    pub fn max_num_vertices(&self) -> usize {
        self.max_num_vertices
    }

    pub fn max_dimension(&self) -> usize {
        self.max_dimension
    }

    /// Mutable `rows x cols` view for the Jacobian block of vertex slot `index`.
    pub fn jacobian_mut(
        &mut self,
        index: usize,
        rows: usize,
        cols: usize,
    ) -> CoreResult<DMatrixViewMut<'_, f64>> {
        let len = rows * cols;
        let max_dimension = self.max_dimension;
        let slots = self.buffers.len();
        let buffer = self.buffers.get_mut(index).ok_or_else(|| {
            CoreError::Workspace(format!(
                "vertex slot {} requested, workspace holds {}",
                index, slots
            ))
        })?;
        if len > buffer.len() {
            return Err(CoreError::Workspace(format!(
                "block {}x{} exceeds workspace capacity {}",
                rows, cols, max_dimension
            )));
        }
        Ok(DMatrixViewMut::from_slice(&mut buffer[..len], rows, cols))
    }

    /// Read-only view of a block previously written by [`Self::jacobian_mut`].
    pub fn jacobian(&self, index: usize, rows: usize, cols: usize) -> CoreResult<DMatrixView<'_, f64>> {
        let len = rows * cols;
        let buffer = self.buffers.get(index).ok_or_else(|| {
            CoreError::Workspace(format!(
                "vertex slot {} requested, workspace holds {}",
                index,
                self.buffers.len()
            ))
        })?;
        if len > buffer.len() {
            return Err(CoreError::Workspace(format!(
                "block {}x{} exceeds workspace capacity {}",
                rows,
                cols,
                buffer.len()
            )));
        }
        Ok(DMatrixView::from_slice(&buffer[..len], rows, cols))
    }
}
