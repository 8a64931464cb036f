//! The owning hypergraph of vertices and edges.
//!
//! Vertices are kept in an id-ordered arena; edges get an [`EdgeId`] handle on
//! insertion and refer to their vertices by id. Removing a vertex removes every edge
//! touching it, so an edge never refers to a vertex outside the graph.

use crate::core::{
    Arity, CoreError, CoreResult, EdgeId, GraphEdge, JacobianWorkspace, Vertex, VertexId,
};
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Optimization state of a vertex. The states are mutually exclusive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum VertexState {
    #[default]
    Free,
    /// Held constant, excluded from the linear system
    Fixed,
    /// Eliminated through the Schur complement before solving
    Marginalized,
}

#[derive(Debug)]
struct VertexNode {
    vertex: Box<dyn Vertex>,
    state: VertexState,
    backup: Vec<DVector<f64>>,
    edges: BTreeSet<EdgeId>,
}

#[derive(Debug, Default)]
pub struct OptimizableGraph {
    vertices: BTreeMap<VertexId, VertexNode>,
    edges: BTreeMap<EdgeId, GraphEdge>,
    next_edge_id: EdgeId,
    jacobian_workspace: JacobianWorkspace,
}

impl OptimizableGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, id: VertexId, vertex: impl Vertex + 'static) -> CoreResult<()> {
        self.add_boxed_vertex(id, Box::new(vertex))
    }

    pub fn add_boxed_vertex(&mut self, id: VertexId, vertex: Box<dyn Vertex>) -> CoreResult<()> {
        if self.vertices.contains_key(&id) {
            return Err(CoreError::DuplicateVertex { id }.log());
        }
        self.vertices.insert(
            id,
            VertexNode {
                vertex,
                state: VertexState::Free,
                backup: Vec::new(),
                edges: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Remove a vertex and every edge connected to it.
    pub fn remove_vertex(&mut self, id: VertexId) -> CoreResult<Box<dyn Vertex>> {
        let node = self
            .vertices
            .remove(&id)
            .ok_or_else(|| CoreError::VertexNotFound { id }.log())?;
        for edge_id in &node.edges {
            if let Some(edge) = self.edges.remove(edge_id) {
                for other in edge.vertex_ids() {
                    if let Some(other_node) = self.vertices.get_mut(other) {
                        other_node.edges.remove(edge_id);
                    }
                }
            }
        }
        debug!("Removed vertex {} and {} incident edges", id, node.edges.len());
        Ok(node.vertex)
    }

    pub fn contains_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains_key(&id)
    }

    pub fn vertex(&self, id: VertexId) -> Option<&dyn Vertex> {
        self.vertices.get(&id).map(|node| node.vertex.as_ref())
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut dyn Vertex> {
        match self.vertices.get_mut(&id) {
            Some(node) => Some(node.vertex.as_mut()),
            None => None,
        }
    }

    /// Downcast a vertex to its concrete type.
    pub fn vertex_as<T: Vertex + 'static>(&self, id: VertexId) -> Option<&T> {
        self.vertices
            .get(&id)
            .and_then(|node| node.vertex.as_any().downcast_ref::<T>())
    }

    pub fn vertex_as_mut<T: Vertex + 'static>(&mut self, id: VertexId) -> Option<&mut T> {
        self.vertices
            .get_mut(&id)
            .and_then(|node| node.vertex.as_any_mut().downcast_mut::<T>())
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices.keys().copied()
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &dyn Vertex)> + '_ {
        self.vertices
            .iter()
            .map(|(id, node)| (*id, node.vertex.as_ref()))
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex_state(&self, id: VertexId) -> Option<VertexState> {
        self.vertices.get(&id).map(|node| node.state)
    }

    pub fn set_vertex_state(&mut self, id: VertexId, state: VertexState) -> CoreResult<()> {
        let node = self
            .vertices
            .get_mut(&id)
            .ok_or_else(|| CoreError::VertexNotFound { id }.log())?;
        node.state = state;
        Ok(())
    }

    /// Fix or release a vertex. Fixing a marginalized vertex makes it fixed.
    pub fn set_fixed(&mut self, id: VertexId, fixed: bool) -> CoreResult<()> {
        let current = self
            .vertex_state(id)
            .ok_or_else(|| CoreError::VertexNotFound { id }.log())?;
        match (fixed, current) {
            (true, _) => self.set_vertex_state(id, VertexState::Fixed),
            (false, VertexState::Fixed) => self.set_vertex_state(id, VertexState::Free),
            (false, _) => Ok(()),
        }
    }

    /// Mark a vertex for Schur elimination. A fixed vertex cannot be marginalized.
    pub fn set_marginalized(&mut self, id: VertexId, marginalized: bool) -> CoreResult<()> {
        let current = self
            .vertex_state(id)
            .ok_or_else(|| CoreError::VertexNotFound { id }.log())?;
        match (marginalized, current) {
            (true, VertexState::Fixed) => Err(CoreError::InvalidInput(format!(
                "vertex {} is fixed and cannot be marginalized",
                id
            ))
            .log()),
            (true, _) => self.set_vertex_state(id, VertexState::Marginalized),
            (false, VertexState::Marginalized) => self.set_vertex_state(id, VertexState::Free),
            (false, _) => Ok(()),
        }
    }

    pub fn is_fixed(&self, id: VertexId) -> bool {
        self.vertex_state(id) == Some(VertexState::Fixed)
    }

    /// Edges connected to a vertex.
    pub fn vertex_edges(&self, id: VertexId) -> impl Iterator<Item = EdgeId> + '_ {
        self.vertices
            .get(&id)
            .into_iter()
            .flat_map(|node| node.edges.iter().copied())
    }

    /// Insert an edge after validating its vertices, arity and information matrix.
    ///
    /// The information matrix must be finite and symmetric with a non-negative
    /// diagonal.
    pub fn add_edge(&mut self, mut edge: GraphEdge) -> CoreResult<EdgeId> {
        let ids = edge.vertex_ids().to_vec();
        if ids.is_empty() {
            return Err(CoreError::InvalidEdge("edge connects no vertices".to_string()).log());
        }
        match edge.edge().arity() {
            Arity::Fixed(n) if n != ids.len() => {
                return Err(CoreError::InvalidEdge(format!(
                    "edge expects {} vertices, got {}",
                    n,
                    ids.len()
                ))
                .log());
            }
            Arity::Variable => edge.edge_mut().set_num_vertices(ids.len())?,
            Arity::Fixed(_) => {}
        }
        let unique: BTreeSet<VertexId> = ids.iter().copied().collect();
        if unique.len() != ids.len() {
            return Err(
                CoreError::InvalidEdge(format!("edge repeats a vertex: {:?}", ids)).log(),
            );
        }

        let dimension = edge.dimension();
        let information = edge.edge().information();
        if information.nrows() != dimension || information.ncols() != dimension {
            return Err(CoreError::DimensionMismatch(format!(
                "information is {}x{}, edge dimension is {}",
                information.nrows(),
                information.ncols(),
                dimension
            ))
            .log());
        }
        validate_information(information)?;

        let mut vertex_dimensions = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            let vertex = self
                .vertex(*id)
                .ok_or_else(|| CoreError::VertexNotFound { id: *id }.log())?;
            if let Some(expected) = edge.edge().expected_vertex_dimension(index)
                && expected != vertex.dimension()
            {
                return Err(CoreError::DimensionMismatch(format!(
                    "edge slot {} expects dimension {}, vertex {} has {}",
                    index,
                    expected,
                    id,
                    vertex.dimension()
                ))
                .log());
            }
            vertex_dimensions.push(vertex.dimension());
        }

        let edge_id = self.next_edge_id;
        self.next_edge_id += 1;
        for id in &ids {
            if let Some(node) = self.vertices.get_mut(id) {
                node.edges.insert(edge_id);
            }
        }
        self.jacobian_workspace
            .update_size_for_edge(dimension, &vertex_dimensions);
        self.edges.insert(edge_id, edge);
        Ok(edge_id)
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> CoreResult<GraphEdge> {
        let edge = self
            .edges
            .remove(&id)
            .ok_or_else(|| CoreError::EdgeNotFound { id }.log())?;
        for vertex_id in edge.vertex_ids() {
            if let Some(node) = self.vertices.get_mut(vertex_id) {
                node.edges.remove(&id);
            }
        }
        Ok(edge)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&GraphEdge> {
        self.edges.get(&id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> Option<&mut GraphEdge> {
        self.edges.get_mut(&id)
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, &GraphEdge)> + '_ {
        self.edges.iter().map(|(id, edge)| (*id, edge))
    }

    pub fn edge_ids(&self) -> impl Iterator<Item = EdgeId> + '_ {
        self.edges.keys().copied()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Highest level tag carried by any edge.
    pub fn max_level(&self) -> usize {
        self.edges.values().map(GraphEdge::level).max().unwrap_or(0)
    }

    /// Vertices of an edge, in edge order.
    pub fn edge_vertices(&self, id: EdgeId) -> CoreResult<Vec<&dyn Vertex>> {
        let edge = self
            .edges
            .get(&id)
            .ok_or_else(|| CoreError::EdgeNotFound { id }.log())?;
        edge.vertex_ids()
            .iter()
            .map(|vertex_id| {
                self.vertex(*vertex_id)
                    .ok_or_else(|| CoreError::VertexNotFound { id: *vertex_id }.log())
            })
            .collect()
    }

    /// Evaluate an edge's error from the current estimates without caching it.
    pub fn evaluate_error(&self, id: EdgeId) -> CoreResult<DVector<f64>> {
        let vertices = self.edge_vertices(id)?;
        let edge = self
            .edges
            .get(&id)
            .ok_or_else(|| CoreError::EdgeNotFound { id }.log())?;
        let error = edge.edge().compute_error(&vertices)?;
        if error.len() != edge.dimension() {
            return Err(CoreError::DimensionMismatch(format!(
                "edge {} produced an error of length {}, dimension is {}",
                id,
                error.len(),
                edge.dimension()
            ))
            .log());
        }
        Ok(error)
    }

    /// Recompute and cache the error of one edge.
    pub fn compute_error(&mut self, id: EdgeId) -> CoreResult<()> {
        let error = self.evaluate_error(id)?;
        match self.edges.get_mut(&id) {
            Some(edge) => edge.set_error(error),
            None => Err(CoreError::EdgeNotFound { id }.log()),
        }
    }

    /// Recompute and cache the errors of all edges.
    pub fn compute_all_errors(&mut self) -> CoreResult<()> {
        let ids: Vec<EdgeId> = self.edges.keys().copied().collect();
        for id in ids {
            self.compute_error(id)?;
        }
        Ok(())
    }

    /// Sum of `eᵀΩe` over all edges, evaluated from the current estimates.
    pub fn chi2(&self) -> CoreResult<f64> {
        let mut chi2 = 0.0;
        for (id, edge) in &self.edges {
            let error = self.evaluate_error(*id)?;
            chi2 += crate::core::edge::squared_error(edge.edge().information(), &error);
        }
        Ok(chi2)
    }

    /// Save the estimate of every vertex on its backup stack.
    pub fn push_all(&mut self) {
        for node in self.vertices.values_mut() {
            node.backup.push(node.vertex.estimate());
        }
    }

    /// Restore every vertex from the top of its backup stack.
    pub fn pop_all(&mut self) -> CoreResult<()> {
        let ids: Vec<VertexId> = self.vertices.keys().copied().collect();
        self.pop(&ids)
    }

    pub fn discard_top_all(&mut self) {
        for node in self.vertices.values_mut() {
            node.backup.pop();
        }
    }

    pub fn push(&mut self, ids: &[VertexId]) -> CoreResult<()> {
        for id in ids {
            let node = self
                .vertices
                .get_mut(id)
                .ok_or_else(|| CoreError::VertexNotFound { id: *id }.log())?;
            node.backup.push(node.vertex.estimate());
        }
        Ok(())
    }

    pub fn pop(&mut self, ids: &[VertexId]) -> CoreResult<()> {
        for id in ids {
            let node = self
                .vertices
                .get_mut(id)
                .ok_or_else(|| CoreError::VertexNotFound { id: *id }.log())?;
            let estimate = node.backup.pop().ok_or_else(|| {
                CoreError::InvalidInput(format!("backup stack of vertex {} is empty", id)).log()
            })?;
            node.vertex.set_estimate(&estimate)?;
        }
        Ok(())
    }

    pub fn discard_top(&mut self, ids: &[VertexId]) -> CoreResult<()> {
        for id in ids {
            let node = self
                .vertices
                .get_mut(id)
                .ok_or_else(|| CoreError::VertexNotFound { id: *id }.log())?;
            node.backup.pop();
        }
        Ok(())
    }

    /// Depth of a vertex's backup stack.
    pub fn stack_size(&self, id: VertexId) -> Option<usize> {
        self.vertices.get(&id).map(|node| node.backup.len())
    }

    /// Remove all vertices and edges.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
        self.next_edge_id = 0;
        self.jacobian_workspace.reset();
    }

    pub fn jacobian_workspace(&self) -> &JacobianWorkspace {
        &self.jacobian_workspace
    }

    pub fn jacobian_workspace_mut(&mut self) -> &mut JacobianWorkspace {
        &mut self.jacobian_workspace
    }
}

/// Relative tolerance on `|Ωᵢⱼ − Ωⱼᵢ|` accepted as symmetric.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

fn validate_information(information: &DMatrix<f64>) -> CoreResult<()> {
    if information.iter().any(|v| !v.is_finite()) {
        return Err(
            CoreError::InvalidEdge("information matrix has non-finite entries".to_string()).log(),
        );
    }
    if let Some(i) = (0..information.nrows()).find(|&i| information[(i, i)] < 0.0) {
        return Err(CoreError::InvalidEdge(format!(
            "information matrix has negative diagonal entry {} at {}",
            information[(i, i)],
            i
        ))
        .log());
    }
    let scale = information.amax().max(1.0);
    for i in 0..information.nrows() {
        for j in (i + 1)..information.ncols() {
            if (information[(i, j)] - information[(j, i)]).abs() > SYMMETRY_TOLERANCE * scale {
                return Err(CoreError::InvalidEdge(format!(
                    "information matrix is not symmetric at ({}, {})",
                    i, j
                ))
                .log());
            }
        }
    }
    Ok(())
}
