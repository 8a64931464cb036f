//! Active subsets of the graph.
//!
//! An optimization run works on a subset of the graph: the edges selected by level,
//! by an explicit vertex set or by an explicit edge set, and the vertices they touch.
//! The subset also fixes the layout of the linear system: every non-fixed active
//! vertex gets a Hessian index, free vertices first and marginalized ones after them,
//! each ordered by id.

use crate::core::{
    CoreError, CoreResult, EdgeId, GraphEdge, OptimizableGraph, VertexId, VertexState,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Which part of the graph to optimize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every edge of the given level and the vertices it touches
    Level(usize),
    /// Edges of the given level whose vertices all belong to the set
    Vertices {
        ids: BTreeSet<VertexId>,
        level: usize,
    },
    /// Exactly these edges. Levels are not consulted.
    Edges(BTreeSet<EdgeId>),
}

impl Default for Selection {
    fn default() -> Self {
        Selection::Level(0)
    }
}

/// A vertex that owns a block of the linear system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedVertex {
    pub id: VertexId,
    pub dimension: usize,
    /// First row of the vertex's block in the full system
    pub offset: usize,
    pub marginalized: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActiveSubset {
    vertices: Vec<VertexId>,
    edges: Vec<EdgeId>,
    indexed: Vec<IndexedVertex>,
    hessian_index: BTreeMap<VertexId, usize>,
    num_free_blocks: usize,
}

impl ActiveSubset {
    /// Select the active edges and vertices and build the Hessian index mapping.
    pub fn build(graph: &OptimizableGraph, selection: &Selection) -> CoreResult<Self> {
        let mut edges = BTreeSet::new();
        for (edge_id, edge) in graph.edges() {
            let selected = match selection {
                Selection::Level(level) => edge.level() == *level,
                Selection::Vertices { ids, level } => {
                    edge.level() == *level && edge.vertex_ids().iter().all(|id| ids.contains(id))
                }
                Selection::Edges(ids) => ids.contains(&edge_id),
            };
            if selected && !all_vertices_fixed(graph, edge) {
                edges.insert(edge_id);
            }
        }
        if let Selection::Edges(ids) = selection
            && let Some(missing) = ids.iter().find(|id| graph.edge(**id).is_none())
        {
            return Err(CoreError::EdgeNotFound { id: *missing }.log());
        }
        if let Selection::Vertices { ids, .. } = selection
            && let Some(missing) = ids.iter().find(|id| !graph.contains_vertex(**id))
        {
            return Err(CoreError::VertexNotFound { id: *missing }.log());
        }

        let mut vertices = BTreeSet::new();
        for edge_id in &edges {
            if let Some(edge) = graph.edge(*edge_id) {
                vertices.extend(edge.vertex_ids().iter().copied());
            }
        }

        let mut subset = ActiveSubset {
            vertices: vertices.into_iter().collect(),
            edges: edges.into_iter().collect(),
            ..Default::default()
        };
        subset.build_index_mapping(graph)?;
        debug!(
            "Active subset: {} vertices, {} edges, {} free and {} marginalized blocks",
            subset.vertices.len(),
            subset.edges.len(),
            subset.num_free_blocks,
            subset.indexed.len() - subset.num_free_blocks
        );
        Ok(subset)
    }

    fn build_index_mapping(&mut self, graph: &OptimizableGraph) -> CoreResult<()> {
        let mut free = Vec::new();
        let mut marginalized = Vec::new();
        for id in &self.vertices {
            let dimension = graph
                .vertex(*id)
                .ok_or_else(|| CoreError::VertexNotFound { id: *id }.log())?
                .dimension();
            match graph.vertex_state(*id) {
                Some(VertexState::Free) => free.push((*id, dimension)),
                Some(VertexState::Marginalized) => marginalized.push((*id, dimension)),
                _ => {}
            }
        }

        self.num_free_blocks = free.len();
        let mut offset = 0;
        for (index, (id, dimension)) in free.iter().chain(marginalized.iter()).enumerate() {
            self.indexed.push(IndexedVertex {
                id: *id,
                dimension: *dimension,
                offset,
                marginalized: index >= self.num_free_blocks,
            });
            self.hessian_index.insert(*id, index);
            offset += dimension;
        }

        // Marginalized blocks must stay block-diagonal for the elimination.
        for edge_id in &self.edges {
            if let Some(edge) = graph.edge(*edge_id) {
                let count = edge
                    .vertex_ids()
                    .iter()
                    .filter(|id| graph.vertex_state(**id) == Some(VertexState::Marginalized))
                    .count();
                if count > 1 {
                    return Err(CoreError::InvalidEdge(format!(
                        "edge {} connects {} marginalized vertices {:?}",
                        edge_id,
                        count,
                        edge.vertex_ids()
                    ))
                    .log());
                }
            }
        }
        Ok(())
    }

    /// Active vertex ids, sorted.
    pub fn vertices(&self) -> &[VertexId] {
        &self.vertices
    }

    /// Active edge ids, sorted.
    pub fn edges(&self) -> &[EdgeId] {
        &self.edges
    }

    /// Vertices owning a block of the linear system, in Hessian order.
    pub fn indexed_vertices(&self) -> &[IndexedVertex] {
        &self.indexed
    }

    pub fn indexed_ids(&self) -> Vec<VertexId> {
        self.indexed.iter().map(|v| v.id).collect()
    }

    pub fn hessian_index(&self, id: VertexId) -> Option<usize> {
        self.hessian_index.get(&id).copied()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.num_free_blocks
    }

    pub fn num_marginalized_blocks(&self) -> usize {
        self.indexed.len() - self.num_free_blocks
    }

    pub fn has_marginalized(&self) -> bool {
        self.num_marginalized_blocks() > 0
    }

    /// Total size of the linear system.
    pub fn dimension(&self) -> usize {
        self.indexed
            .last()
            .map(|v| v.offset + v.dimension)
            .unwrap_or(0)
    }

    /// Size of the free (non-marginalized) part of the system.
    pub fn free_dimension(&self) -> usize {
        self.indexed
            .get(self.num_free_blocks)
            .map(|v| v.offset)
            .unwrap_or_else(|| self.dimension())
    }

    /// Cumulative block end offsets, the block layout of the Hessian.
    pub fn block_indices(&self) -> Vec<usize> {
        self.indexed.iter().map(|v| v.offset + v.dimension).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// True when nothing pins the solution down: no active vertex of maximum
    /// dimension is fixed or carries a unary edge of that full dimension.
    pub fn gauge_freedom(&self, graph: &OptimizableGraph) -> bool {
        let Some(max_dimension) = self.max_vertex_dimension(graph) else {
            return false;
        };
        for id in &self.vertices {
            let Some(vertex) = graph.vertex(*id) else {
                continue;
            };
            if vertex.dimension() != max_dimension {
                continue;
            }
            if graph.is_fixed(*id) || self.has_full_prior(graph, *id, max_dimension) {
                return false;
            }
        }
        true
    }

    /// Lowest-id active vertex of maximum dimension, the one to fix against gauge freedom.
    pub fn find_gauge(&self, graph: &OptimizableGraph) -> Option<VertexId> {
        let max_dimension = self.max_vertex_dimension(graph)?;
        self.vertices
            .iter()
            .copied()
            .find(|id| graph.vertex(*id).map(|v| v.dimension()) == Some(max_dimension))
    }

    /// Active vertices not reachable through active edges from any anchor.
    ///
    /// Anchors are fixed vertices and vertices carrying a unary edge over their full
    /// dimension. Without any anchor the check is skipped and nothing is reported;
    /// that case is gauge freedom.
    pub fn unreachable_vertices(&self, graph: &OptimizableGraph) -> Vec<VertexId> {
        let active_edges: BTreeSet<EdgeId> = self.edges.iter().copied().collect();
        let mut visited: BTreeSet<VertexId> = BTreeSet::new();
        let mut queue = VecDeque::new();
        for id in &self.vertices {
            let dimension = graph.vertex(*id).map(|v| v.dimension()).unwrap_or(0);
            if graph.is_fixed(*id) || self.has_full_prior(graph, *id, dimension) {
                visited.insert(*id);
                queue.push_back(*id);
            }
        }
        if queue.is_empty() {
            return Vec::new();
        }

        while let Some(id) = queue.pop_front() {
            for edge_id in graph.vertex_edges(id) {
                if !active_edges.contains(&edge_id) {
                    continue;
                }
                let Some(edge) = graph.edge(edge_id) else {
                    continue;
                };
                for next in edge.vertex_ids() {
                    if visited.insert(*next) {
                        queue.push_back(*next);
                    }
                }
            }
        }

        self.vertices
            .iter()
            .copied()
            .filter(|id| !visited.contains(id))
            .collect()
    }

    fn max_vertex_dimension(&self, graph: &OptimizableGraph) -> Option<usize> {
        self.vertices
            .iter()
            .filter_map(|id| graph.vertex(*id).map(|v| v.dimension()))
            .max()
    }

    fn has_full_prior(&self, graph: &OptimizableGraph, id: VertexId, dimension: usize) -> bool {
        graph.vertex_edges(id).any(|edge_id| {
            self.edges.binary_search(&edge_id).is_ok()
                && graph
                    .edge(edge_id)
                    .is_some_and(|edge| edge.vertex_ids().len() == 1 && edge.dimension() == dimension)
        })
    }
}

fn all_vertices_fixed(graph: &OptimizableGraph, edge: &GraphEdge) -> bool {
    edge.vertex_ids().iter().all(|id| graph.is_fixed(*id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::euclidean::{EdgeVectorDifference, EdgeVectorPrior, VectorVertex};
    use nalgebra::{DMatrix, DVector, Vector2, Vector3};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn difference(ids: [VertexId; 2], dimension: usize) -> CoreResult<GraphEdge> {
        Ok(GraphEdge::new(
            ids.to_vec(),
            EdgeVectorDifference::new(DVector::zeros(dimension), DMatrix::identity(dimension, dimension))?,
        ))
    }

    /// Two disjoint chains: 0-1-2 and 10-11.
    fn two_clusters() -> CoreResult<OptimizableGraph> {
        let mut graph = OptimizableGraph::new();
        for id in [0, 1, 2, 10, 11] {
            graph.add_vertex(id, VectorVertex::<2>::new(Vector2::new(id as f64, 0.0)))?;
        }
        graph.add_edge(difference([0, 1], 2)?)?;
        graph.add_edge(difference([1, 2], 2)?)?;
        graph.add_edge(difference([10, 11], 2)?)?;
        Ok(graph)
    }

    #[test]
    fn test_gauge_freedom_cleared_by_fixing() -> TestResult {
        let mut graph = two_clusters()?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert!(subset.gauge_freedom(&graph));
        assert_eq!(subset.find_gauge(&graph), Some(0));

        graph.set_fixed(0, true)?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert!(!subset.gauge_freedom(&graph));
        Ok(())
    }

    #[test]
    fn test_full_prior_clears_gauge_freedom() -> TestResult {
        let mut graph = two_clusters()?;
        graph.add_edge(GraphEdge::new(
            vec![11],
            EdgeVectorPrior::new(DVector::zeros(2), DMatrix::identity(2, 2))?,
        ))?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert!(!subset.gauge_freedom(&graph));
        Ok(())
    }

    #[test]
    fn test_gauge_ignores_lower_dimensional_anchors() -> TestResult {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VectorVertex::<3>::new(Vector3::zeros()))?;
        graph.add_vertex(1, VectorVertex::<2>::new(Vector2::zeros()))?;
        graph.add_vertex(2, VectorVertex::<3>::new(Vector3::zeros()))?;
        graph.add_edge(difference([0, 2], 3)?)?;
        graph.set_fixed(1, true)?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert!(subset.gauge_freedom(&graph));
        assert_eq!(subset.find_gauge(&graph), Some(0));
        Ok(())
    }

    #[test]
    fn test_disjoint_cluster_is_unreachable() -> TestResult {
        let mut graph = two_clusters()?;
        graph.set_fixed(0, true)?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert_eq!(subset.unreachable_vertices(&graph), vec![10, 11]);

        graph.add_edge(difference([2, 10], 2)?)?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert!(subset.unreachable_vertices(&graph).is_empty());
        Ok(())
    }

    #[test]
    fn test_index_mapping_orders_free_before_marginalized() -> TestResult {
        let mut graph = OptimizableGraph::new();
        graph.add_vertex(0, VectorVertex::<3>::new(Vector3::zeros()))?;
        graph.add_vertex(1, VectorVertex::<2>::new(Vector2::zeros()))?;
        graph.add_vertex(2, VectorVertex::<3>::new(Vector3::zeros()))?;
        graph.add_vertex(3, VectorVertex::<3>::new(Vector3::zeros()))?;
        graph.add_edge(difference([0, 2], 3)?)?;
        graph.add_edge(difference([2, 3], 3)?)?;
        graph.add_edge(GraphEdge::new(
            vec![1],
            EdgeVectorPrior::new(DVector::zeros(2), DMatrix::identity(2, 2))?,
        ))?;
        graph.set_marginalized(1, true)?;
        graph.set_fixed(3, true)?;

        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert_eq!(subset.vertices(), &[0, 1, 2, 3]);
        assert_eq!(subset.indexed_ids(), vec![0, 2, 1]);
        assert_eq!(subset.hessian_index(3), None);
        assert_eq!(subset.block_indices(), vec![3, 6, 8]);
        assert_eq!(subset.free_dimension(), 6);
        assert_eq!(subset.dimension(), 8);
        assert!(subset.has_marginalized());
        Ok(())
    }

    #[test]
    fn test_marginalized_pair_rejected() -> TestResult {
        let mut graph = two_clusters()?;
        graph.set_marginalized(10, true)?;
        graph.set_marginalized(11, true)?;
        assert!(matches!(
            ActiveSubset::build(&graph, &Selection::default()),
            Err(CoreError::InvalidEdge(_))
        ));
        Ok(())
    }

    #[test]
    fn test_selection_modes() -> TestResult {
        let mut graph = two_clusters()?;
        let coarse = graph.add_edge(difference([0, 2], 2)?.with_level(1))?;

        let level_one = ActiveSubset::build(&graph, &Selection::Level(1))?;
        assert_eq!(level_one.edges(), &[coarse]);
        assert_eq!(level_one.vertices(), &[0, 2]);

        let by_vertices = ActiveSubset::build(
            &graph,
            &Selection::Vertices {
                ids: [0, 1, 10].into_iter().collect(),
                level: 0,
            },
        )?;
        assert_eq!(by_vertices.edges().len(), 1);
        assert_eq!(by_vertices.vertices(), &[0, 1]);

        // An explicit edge set wins over level tags.
        let by_edges = ActiveSubset::build(&graph, &Selection::Edges([coarse, 2].into_iter().collect()))?;
        assert_eq!(by_edges.edges(), &[2, coarse]);
        assert_eq!(by_edges.vertices(), &[0, 2, 10, 11]);

        assert!(matches!(
            ActiveSubset::build(&graph, &Selection::Edges([99].into_iter().collect())),
            Err(CoreError::EdgeNotFound { id: 99 })
        ));
        Ok(())
    }

    #[test]
    fn test_edges_between_fixed_vertices_are_inactive() -> TestResult {
        let mut graph = two_clusters()?;
        graph.set_fixed(10, true)?;
        graph.set_fixed(11, true)?;
        let subset = ActiveSubset::build(&graph, &Selection::default())?;
        assert_eq!(subset.edges().len(), 2);
        assert!(!subset.vertices().contains(&10));
        Ok(())
    }
}
