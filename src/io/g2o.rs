//! g2o-style text format.
//!
//! ```text
//! # comment
//! VERTEX_SE2 0 0 0 0
//! VERTEX_SE2 1 1 0 0
//! FIX 0
//! EDGE_SE2 0 1 1 0 0 500 0 0 500 0 5000
//! EDGE_SUM_VEC 3 1 2 4 2 0.5 0.5 1 0 1
//! ```
//!
//! Vertex lines are `TAG id values…`, edge lines `TAG id… values…`. Edges of variable
//! arity carry their vertex count before the ids. The values are whatever the type's
//! `read`/`write` pair produces. Unknown tags are reported once and skipped.

use crate::core::{
    Arity, CoreError, GraphEdge, OptimizableGraph, TokenReader, TypeRegistry, VertexId,
};
use crate::io::{IoError, IoResult};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::Write;
use tracing::{debug, warn};

const FIX_TAG: &str = "FIX";

fn parse_error(line: usize, error: CoreError) -> IoError {
    IoError::Parse {
        line,
        message: error.to_string(),
    }
    .log()
}

/// Build a graph from g2o-style text.
pub fn parse_graph(content: &str, registry: &TypeRegistry) -> IoResult<OptimizableGraph> {
    let mut graph = OptimizableGraph::new();
    let mut fixed: Vec<(usize, VertexId)> = Vec::new();
    let mut unknown_tags: BTreeSet<&str> = BTreeSet::new();

    for (index, line) in content.lines().enumerate() {
        let line_number = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut tokens = TokenReader::new(trimmed);
        let tag = tokens
            .next_token()
            .map_err(|e| parse_error(line_number, e))?;

        if tag == FIX_TAG {
            for token in tokens.remaining() {
                let id = token.parse::<VertexId>().map_err(|e| {
                    IoError::Parse {
                        line: line_number,
                        message: format!("invalid vertex id '{}'", token),
                    }
                    .log_with_source(e)
                })?;
                fixed.push((line_number, id));
            }
        } else if registry.is_vertex_tag(tag) {
            let mut vertex = registry.create_vertex(tag)?;
            let id = tokens
                .next_usize()
                .map_err(|e| parse_error(line_number, e))?;
            vertex
                .read(&mut tokens)
                .map_err(|e| parse_error(line_number, e))?;
            graph.add_boxed_vertex(id, vertex)?;
        } else if registry.is_edge_tag(tag) {
            let mut edge = registry.create_edge(tag)?;
            let num_vertices = match edge.arity() {
                Arity::Fixed(n) => n,
                Arity::Variable => {
                    let n = tokens
                        .next_usize()
                        .map_err(|e| parse_error(line_number, e))?;
                    edge.set_num_vertices(n)
                        .map_err(|e| parse_error(line_number, e))?;
                    n
                }
            };
            let ids = (0..num_vertices)
                .map(|_| tokens.next_usize())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| parse_error(line_number, e))?;
            edge.read(&mut tokens)
                .map_err(|e| parse_error(line_number, e))?;
            graph.add_edge(GraphEdge::from_boxed(ids, edge))?;
        } else if unknown_tags.insert(tag) {
            warn!("Unknown tag '{}' at line {}, skipping", tag, line_number);
        }
    }

    for (line, id) in fixed {
        graph.set_fixed(id, true).map_err(|e| parse_error(line, e))?;
    }
    debug!(
        "Parsed graph: {} vertices, {} edges, {} unknown tags",
        graph.num_vertices(),
        graph.num_edges(),
        unknown_tags.len()
    );
    Ok(graph)
}

/// Write `graph` as g2o-style text.
pub fn write_graph<W: Write>(
    graph: &OptimizableGraph,
    registry: &TypeRegistry,
    out: &mut W,
) -> IoResult<()> {
    writeln!(out, "# Graph written by graph-optimizer")?;
    writeln!(
        out,
        "# Timestamp: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(
        out,
        "# Vertices: {}, edges: {}",
        graph.num_vertices(),
        graph.num_edges()
    )?;

    let mut line = String::new();
    for (id, vertex) in graph.vertices() {
        let tag = registry.vertex_tag(vertex).ok_or_else(|| {
            IoError::UnregisteredType(format!("vertex {} ({:?})", id, vertex)).log()
        })?;
        line.clear();
        write!(line, "{} {} ", tag, id).and_then(|_| vertex.write(&mut line)).map_err(|e| {
            IoError::UnregisteredType(format!("vertex {} could not be formatted", id))
                .log_with_source(e)
        })?;
        writeln!(out, "{}", line.trim_end())?;
    }

    for id in graph.vertex_ids().filter(|id| graph.is_fixed(*id)) {
        writeln!(out, "{} {}", FIX_TAG, id)?;
    }

    for (edge_id, edge) in graph.edges() {
        let tag = registry.edge_tag(edge.edge()).ok_or_else(|| {
            IoError::UnregisteredType(format!("edge {} ({:?})", edge_id, edge.edge())).log()
        })?;
        line.clear();
        let formatted = (|| {
            write!(line, "{}", tag)?;
            if edge.edge().arity() == Arity::Variable {
                write!(line, " {}", edge.vertex_ids().len())?;
            }
            for id in edge.vertex_ids() {
                write!(line, " {}", id)?;
            }
            line.push(' ');
            edge.edge().write(&mut line)
        })();
        formatted.map_err(|e| {
            IoError::UnregisteredType(format!("edge {} could not be formatted", edge_id))
                .log_with_source(e)
        })?;
        writeln!(out, "{}", line.trim_end())?;
    }
    Ok(())
}
