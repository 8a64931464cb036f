//! Graph file persistence.
//!
//! Graphs are stored as line-oriented text in the g2o style (see [`g2o`]). Tags are
//! resolved through a [`TypeRegistry`] passed by the caller; there is no global
//! factory.

use crate::core::{CoreError, OptimizableGraph, TypeRegistry};
use std::{fs::File, io, path::Path};
use thiserror::Error;
use tracing::{error, info};

pub mod g2o;

pub use g2o::{parse_graph, write_graph};

/// Errors that can occur while loading or saving graph files
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A vertex or edge of the graph has no tag in the registry
    #[error("Type not registered: {0}")]
    UnregisteredType(String),

    /// The graph rejected a parsed vertex or edge
    #[error("Graph error: {0}")]
    Core(#[from] CoreError),
}

impl IoError {
    /// Log the error using tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with source error information using tracing::error and return self for chaining
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

pub type IoResult<T> = Result<T, IoError>;

/// Load a graph file, memory-mapping it for parsing.
pub fn load_graph<P: AsRef<Path>>(path: P, registry: &TypeRegistry) -> IoResult<OptimizableGraph> {
    let path_ref = path.as_ref();
    let file = File::open(path_ref).map_err(|e| {
        IoError::Io(e).log_with_source(format!("Failed to open graph file: {:?}", path_ref))
    })?;
    // Empty files cannot be mapped on every platform
    if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
        return Ok(OptimizableGraph::new());
    }
    // SAFETY: the mapping is read-only and dropped before this function returns
    let mmap = unsafe {
        memmap2::Mmap::map(&file).map_err(|e| {
            IoError::Io(e).log_with_source(format!("Failed to memory-map graph file: {:?}", path_ref))
        })?
    };
    let content = std::str::from_utf8(&mmap).map_err(|e| {
        IoError::Parse {
            line: 0,
            message: format!("Invalid UTF-8: {e}"),
        }
        .log()
    })?;

    let graph = parse_graph(content, registry)?;
    info!(
        "Loaded {:?}: {} vertices, {} edges",
        path_ref,
        graph.num_vertices(),
        graph.num_edges()
    );
    Ok(graph)
}

/// Save a graph file: vertices by id, then `FIX` lines, then edges.
pub fn save_graph<P: AsRef<Path>>(
    graph: &OptimizableGraph,
    path: P,
    registry: &TypeRegistry,
) -> IoResult<()> {
    let path_ref = path.as_ref();
    let file = File::create(path_ref).map_err(|e| {
        IoError::Io(e).log_with_source(format!("Failed to create graph file: {:?}", path_ref))
    })?;
    let mut writer = io::BufWriter::new(file);
    write_graph(graph, registry, &mut writer)?;
    io::Write::flush(&mut writer)
        .map_err(|e| IoError::Io(e).log_with_source(format!("Failed to flush {:?}", path_ref)))?;
    info!(
        "Saved {:?}: {} vertices, {} edges",
        path_ref,
        graph.num_vertices(),
        graph.num_edges()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::default_registry;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_file_round_trip() -> TestResult {
        let registry = default_registry()?;
        let text = "VERTEX_SE2 0 0 0 0\nVERTEX_SE2 1 1.1 0.1 0.05\nFIX 0\n\
                    EDGE_SE2 0 1 1 0 0 10 0 0 10 0 40\n";
        let graph = parse_graph(text, &registry)?;

        let path = std::env::temp_dir().join(format!("graph_io_round_trip_{}.g2o", std::process::id()));
        save_graph(&graph, &path, &registry)?;
        let loaded = load_graph(&path, &registry)?;
        std::fs::remove_file(&path)?;

        assert_eq!(loaded.num_vertices(), 2);
        assert_eq!(loaded.num_edges(), 1);
        assert!(loaded.is_fixed(0));
        assert!((loaded.chi2()? - graph.chi2()?).abs() < 1e-15);
        Ok(())
    }

    #[test]
    fn test_missing_file() -> TestResult {
        let registry = default_registry()?;
        let result = load_graph("/nonexistent/graph.g2o", &registry);
        assert!(matches!(result, Err(IoError::Io(_))));
        Ok(())
    }
}
