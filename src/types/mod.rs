//! Reference vertex and edge types.
//!
//! - [`euclidean`]: vectors with additive updates, both fixed size and runtime sized
//! - [`slam2d`]: planar poses, landmarks and the usual pose graph constraints
//!
//! [`register_types`] puts every type of this module into a [`TypeRegistry`] under
//! its graph file tag.

pub mod euclidean;
pub mod slam2d;

use crate::core::{CoreError, CoreResult, TokenReader, TypeRegistry};
use nalgebra::DMatrix;
use std::fmt;

/// Register every reference type under its tag.
pub fn register_types(registry: &mut TypeRegistry) -> CoreResult<()> {
    registry.register_vertex::<slam2d::VertexSE2>(slam2d::VERTEX_SE2_TAG)?;
    registry.register_vertex::<slam2d::VertexPointXY>(slam2d::VERTEX_XY_TAG)?;
    registry.register_edge::<slam2d::EdgeSE2>(slam2d::EDGE_SE2_TAG)?;
    registry.register_edge::<slam2d::EdgeSE2Prior>(slam2d::EDGE_SE2_PRIOR_TAG)?;
    registry.register_edge::<slam2d::EdgeSE2PointXY>(slam2d::EDGE_SE2_XY_TAG)?;

    registry.register_vertex::<euclidean::VectorVertex<2>>(euclidean::VERTEX_VEC2_TAG)?;
    registry.register_vertex::<euclidean::VectorVertex<3>>(euclidean::VERTEX_VEC3_TAG)?;
    registry.register_vertex::<euclidean::DynamicVectorVertex>(euclidean::VERTEX_VECX_TAG)?;
    registry.register_edge::<euclidean::EdgeVectorPrior>(euclidean::EDGE_VEC_PRIOR_TAG)?;
    registry.register_edge::<euclidean::EdgeVectorDifference>(euclidean::EDGE_VEC_DIFF_TAG)?;
    registry.register_edge::<euclidean::EdgeVectorSum>(euclidean::EDGE_VEC_SUM_TAG)?;
    Ok(())
}

/// Registry holding every reference type.
pub fn default_registry() -> CoreResult<TypeRegistry> {
    let mut registry = TypeRegistry::new();
    register_types(&mut registry)?;
    Ok(registry)
}

/// Read a symmetric information matrix stored as its row-major upper triangle.
pub(crate) fn read_information(
    tokens: &mut TokenReader<'_>,
    dimension: usize,
) -> CoreResult<DMatrix<f64>> {
    let mut information = DMatrix::zeros(dimension, dimension);
    for i in 0..dimension {
        for j in i..dimension {
            let value = tokens.next_f64()?;
            information[(i, j)] = value;
            information[(j, i)] = value;
        }
    }
    Ok(information)
}

/// Write the row-major upper triangle of an information matrix.
pub(crate) fn write_information(out: &mut dyn fmt::Write, information: &DMatrix<f64>) -> fmt::Result {
    for i in 0..information.nrows() {
        for j in i..information.ncols() {
            write!(out, " {}", information[(i, j)])?;
        }
    }
    Ok(())
}

/// Write values separated by single spaces.
pub(crate) fn write_values<'a>(
    out: &mut dyn fmt::Write,
    values: impl IntoIterator<Item = &'a f64>,
) -> fmt::Result {
    for (k, value) in values.into_iter().enumerate() {
        if k > 0 {
            out.write_char(' ')?;
        }
        write!(out, "{}", value)?;
    }
    Ok(())
}

/// Validate an information matrix against an error dimension.
pub(crate) fn check_information(information: &DMatrix<f64>, dimension: usize) -> CoreResult<()> {
    if information.nrows() != dimension || information.ncols() != dimension {
        return Err(CoreError::DimensionMismatch(format!(
            "information matrix is {}x{}, error dimension is {}",
            information.nrows(),
            information.ncols(),
            dimension
        )));
    }
    Ok(())
}
