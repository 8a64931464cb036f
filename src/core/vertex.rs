//! Vertex contract.
//!
//! A vertex is one optimization variable: an estimate living on a manifold together
//! with the `oplus` operator that applies a tangent-space increment to it. Concrete
//! vertex types live in type libraries (see [`crate::types`]); the optimizer only
//! talks to them through this trait.

use crate::core::{CoreError, CoreResult, TokenReader};
use nalgebra::DVector;
use std::any::Any;
use std::fmt;

/// An optimization variable.
///
/// The graph keeps vertices as `Box<dyn Vertex>`, so the trait stays object safe.
/// `estimate`/`set_estimate` expose a flat parameter vector, which is what the graph
/// uses for its backup stack; it does not have to match the tangent dimension
/// (an SE2 pose could store a rotation matrix, for instance).
pub trait Vertex: Send + Sync + fmt::Debug {
    /// Dimension of the tangent space (number of columns of its Jacobian blocks).
    fn dimension(&self) -> usize;

    /// Apply the increment `delta` (length `dimension()`) to the estimate.
    fn oplus(&mut self, delta: &[f64]);

    /// Reset the estimate to the origin of its manifold.
    fn set_to_origin(&mut self);

    /// Flat copy of the current estimate.
    fn estimate(&self) -> DVector<f64>;

    /// Replace the estimate from its flat representation.
    fn set_estimate(&mut self, estimate: &DVector<f64>) -> CoreResult<()>;

    /// Change the dimension of a vertex whose size is only known at runtime.
    fn set_dimension(&mut self, dimension: usize) -> CoreResult<()> {
        Err(CoreError::InvalidInput(format!(
            "vertex of dimension {} cannot be resized to {}",
            self.dimension(),
            dimension
        )))
    }

    /// Parse the estimate from the fields following the id on a graph file line.
    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()>;

    /// Write the estimate in the format accepted by [`Vertex::read`].
    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result;

    fn clone_box(&self) -> Box<dyn Vertex>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Clone for Box<dyn Vertex> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Check that a flat estimate has the expected length.
pub fn check_estimate_len(estimate: &DVector<f64>, expected: usize) -> CoreResult<()> {
    if estimate.len() != expected {
        return Err(CoreError::DimensionMismatch(format!(
            "estimate has {} values, expected {}",
            estimate.len(),
            expected
        )));
    }
    Ok(())
}

/// Downcast a vertex to its concrete type.
pub fn downcast_vertex<T: Vertex + 'static>(vertex: &dyn Vertex) -> CoreResult<&T> {
    vertex.as_any().downcast_ref::<T>().ok_or_else(|| {
        CoreError::TypeMismatch(format!(
            "expected vertex of type {}",
            std::any::type_name::<T>()
        ))
    })
}
