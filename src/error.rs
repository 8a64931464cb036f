//! Error types for the graph-optimizer library
//!
//! Every module reports failures through its own `thiserror` enum (`CoreError`,
//! `LinAlgError`, `OptimizerError`, `IoError`). Public entry points return the
//! top-level [`GraphOptimizerError`], which wraps the module errors transparently so
//! the original message and source chain survive.
//!
//! Example error chain:
//! ```text
//! GraphOptimizerError::Optimizer(
//!     OptimizerError::LinearSolveFailed(
//!         LinAlgError::SingularMatrix
//!     )
//! )
//! ```

#[cfg(feature = "io")]
use crate::io::IoError;
use crate::{core::CoreError, linalg::LinAlgError, optimizer::OptimizerError};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the graph-optimizer library
pub type GraphOptimizerResult<T> = Result<T, GraphOptimizerError>;

/// Top-level error type exposed by public APIs.
///
/// ```rust,ignore
/// if let Err(e) = optimizer.optimize(20) {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum GraphOptimizerError {
    /// Graph construction, vertex/edge and active-subset errors
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Optimization algorithm errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Graph file loading and saving errors
    #[cfg(feature = "io")]
    #[error(transparent)]
    Io(#[from] IoError),
}

impl GraphOptimizerError {
    /// Full error chain, one cause per line.
    ///
    /// ```rust,ignore
    /// // Output: "Linear system solve failed: ...
    /// //            → Singular matrix detected"
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_is_transparent() {
        let error = GraphOptimizerError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_error_chain_includes_source() {
        let optimizer_error = OptimizerError::LinearSolveFailed(LinAlgError::FactorizationFailed(
            "Cholesky factorization failed".to_string(),
        ));
        let error = GraphOptimizerError::from(optimizer_error);

        let chain = error.chain();
        assert!(chain.contains("Linear system solve failed"));
        assert!(chain.contains("Cholesky"));
        assert!(chain.contains('→'));
    }

    #[test]
    fn test_error_chain_compact() {
        let error = GraphOptimizerError::from(CoreError::VertexNotFound { id: 42 });

        let chain_compact = error.chain_compact();
        assert!(chain_compact.contains("42"));
        assert!(!chain_compact.contains('\n'));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let core_error = CoreError::DuplicateVertex { id: 3 };

        let error: GraphOptimizerError = core_error.into();
        match error {
            GraphOptimizerError::Core(CoreError::DuplicateVertex { id }) => assert_eq!(id, 3),
            _ => panic!("Expected Core variant"),
        }
    }
}
