//! Euclidean vectors with additive updates.

use crate::core::vertex::check_estimate_len;
use crate::core::{
    Arity, CoreError, CoreResult, Edge, JacobianWorkspace, TokenReader, Vertex,
};
use crate::types::{check_information, read_information, write_information, write_values};
use nalgebra::{DMatrix, DVector, SVector};
use std::any::Any;
use std::fmt;

pub const VERTEX_VEC2_TAG: &str = "VERTEX_VEC2";
pub const VERTEX_VEC3_TAG: &str = "VERTEX_VEC3";
pub const VERTEX_VECX_TAG: &str = "VERTEX_VECX";
pub const EDGE_VEC_PRIOR_TAG: &str = "EDGE_PRIOR_VEC";
pub const EDGE_VEC_DIFF_TAG: &str = "EDGE_DIFF_VEC";
pub const EDGE_VEC_SUM_TAG: &str = "EDGE_SUM_VEC";

/// Vector of compile-time dimension `D`.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorVertex<const D: usize> {
    value: SVector<f64, D>,
}

impl<const D: usize> VectorVertex<D> {
    pub fn new(value: SVector<f64, D>) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &SVector<f64, D> {
        &self.value
    }
}

impl<const D: usize> Default for VectorVertex<D> {
    fn default() -> Self {
        Self::new(SVector::zeros())
    }
}

impl<const D: usize> Vertex for VectorVertex<D> {
    fn dimension(&self) -> usize {
        D
    }

    fn oplus(&mut self, delta: &[f64]) {
        for (v, d) in self.value.iter_mut().zip(delta) {
            *v += d;
        }
    }

    fn set_to_origin(&mut self) {
        self.value = SVector::zeros();
    }

    fn estimate(&self) -> DVector<f64> {
        DVector::from_column_slice(self.value.as_slice())
    }

    fn set_estimate(&mut self, estimate: &DVector<f64>) -> CoreResult<()> {
        check_estimate_len(estimate, D)?;
        self.value.copy_from_slice(estimate.as_slice());
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        let values = tokens.next_f64_vec(D)?;
        self.value.copy_from_slice(&values);
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_values(out, self.value.iter())
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

/// Vector whose dimension is chosen at runtime. Written as `dimension values…`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicVectorVertex {
    value: DVector<f64>,
}

impl DynamicVectorVertex {
    pub fn new(value: DVector<f64>) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &DVector<f64> {
        &self.value
    }
}

impl Vertex for DynamicVectorVertex {
    fn dimension(&self) -> usize {
        self.value.len()
    }

    fn oplus(&mut self, delta: &[f64]) {
        for (v, d) in self.value.iter_mut().zip(delta) {
            *v += d;
        }
    }

    fn set_to_origin(&mut self) {
        self.value.fill(0.0);
    }

    fn estimate(&self) -> DVector<f64> {
        self.value.clone()
    }

    fn set_estimate(&mut self, estimate: &DVector<f64>) -> CoreResult<()> {
        check_estimate_len(estimate, self.value.len())?;
        self.value.copy_from(estimate);
        Ok(())
    }

    /// Resizing keeps the leading values and zero-fills new ones.
    fn set_dimension(&mut self, dimension: usize) -> CoreResult<()> {
        let old = std::mem::replace(&mut self.value, DVector::zeros(0));
        self.value = old.resize_vertically(dimension, 0.0);
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        let dimension = tokens.next_usize()?;
        self.value = DVector::from_vec(tokens.next_f64_vec(dimension)?);
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", self.value.len())?;
        if !self.value.is_empty() {
            out.write_char(' ')?;
        }
        write_values(out, self.value.iter())
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

fn read_measurement(tokens: &mut TokenReader<'_>) -> CoreResult<(DVector<f64>, DMatrix<f64>)> {
    let dimension = tokens.next_usize()?;
    let measurement = DVector::from_vec(tokens.next_f64_vec(dimension)?);
    let information = read_information(tokens, dimension)?;
    Ok((measurement, information))
}

fn write_measurement(
    out: &mut dyn fmt::Write,
    measurement: &DVector<f64>,
    information: &DMatrix<f64>,
) -> fmt::Result {
    write!(out, "{}", measurement.len())?;
    for value in measurement.iter() {
        write!(out, " {}", value)?;
    }
    write_information(out, information)
}

/// Sum of the estimates of `vertices`, each checked against `dimension`.
fn sum_estimates(vertices: &[&dyn Vertex], dimension: usize) -> CoreResult<DVector<f64>> {
    let mut sum = DVector::zeros(dimension);
    for vertex in vertices {
        let estimate = vertex.estimate();
        check_estimate_len(&estimate, dimension)?;
        sum += estimate;
    }
    Ok(sum)
}

/// Absolute prior `error = v − measurement` on one vector vertex.
#[derive(Debug, Clone)]
pub struct EdgeVectorPrior {
    measurement: DVector<f64>,
    information: DMatrix<f64>,
}

impl EdgeVectorPrior {
    pub fn new(measurement: DVector<f64>, information: DMatrix<f64>) -> CoreResult<Self> {
        check_information(&information, measurement.len())?;
        Ok(Self {
            measurement,
            information,
        })
    }

    pub fn measurement(&self) -> &DVector<f64> {
        &self.measurement
    }
}

impl Default for EdgeVectorPrior {
    fn default() -> Self {
        Self {
            measurement: DVector::zeros(0),
            information: DMatrix::zeros(0, 0),
        }
    }
}

impl Edge for EdgeVectorPrior {
    fn dimension(&self) -> usize {
        self.measurement.len()
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn expected_vertex_dimension(&self, _index: usize) -> Option<usize> {
        Some(self.measurement.len())
    }

    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
        Ok(sum_estimates(vertices, self.measurement.len())? - &self.measurement)
    }

    fn linearize_oplus(
        &self,
        _vertices: &[&dyn Vertex],
        fixed: &[bool],
        workspace: &mut JacobianWorkspace,
    ) -> CoreResult<()> {
        if !fixed.first().copied().unwrap_or(false) {
            let n = self.measurement.len();
            workspace.jacobian_mut(0, n, n)?.fill_with_identity();
        }
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        (self.measurement, self.information) = read_measurement(tokens)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_measurement(out, &self.measurement, &self.information)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Relative constraint `error = v1 − v0 − measurement`.
#[derive(Debug, Clone)]
pub struct EdgeVectorDifference {
    measurement: DVector<f64>,
    information: DMatrix<f64>,
}

impl EdgeVectorDifference {
    pub fn new(measurement: DVector<f64>, information: DMatrix<f64>) -> CoreResult<Self> {
        check_information(&information, measurement.len())?;
        Ok(Self {
            measurement,
            information,
        })
    }

    pub fn measurement(&self) -> &DVector<f64> {
        &self.measurement
    }
}

impl Default for EdgeVectorDifference {
    fn default() -> Self {
        Self {
            measurement: DVector::zeros(0),
            information: DMatrix::zeros(0, 0),
        }
    }
}

impl Edge for EdgeVectorDifference {
    fn dimension(&self) -> usize {
        self.measurement.len()
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn expected_vertex_dimension(&self, _index: usize) -> Option<usize> {
        Some(self.measurement.len())
    }

    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
        let [from, to] = vertices else {
            return Err(CoreError::InvalidEdge(format!(
                "difference edge needs 2 vertices, got {}",
                vertices.len()
            )));
        };
        let n = self.measurement.len();
        let to = to.estimate();
        let from = from.estimate();
        check_estimate_len(&to, n)?;
        check_estimate_len(&from, n)?;
        Ok(to - from - &self.measurement)
    }

    fn linearize_oplus(
        &self,
        _vertices: &[&dyn Vertex],
        fixed: &[bool],
        workspace: &mut JacobianWorkspace,
    ) -> CoreResult<()> {
        let n = self.measurement.len();
        for (slot, sign) in [(0, -1.0), (1, 1.0)] {
            if fixed.get(slot).copied().unwrap_or(false) {
                continue;
            }
            let mut jacobian = workspace.jacobian_mut(slot, n, n)?;
            jacobian.fill(0.0);
            jacobian.fill_diagonal(sign);
        }
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        (self.measurement, self.information) = read_measurement(tokens)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_measurement(out, &self.measurement, &self.information)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Variable-arity constraint `error = Σ v_i − measurement`. Linearized numerically.
#[derive(Debug, Clone)]
pub struct EdgeVectorSum {
    num_vertices: usize,
    measurement: DVector<f64>,
    information: DMatrix<f64>,
}

impl EdgeVectorSum {
    pub fn new(measurement: DVector<f64>, information: DMatrix<f64>) -> CoreResult<Self> {
        check_information(&information, measurement.len())?;
        Ok(Self {
            num_vertices: 0,
            measurement,
            information,
        })
    }

    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }
}

impl Default for EdgeVectorSum {
    fn default() -> Self {
        Self {
            num_vertices: 0,
            measurement: DVector::zeros(0),
            information: DMatrix::zeros(0, 0),
        }
    }
}

impl Edge for EdgeVectorSum {
    fn dimension(&self) -> usize {
        self.measurement.len()
    }

    fn arity(&self) -> Arity {
        Arity::Variable
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn expected_vertex_dimension(&self, _index: usize) -> Option<usize> {
        Some(self.measurement.len())
    }

    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
        if vertices.len() != self.num_vertices {
            return Err(CoreError::InvalidEdge(format!(
                "sum edge sized for {} vertices, got {}",
                self.num_vertices,
                vertices.len()
            )));
        }
        Ok(sum_estimates(vertices, self.measurement.len())? - &self.measurement)
    }

    fn set_num_vertices(&mut self, num_vertices: usize) -> CoreResult<()> {
        if num_vertices == 0 {
            return Err(CoreError::InvalidEdge(
                "sum edge needs at least one vertex".to_string(),
            ));
        }
        self.num_vertices = num_vertices;
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        (self.measurement, self.information) = read_measurement(tokens)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_measurement(out, &self.measurement, &self.information)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
