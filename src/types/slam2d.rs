//! Planar SLAM types: SE(2) poses, point landmarks and their constraints.
//!
//! Poses are updated additively in `(x, y, θ)` with the angle wrapped to `(−π, π]`;
//! all edges here provide analytic Jacobians for that parameterization.

use crate::core::vertex::{check_estimate_len, downcast_vertex};
use crate::core::{Arity, CoreError, CoreResult, Edge, JacobianWorkspace, TokenReader, Vertex};
use crate::types::{check_information, read_information, write_information, write_values};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Vector2, Vector3};
use std::any::Any;
use std::f64::consts::PI;
use std::fmt;

pub const VERTEX_SE2_TAG: &str = "VERTEX_SE2";
pub const VERTEX_XY_TAG: &str = "VERTEX_XY";
pub const EDGE_SE2_TAG: &str = "EDGE_SE2";
pub const EDGE_SE2_PRIOR_TAG: &str = "EDGE_PRIOR_SE2";
pub const EDGE_SE2_XY_TAG: &str = "EDGE_SE2_XY";

/// Wrap an angle to `(−π, π]`.
pub fn normalize_angle(theta: f64) -> f64 {
    let wrapped = theta.rem_euclid(2.0 * PI);
    if wrapped > PI { wrapped - 2.0 * PI } else { wrapped }
}

fn rotation(theta: f64) -> Matrix2<f64> {
    let (s, c) = theta.sin_cos();
    Matrix2::new(c, -s, s, c)
}

/// Rigid transform in the plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Se2 {
    translation: Vector2<f64>,
    theta: f64,
}

impl Default for Se2 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Se2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            translation: Vector2::new(x, y),
            theta: normalize_angle(theta),
        }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn from_vector(v: &Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.translation.x, self.translation.y, self.theta)
    }

    pub fn translation(&self) -> &Vector2<f64> {
        &self.translation
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        rotation(self.theta)
    }

    pub fn inverse(&self) -> Self {
        let t = -(self.rotation_matrix().transpose() * self.translation);
        Self::new(t.x, t.y, -self.theta)
    }

    /// `self ∘ other`
    pub fn compose(&self, other: &Se2) -> Self {
        let t = self.translation + self.rotation_matrix() * other.translation;
        Self::new(t.x, t.y, self.theta + other.theta)
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector2<f64>) -> Vector2<f64> {
        self.translation + self.rotation_matrix() * p
    }
}

/// Robot pose in the plane, `(x, y, θ)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexSE2 {
    estimate: Se2,
}

impl VertexSE2 {
    pub fn new(estimate: Se2) -> Self {
        Self { estimate }
    }

    pub fn pose(&self) -> &Se2 {
        &self.estimate
    }

    pub fn set_pose(&mut self, estimate: Se2) {
        self.estimate = estimate;
    }
}

impl Vertex for VertexSE2 {
    fn dimension(&self) -> usize {
        3
    }

    fn oplus(&mut self, delta: &[f64]) {
        if let [dx, dy, dtheta, ..] = delta {
            let v = self.estimate.to_vector() + Vector3::new(*dx, *dy, *dtheta);
            self.estimate = Se2::from_vector(&v);
        }
    }

    fn set_to_origin(&mut self) {
        self.estimate = Se2::identity();
    }

    fn estimate(&self) -> DVector<f64> {
        DVector::from_column_slice(self.estimate.to_vector().as_slice())
    }

    fn set_estimate(&mut self, estimate: &DVector<f64>) -> CoreResult<()> {
        check_estimate_len(estimate, 3)?;
        self.estimate = Se2::new(estimate[0], estimate[1], estimate[2]);
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        self.estimate = read_pose(tokens)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_values(out, self.estimate.to_vector().iter())
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

/// Point landmark in the plane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexPointXY {
    estimate: Vector2<f64>,
}

impl VertexPointXY {
    pub fn new(estimate: Vector2<f64>) -> Self {
        Self { estimate }
    }

    pub fn point(&self) -> &Vector2<f64> {
        &self.estimate
    }
}

impl Vertex for VertexPointXY {
    fn dimension(&self) -> usize {
        2
    }

    fn oplus(&mut self, delta: &[f64]) {
        if let [dx, dy, ..] = delta {
            self.estimate += Vector2::new(*dx, *dy);
        }
    }

    fn set_to_origin(&mut self) {
        self.estimate = Vector2::zeros();
    }

    fn estimate(&self) -> DVector<f64> {
        DVector::from_column_slice(self.estimate.as_slice())
    }

    fn set_estimate(&mut self, estimate: &DVector<f64>) -> CoreResult<()> {
        check_estimate_len(estimate, 2)?;
        self.estimate = Vector2::new(estimate[0], estimate[1]);
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        let x = tokens.next_f64()?;
        let y = tokens.next_f64()?;
        self.estimate = Vector2::new(x, y);
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_values(out, self.estimate.iter())
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

fn pose_at<'a>(vertices: &[&'a dyn Vertex], index: usize) -> CoreResult<&'a VertexSE2> {
    let vertex = vertices.get(index).ok_or_else(|| {
        CoreError::InvalidEdge(format!("missing vertex at position {}", index))
    })?;
    downcast_vertex::<VertexSE2>(*vertex)
}

fn point_at<'a>(vertices: &[&'a dyn Vertex], index: usize) -> CoreResult<&'a VertexPointXY> {
    let vertex = vertices.get(index).ok_or_else(|| {
        CoreError::InvalidEdge(format!("missing vertex at position {}", index))
    })?;
    downcast_vertex::<VertexPointXY>(*vertex)
}

fn read_pose(tokens: &mut TokenReader<'_>) -> CoreResult<Se2> {
    let x = tokens.next_f64()?;
    let y = tokens.next_f64()?;
    let theta = tokens.next_f64()?;
    Ok(Se2::new(x, y, theta))
}

/// `[R 0; 0 1]` for the rotation of `pose`.
fn rotation_block(pose: &Se2) -> Matrix3<f64> {
    let mut z = Matrix3::identity();
    z.fixed_view_mut::<2, 2>(0, 0).copy_from(&pose.rotation_matrix());
    z
}

fn copy_into_workspace(
    workspace: &mut JacobianWorkspace,
    slot: usize,
    jacobian: &DMatrix<f64>,
) -> CoreResult<()> {
    workspace
        .jacobian_mut(slot, jacobian.nrows(), jacobian.ncols())?
        .copy_from(jacobian);
    Ok(())
}

/// Odometry or loop closure: relative pose of vertex 1 seen from vertex 0.
#[derive(Debug, Clone)]
pub struct EdgeSE2 {
    measurement: Se2,
    inverse_measurement: Se2,
    information: DMatrix<f64>,
}

impl EdgeSE2 {
    pub fn new(measurement: Se2, information: Matrix3<f64>) -> Self {
        Self {
            measurement,
            inverse_measurement: measurement.inverse(),
            information: DMatrix::from_column_slice(3, 3, information.as_slice()),
        }
    }

    pub fn measurement(&self) -> &Se2 {
        &self.measurement
    }

    pub fn set_measurement(&mut self, measurement: Se2) {
        self.measurement = measurement;
        self.inverse_measurement = measurement.inverse();
    }
}

impl Default for EdgeSE2 {
    fn default() -> Self {
        Self::new(Se2::identity(), Matrix3::identity())
    }
}

impl Edge for EdgeSE2 {
    fn dimension(&self) -> usize {
        3
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn expected_vertex_dimension(&self, _index: usize) -> Option<usize> {
        Some(3)
    }

    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
        let from = pose_at(vertices, 0)?.pose();
        let to = pose_at(vertices, 1)?.pose();
        let delta = self
            .inverse_measurement
            .compose(&from.inverse().compose(to));
        Ok(DVector::from_column_slice(delta.to_vector().as_slice()))
    }

    fn linearize_oplus(
        &self,
        vertices: &[&dyn Vertex],
        fixed: &[bool],
        workspace: &mut JacobianWorkspace,
    ) -> CoreResult<()> {
        let from = pose_at(vertices, 0)?.pose();
        let to = pose_at(vertices, 1)?.pose();
        let d = to.translation() - from.translation();
        let (s, c) = from.theta().sin_cos();
        let z = rotation_block(&self.inverse_measurement);

        if !fixed.first().copied().unwrap_or(false) {
            let xi = z * Matrix3::new(
                -c, -s, -s * d.x + c * d.y,
                s, -c, -c * d.x - s * d.y,
                0.0, 0.0, -1.0,
            );
            copy_into_workspace(workspace, 0, &DMatrix::from_column_slice(3, 3, xi.as_slice()))?;
        }
        if !fixed.get(1).copied().unwrap_or(false) {
            let xj = z * Matrix3::new(
                c, s, 0.0,
                -s, c, 0.0,
                0.0, 0.0, 1.0,
            );
            copy_into_workspace(workspace, 1, &DMatrix::from_column_slice(3, 3, xj.as_slice()))?;
        }
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        self.set_measurement(read_pose(tokens)?);
        self.information = read_information(tokens, 3)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_values(out, self.measurement.to_vector().iter())?;
        write_information(out, &self.information)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Absolute pose prior.
#[derive(Debug, Clone)]
pub struct EdgeSE2Prior {
    measurement: Se2,
    inverse_measurement: Se2,
    information: DMatrix<f64>,
}

impl EdgeSE2Prior {
    pub fn new(measurement: Se2, information: DMatrix<f64>) -> CoreResult<Self> {
        check_information(&information, 3)?;
        Ok(Self {
            measurement,
            inverse_measurement: measurement.inverse(),
            information,
        })
    }

    pub fn measurement(&self) -> &Se2 {
        &self.measurement
    }
}

impl Default for EdgeSE2Prior {
    fn default() -> Self {
        Self {
            measurement: Se2::identity(),
            inverse_measurement: Se2::identity(),
            information: DMatrix::identity(3, 3),
        }
    }
}

impl Edge for EdgeSE2Prior {
    fn dimension(&self) -> usize {
        3
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn expected_vertex_dimension(&self, _index: usize) -> Option<usize> {
        Some(3)
    }

    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
        let pose = pose_at(vertices, 0)?.pose();
        let delta = self.inverse_measurement.compose(pose);
        Ok(DVector::from_column_slice(delta.to_vector().as_slice()))
    }

    fn linearize_oplus(
        &self,
        _vertices: &[&dyn Vertex],
        fixed: &[bool],
        workspace: &mut JacobianWorkspace,
    ) -> CoreResult<()> {
        if !fixed.first().copied().unwrap_or(false) {
            let z = rotation_block(&self.inverse_measurement);
            copy_into_workspace(workspace, 0, &DMatrix::from_column_slice(3, 3, z.as_slice()))?;
        }
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        self.measurement = read_pose(tokens)?;
        self.inverse_measurement = self.measurement.inverse();
        self.information = read_information(tokens, 3)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_values(out, self.measurement.to_vector().iter())?;
        write_information(out, &self.information)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Landmark position observed in the frame of a pose.
#[derive(Debug, Clone)]
pub struct EdgeSE2PointXY {
    measurement: Vector2<f64>,
    information: DMatrix<f64>,
}

impl EdgeSE2PointXY {
    pub fn new(measurement: Vector2<f64>, information: Matrix2<f64>) -> Self {
        Self {
            measurement,
            information: DMatrix::from_column_slice(2, 2, information.as_slice()),
        }
    }

    pub fn measurement(&self) -> &Vector2<f64> {
        &self.measurement
    }
}

impl Default for EdgeSE2PointXY {
    fn default() -> Self {
        Self::new(Vector2::zeros(), Matrix2::identity())
    }
}

impl Edge for EdgeSE2PointXY {
    fn dimension(&self) -> usize {
        2
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn expected_vertex_dimension(&self, index: usize) -> Option<usize> {
        match index {
            0 => Some(3),
            1 => Some(2),
            _ => None,
        }
    }

    fn compute_error(&self, vertices: &[&dyn Vertex]) -> CoreResult<DVector<f64>> {
        let pose = pose_at(vertices, 0)?.pose();
        let point = point_at(vertices, 1)?.point();
        let local = pose.inverse().transform_point(point) - self.measurement;
        Ok(DVector::from_column_slice(local.as_slice()))
    }

    fn linearize_oplus(
        &self,
        vertices: &[&dyn Vertex],
        fixed: &[bool],
        workspace: &mut JacobianWorkspace,
    ) -> CoreResult<()> {
        let pose = pose_at(vertices, 0)?.pose();
        let point = point_at(vertices, 1)?.point();
        let d = point - pose.translation();
        let (s, c) = pose.theta().sin_cos();

        if !fixed.first().copied().unwrap_or(false) {
            let xi = DMatrix::from_row_slice(
                2,
                3,
                &[-c, -s, -s * d.x + c * d.y, s, -c, -c * d.x - s * d.y],
            );
            copy_into_workspace(workspace, 0, &xi)?;
        }
        if !fixed.get(1).copied().unwrap_or(false) {
            let xj = DMatrix::from_row_slice(2, 2, &[c, s, -s, c]);
            copy_into_workspace(workspace, 1, &xj)?;
        }
        Ok(())
    }

    fn read(&mut self, tokens: &mut TokenReader<'_>) -> CoreResult<()> {
        let x = tokens.next_f64()?;
        let y = tokens.next_f64()?;
        self.measurement = Vector2::new(x, y);
        self.information = read_information(tokens, 2)?;
        Ok(())
    }

    fn write(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        write_values(out, self.measurement.iter())?;
        write_information(out, &self.information)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::edge::numeric_jacobians;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn assert_jacobians_match(
        edge: &dyn Edge,
        vertices: &[&dyn Vertex],
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dims: Vec<usize> = vertices.iter().map(|v| v.dimension()).collect();
        let fixed = vec![false; vertices.len()];
        let mut analytic = JacobianWorkspace::new();
        analytic.update_size_for_edge(edge.dimension(), &dims);
        analytic.allocate();
        let mut numeric = analytic.clone();

        edge.linearize_oplus(vertices, &fixed, &mut analytic)?;
        numeric_jacobians(edge, vertices, &fixed, &mut numeric)?;
        for (slot, dim) in dims.iter().enumerate() {
            let a = analytic.jacobian(slot, edge.dimension(), *dim)?;
            let n = numeric.jacobian(slot, edge.dimension(), *dim)?;
            assert!((a - n).norm() < 1e-5, "slot {slot}: {a} vs {n}");
        }
        Ok(())
    }

    #[test]
    fn test_normalize_angle() {
        assert!((normalize_angle(1.5 * PI) + 0.5 * PI).abs() < 1e-12);
        assert!((normalize_angle(-PI / 2.0) + PI / 2.0).abs() < 1e-12);
        assert!((normalize_angle(2.5 * PI) - 0.5 * PI).abs() < 1e-12);
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        let a = Se2::new(1.0, -2.0, 0.7);
        let id = a.compose(&a.inverse());
        assert!(id.to_vector().norm() < 1e-12);
        let b = Se2::new(0.5, 0.25, -1.2);
        let p = Vector2::new(3.0, 1.0);
        let composed = a.compose(&b).transform_point(&p);
        let chained = a.transform_point(&b.transform_point(&p));
        assert!((composed - chained).norm() < 1e-12);
    }

    #[test]
    fn test_pose_oplus_wraps_angle() {
        let mut v = VertexSE2::new(Se2::new(0.0, 0.0, PI - 0.1));
        v.oplus(&[1.0, 2.0, 0.2]);
        assert_eq!(v.pose().translation(), &Vector2::new(1.0, 2.0));
        assert!((v.pose().theta() - (-PI + 0.1)).abs() < 1e-12);
    }

    #[test]
    fn test_edge_se2_error_zero_at_measurement() -> TestResult {
        let measurement = Se2::new(1.0, 0.5, 0.3);
        let from = VertexSE2::new(Se2::new(2.0, -1.0, 0.4));
        let to = VertexSE2::new(from.pose().compose(&measurement));
        let edge = EdgeSE2::new(measurement, Matrix3::identity());
        let error = edge.compute_error(&[&from, &to])?;
        assert!(error.norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_edge_se2_jacobians() -> TestResult {
        let from = VertexSE2::new(Se2::new(0.3, -0.2, 0.9));
        let to = VertexSE2::new(Se2::new(1.5, 0.8, -0.4));
        let edge = EdgeSE2::new(Se2::new(1.0, 0.9, -1.0), Matrix3::identity());
        assert_jacobians_match(&edge, &[&from, &to])
    }

    #[test]
    fn test_prior_jacobian() -> TestResult {
        let pose = VertexSE2::new(Se2::new(1.0, 2.0, 0.5));
        let edge = EdgeSE2Prior::new(Se2::new(0.8, 2.1, 0.2), DMatrix::identity(3, 3))?;
        assert_jacobians_match(&edge, &[&pose])
    }

    #[test]
    fn test_point_edge_jacobians() -> TestResult {
        let pose = VertexSE2::new(Se2::new(1.0, 2.0, 0.5));
        let point = VertexPointXY::new(Vector2::new(3.0, 1.0));
        let edge = EdgeSE2PointXY::new(Vector2::new(1.0, -1.0), Matrix2::identity());
        assert_jacobians_match(&edge, &[&pose, &point])?;
        assert_eq!(edge.expected_vertex_dimension(1), Some(2));
        Ok(())
    }

    #[test]
    fn test_wrong_vertex_type_is_reported() {
        let point = VertexPointXY::default();
        let edge = EdgeSE2Prior::default();
        assert!(matches!(
            edge.compute_error(&[&point]),
            Err(CoreError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_edge_text_round_trip() -> TestResult {
        let edge = EdgeSE2::new(
            Se2::new(1.0, 0.5, 0.25),
            Matrix3::new(10.0, 0.0, 0.0, 0.0, 10.0, 0.0, 0.0, 0.0, 40.0),
        );
        let mut text = String::new();
        edge.write(&mut text)?;
        assert_eq!(text, "1 0.5 0.25 10 0 0 10 0 40");

        let mut read_back = EdgeSE2::default();
        read_back.read(&mut TokenReader::new(&text))?;
        assert_eq!(read_back.measurement(), edge.measurement());
        assert_eq!(read_back.information(), edge.information());
        Ok(())
    }
}
