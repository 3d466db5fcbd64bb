//! Poincaré ball model (curvature -1) on batched candle tensors
//!
//! Every row of a `(.., d)` tensor is treated as one point. Points live strictly
//! inside the unit ball; [`PoincareBall::expmap0`] and [`PoincareBall::logmap0`]
//! are the only transitions between the tangent space at the origin and the
//! manifold.

use candle_core::{Tensor, D};

use crate::{HyperRouteError, Result};

/// Boundary margin for f32 points: projected norms never exceed `1 - BALL_EPS`
pub const BALL_EPS: f32 = 4e-3;

/// Floor applied to norms before dividing by them
const MIN_NORM: f32 = 1e-15;

/// Floor under the square root of the `acosh` expansion
const ACOSH_FLOOR: f32 = 1e-14;

/// Poincaré ball of curvature -1
#[derive(Clone, Debug)]
pub struct PoincareBall {
    /// Largest norm a projected point may have
    max_norm: f32,
}

impl Default for PoincareBall {
    fn default() -> Self {
        Self::new()
    }
}

impl PoincareBall {
    /// Create the unit ball with the default f32 boundary margin
    pub fn new() -> Self {
        PoincareBall {
            max_norm: 1.0 - BALL_EPS,
        }
    }

    /// Largest norm produced by [`PoincareBall::project`]
    pub fn max_norm(&self) -> f32 {
        self.max_norm
    }

    /// Per-row Euclidean norm, shape `(.., 1)`, floored away from zero
    fn row_norm(x: &Tensor) -> Result<Tensor> {
        Ok(x
            .sqr()?
            .sum_keepdim(D::Minus1)?
            .maximum(MIN_NORM * MIN_NORM)?
            .sqrt()?)
    }

    /// Rescale rows whose norm exceeds the boundary margin back inside the ball
    pub fn project(&self, x: &Tensor) -> Result<Tensor> {
        let norm = Self::row_norm(x)?;
        let scale = norm.recip()?.affine(self.max_norm as f64, 0.0)?.minimum(1f32)?;
        Ok(x.broadcast_mul(&scale)?)
    }

    /// Exponential map at the origin: `tanh(‖v‖) v / ‖v‖`, projected
    pub fn expmap0(&self, v: &Tensor) -> Result<Tensor> {
        let norm = Self::row_norm(v)?;
        let coeff = norm.tanh()?.div(&norm)?;
        self.project(&v.broadcast_mul(&coeff)?)
    }

    /// Logarithmic map at the origin: `artanh(‖y‖) y / ‖y‖`
    ///
    /// Fails with [`HyperRouteError::GeometryDomain`] if any row of `y` is not
    /// strictly inside the ball.
    pub fn logmap0(&self, y: &Tensor) -> Result<Tensor> {
        check_ball(y, "logmap0")?;
        let norm = Self::row_norm(y)?;
        let artanh = norm
            .affine(1.0, 1.0)?
            .div(&norm.affine(-1.0, 1.0)?)?
            .log()?
            .affine(0.5, 0.0)?;
        Ok(y.broadcast_mul(&artanh.div(&norm)?)?)
    }

    /// Möbius addition `x ⊕ y`, row by row
    pub fn mobius_add(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let xy = x.mul(y)?.sum_keepdim(D::Minus1)?;
        let x2 = x.sqr()?.sum_keepdim(D::Minus1)?;
        let y2 = y.sqr()?.sum_keepdim(D::Minus1)?;

        let coeff_x = xy.affine(2.0, 1.0)?.add(&y2)?;
        let coeff_y = x2.affine(-1.0, 1.0)?;
        let denom = xy
            .affine(2.0, 1.0)?
            .add(&x2.mul(&y2)?)?
            .maximum(MIN_NORM)?;

        let num = x.broadcast_mul(&coeff_x)?.add(&y.broadcast_mul(&coeff_y)?)?;
        self.project(&num.broadcast_div(&denom)?)
    }
}

/// Verify that every row of `x` is a finite point strictly inside the unit ball
pub fn check_ball(x: &Tensor, context: &str) -> Result<()> {
    let sq_norms = x
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    for (row, sq) in sq_norms.iter().enumerate() {
        if !sq.is_finite() || *sq >= 1.0 {
            return Err(HyperRouteError::GeometryDomain(format!(
                "{context}: row {row} has norm {} outside the open unit ball",
                sq.sqrt()
            )));
        }
    }
    Ok(())
}

/// Poincaré geodesic distance between paired rows
///
/// `a` and `b` are `(N, d)`; the result is `(N,)` with entry `i` equal to
/// `acosh(1 + 2‖a_i - b_i‖² / ((1 - ‖a_i‖²)(1 - ‖b_i‖²)))`. This is an
/// elementwise distance, not an all-pairs matrix.
pub fn hyperbolic_distance(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.dims() != b.dims() || a.rank() != 2 {
        return Err(HyperRouteError::ShapeMismatch(format!(
            "hyperbolic_distance expects equal (N, d) inputs, got {:?} and {:?}",
            a.dims(),
            b.dims()
        )));
    }
    check_ball(a, "hyperbolic_distance")?;
    check_ball(b, "hyperbolic_distance")?;

    let diff2 = a.sub(b)?.sqr()?.sum(D::Minus1)?;
    let a2 = a.sqr()?.sum(D::Minus1)?;
    let b2 = b.sqr()?.sum(D::Minus1)?;
    let denom = a2.affine(-1.0, 1.0)?.mul(&b2.affine(-1.0, 1.0)?)?;

    // acosh(1 + z) = ln(1 + z + sqrt(z (z + 2)))
    let z = diff2.affine(2.0, 0.0)?.div(&denom)?;
    let root = z.mul(&z.affine(1.0, 2.0)?)?.maximum(ACOSH_FLOOR)?.sqrt()?;
    let dist = z.affine(1.0, 1.0)?.add(&root)?.log()?;

    if dist.to_vec1::<f32>()?.iter().any(|d| !d.is_finite()) {
        return Err(HyperRouteError::GeometryDomain(
            "hyperbolic_distance produced a non-finite value".to_string(),
        ));
    }
    Ok(dist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use proptest::prelude::*;

    fn rows(data: &[f32], n: usize) -> Tensor {
        Tensor::from_slice(data, (n, data.len() / n), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_distance_from_origin() {
        // d(0, x) = 2 artanh(‖x‖)
        let a = rows(&[0.0, 0.0], 1);
        let b = rows(&[0.5, 0.0], 1);
        let d = hyperbolic_distance(&a, &b).unwrap().to_vec1::<f32>().unwrap();
        let expected = 2.0 * 0.5f32.atanh();
        assert_abs_diff_eq!(d[0], expected, epsilon = 1e-5);
    }

    #[test]
    fn test_distance_is_elementwise() {
        let a = rows(&[0.1, 0.0, 0.0, 0.2, -0.3, 0.1], 3);
        let b = rows(&[0.1, 0.0, 0.4, 0.2, -0.3, 0.1], 3);
        let d = hyperbolic_distance(&a, &b).unwrap();
        assert_eq!(d.dims(), &[3]);
        let d = d.to_vec1::<f32>().unwrap();
        assert!(d[0] < 1e-6);
        assert!(d[1] > 0.5);
        assert!(d[2] < 1e-6);
    }

    #[test]
    fn test_point_outside_ball_is_rejected() {
        let a = rows(&[1.2, 0.0], 1);
        let b = rows(&[0.0, 0.0], 1);
        let err = hyperbolic_distance(&a, &b).unwrap_err();
        assert!(matches!(err, HyperRouteError::GeometryDomain(_)));

        let ball = PoincareBall::new();
        assert!(matches!(
            ball.logmap0(&rows(&[0.6, 0.8], 1)),
            Err(HyperRouteError::GeometryDomain(_))
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = rows(&[0.1, 0.0, 0.2, 0.0], 2);
        let b = rows(&[0.1, 0.0], 1);
        assert!(matches!(
            hyperbolic_distance(&a, &b),
            Err(HyperRouteError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_expmap_stays_inside_ball() {
        let ball = PoincareBall::new();
        let v = rows(&[50.0, -20.0, 0.0, 0.0, 1e-3, 0.0], 3);
        let y = ball.expmap0(&v).unwrap();
        check_ball(&y, "test").unwrap();
        let norms = y.sqr().unwrap().sum(1).unwrap().sqrt().unwrap().to_vec1::<f32>().unwrap();
        assert!(norms[0] <= ball.max_norm() + 1e-6);
        assert_eq!(norms[1], 0.0);
        assert_abs_diff_eq!(norms[2], 1e-3, epsilon = 1e-6);
    }

    #[test]
    fn test_mobius_add_identity() {
        let ball = PoincareBall::new();
        let x = rows(&[0.3, -0.2], 1);
        let zero = rows(&[0.0, 0.0], 1);
        let sum = ball.mobius_add(&x, &zero).unwrap().to_vec2::<f32>().unwrap();
        assert_abs_diff_eq!(sum[0][0], 0.3, epsilon = 1e-6);
        assert_abs_diff_eq!(sum[0][1], -0.2, epsilon = 1e-6);
        let sum = ball.mobius_add(&zero, &x).unwrap().to_vec2::<f32>().unwrap();
        assert_abs_diff_eq!(sum[0][0], 0.3, epsilon = 1e-6);
    }

    fn ball_point() -> impl Strategy<Value = Vec<f32>> {
        prop::collection::vec(-0.5f32..0.5, 4)
    }

    proptest! {
        #[test]
        fn prop_distance_identity(a in ball_point()) {
            let t = rows(&a, 1);
            let d = hyperbolic_distance(&t, &t).unwrap().to_vec1::<f32>().unwrap();
            prop_assert!(d[0].abs() < 1e-6);
        }

        #[test]
        fn prop_distance_symmetry(a in ball_point(), b in ball_point()) {
            let ta = rows(&a, 1);
            let tb = rows(&b, 1);
            let ab = hyperbolic_distance(&ta, &tb).unwrap().to_vec1::<f32>().unwrap();
            let ba = hyperbolic_distance(&tb, &ta).unwrap().to_vec1::<f32>().unwrap();
            prop_assert!((ab[0] - ba[0]).abs() < 1e-5);
            prop_assert!(ab[0] >= 0.0);
        }

        #[test]
        fn prop_expmap_logmap_round_trip(v in prop::collection::vec(-1.0f32..1.0, 4)) {
            let ball = PoincareBall::new();
            let t = rows(&v, 1);
            let back = ball.logmap0(&ball.expmap0(&t).unwrap()).unwrap();
            let back = back.to_vec2::<f32>().unwrap();
            for (orig, rec) in v.iter().zip(back[0].iter()) {
                prop_assert!((orig - rec).abs() < 1e-3, "{} vs {}", orig, rec);
            }
        }
    }
}
