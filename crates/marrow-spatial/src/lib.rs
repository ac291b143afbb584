//! Spatial (6D) vector algebra for articulated rigid body dynamics.
//!
//! Implements Featherstone's spatial vector algebra as used by recursive
//! dynamics algorithms (articulated-body, composite-rigid-body, recursive
//! Newton-Euler). Functions here are pure math with no engine state.
//!
//! Conventions:
//! - A spatial vector is `[angular (3), linear (3)]`.
//! - Motion vectors: `[ω, v]` (angular velocity, linear velocity).
//! - Force vectors: `[τ, f]` (torque, force).
//! - Quantities are expressed in body-fixed frames; `Isometry3` values map
//!   child-frame coordinates into the parent frame.

use nalgebra::{Isometry3, Matrix3, Matrix6, UnitQuaternion, Vector3, Vector6};

/// 6D spatial vector: `[angular (3), linear (3)]`.
pub type SpatialVector = Vector6<f64>;

/// Threshold below which rotation angles use series expansions.
const SMALL_ANGLE: f64 = 1e-9;

/// Skew-symmetric (cross-product) matrix of a 3-vector.
#[inline]
#[must_use]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Spatial cross product for motion vectors: `v × s`.
#[inline]
#[must_use]
pub fn spatial_cross_motion(v: &SpatialVector, s: &SpatialVector) -> SpatialVector {
    let w = Vector3::new(v[0], v[1], v[2]);
    let v_lin = Vector3::new(v[3], v[4], v[5]);
    let s_ang = Vector3::new(s[0], s[1], s[2]);
    let s_lin = Vector3::new(s[3], s[4], s[5]);

    let result_ang = w.cross(&s_ang);
    let result_lin = w.cross(&s_lin) + v_lin.cross(&s_ang);

    SpatialVector::new(
        result_ang.x,
        result_ang.y,
        result_ang.z,
        result_lin.x,
        result_lin.y,
        result_lin.z,
    )
}

/// Spatial cross product for force vectors: `v ×* f`.
#[inline]
#[must_use]
pub fn spatial_cross_force(v: &SpatialVector, f: &SpatialVector) -> SpatialVector {
    let w = Vector3::new(v[0], v[1], v[2]);
    let v_lin = Vector3::new(v[3], v[4], v[5]);
    let f_ang = Vector3::new(f[0], f[1], f[2]);
    let f_lin = Vector3::new(f[3], f[4], f[5]);

    let result_ang = w.cross(&f_ang) + v_lin.cross(&f_lin);
    let result_lin = w.cross(&f_lin);

    SpatialVector::new(
        result_ang.x,
        result_ang.y,
        result_ang.z,
        result_lin.x,
        result_lin.y,
        result_lin.z,
    )
}

/// Map a motion vector from the child frame of `t` into its parent frame:
/// `Ad(t) · m`.
#[must_use]
pub fn transform_motion(t: &Isometry3<f64>, m: &SpatialVector) -> SpatialVector {
    let w = Vector3::new(m[0], m[1], m[2]);
    let v = Vector3::new(m[3], m[4], m[5]);
    let p = t.translation.vector;

    let w_out = t.rotation * w;
    let v_out = p.cross(&w_out) + t.rotation * v;

    SpatialVector::new(w_out.x, w_out.y, w_out.z, v_out.x, v_out.y, v_out.z)
}

/// Map a motion vector from the parent frame of `t` into its child frame:
/// `Ad(t⁻¹) · m`.
#[must_use]
pub fn inv_transform_motion(t: &Isometry3<f64>, m: &SpatialVector) -> SpatialVector {
    let w = Vector3::new(m[0], m[1], m[2]);
    let v = Vector3::new(m[3], m[4], m[5]);
    let p = t.translation.vector;
    let r_inv = t.rotation.inverse();

    let w_out = r_inv * w;
    let v_out = r_inv * (v - p.cross(&w));

    SpatialVector::new(w_out.x, w_out.y, w_out.z, v_out.x, v_out.y, v_out.z)
}

/// Map a force vector from the child frame of `t` into its parent frame.
///
/// This is the dual of `inv_transform_motion`: power is invariant, so
/// `⟨transform_force(t, f), m⟩ = ⟨f, inv_transform_motion(t, m)⟩`.
#[must_use]
pub fn transform_force(t: &Isometry3<f64>, f: &SpatialVector) -> SpatialVector {
    let n = Vector3::new(f[0], f[1], f[2]);
    let f_lin = Vector3::new(f[3], f[4], f[5]);
    let p = t.translation.vector;

    let f_out = t.rotation * f_lin;
    let n_out = t.rotation * n + p.cross(&f_out);

    SpatialVector::new(n_out.x, n_out.y, n_out.z, f_out.x, f_out.y, f_out.z)
}

/// 6×6 adjoint matrix of `t` acting on motion vectors.
///
/// `motion_adjoint(t) · m == transform_motion(t, m)`.
#[must_use]
pub fn motion_adjoint(t: &Isometry3<f64>) -> Matrix6<f64> {
    let r = t.rotation.to_rotation_matrix().into_inner();
    let p_skew = skew(&t.translation.vector);

    let mut adj = Matrix6::zeros();
    adj.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    adj.fixed_view_mut::<3, 3>(3, 3).copy_from(&r);
    adj.fixed_view_mut::<3, 3>(3, 0).copy_from(&(p_skew * r));
    adj
}

/// Transform a 6×6 spatial inertia expressed in the child frame of `t` into
/// the parent frame.
///
/// With `B = Ad(t⁻¹)`, the parent-frame inertia is `Bᵀ · I · B`, which keeps
/// the kinetic energy `½ vᵀ I v` invariant under the frame change.
#[must_use]
pub fn transform_inertia(t: &Isometry3<f64>, inertia: &Matrix6<f64>) -> Matrix6<f64> {
    let b = motion_adjoint(&t.inverse());
    b.transpose() * inertia * b
}

/// Build the 6×6 spatial inertia of a rigid body in its own frame.
///
/// - `mass`: body mass
/// - `com`: center of mass offset from the body frame origin
/// - `moment`: 3×3 rotational inertia about the center of mass
///
/// The result has the block form:
/// ```text
/// I = [ I_com + m·(cᵀc·1 − c·cᵀ),  m·[c]×  ]
///     [ −m·[c]×,                   m·1     ]
/// ```
#[must_use]
pub fn spatial_inertia(mass: f64, com: &Vector3<f64>, moment: &Matrix3<f64>) -> Matrix6<f64> {
    let c_skew = skew(com);
    let c_dot_c = com.dot(com);

    let mut inertia = Matrix6::zeros();

    // Rotational block about the body origin (parallel axis theorem)
    let parallel = mass * (c_dot_c * Matrix3::identity() - com * com.transpose());
    inertia
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(moment + parallel));

    // Translational block
    inertia[(3, 3)] = mass;
    inertia[(4, 4)] = mass;
    inertia[(5, 5)] = mass;

    // Coupling blocks
    let coupling = mass * c_skew;
    inertia.fixed_view_mut::<3, 3>(0, 3).copy_from(&coupling);
    inertia
        .fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&coupling.transpose());

    inertia
}

/// Exponential map from a rotation vector to a rotation.
#[inline]
#[must_use]
pub fn exp_map_rot(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Right Jacobian of the SO(3) exponential map.
///
/// For `R(t) = exp([φ(t)]×)`, the body-frame angular velocity satisfies
/// `ω = Jr(φ) · φ̇` with
/// ```text
/// Jr(φ) = 1 − (1−cosθ)/θ² · [φ]× + (θ−sinθ)/θ³ · [φ]×²,   θ = |φ|
/// ```
#[must_use]
pub fn exp_map_jac(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_skew = skew(phi);
    let phi_skew2 = phi_skew * phi_skew;

    if theta < SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * phi_skew + phi_skew2 / 6.0;
    }

    let c1 = (1.0 - theta.cos()) / (theta * theta);
    let c2 = (theta - theta.sin()) / (theta * theta * theta);
    Matrix3::identity() - c1 * phi_skew + c2 * phi_skew2
}

/// Time derivative of the right Jacobian of the SO(3) exponential map.
///
/// Differentiates `exp_map_jac(φ(t))` along `φ̇`, with `θ̇ = (φ·φ̇)/θ`.
#[must_use]
pub fn exp_map_jac_dot(phi: &Vector3<f64>, phi_dot: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let phi_skew = skew(phi);
    let phid_skew = skew(phi_dot);
    let mixed = phid_skew * phi_skew + phi_skew * phid_skew;

    if theta < SMALL_ANGLE {
        return -0.5 * phid_skew + mixed / 6.0;
    }

    let (sin_t, cos_t) = theta.sin_cos();
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let t4 = t3 * theta;
    let theta_dot = phi.dot(phi_dot) / theta;

    let c1 = (1.0 - cos_t) / t2;
    let c2 = (theta - sin_t) / t3;
    // d/dθ of the two coefficients above
    let dc1 = (theta * sin_t - 2.0 * (1.0 - cos_t)) / t3;
    let dc2 = (theta * (1.0 - cos_t) - 3.0 * (theta - sin_t)) / t4;

    -dc1 * theta_dot * phi_skew - c1 * phid_skew + dc2 * theta_dot * phi_skew * phi_skew
        + c2 * mixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    fn iso(axis_angle: Vector3<f64>, translation: Vector3<f64>) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(translation),
            UnitQuaternion::from_scaled_axis(axis_angle),
        )
    }

    /// T1: motion cross product of a vector with itself vanishes.
    #[test]
    fn t01_cross_motion_self_is_zero() {
        let v = SpatialVector::new(0.3, -0.1, 0.7, 1.0, 2.0, -0.5);
        assert_relative_eq!(
            spatial_cross_motion(&v, &v),
            SpatialVector::zeros(),
            epsilon = 1e-14
        );
    }

    /// T2: duality — ⟨v ×* f, u⟩ = −⟨f, v × u⟩.
    #[test]
    fn t02_cross_force_duality() {
        let v = SpatialVector::new(0.2, 0.5, -0.3, 1.1, 0.0, 0.4);
        let u = SpatialVector::new(-0.6, 0.2, 0.9, 0.3, -1.2, 0.8);
        let f = SpatialVector::new(2.0, -1.0, 0.5, 0.7, 0.3, -0.9);
        assert_relative_eq!(
            spatial_cross_force(&v, &f).dot(&u),
            -f.dot(&spatial_cross_motion(&v, &u)),
            epsilon = 1e-12
        );
    }

    /// T3: transform_motion round-trips through inv_transform_motion.
    #[test]
    fn t03_motion_transform_round_trip() {
        let t = iso(Vector3::new(0.1, -0.4, 0.9), Vector3::new(1.0, 2.0, -0.5));
        let m = SpatialVector::new(0.3, 0.1, -0.2, 0.8, -0.6, 0.4);
        let back = inv_transform_motion(&t, &transform_motion(&t, &m));
        assert_relative_eq!(back, m, epsilon = 1e-12);
    }

    /// T4: motion_adjoint agrees with transform_motion.
    #[test]
    fn t04_adjoint_matches_transform() {
        let t = iso(Vector3::new(-0.7, 0.2, 0.3), Vector3::new(0.5, -1.5, 2.0));
        let m = SpatialVector::new(1.0, -0.3, 0.6, 0.2, 0.9, -1.1);
        assert_relative_eq!(motion_adjoint(&t) * m, transform_motion(&t, &m), epsilon = 1e-12);
    }

    /// T5: power invariance — ⟨F_parent, V_parent⟩ = ⟨F_child, V_child⟩.
    #[test]
    fn t05_force_transform_power_invariance() {
        let t = iso(Vector3::new(0.4, 0.4, -0.2), Vector3::new(-0.3, 0.7, 1.2));
        let f_child = SpatialVector::new(0.5, -1.0, 0.3, 2.0, 0.1, -0.4);
        let v_parent = SpatialVector::new(-0.2, 0.6, 0.1, 0.3, -0.8, 0.5);

        let power_parent = transform_force(&t, &f_child).dot(&v_parent);
        let power_child = f_child.dot(&inv_transform_motion(&t, &v_parent));
        assert_relative_eq!(power_parent, power_child, epsilon = 1e-12);
    }

    /// T6: inertia transform preserves kinetic energy.
    #[test]
    fn t06_inertia_transform_energy_invariance() {
        let inertia = spatial_inertia(
            2.5,
            &Vector3::new(0.1, -0.2, 0.3),
            &Matrix3::from_diagonal(&Vector3::new(0.4, 0.5, 0.6)),
        );
        let t = iso(Vector3::new(0.3, -0.1, 0.5), Vector3::new(1.0, 0.0, -2.0));
        let v_parent = SpatialVector::new(0.2, 0.4, -0.1, 1.0, -0.5, 0.3);
        let v_child = inv_transform_motion(&t, &v_parent);

        let ke_parent = 0.5 * v_parent.dot(&(transform_inertia(&t, &inertia) * v_parent));
        let ke_child = 0.5 * v_child.dot(&(inertia * v_child));
        assert_relative_eq!(ke_parent, ke_child, epsilon = 1e-10);
    }

    /// T7: spatial inertia momentum — pure translation gives m·v in the
    /// linear slot and com-coupling torque in the angular slot.
    #[test]
    fn t07_spatial_inertia_momentum() {
        let mass = 3.0;
        let com = Vector3::new(0.0, 0.5, 0.0);
        let inertia = spatial_inertia(mass, &com, &Matrix3::identity());

        let v = SpatialVector::new(0.0, 0.0, 0.0, 1.0, 0.0, 0.0);
        let h = inertia * v;

        // Angular momentum about the origin: m·c × v = 3·(0,0.5,0)×(1,0,0)
        assert_relative_eq!(Vector3::new(h[0], h[1], h[2]), Vector3::new(0.0, 0.0, -1.5));
        assert_relative_eq!(Vector3::new(h[3], h[4], h[5]), mass * Vector3::new(1.0, 0.0, 0.0));
    }

    /// T8: right Jacobian is identity at zero and maps an aligned rate
    /// straight through.
    #[test]
    fn t08_exp_map_jac_basics() {
        assert_relative_eq!(
            exp_map_jac(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-12
        );

        let phi = Vector3::new(0.0, 0.0, 0.9);
        let omega = exp_map_jac(&phi) * Vector3::new(0.0, 0.0, 2.0);
        assert_relative_eq!(omega, Vector3::new(0.0, 0.0, 2.0), epsilon = 1e-12);
    }

    /// T9: ω = Jr(φ)·φ̇ matches the finite-difference body angular velocity
    /// of R(t) = exp([φ + t·φ̇]×).
    #[test]
    fn t09_exp_map_jac_matches_finite_difference() {
        let phi = Vector3::new(0.3, -0.5, 0.4);
        let phi_dot = Vector3::new(0.7, 0.2, -0.9);
        let h = 1e-7;

        let r0 = exp_map_rot(&phi);
        let r1 = exp_map_rot(&(phi + h * phi_dot));
        let omega_fd = (r0.inverse() * r1).scaled_axis() / h;

        let omega = exp_map_jac(&phi) * phi_dot;
        assert_relative_eq!(omega, omega_fd, epsilon = 1e-5);
    }

    /// T10: dJr/dt matches a finite difference of Jr along φ̇.
    #[test]
    fn t10_exp_map_jac_dot_matches_finite_difference() {
        let phi = Vector3::new(-0.2, 0.6, 0.1);
        let phi_dot = Vector3::new(0.4, -0.3, 0.8);
        let h = 1e-7;

        let fd = (exp_map_jac(&(phi + h * phi_dot)) - exp_map_jac(&(phi - h * phi_dot)))
            / (2.0 * h);
        assert_relative_eq!(exp_map_jac_dot(&phi, &phi_dot), fd, epsilon = 1e-5);
    }
}
