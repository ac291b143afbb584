//! Joints: the mapping from scalar coordinates to the spatial transform and
//! twist between a parent and child body.
//!
//! A joint with `k` degrees of freedom owns a 6×k motion subspace `S`
//! (expressed in the child body frame) such that the child's velocity
//! relative to its parent is `S · q̇`. Ball and free joints use
//! exponential-map rotation coordinates, so every coordinate is a plain
//! scalar and the position, velocity, and acceleration channels all have the
//! same length.

use marrow_spatial::{
    exp_map_jac, exp_map_jac_dot, exp_map_rot, motion_adjoint, skew, SpatialVector,
};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix6xX, Translation3, UnitQuaternion, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::gencoord::GenCoordSystem;

/// The kinematic model of a joint.
#[derive(Debug, Clone)]
pub enum JointType {
    /// One rotational degree of freedom about a fixed local axis.
    Revolute {
        /// Unit rotation axis in the joint frame.
        axis: Vector3<f64>,
    },
    /// One translational degree of freedom along a fixed local axis.
    Prismatic {
        /// Unit translation axis in the joint frame.
        axis: Vector3<f64>,
    },
    /// Three rotational degrees of freedom (exponential-map coordinates).
    Ball,
    /// Six degrees of freedom: rotation vector (3) then translation (3).
    Free,
    /// Rigid connection, zero degrees of freedom.
    Weld,
}

impl JointType {
    /// Number of scalar degrees of freedom.
    #[must_use]
    pub fn num_dofs(&self) -> usize {
        match self {
            Self::Revolute { .. } | Self::Prismatic { .. } => 1,
            Self::Ball => 3,
            Self::Free => 6,
            Self::Weld => 0,
        }
    }
}

/// Per-dof spring/damper parameters.
///
/// Springs act toward `rest_position`; dampers oppose velocity. Both feed
/// the implicit terms of the forward-dynamics recursion and the augmented
/// mass matrix.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct JointParameters {
    /// Spring stiffness per dof.
    pub spring_stiffness: Vec<f64>,
    /// Spring rest position per dof.
    pub rest_position: Vec<f64>,
    /// Viscous damping coefficient per dof.
    pub damping: Vec<f64>,
}

impl JointParameters {
    fn with_dofs(dofs: usize) -> Self {
        Self {
            spring_stiffness: vec![0.0; dofs],
            rest_position: vec![0.0; dofs],
            damping: vec![0.0; dofs],
        }
    }
}

/// A joint connecting a body to its parent.
///
/// Owns the joint placement on both bodies, the per-dof spring/damper
/// parameters, and the caches used by the recursive dynamics algorithms.
#[derive(Debug, Clone)]
pub struct Joint {
    name: String,
    joint_type: JointType,
    /// Joint frame pose in the parent body frame.
    placement_in_parent: Isometry3<f64>,
    /// Joint frame pose in the child body frame.
    placement_in_child: Isometry3<f64>,
    params: JointParameters,

    /// Skeleton index of this joint's first dof; assigned at init.
    pub(crate) index_in_skeleton: usize,

    // ---- kinematic caches ----
    /// X: maps child body coordinates into the parent body frame.
    pub(crate) relative_transform: Isometry3<f64>,
    /// Motion subspace S (6×k) in the child body frame.
    pub(crate) jacobian: Matrix6xX<f64>,
    /// Time derivative Ṡ.
    pub(crate) jacobian_dot: Matrix6xX<f64>,

    // ---- articulated-inertia projections ----
    /// AI·S for the plain articulated inertia.
    pub(crate) ai_s: Matrix6xX<f64>,
    /// (Sᵀ·AI·S)⁻¹.
    pub(crate) psi: DMatrix<f64>,
    /// AI·S for the implicit articulated inertia.
    pub(crate) implicit_ai_s: Matrix6xX<f64>,
    /// (Sᵀ·AI·S + Δt·D + Δt²·K)⁻¹.
    pub(crate) implicit_psi: DMatrix<f64>,

    // ---- per-pass working values ----
    /// Total joint force `u` for the forward-dynamics backward pass.
    pub(crate) total_force: DVector<f64>,
    /// Total joint impulse `u` for the impulse backward pass.
    pub(crate) total_impulse: DVector<f64>,
    /// Velocity change δq̇ from the last impulse forward pass.
    pub(crate) velocity_change: DVector<f64>,
}

impl Joint {
    /// Create a joint of the given type. Axes are normalized.
    #[must_use]
    pub fn new(name: &str, joint_type: JointType) -> Self {
        let joint_type = match joint_type {
            JointType::Revolute { axis } => {
                assert!(axis.norm() > 0.0, "revolute axis must be non-zero");
                JointType::Revolute {
                    axis: axis.normalize(),
                }
            }
            JointType::Prismatic { axis } => {
                assert!(axis.norm() > 0.0, "prismatic axis must be non-zero");
                JointType::Prismatic {
                    axis: axis.normalize(),
                }
            }
            other => other,
        };
        let dofs = joint_type.num_dofs();
        Self {
            name: name.to_string(),
            joint_type,
            placement_in_parent: Isometry3::identity(),
            placement_in_child: Isometry3::identity(),
            params: JointParameters::with_dofs(dofs),
            index_in_skeleton: 0,
            relative_transform: Isometry3::identity(),
            jacobian: Matrix6xX::zeros(dofs),
            jacobian_dot: Matrix6xX::zeros(dofs),
            ai_s: Matrix6xX::zeros(dofs),
            psi: DMatrix::zeros(dofs, dofs),
            implicit_ai_s: Matrix6xX::zeros(dofs),
            implicit_psi: DMatrix::zeros(dofs, dofs),
            total_force: DVector::zeros(dofs),
            total_impulse: DVector::zeros(dofs),
            velocity_change: DVector::zeros(dofs),
        }
    }

    /// Revolute joint about `axis`.
    #[must_use]
    pub fn revolute(name: &str, axis: Vector3<f64>) -> Self {
        Self::new(name, JointType::Revolute { axis })
    }

    /// Prismatic joint along `axis`.
    #[must_use]
    pub fn prismatic(name: &str, axis: Vector3<f64>) -> Self {
        Self::new(name, JointType::Prismatic { axis })
    }

    /// Ball (spherical) joint.
    #[must_use]
    pub fn ball(name: &str) -> Self {
        Self::new(name, JointType::Ball)
    }

    /// Free (floating, 6-dof) joint.
    #[must_use]
    pub fn free(name: &str) -> Self {
        Self::new(name, JointType::Free)
    }

    /// Weld (rigid, 0-dof) joint.
    #[must_use]
    pub fn weld(name: &str) -> Self {
        Self::new(name, JointType::Weld)
    }

    /// Joint name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Joint kinematic model.
    #[must_use]
    pub fn joint_type(&self) -> &JointType {
        &self.joint_type
    }

    /// Number of scalar degrees of freedom.
    #[must_use]
    pub fn num_dofs(&self) -> usize {
        self.joint_type.num_dofs()
    }

    /// Skeleton index of this joint's first dof (valid after `init`).
    #[must_use]
    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }

    /// Set the joint frame pose in the parent body frame.
    pub fn set_placement_in_parent(&mut self, placement: Isometry3<f64>) {
        self.placement_in_parent = placement;
    }

    /// Set the joint frame pose in the child body frame.
    pub fn set_placement_in_child(&mut self, placement: Isometry3<f64>) {
        self.placement_in_child = placement;
    }

    /// Spring/damper parameters.
    #[must_use]
    pub fn parameters(&self) -> &JointParameters {
        &self.params
    }

    /// Set the spring stiffness of one dof.
    pub fn set_spring_stiffness(&mut self, dof: usize, stiffness: f64) {
        assert!(stiffness >= 0.0, "spring stiffness must be non-negative");
        self.params.spring_stiffness[dof] = stiffness;
    }

    /// Set the spring rest position of one dof.
    pub fn set_rest_position(&mut self, dof: usize, rest: f64) {
        self.params.rest_position[dof] = rest;
    }

    /// Set the viscous damping coefficient of one dof.
    pub fn set_damping(&mut self, dof: usize, damping: f64) {
        assert!(damping >= 0.0, "damping must be non-negative");
        self.params.damping[dof] = damping;
    }

    /// Spring potential energy `Σ ½·k·(q − q_rest)²`.
    #[must_use]
    pub fn potential_energy(&self, positions: &DVector<f64>) -> f64 {
        let mut pe = 0.0;
        for d in 0..self.num_dofs() {
            let k = self.params.spring_stiffness[d];
            if k > 0.0 {
                let disp = positions[self.index_in_skeleton + d] - self.params.rest_position[d];
                pe += 0.5 * k * disp * disp;
            }
        }
        pe
    }

    // ------------------------------------------------------------------
    // Kinematics
    // ------------------------------------------------------------------

    /// The joint transform `T(q)` in the joint frame.
    fn joint_transform(&self, positions: &DVector<f64>) -> Isometry3<f64> {
        let i = self.index_in_skeleton;
        match &self.joint_type {
            JointType::Revolute { axis } => Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_scaled_axis(axis * positions[i]),
            ),
            JointType::Prismatic { axis } => Isometry3::from_parts(
                Translation3::from(axis * positions[i]),
                UnitQuaternion::identity(),
            ),
            JointType::Ball => {
                let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
                Isometry3::from_parts(Translation3::identity(), exp_map_rot(&phi))
            }
            JointType::Free => {
                let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
                let p = Vector3::new(positions[i + 3], positions[i + 4], positions[i + 5]);
                Isometry3::from_parts(Translation3::from(p), exp_map_rot(&phi))
            }
            JointType::Weld => Isometry3::identity(),
        }
    }

    /// Recompute the relative transform X and the motion subspace S from the
    /// current positions.
    pub(crate) fn update_relative_transform(&mut self, positions: &DVector<f64>) {
        self.relative_transform =
            self.placement_in_parent * self.joint_transform(positions) * self.placement_in_child.inverse();
        self.update_jacobian(positions);
    }

    /// Motion subspace in the joint frame, before mapping into the child
    /// body frame.
    fn local_jacobian(&self, positions: &DVector<f64>) -> Matrix6xX<f64> {
        let i = self.index_in_skeleton;
        let mut s = Matrix6xX::zeros(self.num_dofs());
        match &self.joint_type {
            JointType::Revolute { axis } => {
                s.fixed_view_mut::<3, 1>(0, 0).copy_from(axis);
            }
            JointType::Prismatic { axis } => {
                s.fixed_view_mut::<3, 1>(3, 0).copy_from(axis);
            }
            JointType::Ball => {
                let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
                s.fixed_view_mut::<3, 3>(0, 0).copy_from(&exp_map_jac(&phi));
            }
            JointType::Free => {
                let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
                let r_inv = exp_map_rot(&phi)
                    .inverse()
                    .to_rotation_matrix()
                    .into_inner();
                s.fixed_view_mut::<3, 3>(0, 0).copy_from(&exp_map_jac(&phi));
                s.fixed_view_mut::<3, 3>(3, 3).copy_from(&r_inv);
            }
            JointType::Weld => {}
        }
        s
    }

    fn update_jacobian(&mut self, positions: &DVector<f64>) {
        let local = self.local_jacobian(positions);
        self.jacobian = motion_adjoint(&self.placement_in_child) * local;
    }

    /// Recompute Ṡ from the current positions and velocities.
    pub(crate) fn update_jacobian_dot(
        &mut self,
        positions: &DVector<f64>,
        velocities: &DVector<f64>,
    ) {
        let i = self.index_in_skeleton;
        let mut s_dot = Matrix6xX::zeros(self.num_dofs());
        match &self.joint_type {
            JointType::Revolute { .. } | JointType::Prismatic { .. } | JointType::Weld => {}
            JointType::Ball => {
                let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
                let phi_dot = Vector3::new(velocities[i], velocities[i + 1], velocities[i + 2]);
                s_dot
                    .fixed_view_mut::<3, 3>(0, 0)
                    .copy_from(&exp_map_jac_dot(&phi, &phi_dot));
            }
            JointType::Free => {
                let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
                let phi_dot = Vector3::new(velocities[i], velocities[i + 1], velocities[i + 2]);
                let omega = exp_map_jac(&phi) * phi_dot;
                let r_inv = exp_map_rot(&phi)
                    .inverse()
                    .to_rotation_matrix()
                    .into_inner();
                s_dot
                    .fixed_view_mut::<3, 3>(0, 0)
                    .copy_from(&exp_map_jac_dot(&phi, &phi_dot));
                // d(Rᵀ)/dt = −[ω]×·Rᵀ for Ṙ = R·[ω]×
                s_dot
                    .fixed_view_mut::<3, 3>(3, 3)
                    .copy_from(&(-skew(&omega) * r_inv));
            }
        }
        self.jacobian_dot = motion_adjoint(&self.placement_in_child) * s_dot;
    }

    /// Joint-space velocity `S·q̇` in the child body frame.
    pub(crate) fn joint_velocity(&self, velocities: &DVector<f64>) -> SpatialVector {
        let k = self.num_dofs();
        if k == 0 {
            return SpatialVector::zeros();
        }
        &self.jacobian * velocities.rows(self.index_in_skeleton, k)
    }

    /// Integrate positions one step: `q ← q ⊕ q̇·Δt`.
    ///
    /// Scalar coordinates integrate linearly; exponential-map rotation
    /// blocks compose rotations so the step is exact for constant angular
    /// velocity.
    pub(crate) fn integrate_positions(
        &self,
        positions: &mut DVector<f64>,
        velocities: &DVector<f64>,
        dt: f64,
    ) {
        let i = self.index_in_skeleton;
        match &self.joint_type {
            JointType::Revolute { .. } | JointType::Prismatic { .. } => {
                positions[i] += velocities[i] * dt;
            }
            JointType::Ball => {
                integrate_rotation_block(positions, velocities, i, dt);
            }
            JointType::Free => {
                integrate_rotation_block(positions, velocities, i, dt);
                for d in 3..6 {
                    positions[i + d] += velocities[i + d] * dt;
                }
            }
            JointType::Weld => {}
        }
    }

    /// Integrate velocities one step: `q̇ ← q̇ + q̈·Δt`.
    pub(crate) fn integrate_velocities(
        &self,
        velocities: &mut DVector<f64>,
        accelerations: &DVector<f64>,
        dt: f64,
    ) {
        let i = self.index_in_skeleton;
        for d in 0..self.num_dofs() {
            velocities[i + d] += accelerations[i + d] * dt;
        }
    }

    // ------------------------------------------------------------------
    // Articulated-inertia projections
    // ------------------------------------------------------------------

    /// Recompute `AI·S` and `Ψ = (Sᵀ·AI·S)⁻¹` for the plain articulated
    /// inertia.
    pub(crate) fn update_inv_proj_art_inertia(&mut self, art_inertia: &nalgebra::Matrix6<f64>) {
        if self.num_dofs() == 0 {
            return;
        }
        self.ai_s = art_inertia * &self.jacobian;
        let projected = self.jacobian.transpose() * &self.ai_s;
        self.psi = invert_projection(projected, &self.name);
    }

    /// Recompute `AI·S` and `Ψ = (Sᵀ·AI·S + Δt·D + Δt²·K)⁻¹` for the
    /// implicit articulated inertia, absorbing joint dampers and springs.
    pub(crate) fn update_inv_proj_art_inertia_implicit(
        &mut self,
        art_inertia: &nalgebra::Matrix6<f64>,
        dt: f64,
    ) {
        let k = self.num_dofs();
        if k == 0 {
            return;
        }
        self.implicit_ai_s = art_inertia * &self.jacobian;
        let mut projected = self.jacobian.transpose() * &self.implicit_ai_s;
        for d in 0..k {
            projected[(d, d)] += dt * self.params.damping[d]
                + dt * dt * self.params.spring_stiffness[d];
        }
        self.implicit_psi = invert_projection(projected, &self.name);
    }

    /// Total joint force for the forward-dynamics backward pass:
    /// `u = τ + τ_spring + τ_damper − Sᵀ·(AI·η + B)`.
    ///
    /// Spring forces are evaluated implicitly at the end-of-step position
    /// `q + Δt·q̇`.
    pub(crate) fn update_total_force(
        &mut self,
        projected_bias: &SpatialVector,
        gen_coords: &GenCoordSystem,
        dt: f64,
    ) {
        let k = self.num_dofs();
        if k == 0 {
            return;
        }
        let i = self.index_in_skeleton;
        let s_t_bias = self.jacobian.transpose() * projected_bias;
        for d in 0..k {
            let q = gen_coords.positions[i + d];
            let dq = gen_coords.velocities[i + d];
            let spring = -self.params.spring_stiffness[d]
                * (q + dt * dq - self.params.rest_position[d]);
            let damper = -self.params.damping[d] * dq;
            self.total_force[d] = gen_coords.forces[i + d] + spring + damper - s_t_bias[d];
        }
    }

    /// Total joint impulse for the impulse backward pass: `u = −Sᵀ·β`.
    pub(crate) fn update_total_impulse(&mut self, bias_impulse: &SpatialVector) {
        if self.num_dofs() == 0 {
            return;
        }
        self.total_impulse = -(self.jacobian.transpose() * bias_impulse);
    }
}

/// Integrate a 3-dof exponential-map rotation block by composing rotations.
fn integrate_rotation_block(
    positions: &mut DVector<f64>,
    velocities: &DVector<f64>,
    i: usize,
    dt: f64,
) {
    let phi = Vector3::new(positions[i], positions[i + 1], positions[i + 2]);
    let phi_dot = Vector3::new(velocities[i], velocities[i + 1], velocities[i + 2]);
    let omega = exp_map_jac(&phi) * phi_dot;
    let next = (exp_map_rot(&phi) * exp_map_rot(&(omega * dt))).scaled_axis();
    positions[i] = next.x;
    positions[i + 1] = next.y;
    positions[i + 2] = next.z;
}

/// Invert a projected articulated inertia, panicking on singularity (a
/// contract violation: body inertias must be positive definite).
fn invert_projection(projected: DMatrix<f64>, joint_name: &str) -> DMatrix<f64> {
    let dim = projected.nrows();
    projected.try_inverse().unwrap_or_else(|| {
        panic!("singular {dim}x{dim} projected articulated inertia at joint '{joint_name}'")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn revolute_jacobian_is_constant_axis() {
        let mut joint = Joint::revolute("j", Vector3::new(0.0, 0.0, 2.0));
        let q = DVector::from_element(1, 0.7);
        joint.update_relative_transform(&q);
        assert_relative_eq!(joint.jacobian[(2, 0)], 1.0);
        assert_relative_eq!(joint.jacobian.column(0).norm(), 1.0);
    }

    #[test]
    fn free_joint_jacobian_is_identity_at_origin() {
        let mut joint = Joint::free("root");
        let q = DVector::zeros(6);
        joint.update_relative_transform(&q);
        for d in 0..6 {
            assert_relative_eq!(joint.jacobian[(d, d)], 1.0);
            assert_relative_eq!(joint.jacobian.column(d).norm(), 1.0);
        }
    }

    #[test]
    fn relative_transform_composes_placements() {
        let mut joint = Joint::revolute("j", Vector3::new(0.0, 1.0, 0.0));
        joint.set_placement_in_parent(Isometry3::translation(0.0, 0.0, -1.0));
        let q = DVector::zeros(1);
        joint.update_relative_transform(&q);
        assert_relative_eq!(joint.relative_transform.translation.vector.z, -1.0);
    }

    #[test]
    fn ball_integration_composes_rotations() {
        let joint = {
            let mut j = Joint::ball("b");
            j.index_in_skeleton = 0;
            j
        };
        // Rotate about z at rate π/2 per second for 1s starting from zero.
        let mut q = DVector::zeros(3);
        let dq = DVector::from_column_slice(&[0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        joint.integrate_positions(&mut q, &dq, 1.0);
        assert_relative_eq!(q[2], std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn spring_potential_energy_uses_rest_position() {
        let mut joint = Joint::revolute("j", Vector3::new(1.0, 0.0, 0.0));
        joint.set_spring_stiffness(0, 8.0);
        joint.set_rest_position(0, 0.5);
        let q = DVector::from_element(1, 1.5);
        assert_relative_eq!(joint.potential_energy(&q), 4.0);
    }
}
