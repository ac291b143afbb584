//! Body nodes: single rigid bodies in the skeleton tree.
//!
//! A `BodyNode` owns its mass properties, its parent joint, its tree links
//! (by index into the skeleton's body vector), and every cache the recursive
//! dynamics algorithms touch. The skeleton drives the recursions; each step
//! here reads the parent's caches (forward passes) or the children's caches
//! (backward passes), which the skeleton provides through split borrows —
//! parents always precede children in the body vector after `init`.

use marrow_spatial::{
    spatial_cross_force, spatial_cross_motion, spatial_inertia, transform_force,
    transform_inertia, SpatialVector,
};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Matrix6, Matrix6xX, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::gencoord::GenCoordSystem;
use crate::joint::Joint;
use crate::soft::SoftBodyProperties;

/// A named point fixed on a body, used by external trackers.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Marker {
    /// Marker name.
    pub name: String,
    /// Offset from the body frame origin, in the body frame.
    pub local_offset: Vector3<f64>,
    /// Index of the owning body; assigned at init.
    pub(crate) body_index: usize,
}

impl Marker {
    /// Create a marker at a body-local offset.
    #[must_use]
    pub fn new(name: &str, local_offset: Vector3<f64>) -> Self {
        Self {
            name: name.to_string(),
            local_offset,
            body_index: 0,
        }
    }

    /// Index of the owning body (valid after `Skeleton::init`).
    #[must_use]
    pub fn body_index(&self) -> usize {
        self.body_index
    }
}

/// Read-only view of the bodies strictly after some index in the skeleton's
/// body vector. Backward passes use it to reach a body's children, whose
/// indices are always larger than the body's own.
#[derive(Clone, Copy)]
pub(crate) struct Descendants<'a> {
    pub(crate) nodes: &'a [BodyNode],
    pub(crate) offset: usize,
}

impl Descendants<'_> {
    pub(crate) fn child(&self, index: usize) -> &BodyNode {
        &self.nodes[index - self.offset]
    }
}

/// A single rigid body in the skeleton tree.
#[derive(Debug, Clone)]
pub struct BodyNode {
    name: String,
    pub(crate) index: usize,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) joint: Joint,

    // ---- mass properties ----
    mass: f64,
    local_com: Vector3<f64>,
    moment_of_inertia: Matrix3<f64>,
    /// 6×6 spatial inertia in the body frame; rebuilt at init.
    pub(crate) inertia: Matrix6<f64>,
    gravity_mode: bool,

    markers: Vec<Marker>,
    pub(crate) soft: Option<SoftBodyProperties>,

    // ---- accumulators written from outside the recursions ----
    /// External wrench on this body, accumulated in the body frame.
    pub(crate) external_force: SpatialVector,
    /// Constraint impulse written by an external constraint solver.
    pub(crate) constraint_impulse: SpatialVector,

    /// Skeleton indices of every generalized coordinate this body depends
    /// on: ancestor joint dofs in tree order, then its own.
    pub(crate) dependent_gen_coords: Vec<usize>,

    // ---- kinematic caches ----
    pub(crate) world_transform: Isometry3<f64>,
    /// Spatial velocity in the body frame.
    pub(crate) velocity: SpatialVector,
    /// Velocity-product acceleration η = Ṡ·q̇ + V ×ₘ S·q̇.
    pub(crate) partial_acceleration: SpatialVector,
    /// Spatial acceleration in the body frame.
    pub(crate) acceleration: SpatialVector,

    // ---- articulated-body caches ----
    pub(crate) art_inertia: Matrix6<f64>,
    pub(crate) art_inertia_implicit: Matrix6<f64>,
    pub(crate) bias_force: SpatialVector,
    /// Wrench transmitted through the parent joint.
    pub(crate) transmitted_force: SpatialVector,

    // ---- impulse caches ----
    pub(crate) bias_impulse: SpatialVector,
    pub(crate) velocity_change: SpatialVector,
    pub(crate) transmitted_impulse: SpatialVector,

    // ---- mass-matrix assembly caches ----
    mass_accel: SpatialVector,
    mass_force: SpatialVector,
    inv_mass_bias: SpatialVector,
    inv_mass_accel: SpatialVector,

    // ---- force-vector assembly caches ----
    combined_accel: SpatialVector,
    combined_force: SpatialVector,
    gravity_force: SpatialVector,
    external_aggregate: SpatialVector,

    // ---- Jacobian caches ----
    pub(crate) body_jacobian: Matrix6xX<f64>,
    pub(crate) body_jacobian_dot: Matrix6xX<f64>,
    pub(crate) jacobian_dirty: bool,
    pub(crate) jacobian_dot_dirty: bool,
}

impl BodyNode {
    /// Create a body with the given parent joint. Mass defaults to 1, the
    /// center of mass to the frame origin, and the rotational inertia to
    /// identity.
    #[must_use]
    pub fn new(name: &str, joint: Joint) -> Self {
        Self {
            name: name.to_string(),
            index: 0,
            parent: None,
            children: Vec::new(),
            joint,
            mass: 1.0,
            local_com: Vector3::zeros(),
            moment_of_inertia: Matrix3::identity(),
            inertia: Matrix6::identity(),
            gravity_mode: true,
            markers: Vec::new(),
            soft: None,
            external_force: SpatialVector::zeros(),
            constraint_impulse: SpatialVector::zeros(),
            dependent_gen_coords: Vec::new(),
            world_transform: Isometry3::identity(),
            velocity: SpatialVector::zeros(),
            partial_acceleration: SpatialVector::zeros(),
            acceleration: SpatialVector::zeros(),
            art_inertia: Matrix6::zeros(),
            art_inertia_implicit: Matrix6::zeros(),
            bias_force: SpatialVector::zeros(),
            transmitted_force: SpatialVector::zeros(),
            bias_impulse: SpatialVector::zeros(),
            velocity_change: SpatialVector::zeros(),
            transmitted_impulse: SpatialVector::zeros(),
            mass_accel: SpatialVector::zeros(),
            mass_force: SpatialVector::zeros(),
            inv_mass_bias: SpatialVector::zeros(),
            inv_mass_accel: SpatialVector::zeros(),
            combined_accel: SpatialVector::zeros(),
            combined_force: SpatialVector::zeros(),
            gravity_force: SpatialVector::zeros(),
            external_aggregate: SpatialVector::zeros(),
            body_jacobian: Matrix6xX::zeros(0),
            body_jacobian_dot: Matrix6xX::zeros(0),
            jacobian_dirty: true,
            jacobian_dot_dirty: true,
        }
    }

    /// Body name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index in the skeleton's body vector (valid after `init`).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Parent body index, `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Declare the parent body by its registration index.
    pub fn set_parent(&mut self, parent: usize) {
        self.parent = Some(parent);
    }

    /// Child body indices (valid after `init`).
    #[must_use]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// The joint connecting this body to its parent.
    #[must_use]
    pub fn parent_joint(&self) -> &Joint {
        &self.joint
    }

    /// Mutable access to the parent joint.
    pub fn parent_joint_mut(&mut self) -> &mut Joint {
        &mut self.joint
    }

    /// Body mass.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Set the body mass. The skeleton's total mass is captured at `init`;
    /// changing masses afterwards desynchronizes it until the next `init`.
    pub fn set_mass(&mut self, mass: f64) {
        assert!(mass > 0.0, "body mass must be positive");
        self.mass = mass;
    }

    /// Center of mass offset in the body frame.
    #[must_use]
    pub fn local_com(&self) -> &Vector3<f64> {
        &self.local_com
    }

    /// Set the center of mass offset in the body frame.
    pub fn set_local_com(&mut self, com: Vector3<f64>) {
        self.local_com = com;
    }

    /// Set the rotational inertia about the center of mass.
    pub fn set_moment_of_inertia(&mut self, moment: Matrix3<f64>) {
        self.moment_of_inertia = moment;
    }

    /// Whether gravity acts on this body.
    #[must_use]
    pub fn gravity_mode(&self) -> bool {
        self.gravity_mode
    }

    /// Enable or disable gravity for this body.
    pub fn set_gravity_mode(&mut self, enabled: bool) {
        self.gravity_mode = enabled;
    }

    /// Attach a named marker.
    pub fn add_marker(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    /// Markers attached to this body.
    #[must_use]
    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub(crate) fn markers_mut(&mut self) -> &mut [Marker] {
        &mut self.markers
    }

    /// Soft-body properties, if this body is deformable.
    #[must_use]
    pub fn soft_properties(&self) -> Option<&SoftBodyProperties> {
        self.soft.as_ref()
    }

    /// Mutable soft-body properties.
    pub fn soft_properties_mut(&mut self) -> Option<&mut SoftBodyProperties> {
        self.soft.as_mut()
    }

    /// Mark this body deformable with the given soft-body properties.
    pub fn set_soft_properties(&mut self, soft: SoftBodyProperties) {
        self.soft = Some(soft);
    }

    /// Skeleton indices of the generalized coordinates this body depends on.
    #[must_use]
    pub fn dependent_gen_coords(&self) -> &[usize] {
        &self.dependent_gen_coords
    }

    /// World transform of the body frame.
    #[must_use]
    pub fn world_transform(&self) -> &Isometry3<f64> {
        &self.world_transform
    }

    /// Spatial velocity in the body frame.
    #[must_use]
    pub fn body_velocity(&self) -> &SpatialVector {
        &self.velocity
    }

    /// Spatial acceleration in the body frame.
    #[must_use]
    pub fn body_acceleration(&self) -> &SpatialVector {
        &self.acceleration
    }

    /// Constraint impulse currently set on this body.
    #[must_use]
    pub fn constraint_impulse(&self) -> &SpatialVector {
        &self.constraint_impulse
    }

    /// Set the constraint impulse (written by an external constraint
    /// solver).
    pub fn set_constraint_impulse(&mut self, impulse: SpatialVector) {
        self.constraint_impulse = impulse;
    }

    /// Zero the constraint impulse.
    pub fn clear_constraint_impulse(&mut self) {
        self.constraint_impulse = SpatialVector::zeros();
    }

    /// Accumulate an external force acting at a point on this body.
    ///
    /// `is_force_local` / `is_offset_local` select between body-frame and
    /// world-frame inputs.
    pub fn add_ext_force(
        &mut self,
        force: &Vector3<f64>,
        offset: &Vector3<f64>,
        is_force_local: bool,
        is_offset_local: bool,
    ) {
        let p = if is_offset_local {
            *offset
        } else {
            self.world_transform.inverse_transform_point(&(*offset).into()).coords
        };
        let f = if is_force_local {
            *force
        } else {
            self.world_transform.rotation.inverse() * force
        };
        let torque = p.cross(&f);
        self.external_force += SpatialVector::new(torque.x, torque.y, torque.z, f.x, f.y, f.z);
    }

    /// Accumulate an external torque on this body.
    pub fn add_ext_torque(&mut self, torque: &Vector3<f64>, is_local: bool) {
        let t = if is_local {
            *torque
        } else {
            self.world_transform.rotation.inverse() * torque
        };
        self.external_force += SpatialVector::new(t.x, t.y, t.z, 0.0, 0.0, 0.0);
    }

    /// Zero the accumulated external wrench.
    pub fn clear_external_forces(&mut self) {
        self.external_force = SpatialVector::zeros();
    }

    /// Rebuild the 6×6 spatial inertia from the scalar mass properties.
    pub(crate) fn update_spatial_inertia(&mut self) {
        self.inertia = spatial_inertia(self.mass, &self.local_com, &self.moment_of_inertia);
    }

    // ------------------------------------------------------------------
    // Forward kinematics
    // ------------------------------------------------------------------

    /// Update the world transform (and the joint's relative transform and
    /// motion subspace) from the current positions.
    pub(crate) fn update_transform(
        &mut self,
        parent: Option<&BodyNode>,
        gen_coords: &GenCoordSystem,
    ) {
        self.joint.update_relative_transform(&gen_coords.positions);
        self.world_transform = match parent {
            Some(p) => p.world_transform * self.joint.relative_transform,
            None => self.joint.relative_transform,
        };
    }

    /// Update the body-frame spatial velocity: `V = Ad(X⁻¹)·V_parent + S·q̇`.
    pub(crate) fn update_velocity(
        &mut self,
        parent: Option<&BodyNode>,
        gen_coords: &GenCoordSystem,
    ) {
        let joint_vel = self.joint.joint_velocity(&gen_coords.velocities);
        self.velocity = match parent {
            Some(p) => {
                marrow_spatial::inv_transform_motion(&self.joint.relative_transform, &p.velocity)
                    + joint_vel
            }
            None => joint_vel,
        };
    }

    /// Update the velocity-product acceleration `η = Ṡ·q̇ + V ×ₘ S·q̇`.
    pub(crate) fn update_partial_acceleration(&mut self, gen_coords: &GenCoordSystem) {
        self.joint
            .update_jacobian_dot(&gen_coords.positions, &gen_coords.velocities);
        let k = self.joint.num_dofs();
        if k == 0 {
            self.partial_acceleration = SpatialVector::zeros();
            return;
        }
        let dq = gen_coords
            .velocities
            .rows(self.joint.index_in_skeleton, k);
        let s_dot_dq: SpatialVector = &self.joint.jacobian_dot * dq;
        let joint_vel = self.joint.joint_velocity(&gen_coords.velocities);
        self.partial_acceleration = s_dot_dq + spatial_cross_motion(&self.velocity, &joint_vel);
    }

    /// Update the body-frame spatial acceleration from the acceleration
    /// channel: `A = Ad(X⁻¹)·A_parent + η + S·q̈`.
    pub(crate) fn update_acceleration(
        &mut self,
        parent: Option<&BodyNode>,
        gen_coords: &GenCoordSystem,
    ) {
        let k = self.joint.num_dofs();
        let s_ddq: SpatialVector = if k > 0 {
            &self.joint.jacobian * gen_coords.accelerations.rows(self.joint.index_in_skeleton, k)
        } else {
            SpatialVector::zeros()
        };
        let parent_term = match parent {
            Some(p) => marrow_spatial::inv_transform_motion(
                &self.joint.relative_transform,
                &p.acceleration,
            ),
            None => SpatialVector::zeros(),
        };
        self.acceleration = parent_term + self.partial_acceleration + s_ddq;
    }

    // ------------------------------------------------------------------
    // Articulated-body algorithm (forward dynamics)
    // ------------------------------------------------------------------

    /// Gravity wrench on this body in the body frame, honoring the gravity
    /// mode flag.
    fn gravity_wrench(&self, gravity: &Vector3<f64>) -> SpatialVector {
        if !self.gravity_mode {
            return SpatialVector::zeros();
        }
        let g_body = self.world_transform.rotation.inverse() * gravity;
        let g_spatial = SpatialVector::new(0.0, 0.0, 0.0, g_body.x, g_body.y, g_body.z);
        self.inertia * g_spatial
    }

    /// Backward pass: accumulate plain and implicit articulated inertias
    /// from the children and refresh this joint's projections.
    pub(crate) fn update_art_inertia(&mut self, descendants: Descendants<'_>, dt: f64) {
        let mut ai = self.inertia;
        let mut ai_implicit = self.inertia;
        for &c in &self.children {
            let child = descendants.child(c);
            let x = &child.joint.relative_transform;

            let s = &child.joint.ai_s;
            let pi = child.art_inertia - s * &child.joint.psi * s.transpose();
            ai += transform_inertia(x, &pi);

            let s_impl = &child.joint.implicit_ai_s;
            let pi_impl = child.art_inertia_implicit
                - s_impl * &child.joint.implicit_psi * s_impl.transpose();
            ai_implicit += transform_inertia(x, &pi_impl);
        }
        self.art_inertia = ai;
        self.art_inertia_implicit = ai_implicit;
        self.joint.update_inv_proj_art_inertia(&self.art_inertia);
        self.joint
            .update_inv_proj_art_inertia_implicit(&self.art_inertia_implicit, dt);
    }

    /// Backward pass: accumulate the articulated bias force and refresh the
    /// joint's total force.
    pub(crate) fn update_bias_force(
        &mut self,
        descendants: Descendants<'_>,
        gravity: &Vector3<f64>,
        dt: f64,
        gen_coords: &GenCoordSystem,
    ) {
        let mut bias = spatial_cross_force(&self.velocity, &(self.inertia * self.velocity))
            - self.external_force
            - self.gravity_wrench(gravity);
        for &c in &self.children {
            let child = descendants.child(c);
            let beta = child.bias_force
                + child.art_inertia_implicit
                    * (child.partial_acceleration
                        + &child.joint.jacobian
                            * (&child.joint.implicit_psi * &child.joint.total_force));
            bias += transform_force(&child.joint.relative_transform, &beta);
        }
        self.bias_force = bias;
        let projected =
            self.art_inertia_implicit * self.partial_acceleration + self.bias_force;
        self.joint.update_total_force(&projected, gen_coords, dt);
    }

    /// Forward pass: solve the joint acceleration and update the body
    /// acceleration.
    pub(crate) fn update_joint_and_body_acceleration(
        &mut self,
        parent: Option<&BodyNode>,
        accelerations: &mut DVector<f64>,
    ) {
        let parent_acc = match parent {
            Some(p) => marrow_spatial::inv_transform_motion(
                &self.joint.relative_transform,
                &p.acceleration,
            ),
            None => SpatialVector::zeros(),
        };
        let k = self.joint.num_dofs();
        let s_ddq: SpatialVector = if k > 0 {
            let rhs =
                &self.joint.total_force - self.joint.implicit_ai_s.transpose() * parent_acc;
            let ddq = &self.joint.implicit_psi * rhs;
            accelerations
                .rows_mut(self.joint.index_in_skeleton, k)
                .copy_from(&ddq);
            &self.joint.jacobian * ddq
        } else {
            SpatialVector::zeros()
        };
        self.acceleration = parent_acc + self.partial_acceleration + s_ddq;
    }

    /// Forward pass: wrench transmitted through the parent joint,
    /// `F = AI·A + B`.
    pub(crate) fn update_transmitted_force(&mut self) {
        self.transmitted_force =
            self.art_inertia_implicit * self.acceleration + self.bias_force;
    }

    // ------------------------------------------------------------------
    // Inverse dynamics (recursive Newton-Euler)
    // ------------------------------------------------------------------

    /// Backward pass: Newton-Euler body wrench
    /// `F = I·A + V ×* I·V − F_gravity [− F_ext] + Σ child wrenches`.
    pub(crate) fn update_body_force(
        &mut self,
        descendants: Descendants<'_>,
        gravity: &Vector3<f64>,
        with_external_forces: bool,
    ) {
        let mut force = self.inertia * self.acceleration
            + spatial_cross_force(&self.velocity, &(self.inertia * self.velocity))
            - self.gravity_wrench(gravity);
        if with_external_forces {
            force -= self.external_force;
        }
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.transmitted_force);
        }
        self.transmitted_force = force;
    }

    /// Backward pass: project the body wrench onto the joint,
    /// `τ = Sᵀ·F [+ d·q̇]`.
    pub(crate) fn update_generalized_force(
        &mut self,
        with_damping_forces: bool,
        gen_coords: &mut GenCoordSystem,
    ) {
        let k = self.joint.num_dofs();
        if k == 0 {
            return;
        }
        let i0 = self.joint.index_in_skeleton;
        let tau = self.joint.jacobian.transpose() * self.transmitted_force;
        for d in 0..k {
            let mut value = tau[d];
            if with_damping_forces {
                // The actuator must supply what the damper removes.
                value += self.joint.parameters().damping[d] * gen_coords.velocities[i0 + d];
            }
            gen_coords.forces[i0 + d] = value;
        }
    }

    // ------------------------------------------------------------------
    // Mass matrix (composite-rigid-body, column by column)
    // ------------------------------------------------------------------

    /// Forward pass: acceleration response to the unit acceleration column,
    /// `a = S·q̈ + Ad(X⁻¹)·a_parent` (no velocity terms).
    pub(crate) fn update_mass_matrix(
        &mut self,
        parent: Option<&BodyNode>,
        gen_coords: &GenCoordSystem,
    ) {
        let k = self.joint.num_dofs();
        let s_ddq: SpatialVector = if k > 0 {
            &self.joint.jacobian
                * gen_coords.accelerations.rows(self.joint.index_in_skeleton, k)
        } else {
            SpatialVector::zeros()
        };
        self.mass_accel = match parent {
            Some(p) => {
                marrow_spatial::inv_transform_motion(&self.joint.relative_transform, &p.mass_accel)
                    + s_ddq
            }
            None => s_ddq,
        };
    }

    /// Backward pass: force response `F = I·a + Σ child forces`, projected
    /// into column `col` of the mass matrix.
    pub(crate) fn aggregate_mass_matrix(
        &mut self,
        descendants: Descendants<'_>,
        m: &mut DMatrix<f64>,
        col: usize,
    ) {
        let mut force = self.inertia * self.mass_accel;
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.mass_force);
        }
        self.mass_force = force;

        let k = self.joint.num_dofs();
        if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            let tau = self.joint.jacobian.transpose() * self.mass_force;
            for d in 0..k {
                m[(i0 + d, col)] += tau[d];
            }
        }
    }

    /// Backward pass for the augmented mass matrix: adds the implicit
    /// damper/spring diagonal `(Δt·d + Δt²·k)·q̈` on top of the plain
    /// projection.
    pub(crate) fn aggregate_aug_mass_matrix(
        &mut self,
        descendants: Descendants<'_>,
        m: &mut DMatrix<f64>,
        col: usize,
        dt: f64,
        gen_coords: &GenCoordSystem,
    ) {
        let mut force = self.inertia * self.mass_accel;
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.mass_force);
        }
        self.mass_force = force;

        let k = self.joint.num_dofs();
        if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            let params = self.joint.parameters();
            let tau = self.joint.jacobian.transpose() * self.mass_force;
            for d in 0..k {
                let implicit = (dt * params.damping[d] + dt * dt * params.spring_stiffness[d])
                    * gen_coords.accelerations[i0 + d];
                m[(i0 + d, col)] += tau[d] + implicit;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inverse mass matrix (unit-force articulated propagation)
    // ------------------------------------------------------------------

    /// Backward pass: propagate the unit-force column through the
    /// articulated tree using the plain projections.
    pub(crate) fn update_inv_mass_matrix(
        &mut self,
        descendants: Descendants<'_>,
        gen_coords: &GenCoordSystem,
    ) {
        let mut bias = SpatialVector::zeros();
        for &c in &self.children {
            let child = descendants.child(c);
            let beta = child.inv_mass_bias
                + &child.joint.ai_s * (&child.joint.psi * &child.joint.total_force);
            bias += transform_force(&child.joint.relative_transform, &beta);
        }
        self.inv_mass_bias = bias;

        let k = self.joint.num_dofs();
        if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            let u = gen_coords.forces.rows(i0, k)
                - self.joint.jacobian.transpose() * self.inv_mass_bias;
            self.joint.total_force.copy_from(&u);
        }
    }

    /// Backward pass variant using the implicit projections (augmented
    /// inverse mass matrix).
    pub(crate) fn update_inv_aug_mass_matrix(
        &mut self,
        descendants: Descendants<'_>,
        gen_coords: &GenCoordSystem,
    ) {
        let mut bias = SpatialVector::zeros();
        for &c in &self.children {
            let child = descendants.child(c);
            let beta = child.inv_mass_bias
                + &child.joint.implicit_ai_s
                    * (&child.joint.implicit_psi * &child.joint.total_force);
            bias += transform_force(&child.joint.relative_transform, &beta);
        }
        self.inv_mass_bias = bias;

        let k = self.joint.num_dofs();
        if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            let u = gen_coords.forces.rows(i0, k)
                - self.joint.jacobian.transpose() * self.inv_mass_bias;
            self.joint.total_force.copy_from(&u);
        }
    }

    /// Forward pass: solve the acceleration response and write it into
    /// column `col` of the inverse mass matrix.
    pub(crate) fn aggregate_inv_mass_matrix(
        &mut self,
        parent: Option<&BodyNode>,
        inv_m: &mut DMatrix<f64>,
        col: usize,
    ) {
        let parent_acc = match parent {
            Some(p) => marrow_spatial::inv_transform_motion(
                &self.joint.relative_transform,
                &p.inv_mass_accel,
            ),
            None => SpatialVector::zeros(),
        };
        let k = self.joint.num_dofs();
        let s_ddq: SpatialVector = if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            let rhs = &self.joint.total_force - self.joint.ai_s.transpose() * parent_acc;
            let ddq = &self.joint.psi * rhs;
            for d in 0..k {
                inv_m[(i0 + d, col)] = ddq[d];
            }
            &self.joint.jacobian * ddq
        } else {
            SpatialVector::zeros()
        };
        self.inv_mass_accel = parent_acc + s_ddq;
    }

    /// Forward pass variant using the implicit projections.
    pub(crate) fn aggregate_inv_aug_mass_matrix(
        &mut self,
        parent: Option<&BodyNode>,
        inv_m: &mut DMatrix<f64>,
        col: usize,
    ) {
        let parent_acc = match parent {
            Some(p) => marrow_spatial::inv_transform_motion(
                &self.joint.relative_transform,
                &p.inv_mass_accel,
            ),
            None => SpatialVector::zeros(),
        };
        let k = self.joint.num_dofs();
        let s_ddq: SpatialVector = if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            let rhs =
                &self.joint.total_force - self.joint.implicit_ai_s.transpose() * parent_acc;
            let ddq = &self.joint.implicit_psi * rhs;
            for d in 0..k {
                inv_m[(i0 + d, col)] = ddq[d];
            }
            &self.joint.jacobian * ddq
        } else {
            SpatialVector::zeros()
        };
        self.inv_mass_accel = parent_acc + s_ddq;
    }

    // ------------------------------------------------------------------
    // Coriolis / gravity / combined / external force vectors
    // ------------------------------------------------------------------

    /// Forward pass shared by the Coriolis and combined vectors: the
    /// zero-acceleration body acceleration `a₀ = η + Ad(X⁻¹)·a₀_parent`.
    pub(crate) fn update_combined_vector(&mut self, parent: Option<&BodyNode>) {
        self.combined_accel = match parent {
            Some(p) => {
                marrow_spatial::inv_transform_motion(
                    &self.joint.relative_transform,
                    &p.combined_accel,
                ) + self.partial_acceleration
            }
            None => self.partial_acceleration,
        };
    }

    /// Backward pass: combined Coriolis-plus-gravity wrench, projected into
    /// the combined vector.
    pub(crate) fn aggregate_combined_vector(
        &mut self,
        descendants: Descendants<'_>,
        cg: &mut DVector<f64>,
        gravity: &Vector3<f64>,
    ) {
        let mut force = self.inertia * self.combined_accel
            + spatial_cross_force(&self.velocity, &(self.inertia * self.velocity))
            - self.gravity_wrench(gravity);
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.combined_force);
        }
        self.combined_force = force;
        self.project_into(cg, &self.combined_force, 1.0);
    }

    /// Backward pass: Coriolis/centrifugal wrench only (no gravity).
    pub(crate) fn aggregate_coriolis_force_vector(
        &mut self,
        descendants: Descendants<'_>,
        c_vec: &mut DVector<f64>,
    ) {
        let mut force = self.inertia * self.combined_accel
            + spatial_cross_force(&self.velocity, &(self.inertia * self.velocity));
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.combined_force);
        }
        self.combined_force = force;
        self.project_into(c_vec, &self.combined_force, 1.0);
    }

    /// Backward pass: gravity wrench, projected (negated) into the gravity
    /// force vector so that `M·q̈ + C + g = τ` holds.
    pub(crate) fn aggregate_gravity_force_vector(
        &mut self,
        descendants: Descendants<'_>,
        g_vec: &mut DVector<f64>,
        gravity: &Vector3<f64>,
    ) {
        let mut force = self.gravity_wrench(gravity);
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.gravity_force);
        }
        self.gravity_force = force;
        self.project_into(g_vec, &self.gravity_force, -1.0);
    }

    /// Backward pass: accumulated external wrenches, projected into the
    /// external force vector.
    pub(crate) fn aggregate_external_forces(
        &mut self,
        descendants: Descendants<'_>,
        fext: &mut DVector<f64>,
    ) {
        let mut force = self.external_force;
        for &c in &self.children {
            let child = descendants.child(c);
            force += transform_force(&child.joint.relative_transform, &child.external_aggregate);
        }
        self.external_aggregate = force;
        self.project_into(fext, &self.external_aggregate, 1.0);
    }

    /// `out[segment] += scale · Sᵀ · wrench`.
    fn project_into(&self, out: &mut DVector<f64>, wrench: &SpatialVector, scale: f64) {
        let k = self.joint.num_dofs();
        if k == 0 {
            return;
        }
        let i0 = self.joint.index_in_skeleton;
        let tau = self.joint.jacobian.transpose() * wrench;
        for d in 0..k {
            out[i0 + d] += scale * tau[d];
        }
    }

    // ------------------------------------------------------------------
    // Impulse dynamics
    // ------------------------------------------------------------------

    /// Backward pass: articulated bias impulse
    /// `β = −imp + Σ Ad*(X_c)·(β_c + AI_c·S_c·Ψ_c·u_c)` and the joint's
    /// total impulse.
    pub(crate) fn update_bias_impulse(&mut self, descendants: Descendants<'_>) {
        let mut bias = -self.constraint_impulse;
        for &c in &self.children {
            let child = descendants.child(c);
            let beta = child.bias_impulse
                + &child.joint.ai_s * (&child.joint.psi * &child.joint.total_impulse);
            bias += transform_force(&child.joint.relative_transform, &beta);
        }
        self.bias_impulse = bias;
        self.joint.update_total_impulse(&self.bias_impulse);
    }

    /// Forward pass: joint velocity change `δq̇ = Ψ·(u − Sᵀ·AI·ΔV_parent)`
    /// and body velocity change.
    pub(crate) fn update_joint_velocity_change(&mut self, parent: Option<&BodyNode>) {
        let parent_dv = match parent {
            Some(p) => marrow_spatial::inv_transform_motion(
                &self.joint.relative_transform,
                &p.velocity_change,
            ),
            None => SpatialVector::zeros(),
        };
        let k = self.joint.num_dofs();
        let s_ddq: SpatialVector = if k > 0 {
            let rhs = &self.joint.total_impulse - self.joint.ai_s.transpose() * parent_dv;
            let del_dq = &self.joint.psi * rhs;
            self.joint.velocity_change.copy_from(&del_dq);
            &self.joint.jacobian * del_dq
        } else {
            SpatialVector::zeros()
        };
        self.velocity_change = parent_dv + s_ddq;
    }

    /// Forward pass: impulse transmitted through the parent joint,
    /// `p = β + AI·ΔV`.
    pub(crate) fn update_body_imp_force_fwd_dyn(&mut self) {
        self.transmitted_impulse = self.bias_impulse + self.art_inertia * self.velocity_change;
    }

    /// Fold the impulse response into the joint coordinates and body caches:
    /// `q̇ += δq̇`, `q̈ += δq̇/Δt`, and the body velocity/acceleration follow.
    pub(crate) fn update_constrained_joint_and_body_acceleration(
        &mut self,
        dt: f64,
        gen_coords: &mut GenCoordSystem,
    ) {
        let k = self.joint.num_dofs();
        if k > 0 {
            let i0 = self.joint.index_in_skeleton;
            for d in 0..k {
                let del = self.joint.velocity_change[d];
                gen_coords.velocities[i0 + d] += del;
                gen_coords.accelerations[i0 + d] += del / dt;
            }
        }
        self.velocity += self.velocity_change;
        self.acceleration += self.velocity_change / dt;
    }

    /// Fold the transmitted impulse into the transmitted force:
    /// `F⁺ = F⁻ + p/Δt`.
    pub(crate) fn update_constrained_transmitted_force(&mut self, dt: f64) {
        self.transmitted_force += self.transmitted_impulse / dt;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Center of mass in world coordinates.
    #[must_use]
    pub fn world_com(&self) -> Vector3<f64> {
        self.world_transform.transform_point(&self.local_com.into()).coords
    }

    /// Center of mass velocity in world coordinates.
    #[must_use]
    pub fn world_com_velocity(&self) -> Vector3<f64> {
        let omega = Vector3::new(self.velocity[0], self.velocity[1], self.velocity[2]);
        let v = Vector3::new(self.velocity[3], self.velocity[4], self.velocity[5]);
        self.world_transform.rotation * (v + omega.cross(&self.local_com))
    }

    /// Center of mass acceleration in world coordinates (includes the
    /// centripetal term).
    #[must_use]
    pub fn world_com_acceleration(&self) -> Vector3<f64> {
        let omega = Vector3::new(self.velocity[0], self.velocity[1], self.velocity[2]);
        let v = Vector3::new(self.velocity[3], self.velocity[4], self.velocity[5]);
        let alpha = Vector3::new(
            self.acceleration[0],
            self.acceleration[1],
            self.acceleration[2],
        );
        let a = Vector3::new(
            self.acceleration[3],
            self.acceleration[4],
            self.acceleration[5],
        );
        let c = &self.local_com;
        self.world_transform.rotation
            * (a + alpha.cross(c) + omega.cross(&(v + omega.cross(c))))
    }

    /// Kinetic energy `½·Vᵀ·I·V`.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.velocity.dot(&(self.inertia * self.velocity))
    }

    /// Gravitational potential energy `−m·g·r_com`.
    #[must_use]
    pub fn potential_energy(&self, gravity: &Vector3<f64>) -> f64 {
        -self.mass * gravity.dot(&self.world_com())
    }
}
