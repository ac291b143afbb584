//! The skeleton: owner of the body tree and every system-level dynamic
//! quantity.
//!
//! A skeleton is built by registering body nodes in any order, then
//! finalized with [`Skeleton::init`], which reorders the bodies breadth-first
//! from the root, assigns every joint and point mass its segment of the flat
//! generalized-coordinate vector, and allocates the dof-sized buffers.
//!
//! Derived quantities (mass matrices and their inverses, Coriolis, gravity,
//! combined, and external force vectors) are cached behind dirty flags:
//! accessors recompute on miss and every state mutation raises the flags of
//! the quantities it feeds.
//!
//! All recursions run in strict breadth-first order (root→leaves) or its
//! reverse (leaves→root) over the body vector; the BFS invariant that a
//! parent's index precedes its children's makes the split-borrow loops here
//! safe.

use std::collections::VecDeque;

use marrow_spatial::{motion_adjoint, spatial_cross_motion, SpatialVector};
use nalgebra::{DMatrix, DVector, Matrix6xX, Vector3};

use crate::body::{BodyNode, Descendants, Marker};
use crate::error::SkeletonError;
use crate::gencoord::GenCoordSystem;
use crate::joint::Joint;

/// Dirty bits for the cached derived quantities.
///
/// Monotone per mutation: every public call that touches an input of a
/// quantity raises its flag before returning; the updater clears it after a
/// successful recompute.
#[derive(Debug, Clone)]
struct DirtyFlags {
    articulated_inertia: bool,
    mass_matrix: bool,
    aug_mass_matrix: bool,
    inv_mass_matrix: bool,
    inv_aug_mass_matrix: bool,
    coriolis_forces: bool,
    gravity_forces: bool,
    combined_vector: bool,
    external_forces: bool,
}

impl DirtyFlags {
    fn all_set() -> Self {
        Self {
            articulated_inertia: true,
            mass_matrix: true,
            aug_mass_matrix: true,
            inv_mass_matrix: true,
            inv_aug_mass_matrix: true,
            coriolis_forces: true,
            gravity_forces: true,
            combined_vector: true,
            external_forces: true,
        }
    }

    fn set_all(&mut self) {
        *self = Self::all_set();
    }
}

/// An articulated skeleton: a tree of rigid (and optionally soft) bodies
/// connected by joints, parameterized by flat generalized coordinates.
#[derive(Debug, Clone)]
pub struct Skeleton {
    name: String,
    time_step: f64,
    gravity: Vector3<f64>,
    mobile: bool,
    self_collision_enabled: bool,
    adjacent_body_check_enabled: bool,
    total_mass: f64,

    bodies: Vec<BodyNode>,
    soft_body_ids: Vec<usize>,
    gen_coords: GenCoordSystem,

    mass_matrix: DMatrix<f64>,
    aug_mass_matrix: DMatrix<f64>,
    inv_mass_matrix: DMatrix<f64>,
    inv_aug_mass_matrix: DMatrix<f64>,
    coriolis_forces: DVector<f64>,
    gravity_forces: DVector<f64>,
    combined_forces: DVector<f64>,
    external_forces: DVector<f64>,
    constraint_forces: DVector<f64>,
    /// Damping force buffer; allocated for layout parity but its updater is
    /// undefined, so it is never exposed.
    #[allow(dead_code)]
    damping_forces: DVector<f64>,

    dirty: DirtyFlags,
    impulse_applied: bool,

    union_parent: usize,
    union_size: usize,
}

impl Skeleton {
    /// Create an empty skeleton with default time step (1 ms) and gravity
    /// (0, 0, −9.81).
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            time_step: 0.001,
            gravity: Vector3::new(0.0, 0.0, -9.81),
            mobile: true,
            self_collision_enabled: false,
            adjacent_body_check_enabled: false,
            total_mass: 0.0,
            bodies: Vec::new(),
            soft_body_ids: Vec::new(),
            gen_coords: GenCoordSystem::new(),
            mass_matrix: DMatrix::zeros(0, 0),
            aug_mass_matrix: DMatrix::zeros(0, 0),
            inv_mass_matrix: DMatrix::zeros(0, 0),
            inv_aug_mass_matrix: DMatrix::zeros(0, 0),
            coriolis_forces: DVector::zeros(0),
            gravity_forces: DVector::zeros(0),
            combined_forces: DVector::zeros(0),
            external_forces: DVector::zeros(0),
            constraint_forces: DVector::zeros(0),
            damping_forces: DVector::zeros(0),
            dirty: DirtyFlags::all_set(),
            impulse_applied: false,
            union_parent: 0,
            union_size: 1,
        }
    }

    // ==================================================================
    // Properties
    // ==================================================================

    /// Skeleton name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the skeleton.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Simulation time step used by the implicit terms of the recursions.
    #[must_use]
    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    /// Set the time step. Must be positive. Invalidates every cached
    /// quantity (the implicit articulated inertia and the augmented
    /// matrices depend on Δt).
    pub fn set_time_step(&mut self, time_step: f64) {
        assert!(time_step > 0.0, "time step must be positive");
        self.time_step = time_step;
        self.invalidate_derived();
    }

    /// Gravity vector.
    #[must_use]
    pub fn gravity(&self) -> &Vector3<f64> {
        &self.gravity
    }

    /// Set the gravity vector. Invalidates every cached quantity.
    pub fn set_gravity(&mut self, gravity: Vector3<f64>) {
        self.gravity = gravity;
        self.invalidate_derived();
    }

    /// Total mass, captured at `init` (sum of rigid body masses).
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.total_mass
    }

    /// Whether the skeleton participates in dynamics.
    #[must_use]
    pub fn is_mobile(&self) -> bool {
        self.mobile
    }

    /// Enable or disable dynamics for this skeleton.
    pub fn set_mobile(&mut self, mobile: bool) {
        self.mobile = mobile;
    }

    /// Enable self-collision checking; `adjacent_body_check` also enables
    /// checks between bodies sharing a joint.
    pub fn enable_self_collision(&mut self, adjacent_body_check: bool) {
        self.self_collision_enabled = true;
        self.adjacent_body_check_enabled = adjacent_body_check;
    }

    /// Disable self-collision checking.
    pub fn disable_self_collision(&mut self) {
        self.self_collision_enabled = false;
        self.adjacent_body_check_enabled = false;
    }

    /// Whether self-collision checking is enabled.
    #[must_use]
    pub fn is_self_collision_enabled(&self) -> bool {
        self.self_collision_enabled
    }

    /// Whether adjacent-body collision checking is enabled.
    #[must_use]
    pub fn is_adjacent_body_check_enabled(&self) -> bool {
        self.adjacent_body_check_enabled
    }

    /// Flag consumed by the external impulse pipeline.
    pub fn set_impulse_applied(&mut self, applied: bool) {
        self.impulse_applied = applied;
    }

    /// Whether an impulse is currently flagged as applied.
    #[must_use]
    pub fn is_impulse_applied(&self) -> bool {
        self.impulse_applied
    }

    // ==================================================================
    // Union-find accessors (opaque to the core; used by an external
    // constraint grouper)
    // ==================================================================

    /// Reset this skeleton's union to a singleton rooted at `self_index`.
    pub fn reset_union(&mut self, self_index: usize) {
        self.union_parent = self_index;
        self.union_size = 1;
    }

    /// Union-find parent index.
    #[must_use]
    pub fn union_parent(&self) -> usize {
        self.union_parent
    }

    /// Set the union-find parent index.
    pub fn set_union_parent(&mut self, parent: usize) {
        self.union_parent = parent;
    }

    /// Union-find component size.
    #[must_use]
    pub fn union_size(&self) -> usize {
        self.union_size
    }

    /// Set the union-find component size.
    pub fn set_union_size(&mut self, size: usize) {
        self.union_size = size;
    }

    // ==================================================================
    // Construction and finalization
    // ==================================================================

    /// Register a body node; returns its registration index, which parent
    /// declarations refer to until `init` reorders the tree.
    pub fn add_body_node(&mut self, body: BodyNode) -> usize {
        let index = self.bodies.len();
        if body.soft_properties().is_some() {
            self.soft_body_ids.push(index);
        }
        self.bodies.push(body);
        index
    }

    /// Finalize the skeleton: validate the tree, reorder bodies
    /// breadth-first from the root, assign coordinate segments, allocate
    /// the dof-sized buffers, and run one forward-kinematics pass.
    pub fn init(&mut self, time_step: f64, gravity: Vector3<f64>) -> Result<(), SkeletonError> {
        if self.bodies.is_empty() {
            return Err(SkeletonError::Empty {
                name: self.name.clone(),
            });
        }
        assert!(time_step > 0.0, "time step must be positive");
        self.time_step = time_step;
        self.gravity = gravity;

        let n = self.bodies.len();

        // ---- Validate parent declarations and find the root ----
        let mut root = None;
        for (i, body) in self.bodies.iter().enumerate() {
            match body.parent() {
                None => match root {
                    None => root = Some(i),
                    Some(r) => {
                        return Err(SkeletonError::MultipleRoots {
                            name: self.name.clone(),
                            first: self.bodies[r].name().to_string(),
                            second: body.name().to_string(),
                        })
                    }
                },
                Some(p) if p >= n => {
                    return Err(SkeletonError::ParentOutOfRange {
                        body: body.name().to_string(),
                        parent: p,
                        count: n,
                    })
                }
                Some(_) => {}
            }
        }
        let root = root.ok_or_else(|| SkeletonError::NoRoot {
            name: self.name.clone(),
        })?;

        // ---- Breadth-first ordering from the root ----
        let mut child_lists: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, body) in self.bodies.iter().enumerate() {
            if let Some(p) = body.parent() {
                child_lists[p].push(i);
            }
        }
        let mut order = Vec::with_capacity(n);
        let mut queue = VecDeque::new();
        queue.push_back(root);
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &c in &child_lists[i] {
                queue.push_back(c);
            }
        }
        if order.len() != n {
            let mut reached = vec![false; n];
            for &i in &order {
                reached[i] = true;
            }
            let stray = (0..n).find(|&i| !reached[i]).unwrap_or(0);
            return Err(SkeletonError::Unreachable {
                body: self.bodies[stray].name().to_string(),
            });
        }

        // ---- Permute bodies into BFS order and remap tree links ----
        let mut new_index = vec![0usize; n];
        for (new_i, &old_i) in order.iter().enumerate() {
            new_index[old_i] = new_i;
        }
        let mut slots: Vec<Option<BodyNode>> = self.bodies.drain(..).map(Some).collect();
        for &old_i in &order {
            let Some(body) = slots[old_i].take() else {
                unreachable!("BFS order visits each body exactly once");
            };
            self.bodies.push(body);
        }
        for (i, body) in self.bodies.iter_mut().enumerate() {
            body.index = i;
            body.parent = body.parent.map(|p| new_index[p]);
            body.children.clear();
        }
        for i in 0..n {
            if let Some(p) = self.bodies[i].parent {
                self.bodies[p].children.push(i);
            }
        }
        self.soft_body_ids = (0..n)
            .filter(|&i| self.bodies[i].soft.is_some())
            .collect();

        // ---- Assign coordinate segments: joints first, then point masses ----
        let mut dof = 0usize;
        for body in &mut self.bodies {
            body.joint.index_in_skeleton = dof;
            dof += body.joint.num_dofs();
        }
        for i in 0..n {
            if let Some(soft) = self.bodies[i].soft.as_mut() {
                for pm in &mut soft.point_masses {
                    pm.index_in_skeleton = dof;
                    dof += 3;
                }
            }
        }
        self.gen_coords.reset(dof);

        // ---- Dependent coordinate lists (parent-first order makes this a
        // single pass) ----
        for i in 0..n {
            let mut dep = match self.bodies[i].parent {
                Some(p) => self.bodies[p].dependent_gen_coords.clone(),
                None => Vec::new(),
            };
            let j0 = self.bodies[i].joint.index_in_skeleton;
            for d in 0..self.bodies[i].joint.num_dofs() {
                dep.push(j0 + d);
            }
            self.bodies[i].dependent_gen_coords = dep;
        }

        // ---- Per-body precomputation and cache sizing ----
        for body in &mut self.bodies {
            body.update_spatial_inertia();
            let k_dep = body.dependent_gen_coords.len();
            body.body_jacobian = Matrix6xX::zeros(k_dep);
            body.body_jacobian_dot = Matrix6xX::zeros(k_dep);
            body.jacobian_dirty = true;
            body.jacobian_dot_dirty = true;
            let index = body.index;
            for marker in body.markers_mut() {
                marker.body_index = index;
            }
        }

        // ---- First kinematics pass ----
        self.compute_forward_dynamics_recursion_a();

        // ---- Allocate system-level buffers ----
        self.mass_matrix = DMatrix::zeros(dof, dof);
        self.aug_mass_matrix = DMatrix::zeros(dof, dof);
        self.inv_mass_matrix = DMatrix::zeros(dof, dof);
        self.inv_aug_mass_matrix = DMatrix::zeros(dof, dof);
        self.coriolis_forces = DVector::zeros(dof);
        self.gravity_forces = DVector::zeros(dof);
        self.combined_forces = DVector::zeros(dof);
        self.external_forces = DVector::zeros(dof);
        self.constraint_forces = DVector::zeros(dof);
        self.damping_forces = DVector::zeros(dof);

        self.clear_external_forces();
        self.clear_internal_forces();

        self.total_mass = self.bodies.iter().map(BodyNode::mass).sum();

        tracing::debug!(
            name = %self.name,
            bodies = n,
            soft_bodies = self.soft_body_ids.len(),
            dof,
            total_mass = self.total_mass,
            "initialized skeleton"
        );
        Ok(())
    }

    // ==================================================================
    // Enumeration and lookups
    // ==================================================================

    /// Number of degrees of freedom.
    #[must_use]
    pub fn dof(&self) -> usize {
        self.gen_coords.dof()
    }

    /// Number of body nodes.
    #[must_use]
    pub fn num_body_nodes(&self) -> usize {
        self.bodies.len()
    }

    /// Number of rigid (non-soft) body nodes.
    #[must_use]
    pub fn num_rigid_body_nodes(&self) -> usize {
        self.bodies.len() - self.soft_body_ids.len()
    }

    /// Number of soft body nodes.
    #[must_use]
    pub fn num_soft_body_nodes(&self) -> usize {
        self.soft_body_ids.len()
    }

    /// The root body node (index 0 after `init`).
    #[must_use]
    pub fn root_body_node(&self) -> &BodyNode {
        &self.bodies[0]
    }

    /// Body node by index.
    #[must_use]
    pub fn body_node(&self, index: usize) -> &BodyNode {
        &self.bodies[index]
    }

    /// Mutable body node by index. Conservatively invalidates every cached
    /// quantity, since the caller may change masses, forces, or joint
    /// parameters.
    pub fn body_node_mut(&mut self, index: usize) -> &mut BodyNode {
        self.invalidate_derived();
        &mut self.bodies[index]
    }

    /// Body node by name.
    #[must_use]
    pub fn body_node_by_name(&self, name: &str) -> Option<&BodyNode> {
        assert!(!name.is_empty(), "body name must be non-empty");
        self.bodies.iter().find(|b| b.name() == name)
    }

    /// Soft body node by position in the soft-body list.
    #[must_use]
    pub fn soft_body_node(&self, index: usize) -> &BodyNode {
        &self.bodies[self.soft_body_ids[index]]
    }

    /// Soft body node by name.
    #[must_use]
    pub fn soft_body_node_by_name(&self, name: &str) -> Option<&BodyNode> {
        assert!(!name.is_empty(), "body name must be non-empty");
        self.soft_body_ids
            .iter()
            .map(|&i| &self.bodies[i])
            .find(|b| b.name() == name)
    }

    /// Joint by body index (the joint connecting that body to its parent).
    #[must_use]
    pub fn joint(&self, index: usize) -> &Joint {
        &self.bodies[index].joint
    }

    /// Joint by name.
    #[must_use]
    pub fn joint_by_name(&self, name: &str) -> Option<&Joint> {
        assert!(!name.is_empty(), "joint name must be non-empty");
        self.bodies
            .iter()
            .map(|b| &b.joint)
            .find(|j| j.name() == name)
    }

    /// Marker by name, scanning every body.
    #[must_use]
    pub fn marker(&self, name: &str) -> Option<&Marker> {
        assert!(!name.is_empty(), "marker name must be non-empty");
        self.bodies
            .iter()
            .flat_map(|b| b.markers().iter())
            .find(|m| m.name == name)
    }

    // ==================================================================
    // Generalized state
    // ==================================================================

    /// Generalized positions.
    #[must_use]
    pub fn positions(&self) -> &DVector<f64> {
        self.gen_coords.positions()
    }

    /// Set the generalized positions, then refresh the selected kinematic
    /// levels.
    pub fn set_positions(
        &mut self,
        q: &DVector<f64>,
        update_transforms: bool,
        update_velocities: bool,
        update_accelerations: bool,
    ) {
        self.gen_coords.set_positions(q);
        self.compute_forward_kinematics(update_transforms, update_velocities, update_accelerations);
    }

    /// Generalized velocities.
    #[must_use]
    pub fn velocities(&self) -> &DVector<f64> {
        self.gen_coords.velocities()
    }

    /// Set the generalized velocities, then refresh the selected kinematic
    /// levels.
    pub fn set_velocities(
        &mut self,
        dq: &DVector<f64>,
        update_velocities: bool,
        update_accelerations: bool,
    ) {
        self.gen_coords.set_velocities(dq);
        self.compute_forward_kinematics(false, update_velocities, update_accelerations);
    }

    /// Generalized accelerations.
    #[must_use]
    pub fn accelerations(&self) -> &DVector<f64> {
        self.gen_coords.accelerations()
    }

    /// Set the generalized accelerations, then optionally refresh body
    /// accelerations.
    pub fn set_accelerations(&mut self, ddq: &DVector<f64>, update_accelerations: bool) {
        self.gen_coords.set_accelerations(ddq);
        self.compute_forward_kinematics(false, false, update_accelerations);
    }

    /// Concatenated state `[q; q̇]`.
    #[must_use]
    pub fn state(&self) -> DVector<f64> {
        let dof = self.dof();
        let mut x = DVector::zeros(2 * dof);
        x.rows_mut(0, dof).copy_from(self.gen_coords.positions());
        x.rows_mut(dof, dof).copy_from(self.gen_coords.velocities());
        x
    }

    /// Split a `[q; q̇]` state vector into the position and velocity
    /// channels, then refresh the selected kinematic levels. Length must be
    /// even.
    pub fn set_state(
        &mut self,
        x: &DVector<f64>,
        update_transforms: bool,
        update_velocities: bool,
        update_accelerations: bool,
    ) {
        assert!(x.len() % 2 == 0, "state vector length must be even");
        let half = x.len() / 2;
        self.gen_coords.set_positions(&x.rows(0, half).into_owned());
        self.gen_coords
            .set_velocities(&x.rows(half, half).into_owned());
        self.compute_forward_kinematics(update_transforms, update_velocities, update_accelerations);
    }

    /// Gather the positions of an arbitrary set of coordinates.
    #[must_use]
    pub fn config_segs(&self, ids: &[usize]) -> DVector<f64> {
        let mut q = DVector::zeros(ids.len());
        for (i, &id) in ids.iter().enumerate() {
            q[i] = self.gen_coords.positions[id];
        }
        q
    }

    /// Scatter positions into an arbitrary set of coordinates, then refresh
    /// the selected kinematic levels.
    pub fn set_config_segs(
        &mut self,
        ids: &[usize],
        values: &DVector<f64>,
        update_transforms: bool,
        update_velocities: bool,
        update_accelerations: bool,
    ) {
        assert_eq!(ids.len(), values.len(), "id/value length mismatch");
        for (i, &id) in ids.iter().enumerate() {
            self.gen_coords.positions[id] = values[i];
        }
        self.compute_forward_kinematics(update_transforms, update_velocities, update_accelerations);
    }

    /// Integrate positions one step from the velocity channel. No
    /// forward-kinematics refresh is performed; call
    /// [`compute_forward_kinematics`](Self::compute_forward_kinematics)
    /// afterwards.
    pub fn integrate_positions(&mut self, dt: f64) {
        for body in &self.bodies {
            body.joint
                .integrate_positions(&mut self.gen_coords.positions, &self.gen_coords.velocities, dt);
        }
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    for d in 0..3 {
                        self.gen_coords.positions[i0 + d] +=
                            self.gen_coords.velocities[i0 + d] * dt;
                    }
                }
            }
        }
    }

    /// Integrate velocities one step from the acceleration channel. No
    /// forward-kinematics refresh is performed.
    pub fn integrate_velocities(&mut self, dt: f64) {
        for body in &self.bodies {
            body.joint.integrate_velocities(
                &mut self.gen_coords.velocities,
                &self.gen_coords.accelerations,
                dt,
            );
        }
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    for d in 0..3 {
                        self.gen_coords.velocities[i0 + d] +=
                            self.gen_coords.accelerations[i0 + d] * dt;
                    }
                }
            }
        }
    }

    // ==================================================================
    // Internal and constraint forces
    // ==================================================================

    /// Current generalized forces.
    #[must_use]
    pub fn internal_force_vector(&self) -> &DVector<f64> {
        self.gen_coords.forces()
    }

    /// Set the generalized forces.
    pub fn set_internal_force_vector(&mut self, tau: &DVector<f64>) {
        self.gen_coords.set_forces(tau);
    }

    /// Zero the generalized forces.
    pub fn clear_internal_forces(&mut self) {
        self.gen_coords.forces.fill(0.0);
    }

    /// Lower generalized-force bounds.
    #[must_use]
    pub fn min_internal_forces(&self) -> &DVector<f64> {
        self.gen_coords.force_min()
    }

    /// Set the lower generalized-force bounds.
    pub fn set_min_internal_force_vector(&mut self, min: &DVector<f64>) {
        self.gen_coords.set_force_min(min);
    }

    /// Upper generalized-force bounds.
    #[must_use]
    pub fn max_internal_forces(&self) -> &DVector<f64> {
        self.gen_coords.force_max()
    }

    /// Set the upper generalized-force bounds.
    pub fn set_max_internal_force_vector(&mut self, max: &DVector<f64>) {
        self.gen_coords.set_force_max(max);
    }

    /// Constraint force vector, written by an external constraint solver.
    #[must_use]
    pub fn constraint_force_vector(&self) -> &DVector<f64> {
        &self.constraint_forces
    }

    /// Set the constraint force vector.
    pub fn set_constraint_force_vector(&mut self, fc: &DVector<f64>) {
        assert_eq!(fc.len(), self.dof(), "constraint force length mismatch");
        self.constraint_forces.copy_from(fc);
    }

    /// Zero every body's accumulated external wrench.
    pub fn clear_external_forces(&mut self) {
        for body in &mut self.bodies {
            body.clear_external_forces();
        }
        self.dirty.external_forces = true;
    }

    /// Zero every body and point-mass constraint impulse.
    pub fn clear_constraint_impulses(&mut self) {
        for body in &mut self.bodies {
            body.clear_constraint_impulse();
            if let Some(soft) = body.soft.as_mut() {
                for pm in &mut soft.point_masses {
                    pm.clear_constraint_impulse();
                }
            }
        }
    }

    // ==================================================================
    // Forward kinematics
    // ==================================================================

    /// Walk the body tree root→leaves, refreshing the selected kinematic
    /// levels, then raise every cache flag.
    pub fn compute_forward_kinematics(
        &mut self,
        update_transforms: bool,
        update_velocities: bool,
        update_accelerations: bool,
    ) {
        let n = self.bodies.len();
        if update_transforms {
            for i in 0..n {
                let (done, rest) = self.bodies.split_at_mut(i);
                let body = &mut rest[0];
                let parent = body.parent.map(|p| &done[p]);
                body.update_transform(parent, &self.gen_coords);
            }
        }
        if update_velocities {
            for i in 0..n {
                let (done, rest) = self.bodies.split_at_mut(i);
                let body = &mut rest[0];
                let parent = body.parent.map(|p| &done[p]);
                body.update_velocity(parent, &self.gen_coords);
                body.update_partial_acceleration(&self.gen_coords);
            }
        }
        if update_accelerations {
            for i in 0..n {
                let (done, rest) = self.bodies.split_at_mut(i);
                let body = &mut rest[0];
                let parent = body.parent.map(|p| &done[p]);
                body.update_acceleration(parent, &self.gen_coords);
            }
        }
        self.invalidate_derived();
    }

    /// Raise every cache flag, system-level and per-body.
    fn invalidate_derived(&mut self) {
        self.dirty.set_all();
        for body in &mut self.bodies {
            body.jacobian_dirty = true;
            body.jacobian_dot_dirty = true;
        }
    }

    // ==================================================================
    // Lazy derived quantities
    // ==================================================================

    /// Joint-space mass matrix M.
    pub fn mass_matrix(&mut self) -> &DMatrix<f64> {
        if self.dirty.mass_matrix {
            self.update_mass_matrix();
        }
        &self.mass_matrix
    }

    /// Augmented mass matrix `Mₐ = M + Δt·D + Δt²·K`.
    pub fn aug_mass_matrix(&mut self) -> &DMatrix<f64> {
        if self.dirty.aug_mass_matrix {
            self.update_aug_mass_matrix();
        }
        &self.aug_mass_matrix
    }

    /// Inverse mass matrix M⁻¹.
    pub fn inv_mass_matrix(&mut self) -> &DMatrix<f64> {
        if self.dirty.inv_mass_matrix {
            self.update_inv_mass_matrix();
        }
        &self.inv_mass_matrix
    }

    /// Inverse augmented mass matrix Mₐ⁻¹.
    pub fn inv_aug_mass_matrix(&mut self) -> &DMatrix<f64> {
        if self.dirty.inv_aug_mass_matrix {
            self.update_inv_aug_mass_matrix();
        }
        &self.inv_aug_mass_matrix
    }

    /// Coriolis/centrifugal force vector C.
    pub fn coriolis_force_vector(&mut self) -> &DVector<f64> {
        if self.dirty.coriolis_forces {
            self.update_coriolis_force_vector();
        }
        &self.coriolis_forces
    }

    /// Gravity force vector g, on the left-hand side of
    /// `M·q̈ + C + g = τ + Fext`.
    pub fn gravity_force_vector(&mut self) -> &DVector<f64> {
        if self.dirty.gravity_forces {
            self.update_gravity_force_vector();
        }
        &self.gravity_forces
    }

    /// Combined vector `Cg = C + g`.
    pub fn combined_vector(&mut self) -> &DVector<f64> {
        if self.dirty.combined_vector {
            self.update_combined_vector();
        }
        &self.combined_forces
    }

    /// External force vector Fext, including soft-body spring forces.
    pub fn external_force_vector(&mut self) -> &DVector<f64> {
        if self.dirty.external_forces {
            self.update_external_force_vector();
        }
        &self.external_forces
    }

    fn update_mass_matrix(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "mass matrix requires at least one dof");
        assert_eq!(self.mass_matrix.nrows(), dof, "mass matrix not allocated");

        self.mass_matrix.fill(0.0);
        let backup = self.gen_coords.accelerations.clone();
        let n = self.bodies.len();
        let mut e = DVector::zeros(dof);

        for j in 0..dof {
            e[j] = 1.0;
            self.gen_coords.accelerations.copy_from(&e);

            for i in 0..n {
                let (done, rest) = self.bodies.split_at_mut(i);
                let body = &mut rest[0];
                let parent = body.parent.map(|p| &done[p]);
                body.update_mass_matrix(parent, &self.gen_coords);
            }

            for i in (0..n).rev() {
                {
                    let (left, right) = self.bodies.split_at_mut(i + 1);
                    left[i].aggregate_mass_matrix(
                        Descendants {
                            nodes: right,
                            offset: i + 1,
                        },
                        &mut self.mass_matrix,
                        j,
                    );
                }
                // Bodies whose dofs all lie strictly left of column j cannot
                // contribute under lower-triangular accumulation.
                let joint = &self.bodies[i].joint;
                let local_dof = joint.num_dofs();
                if local_dof > 0 && joint.index_in_skeleton + local_dof < j {
                    break;
                }
            }

            e[j] = 0.0;
        }

        for r in 0..dof {
            for c in (r + 1)..dof {
                self.mass_matrix[(r, c)] = self.mass_matrix[(c, r)];
            }
        }

        self.add_point_mass_diagonal(|mass, _| mass, true);

        self.gen_coords.accelerations.copy_from(&backup);
        self.dirty.mass_matrix = false;
    }

    fn update_aug_mass_matrix(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "mass matrix requires at least one dof");
        assert_eq!(self.aug_mass_matrix.nrows(), dof, "mass matrix not allocated");

        self.aug_mass_matrix.fill(0.0);
        let backup = self.gen_coords.accelerations.clone();
        let n = self.bodies.len();
        let dt = self.time_step;
        let mut e = DVector::zeros(dof);

        for j in 0..dof {
            e[j] = 1.0;
            self.gen_coords.accelerations.copy_from(&e);

            for i in 0..n {
                let (done, rest) = self.bodies.split_at_mut(i);
                let body = &mut rest[0];
                let parent = body.parent.map(|p| &done[p]);
                body.update_mass_matrix(parent, &self.gen_coords);
            }

            for i in (0..n).rev() {
                {
                    let (left, right) = self.bodies.split_at_mut(i + 1);
                    let body = &mut left[i];
                    body.aggregate_aug_mass_matrix(
                        Descendants {
                            nodes: right,
                            offset: i + 1,
                        },
                        &mut self.aug_mass_matrix,
                        j,
                        dt,
                        &self.gen_coords,
                    );
                }
                let joint = &self.bodies[i].joint;
                let local_dof = joint.num_dofs();
                if local_dof > 0 && joint.index_in_skeleton + local_dof < j {
                    break;
                }
            }

            e[j] = 0.0;
        }

        for r in 0..dof {
            for c in (r + 1)..dof {
                self.aug_mass_matrix[(r, c)] = self.aug_mass_matrix[(c, r)];
            }
        }

        self.add_point_mass_diagonal(|mass, damping| mass + dt * damping, false);

        self.gen_coords.accelerations.copy_from(&backup);
        self.dirty.aug_mass_matrix = false;
    }

    /// Refresh the articulated inertias (plain and implicit) with a
    /// leaves→root pass.
    fn refresh_articulated_inertia(&mut self) {
        let n = self.bodies.len();
        let dt = self.time_step;
        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            left[i].update_art_inertia(
                Descendants {
                    nodes: right,
                    offset: i + 1,
                },
                dt,
            );
        }
    }

    fn update_inv_mass_matrix(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "inverse mass matrix requires at least one dof");
        assert_eq!(
            self.inv_mass_matrix.nrows(),
            dof,
            "inverse mass matrix not allocated"
        );

        let backup = self.gen_coords.forces.clone();
        if self.dirty.articulated_inertia {
            self.refresh_articulated_inertia();
            self.dirty.articulated_inertia = false;
        }

        let n = self.bodies.len();
        let mut e = DVector::zeros(dof);

        for j in 0..dof {
            e[j] = 1.0;
            self.gen_coords.forces.copy_from(&e);

            for i in (0..n).rev() {
                let (left, right) = self.bodies.split_at_mut(i + 1);
                left[i].update_inv_mass_matrix(
                    Descendants {
                        nodes: right,
                        offset: i + 1,
                    },
                    &self.gen_coords,
                );
            }

            for i in 0..n {
                {
                    let (done, rest) = self.bodies.split_at_mut(i);
                    let body = &mut rest[0];
                    let parent = body.parent.map(|p| &done[p]);
                    body.aggregate_inv_mass_matrix(parent, &mut self.inv_mass_matrix, j);
                }
                // Bodies whose dofs extend strictly right of column j close
                // out the column under upper-triangular accumulation.
                let joint = &self.bodies[i].joint;
                let local_dof = joint.num_dofs();
                if local_dof > 0 && joint.index_in_skeleton + local_dof > j {
                    break;
                }
            }

            e[j] = 0.0;
        }

        for r in 0..dof {
            for c in 0..r {
                self.inv_mass_matrix[(r, c)] = self.inv_mass_matrix[(c, r)];
            }
        }

        self.add_point_mass_inverse_diagonal(|mass, _| 1.0 / mass, true);

        self.gen_coords.forces.copy_from(&backup);
        self.dirty.inv_mass_matrix = false;
    }

    fn update_inv_aug_mass_matrix(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "inverse mass matrix requires at least one dof");
        assert_eq!(
            self.inv_aug_mass_matrix.nrows(),
            dof,
            "inverse mass matrix not allocated"
        );

        let backup = self.gen_coords.forces.clone();
        // The articulated inertia is a function of Δt and must be current,
        // but its flag is owned by the plain-inverse path and stays as-is.
        if self.dirty.articulated_inertia {
            self.refresh_articulated_inertia();
        }

        let n = self.bodies.len();
        let dt = self.time_step;
        let mut e = DVector::zeros(dof);

        for j in 0..dof {
            e[j] = 1.0;
            self.gen_coords.forces.copy_from(&e);

            for i in (0..n).rev() {
                let (left, right) = self.bodies.split_at_mut(i + 1);
                left[i].update_inv_aug_mass_matrix(
                    Descendants {
                        nodes: right,
                        offset: i + 1,
                    },
                    &self.gen_coords,
                );
            }

            for i in 0..n {
                {
                    let (done, rest) = self.bodies.split_at_mut(i);
                    let body = &mut rest[0];
                    let parent = body.parent.map(|p| &done[p]);
                    body.aggregate_inv_aug_mass_matrix(parent, &mut self.inv_aug_mass_matrix, j);
                }
                let joint = &self.bodies[i].joint;
                let local_dof = joint.num_dofs();
                if local_dof > 0 && joint.index_in_skeleton + local_dof > j {
                    break;
                }
            }

            e[j] = 0.0;
        }

        for r in 0..dof {
            for c in 0..r {
                self.inv_aug_mass_matrix[(r, c)] = self.inv_aug_mass_matrix[(c, r)];
            }
        }

        self.add_point_mass_inverse_diagonal(|mass, damping| 1.0 / (mass + dt * damping), false);

        self.gen_coords.forces.copy_from(&backup);
        self.dirty.inv_aug_mass_matrix = false;
    }

    /// Write point-mass diagonal entries into the (augmented) mass matrix.
    fn add_point_mass_diagonal(&mut self, entry: impl Fn(f64, f64) -> f64, plain: bool) {
        let target = if plain {
            &mut self.mass_matrix
        } else {
            &mut self.aug_mass_matrix
        };
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                for pm in soft.point_masses() {
                    let value = entry(pm.mass(), soft.damping_coefficient);
                    let i0 = pm.index_in_skeleton;
                    for d in 0..3 {
                        target[(i0 + d, i0 + d)] = value;
                    }
                }
            }
        }
    }

    /// Write point-mass diagonal entries into the (augmented) inverse mass
    /// matrix.
    fn add_point_mass_inverse_diagonal(&mut self, entry: impl Fn(f64, f64) -> f64, plain: bool) {
        let target = if plain {
            &mut self.inv_mass_matrix
        } else {
            &mut self.inv_aug_mass_matrix
        };
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                for pm in soft.point_masses() {
                    let value = entry(pm.mass(), soft.damping_coefficient);
                    let i0 = pm.index_in_skeleton;
                    for d in 0..3 {
                        target[(i0 + d, i0 + d)] = value;
                    }
                }
            }
        }
    }

    fn update_coriolis_force_vector(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "coriolis vector requires at least one dof");
        assert_eq!(self.coriolis_forces.len(), dof, "buffers not allocated");

        self.coriolis_forces.fill(0.0);
        let n = self.bodies.len();

        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_combined_vector(parent);
        }
        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            left[i].aggregate_coriolis_force_vector(
                Descendants {
                    nodes: right,
                    offset: i + 1,
                },
                &mut self.coriolis_forces,
            );
        }

        self.dirty.coriolis_forces = false;
    }

    fn update_gravity_force_vector(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "gravity vector requires at least one dof");
        assert_eq!(self.gravity_forces.len(), dof, "buffers not allocated");

        self.gravity_forces.fill(0.0);
        let n = self.bodies.len();
        let gravity = self.gravity;

        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            left[i].aggregate_gravity_force_vector(
                Descendants {
                    nodes: right,
                    offset: i + 1,
                },
                &mut self.gravity_forces,
                &gravity,
            );
        }

        // Point masses: body-frame gravity rows.
        for &s in &self.soft_body_ids {
            let rotation = self.bodies[s].world_transform().rotation;
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                let g_body = rotation.inverse() * gravity;
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    for d in 0..3 {
                        self.gravity_forces[i0 + d] = -pm.mass() * g_body[d];
                    }
                }
            }
        }

        self.dirty.gravity_forces = false;
    }

    fn update_combined_vector(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "combined vector requires at least one dof");
        assert_eq!(self.combined_forces.len(), dof, "buffers not allocated");

        self.combined_forces.fill(0.0);
        let n = self.bodies.len();
        let gravity = self.gravity;

        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_combined_vector(parent);
        }
        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            left[i].aggregate_combined_vector(
                Descendants {
                    nodes: right,
                    offset: i + 1,
                },
                &mut self.combined_forces,
                &gravity,
            );
        }

        // Point masses contribute their gravity rows (Coriolis rows are
        // zero in the decoupled particle model).
        for &s in &self.soft_body_ids {
            let rotation = self.bodies[s].world_transform().rotation;
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                let g_body = rotation.inverse() * gravity;
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    for d in 0..3 {
                        self.combined_forces[i0 + d] = -pm.mass() * g_body[d];
                    }
                }
            }
        }

        self.dirty.combined_vector = false;
    }

    fn update_external_force_vector(&mut self) {
        let dof = self.dof();
        assert!(dof > 0, "external force vector requires at least one dof");
        assert_eq!(self.external_forces.len(), dof, "buffers not allocated");

        self.external_forces.fill(0.0);
        let n = self.bodies.len();

        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            left[i].aggregate_external_forces(
                Descendants {
                    nodes: right,
                    offset: i + 1,
                },
                &mut self.external_forces,
            );
        }

        // Soft-body spring forces: vertex springs restore each point mass
        // toward its rest displacement, edge springs couple neighbors, with
        // an implicit Δt·velocity term for stability.
        let dt = self.time_step;
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                let kv = soft.vertex_stiffness;
                let ke = soft.edge_stiffness;
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    let n_conn = pm.num_connected() as f64;
                    let q = Vector3::new(
                        self.gen_coords.positions[i0],
                        self.gen_coords.positions[i0 + 1],
                        self.gen_coords.positions[i0 + 2],
                    );
                    let dq = Vector3::new(
                        self.gen_coords.velocities[i0],
                        self.gen_coords.velocities[i0 + 1],
                        self.gen_coords.velocities[i0 + 2],
                    );

                    let stiffness = kv + n_conn * ke;
                    let mut f = -stiffness * q - (dt * stiffness) * dq;

                    for &nb in pm.connections() {
                        let other = soft.point_mass(nb);
                        let o0 = other.index_in_skeleton;
                        let oq = Vector3::new(
                            self.gen_coords.positions[o0],
                            self.gen_coords.positions[o0 + 1],
                            self.gen_coords.positions[o0 + 2],
                        );
                        let odq = Vector3::new(
                            self.gen_coords.velocities[o0],
                            self.gen_coords.velocities[o0 + 1],
                            self.gen_coords.velocities[o0 + 2],
                        );
                        f += ke * (oq + dt * odq);
                    }

                    for d in 0..3 {
                        self.external_forces[i0 + d] = f[d];
                    }
                }
            }
        }

        self.dirty.external_forces = false;
    }

    // ==================================================================
    // Forward dynamics (articulated-body algorithm)
    // ==================================================================

    /// Run the full forward-dynamics pipeline: kinematics refresh, then the
    /// articulated backward/forward sweeps, writing joint accelerations.
    pub fn compute_forward_dynamics(&mut self) {
        self.compute_forward_dynamics_recursion_a();
        self.compute_forward_dynamics_recursion_b();
    }

    /// Part A: refresh transforms, velocities, and velocity-product
    /// accelerations root→leaves, then raise every cache flag.
    pub fn compute_forward_dynamics_recursion_a(&mut self) {
        let n = self.bodies.len();
        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_transform(parent, &self.gen_coords);
            body.update_velocity(parent, &self.gen_coords);
            body.update_partial_acceleration(&self.gen_coords);
        }
        self.invalidate_derived();
    }

    /// Part B: articulated inertia and bias force leaves→root, then joint
    /// and body accelerations plus transmitted forces root→leaves.
    pub fn compute_forward_dynamics_recursion_b(&mut self) {
        let n = self.bodies.len();
        let dt = self.time_step;
        let gravity = self.gravity;

        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            let descendants = Descendants {
                nodes: right,
                offset: i + 1,
            };
            let body = &mut left[i];
            body.update_art_inertia(descendants, dt);
            body.update_bias_force(descendants, &gravity, dt, &self.gen_coords);
        }
        self.dirty.articulated_inertia = false;

        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_joint_and_body_acceleration(parent, &mut self.gen_coords.accelerations);
            body.update_transmitted_force();
        }
    }

    // ==================================================================
    // Inverse dynamics (recursive Newton-Euler)
    // ==================================================================

    /// Compute the generalized forces that produce the current
    /// accelerations, writing them into the force channel.
    pub fn compute_inverse_dynamics(
        &mut self,
        with_external_forces: bool,
        with_damping_forces: bool,
    ) {
        self.compute_inverse_dynamics_recursion_a();
        self.compute_inverse_dynamics_recursion_b(with_external_forces, with_damping_forces);
    }

    /// Part A: full kinematics refresh (transforms, velocities,
    /// velocity-product and body accelerations), then raise every cache
    /// flag.
    pub fn compute_inverse_dynamics_recursion_a(&mut self) {
        let n = self.bodies.len();
        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_transform(parent, &self.gen_coords);
            body.update_velocity(parent, &self.gen_coords);
            body.update_partial_acceleration(&self.gen_coords);
            body.update_acceleration(parent, &self.gen_coords);
        }
        self.invalidate_derived();
    }

    /// Part B: Newton-Euler wrenches and generalized forces leaves→root.
    pub fn compute_inverse_dynamics_recursion_b(
        &mut self,
        with_external_forces: bool,
        with_damping_forces: bool,
    ) {
        if self.dof() == 0 {
            return;
        }
        let n = self.bodies.len();
        let gravity = self.gravity;
        for i in (0..n).rev() {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            let descendants = Descendants {
                nodes: right,
                offset: i + 1,
            };
            let body = &mut left[i];
            body.update_body_force(descendants, &gravity, with_external_forces);
            body.update_generalized_force(with_damping_forces, &mut self.gen_coords);
        }

        // Point masses follow the decoupled particle model:
        // τ = m·q̈ + g − Fext, with no Coriolis term.
        let dt = self.time_step;
        for &s in &self.soft_body_ids {
            let rotation = self.bodies[s].world_transform().rotation;
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                let g_body = rotation.inverse() * gravity;
                let kv = soft.vertex_stiffness;
                let ke = soft.edge_stiffness;
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    let q = Vector3::new(
                        self.gen_coords.positions[i0],
                        self.gen_coords.positions[i0 + 1],
                        self.gen_coords.positions[i0 + 2],
                    );
                    let dq = Vector3::new(
                        self.gen_coords.velocities[i0],
                        self.gen_coords.velocities[i0 + 1],
                        self.gen_coords.velocities[i0 + 2],
                    );

                    let mut spring = Vector3::zeros();
                    if with_external_forces {
                        let stiffness = kv + pm.num_connected() as f64 * ke;
                        spring = -stiffness * q - (dt * stiffness) * dq;
                        for &nb in pm.connections() {
                            let other = soft.point_mass(nb);
                            let o0 = other.index_in_skeleton;
                            let oq = Vector3::new(
                                self.gen_coords.positions[o0],
                                self.gen_coords.positions[o0 + 1],
                                self.gen_coords.positions[o0 + 2],
                            );
                            let odq = Vector3::new(
                                self.gen_coords.velocities[o0],
                                self.gen_coords.velocities[o0 + 1],
                                self.gen_coords.velocities[o0 + 2],
                            );
                            spring += ke * (oq + dt * odq);
                        }
                    }

                    for d in 0..3 {
                        self.gen_coords.forces[i0 + d] = pm.mass()
                            * (self.gen_coords.accelerations[i0 + d] - g_body[d])
                            - spring[d];
                    }
                }
            }
        }
    }

    // ==================================================================
    // Hybrid dynamics (declared, unimplemented)
    // ==================================================================

    /// Hybrid dynamics is not implemented; logs a warning and returns.
    pub fn compute_hybrid_dynamics(&mut self) {
        tracing::warn!("hybrid dynamics is not implemented");
    }

    /// Hybrid dynamics recursion A; not implemented.
    pub fn compute_hybrid_dynamics_recursion_a(&mut self) {
        tracing::warn!("hybrid dynamics is not implemented");
    }

    /// Hybrid dynamics recursion B; not implemented.
    pub fn compute_hybrid_dynamics_recursion_b(&mut self) {
        tracing::warn!("hybrid dynamics is not implemented");
    }

    // ==================================================================
    // Impulse-based dynamics
    // ==================================================================

    fn debug_assert_impulses_clear(&self) {
        debug_assert!(
            self.bodies
                .iter()
                .all(|b| b.constraint_impulse() == &SpatialVector::zeros()),
            "constraint impulses must be zero before seeding a bias impulse"
        );
    }

    /// Walk from `body_index` to the root, refreshing each ancestor's bias
    /// impulse.
    pub fn update_bias_impulse(&mut self, body_index: usize) {
        assert!(body_index < self.bodies.len(), "body index out of range");
        assert!(self.dof() > 0, "impulse dynamics requires at least one dof");
        self.debug_assert_impulses_clear();
        self.propagate_bias_impulse(body_index);
    }

    /// Seed `body_index` with a constraint impulse, walk to the root, then
    /// zero the seeded impulse.
    pub fn update_bias_impulse_with_impulse(&mut self, body_index: usize, impulse: SpatialVector) {
        assert!(body_index < self.bodies.len(), "body index out of range");
        assert!(self.dof() > 0, "impulse dynamics requires at least one dof");
        self.debug_assert_impulses_clear();

        self.bodies[body_index].set_constraint_impulse(impulse);
        self.propagate_bias_impulse(body_index);
        self.bodies[body_index].clear_constraint_impulse();
    }

    /// Seed a point mass with a constraint impulse, walk its soft body's
    /// ancestors, then restore the point mass's prior impulse exactly.
    pub fn update_bias_impulse_for_point_mass(
        &mut self,
        soft_index: usize,
        point_mass_index: usize,
        impulse: Vector3<f64>,
    ) {
        assert!(soft_index < self.soft_body_ids.len(), "soft body index out of range");
        assert!(self.dof() > 0, "impulse dynamics requires at least one dof");
        self.debug_assert_impulses_clear();

        let body_index = self.soft_body_ids[soft_index];
        let old = {
            let Some(soft) = self.bodies[body_index].soft.as_mut() else {
                unreachable!("soft body list only holds bodies with soft properties");
            };
            let pm = pm_mut(soft, point_mass_index);
            let old = *pm.constraint_impulse();
            pm.set_constraint_impulse(impulse);
            old
        };

        self.propagate_bias_impulse(body_index);

        if let Some(soft) = self.bodies[body_index].soft.as_mut() {
            pm_mut(soft, point_mass_index).set_constraint_impulse(old);
        }
    }

    fn propagate_bias_impulse(&mut self, start: usize) {
        let mut current = Some(start);
        while let Some(i) = current {
            let (left, right) = self.bodies.split_at_mut(i + 1);
            let body = &mut left[i];
            body.update_bias_impulse(Descendants {
                nodes: right,
                offset: i + 1,
            });
            current = body.parent;
        }
    }

    /// Forward pass propagating joint velocity changes from the current
    /// bias impulses.
    pub fn update_velocity_change(&mut self) {
        let n = self.bodies.len();
        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_joint_velocity_change(parent);
        }
    }

    /// Impulse-based forward dynamics: fold the current constraint
    /// impulses into velocities, accelerations, and transmitted forces.
    ///
    /// No-op when the skeleton is immobile or has no dofs.
    pub fn compute_impulse_forward_dynamics(&mut self) {
        if !self.mobile || self.dof() == 0 {
            return;
        }
        let n = self.bodies.len();
        let dt = self.time_step;

        if self.dirty.articulated_inertia {
            for i in (0..n).rev() {
                let (left, right) = self.bodies.split_at_mut(i + 1);
                let descendants = Descendants {
                    nodes: right,
                    offset: i + 1,
                };
                let body = &mut left[i];
                body.update_art_inertia(descendants, dt);
                body.update_bias_impulse(descendants);
            }
            self.dirty.articulated_inertia = false;
        } else {
            for i in (0..n).rev() {
                let (left, right) = self.bodies.split_at_mut(i + 1);
                left[i].update_bias_impulse(Descendants {
                    nodes: right,
                    offset: i + 1,
                });
            }
        }

        for i in 0..n {
            let (done, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            let parent = body.parent.map(|p| &done[p]);
            body.update_joint_velocity_change(parent);
            body.update_body_imp_force_fwd_dyn();
        }

        for i in 0..n {
            let (_, rest) = self.bodies.split_at_mut(i);
            let body = &mut rest[0];
            body.update_constrained_joint_and_body_acceleration(dt, &mut self.gen_coords);
            body.update_constrained_transmitted_force(dt);
        }

        // Point masses respond as decoupled particles: δq̇ = imp / m.
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    let del = *pm.constraint_impulse() / pm.mass();
                    for d in 0..3 {
                        self.gen_coords.velocities[i0 + d] += del[d];
                        self.gen_coords.accelerations[i0 + d] += del[d] / dt;
                    }
                }
            }
        }
    }

    // ==================================================================
    // Jacobians
    // ==================================================================

    fn ensure_body_jacobian(&mut self, index: usize) {
        if !self.bodies[index].jacobian_dirty {
            return;
        }
        if let Some(p) = self.bodies[index].parent {
            self.ensure_body_jacobian(p);
        }
        let (left, right) = self.bodies.split_at_mut(index);
        let body = &mut right[0];
        match body.parent {
            None => {
                body.body_jacobian = body.joint.jacobian.clone();
            }
            Some(p) => {
                let parent = &left[p];
                let n_par = parent.dependent_gen_coords.len();
                let k = body.joint.num_dofs();
                let adj = motion_adjoint(&body.joint.relative_transform.inverse());
                let transformed = adj * &parent.body_jacobian;
                let mut jac = Matrix6xX::zeros(n_par + k);
                jac.columns_mut(0, n_par).copy_from(&transformed);
                jac.columns_mut(n_par, k).copy_from(&body.joint.jacobian);
                body.body_jacobian = jac;
            }
        }
        body.jacobian_dirty = false;
    }

    fn ensure_body_jacobian_dot(&mut self, index: usize) {
        self.ensure_body_jacobian(index);
        if !self.bodies[index].jacobian_dot_dirty {
            return;
        }
        if let Some(p) = self.bodies[index].parent {
            self.ensure_body_jacobian_dot(p);
        }
        let (left, right) = self.bodies.split_at_mut(index);
        let body = &mut right[0];
        match body.parent {
            None => {
                body.body_jacobian_dot = body.joint.jacobian_dot.clone();
            }
            Some(p) => {
                let parent = &left[p];
                let n_par = parent.dependent_gen_coords.len();
                let k = body.joint.num_dofs();
                let adj = motion_adjoint(&body.joint.relative_transform.inverse());
                let joint_vel = body.joint.joint_velocity(&self.gen_coords.velocities);

                let mut jac_dot = Matrix6xX::zeros(n_par + k);
                // d/dt[Ad(X⁻¹)·Jₚ] = Ad(X⁻¹)·J̇ₚ − ad(S·q̇)·Ad(X⁻¹)·Jₚ
                let transformed = adj * &parent.body_jacobian;
                let transformed_dot = adj * &parent.body_jacobian_dot;
                for c in 0..n_par {
                    let col: SpatialVector = transformed_dot.column(c).into_owned()
                        - spatial_cross_motion(&joint_vel, &transformed.column(c).into_owned());
                    jac_dot.set_column(c, &col);
                }
                jac_dot
                    .columns_mut(n_par, k)
                    .copy_from(&body.joint.jacobian_dot);
                body.body_jacobian_dot = jac_dot;
            }
        }
        body.jacobian_dot_dirty = false;
    }

    /// World-frame Jacobian of a point fixed on a body (body-local
    /// `offset`): 6×k, one column per dependent coordinate, angular rows on
    /// top.
    pub fn world_jacobian(&mut self, body_index: usize, offset: &Vector3<f64>) -> Matrix6xX<f64> {
        self.ensure_body_jacobian(body_index);
        let body = &self.bodies[body_index];
        let rotation = body.world_transform().rotation;
        let k = body.dependent_gen_coords.len();

        let mut out = Matrix6xX::zeros(k);
        for c in 0..k {
            let col = body.body_jacobian.column(c);
            let ang = Vector3::new(col[0], col[1], col[2]);
            let lin = Vector3::new(col[3], col[4], col[5]);
            let ang_w = rotation * ang;
            let lin_w = rotation * (lin + ang.cross(offset));
            out.set_column(
                c,
                &SpatialVector::new(ang_w.x, ang_w.y, ang_w.z, lin_w.x, lin_w.y, lin_w.z),
            );
        }
        out
    }

    /// Time derivative of [`world_jacobian`](Self::world_jacobian).
    pub fn world_jacobian_time_deriv(
        &mut self,
        body_index: usize,
        offset: &Vector3<f64>,
    ) -> Matrix6xX<f64> {
        self.ensure_body_jacobian_dot(body_index);
        let body = &self.bodies[body_index];
        let rotation = body.world_transform().rotation;
        let velocity = body.body_velocity();
        let omega = Vector3::new(velocity[0], velocity[1], velocity[2]);
        let k = body.dependent_gen_coords.len();

        let mut out = Matrix6xX::zeros(k);
        for c in 0..k {
            let col = body.body_jacobian.column(c);
            let dcol = body.body_jacobian_dot.column(c);
            let ang = Vector3::new(col[0], col[1], col[2]);
            let lin = Vector3::new(col[3], col[4], col[5]);
            let dang = Vector3::new(dcol[0], dcol[1], dcol[2]);
            let dlin = Vector3::new(dcol[3], dcol[4], dcol[5]);

            let ang_w = rotation * (omega.cross(&ang) + dang);
            let lin_w =
                rotation * (omega.cross(&(lin + ang.cross(offset))) + dlin + dang.cross(offset));
            out.set_column(
                c,
                &SpatialVector::new(ang_w.x, ang_w.y, ang_w.z, lin_w.x, lin_w.y, lin_w.z),
            );
        }
        out
    }

    // ==================================================================
    // Center of mass and energy
    // ==================================================================

    /// Mass-weighted world center of mass.
    #[must_use]
    pub fn world_com(&self) -> Vector3<f64> {
        assert!(self.total_mass != 0.0, "total mass is zero");
        let mut com = Vector3::zeros();
        for body in &self.bodies {
            com += body.mass() * body.world_com();
        }
        com / self.total_mass
    }

    /// World center-of-mass velocity.
    #[must_use]
    pub fn world_com_velocity(&self) -> Vector3<f64> {
        assert!(self.total_mass != 0.0, "total mass is zero");
        let mut vel = Vector3::zeros();
        for body in &self.bodies {
            vel += body.mass() * body.world_com_velocity();
        }
        vel / self.total_mass
    }

    /// World center-of-mass acceleration.
    #[must_use]
    pub fn world_com_acceleration(&self) -> Vector3<f64> {
        assert!(self.total_mass != 0.0, "total mass is zero");
        let mut acc = Vector3::zeros();
        for body in &self.bodies {
            acc += body.mass() * body.world_com_acceleration();
        }
        acc / self.total_mass
    }

    /// 3×dof Jacobian of the world center of mass.
    pub fn world_com_jacobian(&mut self) -> DMatrix<f64> {
        assert!(self.total_mass != 0.0, "total mass is zero");
        let dof = self.dof();
        let mut jac = DMatrix::zeros(3, dof);

        for i in 0..self.bodies.len() {
            let local_com = *self.bodies[i].local_com();
            let mass = self.bodies[i].mass();
            let body_jac = self.world_jacobian(i, &local_com);
            let deps = self.bodies[i].dependent_gen_coords().to_vec();
            for (c, &gc) in deps.iter().enumerate() {
                for row in 0..3 {
                    jac[(row, gc)] += mass * body_jac[(3 + row, c)];
                }
            }
        }
        jac / self.total_mass
    }

    /// 3×dof time derivative of the world center-of-mass Jacobian.
    pub fn world_com_jacobian_time_deriv(&mut self) -> DMatrix<f64> {
        assert!(self.total_mass != 0.0, "total mass is zero");
        let dof = self.dof();
        let mut jac = DMatrix::zeros(3, dof);

        for i in 0..self.bodies.len() {
            let local_com = *self.bodies[i].local_com();
            let mass = self.bodies[i].mass();
            let body_jac = self.world_jacobian_time_deriv(i, &local_com);
            let deps = self.bodies[i].dependent_gen_coords().to_vec();
            for (c, &gc) in deps.iter().enumerate() {
                for row in 0..3 {
                    jac[(row, gc)] += mass * body_jac[(3 + row, c)];
                }
            }
        }
        jac / self.total_mass
    }

    /// Total kinetic energy (bodies plus point masses). Non-negative.
    #[must_use]
    pub fn kinetic_energy(&self) -> f64 {
        let mut ke = 0.0;
        for body in &self.bodies {
            ke += body.kinetic_energy();
        }
        for &s in &self.soft_body_ids {
            if let Some(soft) = self.bodies[s].soft.as_ref() {
                for pm in soft.point_masses() {
                    let i0 = pm.index_in_skeleton;
                    let dq = Vector3::new(
                        self.gen_coords.velocities[i0],
                        self.gen_coords.velocities[i0 + 1],
                        self.gen_coords.velocities[i0 + 2],
                    );
                    ke += 0.5 * pm.mass() * dq.norm_squared();
                }
            }
        }
        assert!(ke >= 0.0, "kinetic energy must be non-negative");
        ke
    }

    /// Total potential energy: gravity on the bodies plus joint springs.
    #[must_use]
    pub fn potential_energy(&self) -> f64 {
        let mut pe = 0.0;
        for body in &self.bodies {
            pe += body.potential_energy(&self.gravity);
            pe += body.parent_joint().potential_energy(&self.gen_coords.positions);
        }
        pe
    }
}

/// Mutable point-mass access with a bounds assertion.
fn pm_mut(
    soft: &mut crate::soft::SoftBodyProperties,
    index: usize,
) -> &mut crate::soft::PointMass {
    assert!(index < soft.num_point_masses(), "point mass index out of range");
    soft.point_mass_mut(index)
}
