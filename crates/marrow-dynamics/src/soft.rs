//! Deformable bodies: point-mass clouds attached to a body node.
//!
//! A soft body is an ordinary [`BodyNode`](crate::BodyNode) carrying
//! [`SoftBodyProperties`]: a set of point masses, each owning three
//! generalized coordinates (its displacement in the body frame), connected
//! to neighboring point masses by edge springs and to its rest position by a
//! vertex spring. The skeleton folds the spring forces into the external
//! force vector and gives each point mass a diagonal block of the mass
//! matrices.

use nalgebra::Vector3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A particle with three translational degrees of freedom in the skeleton's
/// generalized-coordinate vector.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PointMass {
    mass: f64,
    /// Rest position in the owning body's frame.
    rest_position: Vector3<f64>,
    /// Indices of connected point masses within the owning soft body.
    connections: Vec<usize>,
    /// Constraint impulse written by an external constraint solver.
    pub(crate) constraint_impulse: Vector3<f64>,
    /// Skeleton index of this point mass's first coordinate; assigned at
    /// init.
    pub(crate) index_in_skeleton: usize,
}

impl PointMass {
    /// Create a point mass at a body-frame rest position.
    #[must_use]
    pub fn new(mass: f64, rest_position: Vector3<f64>) -> Self {
        assert!(mass > 0.0, "point mass must be positive");
        Self {
            mass,
            rest_position,
            connections: Vec::new(),
            constraint_impulse: Vector3::zeros(),
            index_in_skeleton: 0,
        }
    }

    /// Particle mass.
    #[must_use]
    pub fn mass(&self) -> f64 {
        self.mass
    }

    /// Rest position in the owning body's frame.
    #[must_use]
    pub fn rest_position(&self) -> &Vector3<f64> {
        &self.rest_position
    }

    /// Connect this point mass to another (one direction; call on both
    /// sides for a symmetric edge).
    pub fn connect(&mut self, other: usize) {
        if !self.connections.contains(&other) {
            self.connections.push(other);
        }
    }

    /// Indices of connected point masses within the owning soft body.
    #[must_use]
    pub fn connections(&self) -> &[usize] {
        &self.connections
    }

    /// Number of connected point masses.
    #[must_use]
    pub fn num_connected(&self) -> usize {
        self.connections.len()
    }

    /// Skeleton index of this point mass's first coordinate (valid after
    /// `init`).
    #[must_use]
    pub fn index_in_skeleton(&self) -> usize {
        self.index_in_skeleton
    }

    /// Constraint impulse currently set on this point mass.
    #[must_use]
    pub fn constraint_impulse(&self) -> &Vector3<f64> {
        &self.constraint_impulse
    }

    /// Set the constraint impulse (written by an external constraint
    /// solver).
    pub fn set_constraint_impulse(&mut self, impulse: Vector3<f64>) {
        self.constraint_impulse = impulse;
    }

    /// Zero the constraint impulse.
    pub fn clear_constraint_impulse(&mut self) {
        self.constraint_impulse = Vector3::zeros();
    }
}

/// Spring parameters and point masses of a deformable body.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftBodyProperties {
    /// Vertex spring stiffness kᵥ, restoring each point mass toward its
    /// rest position.
    pub vertex_stiffness: f64,
    /// Edge spring stiffness kₑ between connected point masses.
    pub edge_stiffness: f64,
    /// Damping coefficient applied to point-mass velocities.
    pub damping_coefficient: f64,
    pub(crate) point_masses: Vec<PointMass>,
}

impl SoftBodyProperties {
    /// Create soft-body properties with the given spring parameters.
    #[must_use]
    pub fn new(vertex_stiffness: f64, edge_stiffness: f64, damping_coefficient: f64) -> Self {
        assert!(vertex_stiffness >= 0.0, "vertex stiffness must be non-negative");
        assert!(edge_stiffness >= 0.0, "edge stiffness must be non-negative");
        assert!(damping_coefficient >= 0.0, "damping must be non-negative");
        Self {
            vertex_stiffness,
            edge_stiffness,
            damping_coefficient,
            point_masses: Vec::new(),
        }
    }

    /// Add a point mass; returns its index within this soft body.
    pub fn add_point_mass(&mut self, point_mass: PointMass) -> usize {
        self.point_masses.push(point_mass);
        self.point_masses.len() - 1
    }

    /// Connect two point masses with a symmetric edge.
    pub fn connect_point_masses(&mut self, a: usize, b: usize) {
        assert!(a != b, "cannot connect a point mass to itself");
        self.point_masses[a].connect(b);
        self.point_masses[b].connect(a);
    }

    /// Number of point masses.
    #[must_use]
    pub fn num_point_masses(&self) -> usize {
        self.point_masses.len()
    }

    /// Access a point mass by index.
    #[must_use]
    pub fn point_mass(&self, index: usize) -> &PointMass {
        &self.point_masses[index]
    }

    /// Mutable access to a point mass.
    pub fn point_mass_mut(&mut self, index: usize) -> &mut PointMass {
        &mut self.point_masses[index]
    }

    /// Iterate over the point masses.
    pub fn point_masses(&self) -> impl Iterator<Item = &PointMass> {
        self.point_masses.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_are_symmetric() {
        let mut soft = SoftBodyProperties::new(10.0, 2.0, 0.1);
        let a = soft.add_point_mass(PointMass::new(0.5, Vector3::zeros()));
        let b = soft.add_point_mass(PointMass::new(0.5, Vector3::new(0.1, 0.0, 0.0)));
        soft.connect_point_masses(a, b);
        assert_eq!(soft.point_mass(a).connections(), &[b]);
        assert_eq!(soft.point_mass(b).connections(), &[a]);
        assert_eq!(soft.point_mass(a).num_connected(), 1);
    }

    #[test]
    #[should_panic(expected = "positive")]
    fn zero_mass_is_rejected() {
        let _ = PointMass::new(0.0, Vector3::zeros());
    }
}
