//! Flat generalized-coordinate storage.
//!
//! Every scalar degree of freedom in a skeleton — joint coordinates first in
//! breadth-first body order, then point-mass coordinates — lives in one of
//! the parallel vectors held here. Joints and point masses cache the start
//! index of their segment, assigned during `Skeleton::init`.

use nalgebra::DVector;

/// Structure-of-arrays store for scalar generalized coordinates: position,
/// velocity, acceleration, and force channels, plus force bounds.
#[derive(Debug, Clone)]
pub struct GenCoordSystem {
    pub(crate) positions: DVector<f64>,
    pub(crate) velocities: DVector<f64>,
    pub(crate) accelerations: DVector<f64>,
    pub(crate) forces: DVector<f64>,
    pub(crate) force_min: DVector<f64>,
    pub(crate) force_max: DVector<f64>,
}

impl GenCoordSystem {
    /// Create an empty coordinate system (zero degrees of freedom).
    #[must_use]
    pub fn new() -> Self {
        Self::with_dof(0)
    }

    /// Create a coordinate system with `dof` zeroed coordinates and
    /// unbounded force limits.
    #[must_use]
    pub fn with_dof(dof: usize) -> Self {
        Self {
            positions: DVector::zeros(dof),
            velocities: DVector::zeros(dof),
            accelerations: DVector::zeros(dof),
            forces: DVector::zeros(dof),
            force_min: DVector::from_element(dof, f64::NEG_INFINITY),
            force_max: DVector::from_element(dof, f64::INFINITY),
        }
    }

    /// Number of scalar degrees of freedom.
    #[must_use]
    pub fn dof(&self) -> usize {
        self.positions.len()
    }

    /// Reset to `dof` zeroed coordinates, dropping all previous state.
    pub(crate) fn reset(&mut self, dof: usize) {
        *self = Self::with_dof(dof);
    }

    /// Position channel.
    #[must_use]
    pub fn positions(&self) -> &DVector<f64> {
        &self.positions
    }

    /// Velocity channel.
    #[must_use]
    pub fn velocities(&self) -> &DVector<f64> {
        &self.velocities
    }

    /// Acceleration channel.
    #[must_use]
    pub fn accelerations(&self) -> &DVector<f64> {
        &self.accelerations
    }

    /// Force channel.
    #[must_use]
    pub fn forces(&self) -> &DVector<f64> {
        &self.forces
    }

    /// Overwrite the position channel. Length must match `dof()`.
    pub fn set_positions(&mut self, q: &DVector<f64>) {
        assert_eq!(q.len(), self.dof(), "position vector length mismatch");
        self.positions.copy_from(q);
    }

    /// Overwrite the velocity channel. Length must match `dof()`.
    pub fn set_velocities(&mut self, dq: &DVector<f64>) {
        assert_eq!(dq.len(), self.dof(), "velocity vector length mismatch");
        self.velocities.copy_from(dq);
    }

    /// Overwrite the acceleration channel. Length must match `dof()`.
    pub fn set_accelerations(&mut self, ddq: &DVector<f64>) {
        assert_eq!(ddq.len(), self.dof(), "acceleration vector length mismatch");
        self.accelerations.copy_from(ddq);
    }

    /// Overwrite the force channel. Length must match `dof()`.
    pub fn set_forces(&mut self, tau: &DVector<f64>) {
        assert_eq!(tau.len(), self.dof(), "force vector length mismatch");
        self.forces.copy_from(tau);
    }

    /// Lower force bounds.
    #[must_use]
    pub fn force_min(&self) -> &DVector<f64> {
        &self.force_min
    }

    /// Upper force bounds.
    #[must_use]
    pub fn force_max(&self) -> &DVector<f64> {
        &self.force_max
    }

    /// Set the lower force bounds. Length must match `dof()`.
    pub fn set_force_min(&mut self, min: &DVector<f64>) {
        assert_eq!(min.len(), self.dof(), "force bound length mismatch");
        self.force_min.copy_from(min);
    }

    /// Set the upper force bounds. Length must match `dof()`.
    pub fn set_force_max(&mut self, max: &DVector<f64>) {
        assert_eq!(max.len(), self.dof(), "force bound length mismatch");
        self.force_max.copy_from(max);
    }
}

impl Default for GenCoordSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_start_zeroed_with_open_force_bounds() {
        let gc = GenCoordSystem::with_dof(4);
        assert_eq!(gc.dof(), 4);
        assert_eq!(gc.positions().as_slice(), &[0.0; 4]);
        assert!(gc.force_min().iter().all(|&v| v == f64::NEG_INFINITY));
        assert!(gc.force_max().iter().all(|&v| v == f64::INFINITY));
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn setter_rejects_wrong_length() {
        let mut gc = GenCoordSystem::with_dof(3);
        gc.set_positions(&DVector::zeros(2));
    }
}
