//! Impulse-based dynamics: bias-impulse propagation and velocity-change
//! responses.

use approx::assert_relative_eq;
use marrow_dynamics::{BodyNode, Joint, Skeleton, SpatialVector};
use nalgebra::{DVector, Isometry3, Matrix3, Vector3};

fn free_ball(mass: f64) -> Skeleton {
    let mut sk = Skeleton::new("ball");
    let mut body = BodyNode::new("ball", Joint::free("root"));
    body.set_mass(mass);
    body.set_moment_of_inertia(Matrix3::identity());
    sk.add_body_node(body);
    sk.init(0.001, Vector3::zeros()).unwrap();
    sk
}

fn two_link() -> Skeleton {
    let mut sk = Skeleton::new("2r");
    let mut l1 = BodyNode::new("l1", Joint::revolute("j1", Vector3::y()));
    l1.set_local_com(Vector3::new(0.0, 0.0, -0.5));
    let mut j2 = Joint::revolute("j2", Vector3::y());
    j2.set_placement_in_parent(Isometry3::translation(0.0, 0.0, -1.0));
    let mut l2 = BodyNode::new("l2", j2);
    l2.set_local_com(Vector3::new(0.0, 0.0, -0.5));
    l2.set_parent(0);
    sk.add_body_node(l1);
    sk.add_body_node(l2);
    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();
    sk
}

/// Test: with all constraint impulses zero, the bias-impulse walk leaves
/// the public state (q, q̇, τ) untouched.
#[test]
fn bias_impulse_walk_preserves_state() {
    let mut sk = two_link();
    let q = DVector::from_column_slice(&[0.4, -0.2]);
    let dq = DVector::from_column_slice(&[1.0, 0.3]);
    sk.set_positions(&q, true, true, false);
    sk.set_velocities(&dq, true, false);
    let tau = DVector::from_column_slice(&[0.1, -0.7]);
    sk.set_internal_force_vector(&tau);

    sk.update_bias_impulse(1);

    assert_relative_eq!(sk.positions(), &q);
    assert_relative_eq!(sk.velocities(), &dq);
    assert_relative_eq!(sk.internal_force_vector(), &tau);
}

/// Test: the seeded-impulse overload zeroes the body's constraint impulse
/// after the walk.
#[test]
fn seeded_bias_impulse_is_zeroed_afterwards() {
    let mut sk = two_link();
    sk.compute_forward_dynamics(); // populate articulated inertia caches
    let imp = SpatialVector::new(0.0, 0.2, 0.0, 0.5, 0.0, 0.0);
    sk.update_bias_impulse_with_impulse(1, imp);
    assert_relative_eq!(
        sk.body_node(1).constraint_impulse(),
        &SpatialVector::zeros()
    );
}

/// Test: impulse forward dynamics is a no-op when the skeleton is immobile.
#[test]
fn impulse_forward_dynamics_noop_when_immobile() {
    let mut sk = free_ball(2.0);
    sk.body_node_mut(0)
        .set_constraint_impulse(SpatialVector::new(0.0, 0.0, 0.0, 4.0, 0.0, 0.0));
    sk.set_mobile(false);

    let dq_before = sk.velocities().clone();
    sk.compute_impulse_forward_dynamics();
    assert_relative_eq!(sk.velocities(), &dq_before);
}

/// Test: zero impulses produce zero velocity change through the full
/// impulse pipeline.
#[test]
fn impulse_forward_dynamics_noop_with_zero_impulses() {
    let mut sk = two_link();
    let dq = DVector::from_column_slice(&[0.6, -0.4]);
    sk.set_velocities(&dq, true, false);
    let ddq_before = sk.accelerations().clone();

    sk.compute_impulse_forward_dynamics();

    assert_relative_eq!(sk.velocities(), &dq, epsilon = 1e-12);
    assert_relative_eq!(sk.accelerations(), &ddq_before, epsilon = 1e-12);
}

/// Test: a linear impulse on a free body changes its velocity by imp/m and
/// its acceleration by the same over Δt.
#[test]
fn free_body_linear_impulse_response() {
    let dt = 0.001;
    let mut sk = free_ball(2.0);
    sk.body_node_mut(0)
        .set_constraint_impulse(SpatialVector::new(0.0, 0.0, 0.0, 4.0, 0.0, 0.0));

    sk.compute_impulse_forward_dynamics();

    let dq = sk.velocities();
    assert_relative_eq!(dq[3], 2.0, epsilon = 1e-12); // 4 N·s / 2 kg
    assert_relative_eq!(dq[4], 0.0, epsilon = 1e-12);
    for d in 0..3 {
        assert_relative_eq!(dq[d], 0.0, epsilon = 1e-12);
    }
    assert_relative_eq!(sk.accelerations()[3], 2.0 / dt, epsilon = 1e-6);
}

/// Test: an angular impulse maps through the rotational inertia block.
#[test]
fn free_body_angular_impulse_response() {
    let mut sk = free_ball(2.0);
    sk.body_node_mut(0)
        .set_constraint_impulse(SpatialVector::new(0.5, 0.0, 0.0, 0.0, 0.0, 0.0));

    sk.compute_impulse_forward_dynamics();

    // Identity rotational inertia: δω = imp.
    assert_relative_eq!(sk.velocities()[0], 0.5, epsilon = 1e-12);
    assert_relative_eq!(sk.velocities()[3], 0.0, epsilon = 1e-12);
}

/// Test: update_velocity_change propagates a seeded bias impulse into the
/// joint-space velocity response without touching the coordinates.
#[test]
fn velocity_change_leaves_coordinates_untouched() {
    let mut sk = two_link();
    sk.compute_forward_dynamics();
    let dq_before = sk.velocities().clone();

    sk.update_bias_impulse_with_impulse(1, SpatialVector::new(0.0, 0.1, 0.0, 0.0, 0.0, 0.3));
    sk.update_velocity_change();

    assert_relative_eq!(sk.velocities(), &dq_before);
}

/// Test: the impulse-applied flag round-trips.
#[test]
fn impulse_applied_flag() {
    let mut sk = free_ball(1.0);
    assert!(!sk.is_impulse_applied());
    sk.set_impulse_applied(true);
    assert!(sk.is_impulse_applied());
    sk.set_impulse_applied(false);
    assert!(!sk.is_impulse_applied());
}
