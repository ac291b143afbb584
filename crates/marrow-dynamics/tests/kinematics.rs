//! Tree finalization, state round trips, and aggregate geometry queries.

use approx::assert_relative_eq;
use marrow_dynamics::{BodyNode, Joint, Marker, Skeleton};
use nalgebra::{DVector, Isometry3, Matrix3, Vector3};

fn link(name: &str, joint: Joint, parent: Option<usize>) -> BodyNode {
    let mut body = BodyNode::new(name, joint);
    if let Some(p) = parent {
        body.set_parent(p);
    }
    body
}

/// Test: bodies registered child-before-parent are reordered breadth-first
/// at init — the root lands at index 0 and every child index exceeds its
/// parent's.
#[test]
fn bfs_reorder_handles_child_first_registration() {
    let mut sk = Skeleton::new("reorder");
    // Registration order: leaf, middle, root; parent pointers use
    // registration indices.
    sk.add_body_node(link("leaf", Joint::revolute("j3", Vector3::y()), Some(1)));
    sk.add_body_node(link("middle", Joint::revolute("j2", Vector3::y()), Some(2)));
    sk.add_body_node(link("root", Joint::free("j1"), None));
    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    assert_eq!(sk.root_body_node().name(), "root");
    assert_eq!(sk.body_node(1).name(), "middle");
    assert_eq!(sk.body_node(2).name(), "leaf");
    for i in 0..sk.num_body_nodes() {
        assert_eq!(sk.body_node(i).index(), i);
        if let Some(p) = sk.body_node(i).parent() {
            assert!(p < i, "parent {p} must precede child {i}");
        }
    }
    // Joint dofs are assigned in the new order: free joint first.
    assert_eq!(sk.joint(0).index_in_skeleton(), 0);
    assert_eq!(sk.joint(1).index_in_skeleton(), 6);
    assert_eq!(sk.joint(2).index_in_skeleton(), 7);
    assert_eq!(sk.dof(), 8);
}

/// Test: init rejects malformed trees instead of proceeding.
#[test]
fn init_rejects_malformed_trees() {
    let mut empty = Skeleton::new("empty");
    assert!(empty.init(0.001, Vector3::zeros()).is_err());

    let mut two_roots = Skeleton::new("two-roots");
    two_roots.add_body_node(link("a", Joint::free("ja"), None));
    two_roots.add_body_node(link("b", Joint::free("jb"), None));
    assert!(two_roots.init(0.001, Vector3::zeros()).is_err());

    let mut cycle = Skeleton::new("cycle");
    cycle.add_body_node(link("root", Joint::free("jr"), None));
    cycle.add_body_node(link("a", Joint::revolute("ja", Vector3::y()), Some(2)));
    cycle.add_body_node(link("b", Joint::revolute("jb", Vector3::y()), Some(1)));
    assert!(cycle.init(0.001, Vector3::zeros()).is_err());
}

/// Test: total mass equals the sum of body masses after init.
#[test]
fn total_mass_is_sum_of_body_masses() {
    let mut sk = Skeleton::new("mass");
    let mut root = link("root", Joint::free("j0"), None);
    root.set_mass(2.5);
    let mut child = link("child", Joint::revolute("j1", Vector3::x()), Some(0));
    child.set_mass(0.75);
    sk.add_body_node(root);
    sk.add_body_node(child);
    sk.init(0.001, Vector3::zeros()).unwrap();
    assert_relative_eq!(sk.mass(), 3.25);
}

/// Test: `set_state(state())` is a no-op and channel setters round-trip.
#[test]
fn state_and_channel_round_trips() {
    let mut sk = Skeleton::new("state");
    sk.add_body_node(link("root", Joint::free("j0"), None));
    sk.add_body_node(link("child", Joint::revolute("j1", Vector3::y()), Some(0)));
    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    let q = DVector::from_column_slice(&[0.1, -0.2, 0.3, 1.0, 2.0, -0.5, 0.7]);
    let dq = DVector::from_column_slice(&[0.01, 0.02, -0.03, 0.4, -0.1, 0.2, -0.6]);
    let ddq = DVector::from_column_slice(&[0.5, 0.0, -0.5, 0.1, 0.2, 0.3, 0.9]);

    sk.set_positions(&q, true, false, false);
    sk.set_velocities(&dq, true, false);
    sk.set_accelerations(&ddq, true);
    assert_relative_eq!(sk.positions(), &q);
    assert_relative_eq!(sk.velocities(), &dq);
    assert_relative_eq!(sk.accelerations(), &ddq);

    let state = sk.state();
    assert_eq!(state.len(), 14);
    sk.set_state(&state, true, true, false);
    assert_relative_eq!(&sk.state(), &state, epsilon = 1e-15);
}

/// Test: cached accessors recompute after a position setter — the gravity
/// vector of a pendulum changes between the hanging and horizontal
/// configurations.
#[test]
fn cached_quantities_recompute_after_mutation() {
    let mut sk = Skeleton::new("dirty");
    let mut body = link("link", Joint::revolute("j", Vector3::y()), None);
    body.set_local_com(Vector3::new(0.0, 0.0, -1.0));
    body.set_moment_of_inertia(Matrix3::zeros());
    sk.add_body_node(body);
    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    let hanging = sk.gravity_force_vector()[0];
    assert_relative_eq!(hanging, 0.0, epsilon = 1e-12);

    sk.set_positions(
        &DVector::from_element(1, std::f64::consts::FRAC_PI_2),
        true,
        false,
        false,
    );
    let horizontal = sk.gravity_force_vector()[0];
    assert_relative_eq!(horizontal, 9.81, epsilon = 1e-9);
}

/// Test: COM Jacobian contract — `J_com · q̇ == world COM velocity`.
#[test]
fn com_jacobian_times_velocities_matches_com_velocity() {
    let mut sk = Skeleton::new("com");
    let mut root = link("root", Joint::free("j0"), None);
    root.set_mass(1.5);
    root.set_local_com(Vector3::new(0.1, 0.0, -0.2));
    let mut child = link("child", Joint::revolute("j1", Vector3::y()), Some(0));
    child.set_mass(0.8);
    child.set_local_com(Vector3::new(0.0, 0.0, -0.5));
    child
        .parent_joint_mut()
        .set_placement_in_parent(Isometry3::translation(0.0, 0.0, -0.4));
    sk.add_body_node(root);
    sk.add_body_node(child);
    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    let q = DVector::from_column_slice(&[0.3, -0.1, 0.2, 0.5, -0.4, 0.1, 0.8]);
    let dq = DVector::from_column_slice(&[0.2, 0.4, -0.3, 1.0, 0.5, -0.2, 0.6]);
    sk.set_positions(&q, true, false, false);
    sk.set_velocities(&dq, true, false);

    let jac = sk.world_com_jacobian();
    let predicted = &jac * sk.velocities();
    let actual = sk.world_com_velocity();
    for d in 0..3 {
        assert_relative_eq!(predicted[d], actual[d], epsilon = 1e-9);
    }
}

/// Test: COM Jacobian time-derivative contract —
/// `J̇_com·q̇ + J_com·q̈ == world COM acceleration`.
#[test]
fn com_jacobian_derivative_matches_com_acceleration() {
    let mut sk = Skeleton::new("com-accel");
    let mut root = link("root", Joint::revolute("j0", Vector3::y()), None);
    root.set_local_com(Vector3::new(0.0, 0.0, -0.5));
    let mut child = link("child", Joint::revolute("j1", Vector3::y()), Some(0));
    child.set_local_com(Vector3::new(0.0, 0.0, -0.3));
    child
        .parent_joint_mut()
        .set_placement_in_parent(Isometry3::translation(0.0, 0.0, -1.0));
    sk.add_body_node(root);
    sk.add_body_node(child);
    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    let q = DVector::from_column_slice(&[0.4, -0.7]);
    let dq = DVector::from_column_slice(&[1.2, 0.5]);
    let ddq = DVector::from_column_slice(&[-0.3, 0.9]);
    sk.set_positions(&q, true, true, false);
    sk.set_velocities(&dq, true, false);
    sk.set_accelerations(&ddq, true);

    let jac = sk.world_com_jacobian();
    let jac_dot = sk.world_com_jacobian_time_deriv();
    let predicted = &jac_dot * sk.velocities() + &jac * sk.accelerations();
    let actual = sk.world_com_acceleration();
    for d in 0..3 {
        assert_relative_eq!(predicted[d], actual[d], epsilon = 1e-8);
    }
}

/// Test: scatter/gather access to arbitrary coordinate subsets.
#[test]
fn config_segs_scatter_and_gather() {
    let mut sk = Skeleton::new("segs");
    sk.add_body_node(link("root", Joint::free("j0"), None));
    sk.init(0.001, Vector3::zeros()).unwrap();

    let ids = [5usize, 1, 3];
    let values = DVector::from_column_slice(&[0.9, -0.4, 0.2]);
    sk.set_config_segs(&ids, &values, true, false, false);
    assert_relative_eq!(sk.config_segs(&ids), values);
    assert_relative_eq!(sk.positions()[5], 0.9);
    assert_relative_eq!(sk.positions()[1], -0.4);
    assert_relative_eq!(sk.positions()[3], 0.2);
}

/// Test: name lookups return the match or None, never a wrong entry.
#[test]
fn name_lookups_hit_and_miss() {
    let mut sk = Skeleton::new("names");
    let mut root = link("pelvis", Joint::free("root_joint"), None);
    root.add_marker(Marker::new("beacon", Vector3::new(0.0, 0.1, 0.0)));
    sk.add_body_node(root);
    sk.add_body_node(link("femur", Joint::revolute("hip", Vector3::x()), Some(0)));
    sk.init(0.001, Vector3::zeros()).unwrap();

    assert_eq!(sk.body_node_by_name("femur").map(BodyNode::name), Some("femur"));
    assert!(sk.body_node_by_name("tibia").is_none());
    assert_eq!(sk.joint_by_name("hip").map(Joint::name), Some("hip"));
    assert!(sk.joint_by_name("knee").is_none());
    let marker = sk.marker("beacon").unwrap();
    assert_eq!(marker.body_index(), 0);
    assert!(sk.marker("ghost").is_none());
}
