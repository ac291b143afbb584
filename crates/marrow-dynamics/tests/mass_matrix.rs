//! Mass matrix assembly: CRBA columns, augmented variant, and both
//! inverses.

use approx::assert_relative_eq;
use marrow_dynamics::{BodyNode, Joint, Skeleton};
use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Vector3};

fn pendulum_link(name: &str, joint_name: &str, parent: Option<usize>, z_offset: f64) -> BodyNode {
    let mut joint = Joint::revolute(joint_name, Vector3::y());
    joint.set_placement_in_parent(Isometry3::translation(0.0, 0.0, z_offset));
    let mut body = BodyNode::new(name, joint);
    body.set_mass(1.0);
    body.set_local_com(Vector3::new(0.0, 0.0, -1.0));
    body.set_moment_of_inertia(Matrix3::zeros());
    if let Some(p) = parent {
        body.set_parent(p);
    }
    body
}

/// Branched skeleton with free, revolute, and ball joints (10 dofs).
fn branched_skeleton() -> Skeleton {
    let mut sk = Skeleton::new("branched");

    let mut root = BodyNode::new("trunk", Joint::free("root"));
    root.set_mass(2.0);
    root.set_local_com(Vector3::new(0.05, 0.0, 0.1));
    root.set_moment_of_inertia(Matrix3::from_diagonal(&Vector3::new(0.3, 0.4, 0.5)));
    sk.add_body_node(root);

    let mut swing_joint = Joint::revolute("swing", Vector3::y());
    swing_joint.set_placement_in_parent(Isometry3::translation(0.2, 0.0, 0.0));
    let mut swing = BodyNode::new("swing", swing_joint);
    swing.set_mass(0.7);
    swing.set_local_com(Vector3::new(0.0, 0.0, -0.4));
    swing.set_moment_of_inertia(Matrix3::from_diagonal(&Vector3::new(0.02, 0.02, 0.01)));
    swing.set_parent(0);
    sk.add_body_node(swing);

    let mut wrist_joint = Joint::ball("wrist");
    wrist_joint.set_placement_in_parent(Isometry3::translation(-0.1, 0.15, 0.0));
    let mut wrist = BodyNode::new("wrist", wrist_joint);
    wrist.set_mass(0.4);
    wrist.set_local_com(Vector3::new(0.0, 0.1, 0.0));
    wrist.set_moment_of_inertia(Matrix3::from_diagonal(&Vector3::new(0.01, 0.008, 0.012)));
    wrist.set_parent(0);
    sk.add_body_node(wrist);

    sk.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    let q = DVector::from_column_slice(&[
        0.3, -0.2, 0.5, 0.1, -0.3, 0.2, // free
        0.8, // revolute
        0.2, -0.4, 0.3, // ball
    ]);
    sk.set_positions(&q, true, true, false);
    sk
}

/// Test: free-floating single body with mass 2 and identity rotational
/// inertia — M is the spatial-inertia block diagonal, and M⁻¹ its inverse;
/// C and g vanish at rest without gravity.
#[test]
fn free_body_matrices_are_block_diagonal() {
    let mut sk = Skeleton::new("free");
    let mut body = BodyNode::new("body", Joint::free("root"));
    body.set_mass(2.0);
    body.set_moment_of_inertia(Matrix3::identity());
    sk.add_body_node(body);
    sk.init(0.001, Vector3::zeros()).unwrap();

    let expected = [1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
    let m = sk.mass_matrix().clone();
    for r in 0..6 {
        for c in 0..6 {
            let want = if r == c { expected[r] } else { 0.0 };
            assert_relative_eq!(m[(r, c)], want, epsilon = 1e-12);
        }
    }

    let inv = sk.inv_mass_matrix().clone();
    for r in 0..6 {
        assert_relative_eq!(inv[(r, r)], 1.0 / expected[r], epsilon = 1e-12);
    }

    assert_relative_eq!(
        sk.coriolis_force_vector().norm(),
        0.0,
        epsilon = 1e-12
    );
    assert_relative_eq!(sk.gravity_force_vector().norm(), 0.0, epsilon = 1e-12);
}

/// Test: the mass matrix is symmetric at a generic configuration.
#[test]
fn mass_matrix_is_symmetric() {
    let mut sk = branched_skeleton();
    let m = sk.mass_matrix().clone();
    for r in 0..m.nrows() {
        for c in 0..m.ncols() {
            assert_relative_eq!(m[(r, c)], m[(c, r)], epsilon = 1e-10);
        }
    }
}

/// Test: `M · M⁻¹ ≈ I` on a branched tree with mixed joint types, which
/// exercises both triangular early-exit paths.
#[test]
fn mass_matrix_times_inverse_is_identity() {
    let mut sk = branched_skeleton();
    let m = sk.mass_matrix().clone();
    let inv = sk.inv_mass_matrix().clone();
    let product = &m * &inv;
    let identity = DMatrix::<f64>::identity(m.nrows(), m.ncols());
    assert_relative_eq!(product, identity, epsilon = 1e-8);
}

/// Test: `Mₐ · Mₐ⁻¹ ≈ I` with non-trivial joint dampers and springs.
#[test]
fn aug_mass_matrix_times_inverse_is_identity() {
    let mut sk = branched_skeleton();
    {
        let joint = sk.body_node_mut(1).parent_joint_mut();
        joint.set_damping(0, 0.5);
        joint.set_spring_stiffness(0, 3.0);
    }
    {
        let joint = sk.body_node_mut(2).parent_joint_mut();
        for d in 0..3 {
            joint.set_damping(d, 0.2);
        }
    }
    let aug = sk.aug_mass_matrix().clone();
    let inv_aug = sk.inv_aug_mass_matrix().clone();
    let product = &aug * &inv_aug;
    let identity = DMatrix::<f64>::identity(aug.nrows(), aug.ncols());
    assert_relative_eq!(product, identity, epsilon = 1e-8);
}

/// Test: `Mₐ = M + Δt·D + Δt²·K` on a single damped, sprung pendulum.
#[test]
fn aug_mass_matrix_adds_implicit_diagonal() {
    let dt = 0.01;
    let mut sk = Skeleton::new("damped");
    let mut body = pendulum_link("link", "j", None, 0.0);
    body.parent_joint_mut().set_damping(0, 0.3);
    body.parent_joint_mut().set_spring_stiffness(0, 2.0);
    sk.add_body_node(body);
    sk.init(dt, Vector3::new(0.0, 0.0, -9.81)).unwrap();

    let m = sk.mass_matrix()[(0, 0)];
    let aug = sk.aug_mass_matrix()[(0, 0)];
    assert_relative_eq!(m, 1.0, epsilon = 1e-12); // m·l_c² with zero moment
    assert_relative_eq!(aug - m, dt * 0.3 + dt * dt * 2.0, epsilon = 1e-12);
    assert_relative_eq!(
        sk.inv_aug_mass_matrix()[(0, 0)],
        1.0 / aug,
        epsilon = 1e-12
    );
}

/// Test: CRBA columns agree with inverse dynamics — with q̇ = 0 and no
/// gravity, the generalized force for q̈ = eⱼ is exactly column j of M.
#[test]
fn crba_columns_match_inverse_dynamics() {
    let mut sk = Skeleton::new("chain");
    sk.add_body_node(pendulum_link("l1", "j1", None, 0.0));
    sk.add_body_node(pendulum_link("l2", "j2", Some(0), -1.0));
    sk.add_body_node(pendulum_link("l3", "j3", Some(1), -1.0));
    sk.init(0.001, Vector3::zeros()).unwrap();

    let q = DVector::from_column_slice(&[0.3, -0.4, 0.2]);
    sk.set_positions(&q, true, true, false);
    let m = sk.mass_matrix().clone();

    for j in 0..3 {
        let mut e = DVector::zeros(3);
        e[j] = 1.0;
        sk.set_accelerations(&e, true);
        sk.compute_inverse_dynamics(false, false);
        let tau = sk.internal_force_vector().clone();
        for r in 0..3 {
            assert_relative_eq!(tau[r], m[(r, j)], epsilon = 1e-10);
        }
    }
}

/// Test: two-link planar pendulum against the textbook model.
///
/// Unit masses concentrated at the link ends (l = l_c = 1, zero rotational
/// inertia), revolute about ŷ, links along −ẑ at q = 0, gravity 9.81·ẑ.
/// Lagrangian analysis gives
///   M₁₁ = m₁l_c₁² + m₂(l₁² + l_c₂² + 2·l₁·l_c₂·cos q₂)
///   M₁₂ = m₂(l_c₂² + l₁·l_c₂·cos q₂),  M₂₂ = m₂·l_c₂²
///   g₁ = −g·((m₁l_c₁ + m₂l₁)·sin q₁ + m₂l_c₂·sin(q₁+q₂))
///   g₂ = −g·m₂l_c₂·sin(q₁+q₂)
/// At q = (π/2, 0): M = [[5, 2], [2, 1]], g = (−3·9.81, −9.81).
#[test]
fn two_link_pendulum_matches_textbook() {
    let g = 9.81;
    let mut sk = Skeleton::new("2r");
    sk.add_body_node(pendulum_link("l1", "j1", None, 0.0));
    sk.add_body_node(pendulum_link("l2", "j2", Some(0), -1.0));
    sk.init(0.001, Vector3::new(0.0, 0.0, g)).unwrap();

    let q = DVector::from_column_slice(&[std::f64::consts::FRAC_PI_2, 0.0]);
    sk.set_positions(&q, true, false, false);

    let m = sk.mass_matrix().clone();
    assert_relative_eq!(m[(0, 0)], 5.0, epsilon = 1e-10);
    assert_relative_eq!(m[(0, 1)], 2.0, epsilon = 1e-10);
    assert_relative_eq!(m[(1, 0)], 2.0, epsilon = 1e-10);
    assert_relative_eq!(m[(1, 1)], 1.0, epsilon = 1e-10);

    let grav = sk.gravity_force_vector().clone();
    assert_relative_eq!(grav[0], -3.0 * g, epsilon = 1e-9);
    assert_relative_eq!(grav[1], -g, epsilon = 1e-9);

    // Combined vector reduces to gravity at rest.
    let combined = sk.combined_vector().clone();
    assert_relative_eq!(combined, grav, epsilon = 1e-9);
}
