//! Articulated rigid/soft multibody dynamics.
//!
//! This crate implements a skeleton — a tree of rigid (and optionally
//! deformable) bodies connected by joints, parameterized by flat
//! generalized coordinates — and the Featherstone-style O(n) recursive
//! algorithms over it: forward kinematics, forward dynamics
//! (articulated-body algorithm), inverse dynamics (recursive Newton-Euler),
//! impulse-based dynamics, and column-wise assembly of the joint-space mass
//! matrix (composite-rigid-body algorithm), its Δt-augmented variant, and
//! both inverses.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Skeleton                            │
//! │  body tree (BFS order) · generalized coordinates ·         │
//! │  dirty-flag caches: M, Mₐ, M⁻¹, Mₐ⁻¹, C, g, Cg, Fext       │
//! └──────────────┬─────────────────────────────────────────────┘
//!                │ forward (root→leaves) / backward (leaves→root)
//!                ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  BodyNode: spatial inertia, recursion caches, parent Joint │
//! │  Joint: motion subspace S, spring/damper, Ψ projections    │
//! │  PointMass: 3 dofs per particle on a soft body             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Derived quantities are cached and recomputed lazily: every state
//! mutation raises the dirty flags of the quantities it feeds, and each
//! accessor recomputes on miss. Recursions temporarily overwrite the
//! acceleration or force channels (column-wise mass-matrix assembly) and
//! restore them before returning, so recomputation is pure with respect to
//! public state.
//!
//! # Quick start
//!
//! ```
//! use marrow_dynamics::{BodyNode, Joint, Skeleton};
//! use nalgebra::Vector3;
//!
//! let mut skeleton = Skeleton::new("pendulum");
//! let body = BodyNode::new("link1", Joint::revolute("j1", Vector3::y()));
//! skeleton.add_body_node(body);
//! skeleton.init(0.001, Vector3::new(0.0, 0.0, -9.81)).unwrap();
//!
//! skeleton.compute_forward_dynamics();
//! let m = skeleton.mass_matrix().clone();
//! assert_eq!(m.nrows(), 1);
//! ```
//!
//! Out of scope, by design: scene containers, collision detection,
//! constraint solving, integrators above the position/velocity-integration
//! contract, file formats, and rendering.

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs)]
#![allow(
    clippy::missing_const_for_fn,  // nalgebra operations are not const
    clippy::too_many_lines,        // dynamics recursions naturally have many steps
    clippy::doc_markdown,          // not all technical terms need backticks
    clippy::module_name_repetitions
)]

pub mod body;
pub mod error;
pub mod gencoord;
pub mod joint;
pub mod skeleton;
pub mod soft;

pub use body::{BodyNode, Marker};
pub use error::SkeletonError;
pub use gencoord::GenCoordSystem;
pub use joint::{Joint, JointParameters, JointType};
pub use skeleton::Skeleton;
pub use soft::{PointMass, SoftBodyProperties};

pub use marrow_spatial::SpatialVector;
