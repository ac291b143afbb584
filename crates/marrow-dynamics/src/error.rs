//! Error types for skeleton construction and finalization.

use thiserror::Error;

/// Errors reported by [`Skeleton::init`](crate::Skeleton::init) when the
/// registered body tree cannot be finalized.
///
/// Runtime contract violations (bad setter lengths, out-of-range indices,
/// derived-quantity access on an empty skeleton) abort via assertions
/// instead; see the crate-level error-handling notes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SkeletonError {
    /// `init` was called on a skeleton with no registered bodies.
    #[error("skeleton '{name}' has no body nodes")]
    Empty {
        /// Skeleton name.
        name: String,
    },

    /// No parent-less body exists to serve as the tree root.
    #[error("skeleton '{name}' has no root body (every body declares a parent)")]
    NoRoot {
        /// Skeleton name.
        name: String,
    },

    /// More than one body is parent-less; the engine operates on a single
    /// spanning tree.
    #[error("skeleton '{name}' has multiple root bodies: '{first}' and '{second}'")]
    MultipleRoots {
        /// Skeleton name.
        name: String,
        /// First parent-less body found.
        first: String,
        /// Second parent-less body found.
        second: String,
    },

    /// A body references a parent index that was never registered.
    #[error("body '{body}' references parent index {parent} but only {count} bodies exist")]
    ParentOutOfRange {
        /// Offending body name.
        body: String,
        /// Declared parent index.
        parent: usize,
        /// Number of registered bodies.
        count: usize,
    },

    /// A body is unreachable from the root (a parent cycle or detached
    /// subtree).
    #[error("body '{body}' is not reachable from the root body")]
    Unreachable {
        /// Offending body name.
        body: String,
    },
}
