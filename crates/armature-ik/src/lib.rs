//! Inverse kinematics solvers for Armature characters.
//!
//! Provides per-end-effector goal management, a closed-form analytical
//! solver for 3-joint limb chains, and a numerical whole-body solver that
//! minimizes a composite objective with L-BFGS over a quaternion log-map
//! pose parameterization.
//!
//! # Architecture
//!
//! ```text
//! host goals ──► GoalStore ──► consolidation ──► LimbSolver (per limb)
//!                                          └───► BodySolver (whole body)
//! ```
//!
//! An [`IkRig`] is configured once per character from its skeleton and a
//! [`SolverConfig`](armature_core::config::SolverConfig). Each frame the
//! host pushes [`IkGoal`]s and calls [`IkRig::solve`], which consolidates
//! goals per end-effector, dispatches to the configured solving strategy,
//! and writes new joint rotations back onto the skeleton.

pub mod body;
pub mod goal;
pub mod limb;
pub mod rig;

pub use body::{BodySolveReport, BodySolver};
pub use goal::{GoalStore, IkGoal};
pub use limb::{LimbChain, LimbSolver};
pub use rig::{IkRig, SolveStrategy};
