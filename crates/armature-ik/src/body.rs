//! Numerical whole-body IK solver.
//!
//! Produces one consistent pose honoring all end-effector goals at once by
//! minimizing `goal_term + base_pose_weight * base_pose_term` with L-BFGS
//! over a flat pose vector: the root position (full-body mode only)
//! followed by the log-map of each optimized joint's local rotation. The
//! goal term is an inequality-style penalty (goals within reach exert no
//! force); the base-pose term anchors the result to the authored motion.
//!
//! A solve is a single-shot optimization: the optimizer memory restarts
//! from the encoded current pose every call, capped at a small iteration
//! budget so per-frame latency stays bounded. Non-convergence at the cap
//! is not an error; the best pose found is applied.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use argmin::core::{CostFunction, Error, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use armature_core::config::SolverConfig;
use armature_core::error::ConfigError;
use armature_core::rotation;
use armature_core::skeleton::{is_leg, limb_joint_tags, JointId, Skeleton};
use nalgebra::Vector3;
use tracing::{debug, warn};

use crate::goal::{IkGoal, MIN_GOAL_WEIGHT};

/// Central-difference step for the numerical gradient.
const DIFF_STEP: f64 = 0.05;

/// L-BFGS memory cap; the pose vector is rarely longer than a few dozen
/// components, so a short history suffices.
const LBFGS_MEMORY: usize = 5;

// ---------------------------------------------------------------------------
// Pose vector layout
// ---------------------------------------------------------------------------

/// Mapping between the skeleton pose and the flat optimization vector.
///
/// Layout: `[root xyz]` (full-body mode only) followed by one 3-component
/// rotation-vector slot per optimized joint. Fixed at configuration time.
#[derive(Debug)]
struct PoseLayout {
    joints: Vec<JointId>,
    upper_body_only: bool,
}

impl PoseLayout {
    fn rot_offset(&self) -> usize {
        if self.upper_body_only {
            0
        } else {
            3
        }
    }

    fn len(&self) -> usize {
        self.rot_offset() + 3 * self.joints.len()
    }

    fn encode(&self, skeleton: &Skeleton, x: &mut Vec<f64>) {
        x.resize(self.len(), 0.0);
        if !self.upper_body_only {
            let p = skeleton.root_position();
            x[0] = f64::from(p.x);
            x[1] = f64::from(p.y);
            x[2] = f64::from(p.z);
        }
        let offset = self.rot_offset();
        for (i, &joint) in self.joints.iter().enumerate() {
            let v = rotation::log(&skeleton.local_rotation(joint));
            x[offset + 3 * i] = f64::from(v.x);
            x[offset + 3 * i + 1] = f64::from(v.y);
            x[offset + 3 * i + 2] = f64::from(v.z);
        }
    }

    fn decode(&self, x: &[f64], skeleton: &mut Skeleton) {
        if !self.upper_body_only {
            skeleton.set_root_position(Vector3::new(x[0] as f32, x[1] as f32, x[2] as f32));
        }
        for (i, &joint) in self.joints.iter().enumerate() {
            let v = self.joint_rotation(x, i);
            skeleton.set_local_rotation(joint, rotation::exp(&v));
        }
    }

    /// Rotation-vector slot for the `i`-th optimized joint.
    fn joint_rotation(&self, x: &[f64], i: usize) -> Vector3<f32> {
        let offset = self.rot_offset() + 3 * i;
        Vector3::new(
            x[offset] as f32,
            x[offset + 1] as f32,
            x[offset + 2] as f32,
        )
    }
}

/// Joint ids of one goal-bearing limb, resolved at configuration time.
#[derive(Debug, Clone)]
struct LimbRef {
    end_effector: String,
    shoulder: JointId,
    elbow: JointId,
    wrist: JointId,
}

// ---------------------------------------------------------------------------
// Objective
// ---------------------------------------------------------------------------

/// Objective evaluated by the optimizer.
///
/// Candidate poses are decoded onto a scratch skeleton so evaluation never
/// touches the live skeleton. The evaluation counter is shared so the
/// final report can include it after the executor consumes the objective.
#[derive(Clone)]
struct BodyObjective {
    layout: Rc<PoseLayout>,
    limbs: Vec<LimbRef>,
    goals: Vec<IkGoal>,
    base: Vec<f64>,
    base_pose_weight: f64,
    root_position_weight: f64,
    scratch: Rc<RefCell<Skeleton>>,
    evaluations: Rc<Cell<u64>>,
}

impl BodyObjective {
    /// Compute `(goal_term, base_pose_term)` at `x`. The base-pose term
    /// includes the root-position deviation in full-body mode.
    fn objective_terms(&self, x: &[f64]) -> (f64, f64) {
        let mut scratch = self.scratch.borrow_mut();
        self.layout.decode(x, &mut scratch);

        let mut goal_term = 0.0;
        for goal in &self.goals {
            let weight = goal.weight.clamp(0.0, 1.0);
            if weight < MIN_GOAL_WEIGHT {
                continue;
            }
            let Some(limb) = self
                .limbs
                .iter()
                .find(|l| l.end_effector == goal.end_effector)
            else {
                continue;
            };
            let shoulder = scratch.world_position(limb.shoulder);
            let elbow = scratch.world_position(limb.elbow);
            let wrist = scratch.world_position(limb.wrist);
            // Relaxed reach: lower-weight goals are harder to satisfy, so
            // the optimizer spends less effort on them.
            let reach = ((shoulder - elbow).norm() + (wrist - elbow).norm()) / weight;
            let dist = (goal.position - shoulder).norm();
            if dist > reach {
                let excess = f64::from(dist - reach);
                goal_term += excess * excess;
            }
        }

        let mut base_pose_term = 0.0;
        for (i, _) in self.layout.joints.iter().enumerate() {
            let q = rotation::exp(&self.layout.joint_rotation(x, i));
            let qb = rotation::exp(&self.layout.joint_rotation(&self.base, i));
            base_pose_term += f64::from(rotation::disp(&q, &qb).norm_squared());
        }
        if !self.layout.upper_body_only {
            let dx = x[0] - self.base[0];
            let dy = x[1] - self.base[1];
            let dz = x[2] - self.base[2];
            base_pose_term += self.root_position_weight * (dx * dx + dy * dy + dz * dz);
        }

        (goal_term, base_pose_term)
    }

    fn value(&self, x: &[f64]) -> f64 {
        self.evaluations.set(self.evaluations.get() + 1);
        let (goal_term, base_pose_term) = self.objective_terms(x);
        goal_term + self.base_pose_weight * base_pose_term
    }
}

impl CostFunction for BodyObjective {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, Error> {
        Ok(self.value(param))
    }
}

impl Gradient for BodyObjective {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, Error> {
        let mut x = param.clone();
        let mut grad = vec![0.0; x.len()];
        for i in 0..x.len() {
            let xi = x[i];
            x[i] = xi + DIFF_STEP;
            let above = self.value(&x);
            x[i] = xi - DIFF_STEP;
            let below = self.value(&x);
            x[i] = xi;
            grad[i] = (above - below) / (2.0 * DIFF_STEP);
        }
        Ok(grad)
    }
}

// ---------------------------------------------------------------------------
// Solver
// ---------------------------------------------------------------------------

/// Diagnostics from one whole-body solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodySolveReport {
    /// Optimizer iterations performed (at most the configured cap).
    pub iterations: u64,
    /// Objective evaluations, including gradient probes.
    pub evaluations: u64,
    /// Final goal penalty.
    pub goal_term: f64,
    /// Final base-pose deviation, scaled by `base_pose_weight`.
    pub base_pose_term: f64,
    /// Wall-clock solve time in microseconds.
    pub solve_time_us: u64,
}

/// Whole-body numerical IK solver for one character.
#[derive(Debug)]
pub struct BodySolver {
    layout: Rc<PoseLayout>,
    limbs: Vec<LimbRef>,
    base_pose_weight: f32,
    root_position_weight: f32,
    max_iterations: u32,
    gradient_tolerance: f64,
    log_performance: bool,
    x: Vec<f64>,
    base: Vec<f64>,
    scratch: Rc<RefCell<Skeleton>>,
}

impl BodySolver {
    /// Build the solver for a skeleton and the configured end-effectors.
    ///
    /// The mode is decided here, once: without any ankle end-effector the
    /// solver is upper-body-only and never touches the root position.
    ///
    /// # Errors
    ///
    /// Returns an error if the skeleton is empty, an end-effector is not a
    /// limb tag, a chain joint is missing, or no body joints remain to
    /// optimize.
    pub fn new(skeleton: &Skeleton, config: &SolverConfig) -> Result<Self, ConfigError> {
        let root = skeleton.root().ok_or(ConfigError::EmptySkeleton)?;
        let upper_body_only = !config.end_effectors.iter().any(|e| is_leg(e));

        let mut limbs = Vec::new();
        for end_effector in &config.end_effectors {
            let (elbow_tag, shoulder_tag) = limb_joint_tags(end_effector)
                .ok_or_else(|| ConfigError::UnknownEndEffector(end_effector.clone()))?;
            let find = |tag: &str| {
                skeleton
                    .find_by_tag(tag)
                    .ok_or_else(|| ConfigError::MissingJoint(tag.to_string()))
            };
            limbs.push(LimbRef {
                end_effector: end_effector.clone(),
                shoulder: find(shoulder_tag)?,
                elbow: find(elbow_tag)?,
                wrist: find(end_effector)?,
            });
        }

        // Optimized joints: the root (full-body mode) plus every trunk
        // joint between the root and a limb's proximal joint. Eye joints
        // belong to the gaze layer and are never optimized here.
        let mut joints: Vec<JointId> = Vec::new();
        if !upper_body_only {
            joints.push(root);
        }
        for limb in &limbs {
            let Some(parent) = skeleton.joint(limb.shoulder).parent else {
                continue;
            };
            for joint in skeleton.path_from_root(parent) {
                if joint == root
                    || skeleton.joint(joint).tag.contains("Eye")
                    || joints.contains(&joint)
                {
                    continue;
                }
                joints.push(joint);
            }
        }
        if joints.is_empty() {
            return Err(ConfigError::NoBodyJoints);
        }

        let layout = Rc::new(PoseLayout {
            joints,
            upper_body_only,
        });
        Ok(Self {
            layout,
            limbs,
            base_pose_weight: config.base_pose_weight,
            root_position_weight: config.root_position_weight,
            max_iterations: config.max_iterations,
            gradient_tolerance: config.gradient_tolerance,
            log_performance: config.log_performance,
            x: Vec::new(),
            base: Vec::new(),
            scratch: Rc::new(RefCell::new(skeleton.clone())),
        })
    }

    pub fn upper_body_only(&self) -> bool {
        self.layout.upper_body_only
    }

    /// Optimize the pose toward `goals` and apply it to `skeleton`.
    ///
    /// The current pose is captured as the base-pose anchor, the optimizer
    /// runs to its iteration cap or gradient tolerance, and the best pose
    /// found is decoded back onto the skeleton. Optimizer failure keeps
    /// the starting pose; it is logged, not propagated.
    pub fn solve(&mut self, skeleton: &mut Skeleton, goals: &[IkGoal]) -> BodySolveReport {
        let start = Instant::now();

        self.layout.encode(skeleton, &mut self.base);
        self.x.clone_from(&self.base);
        self.scratch.borrow_mut().copy_pose_from(skeleton);

        let evaluations = Rc::new(Cell::new(0));
        let objective = BodyObjective {
            layout: Rc::clone(&self.layout),
            limbs: self.limbs.clone(),
            goals: goals.to_vec(),
            base: self.base.clone(),
            base_pose_weight: f64::from(self.base_pose_weight),
            root_position_weight: f64::from(self.root_position_weight),
            scratch: Rc::clone(&self.scratch),
            evaluations: Rc::clone(&evaluations),
        };
        // The executor consumes its objective; keep a clone for the final
        // term breakdown.
        let probe = objective.clone();

        let memory = self.layout.len().min(LBFGS_MEMORY).max(1);
        let mut iterations = 0;
        match LBFGS::new(MoreThuenteLineSearch::new(), memory)
            .with_tolerance_grad(self.gradient_tolerance)
        {
            Ok(solver) => {
                let result = Executor::new(objective, solver)
                    .configure(|state| {
                        state
                            .param(self.x.clone())
                            .max_iters(u64::from(self.max_iterations))
                    })
                    .run();
                match result {
                    Ok(res) => {
                        if let Some(best) = res.state().get_best_param() {
                            self.x.clone_from(best);
                        }
                        iterations = res.state().get_iter();
                    }
                    Err(err) => {
                        warn!(error = %err, "whole-body optimization failed, keeping base pose");
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "optimizer setup failed, keeping base pose");
            }
        }

        self.layout.decode(&self.x, skeleton);

        let (goal_term, base_pose_term) = probe.objective_terms(&self.x);
        let report = BodySolveReport {
            iterations,
            evaluations: evaluations.get(),
            goal_term,
            base_pose_term: f64::from(self.base_pose_weight) * base_pose_term,
            solve_time_us: start.elapsed().as_micros() as u64,
        };
        if self.log_performance {
            debug!(
                iterations = report.iterations,
                evaluations = report.evaluations,
                goal_term = report.goal_term,
                base_pose_term = report.base_pose_term,
                solve_time_us = report.solve_time_us,
                "whole-body solve finished"
            );
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Unit, UnitQuaternion};

    /// Arm hanging off a zero-offset trunk: the shoulder sits at the root
    /// position, so trunk rotations cannot move it.
    fn upper_body() -> Skeleton {
        let mut s = Skeleton::new();
        let root = s.add_root("Hips", Vector3::zeros()).unwrap();
        let spine = s.add_joint("Spine", root, Vector3::zeros()).unwrap();
        let chest = s.add_joint("Chest", spine, Vector3::zeros()).unwrap();
        let shoulder = s.add_joint("LShoulder", chest, Vector3::zeros()).unwrap();
        let elbow = s
            .add_joint("LElbow", shoulder, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s.add_joint("LWrist", elbow, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s
    }

    fn full_body() -> Skeleton {
        let mut s = Skeleton::new();
        let root = s.add_root("Hips", Vector3::zeros()).unwrap();
        let hip = s.add_joint("LHip", root, Vector3::zeros()).unwrap();
        let knee = s
            .add_joint("LKnee", hip, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s.add_joint("LAnkle", knee, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s
    }

    fn config(end_effectors: &[&str]) -> SolverConfig {
        SolverConfig {
            end_effectors: end_effectors.iter().map(|s| (*s).to_string()).collect(),
            ..SolverConfig::default()
        }
    }

    #[test]
    fn empty_skeleton_rejected() {
        let err = BodySolver::new(&Skeleton::new(), &config(&["LWrist"])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySkeleton));
    }

    #[test]
    fn missing_chain_joint_rejected() {
        let err = BodySolver::new(&upper_body(), &config(&["RWrist"])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingJoint(_)));
    }

    #[test]
    fn shoulder_directly_under_root_has_no_body_joints() {
        let mut s = Skeleton::new();
        let root = s.add_root("Hips", Vector3::zeros()).unwrap();
        let shoulder = s.add_joint("LShoulder", root, Vector3::zeros()).unwrap();
        let elbow = s
            .add_joint("LElbow", shoulder, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s.add_joint("LWrist", elbow, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();

        let err = BodySolver::new(&s, &config(&["LWrist"])).unwrap_err();
        assert!(matches!(err, ConfigError::NoBodyJoints));
    }

    #[test]
    fn mode_follows_end_effector_list() {
        let upper = BodySolver::new(&upper_body(), &config(&["LWrist"])).unwrap();
        assert!(upper.upper_body_only());
        let full = BodySolver::new(&full_body(), &config(&["LAnkle"])).unwrap();
        assert!(!full.upper_body_only());
    }

    #[test]
    fn no_goals_preserves_base_pose() {
        let mut s = upper_body();
        let spine = s.find_by_tag("Spine").unwrap();
        let bend = UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::z()), 0.3);
        s.set_local_rotation(spine, bend);

        let mut solver = BodySolver::new(&s, &config(&["LWrist"])).unwrap();
        let report = solver.solve(&mut s, &[]);

        let got = s.local_rotation(spine);
        let dot = got.coords.dot(&bend.coords).abs();
        assert_relative_eq!(dot, 1.0, epsilon = 1e-5);
        assert_relative_eq!(report.goal_term, 0.0);
        assert!(report.base_pose_term < 1e-9);
    }

    #[test]
    fn negligible_goal_weight_exerts_no_force() {
        let mut s = upper_body();
        let mut solver = BodySolver::new(&s, &config(&["LWrist"])).unwrap();
        let goal = IkGoal::new("LWrist", Vector3::new(5.0, 0.0, 0.0), 0.001);
        let report = solver.solve(&mut s, &[goal]);
        assert_relative_eq!(report.goal_term, 0.0);
        assert!(report.base_pose_term < 1e-9);
    }

    #[test]
    fn unreachable_goal_with_fixed_shoulder_keeps_excess_penalty() {
        let mut s = upper_body();
        let mut solver = BodySolver::new(&s, &config(&["LWrist"])).unwrap();
        // d = 1.0 against a reach of 0.6; the zero-offset trunk cannot
        // move the shoulder, so the penalty (1.0 - 0.6)^2 is irreducible.
        let goal = IkGoal::new("LWrist", Vector3::new(1.0, 0.0, 0.0), 1.0);
        let report = solver.solve(&mut s, &[goal]);
        assert_relative_eq!(report.goal_term, 0.16, epsilon = 1e-6);
        assert!(report.iterations <= 10);
    }

    #[test]
    fn full_body_mode_translates_root_toward_goal() {
        let mut s = full_body();
        let mut solver = BodySolver::new(&s, &config(&["LAnkle"])).unwrap();
        let goal = IkGoal::new("LAnkle", Vector3::new(1.0, 0.0, 0.0), 1.0);
        let report = solver.solve(&mut s, &[goal]);

        // Quadratic trade-off between goal excess and root deviation has
        // its optimum at x = 0.2.
        let root = s.root_position();
        assert!((root.x - 0.2).abs() < 0.05, "root.x = {}", root.x);
        assert!(report.goal_term < 0.16);
        assert!(report.evaluations > 0);
        assert!(report.iterations >= 1);
    }

    #[test]
    fn upper_body_mode_never_moves_root() {
        let mut s = upper_body();
        let mut solver = BodySolver::new(&s, &config(&["LWrist"])).unwrap();
        let goal = IkGoal::new("LWrist", Vector3::new(2.0, 0.0, 0.0), 1.0);
        solver.solve(&mut s, &[goal]);
        assert_relative_eq!(s.root_position().norm(), 0.0);
    }
}
