//! Per-character IK facade: goal intake, consolidation, and dispatch to
//! the configured solving strategy.

use armature_core::config::{SolveStrategyKind, SolverConfig};
use armature_core::error::ConfigError;
use armature_core::skeleton::Skeleton;
use tracing::{debug, warn};

use crate::body::BodySolver;
use crate::goal::{GoalStore, IkGoal};
use crate::limb::LimbSolver;

/// Solving strategy selected at configuration time.
#[derive(Debug)]
pub enum SolveStrategy {
    /// One independent closed-form solver per limb.
    Analytical(Vec<LimbSolver>),
    /// One whole-body optimizer covering all limbs.
    Numerical(BodySolver),
}

/// IK entry point for one character.
///
/// Built once from the skeleton and a validated [`SolverConfig`]. Each
/// frame the host pushes goals and calls [`solve`](IkRig::solve); goals
/// are consumed by the solve whether or not it succeeds.
#[derive(Debug)]
pub struct IkRig {
    goals: GoalStore,
    handled: Vec<String>,
    strategy: SolveStrategy,
    log_performance: bool,
}

impl IkRig {
    /// Validate the configuration and build the solving strategy.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid configuration or a skeleton missing
    /// required joints; the host is expected to log it and run without IK
    /// rather than crash the frame loop.
    pub fn new(skeleton: &Skeleton, config: &SolverConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let strategy = match config.strategy {
            SolveStrategyKind::Analytical => {
                let solvers = config
                    .end_effectors
                    .iter()
                    .map(|tag| LimbSolver::new(skeleton, tag))
                    .collect::<Result<Vec<_>, _>>()?;
                SolveStrategy::Analytical(solvers)
            }
            SolveStrategyKind::Numerical => {
                SolveStrategy::Numerical(BodySolver::new(skeleton, config)?)
            }
        };
        Ok(Self {
            goals: GoalStore::new(),
            handled: config.end_effectors.clone(),
            strategy,
            log_performance: config.log_performance,
        })
    }

    pub fn add_goal(&mut self, goal: IkGoal) {
        self.goals.add_goal(goal);
    }

    pub fn clear_goals(&mut self) {
        self.goals.clear_goals();
    }

    pub fn pending_goals(&self) -> usize {
        self.goals.len()
    }

    pub fn handled_end_effectors(&self) -> &[String] {
        &self.handled
    }

    pub fn strategy(&self) -> &SolveStrategy {
        &self.strategy
    }

    /// Consolidate this frame's goals and pose the skeleton.
    ///
    /// A goal for an end-effector this rig does not handle skips the
    /// whole frame (the stale pose is retained); the numerical strategy
    /// runs even with no goals so the pose stays anchored to the base.
    pub fn solve(&mut self, skeleton: &mut Skeleton) {
        let consolidated = match self.goals.consolidate(&self.handled, skeleton) {
            Ok(goals) => goals,
            Err(err) => {
                warn!(error = %err, "skipping IK frame");
                self.goals.clear_goals();
                return;
            }
        };
        self.goals.clear_goals();

        if self.log_performance {
            for goal in &consolidated {
                debug!(
                    end_effector = %goal.end_effector,
                    position = ?goal.position,
                    weight = goal.weight,
                    "consolidated goal"
                );
            }
        }

        match &mut self.strategy {
            SolveStrategy::Analytical(solvers) => {
                for solver in solvers {
                    if let Some(goal) = consolidated
                        .iter()
                        .find(|g| g.end_effector == solver.end_effector())
                    {
                        solver.solve(skeleton, goal);
                    }
                }
            }
            SolveStrategy::Numerical(solver) => {
                solver.solve(skeleton, &consolidated);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
