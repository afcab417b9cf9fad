//! Frame-scoped IK goals and per-end-effector consolidation.
//!
//! Hosts may push any number of goals per frame, several of them for the
//! same end-effector (e.g. a reach controller and a gesture layer both
//! steering the same wrist). Before solving, the store consolidates each
//! end-effector's goals into a single blended goal so the solvers only
//! ever see one goal per effector.

use armature_core::error::GoalError;
use armature_core::rotation;
use armature_core::skeleton::Skeleton;
use nalgebra::{UnitQuaternion, Vector3};

/// Goals blended to a combined weight below this are dropped entirely.
pub const MIN_GOAL_WEIGHT: f32 = 0.005;

/// A single end-effector goal for the current frame.
#[derive(Debug, Clone)]
pub struct IkGoal {
    /// Tag of the end-effector this goal steers.
    pub end_effector: String,
    /// Target world-space position.
    pub position: Vector3<f32>,
    /// Target world-space rotation. Only honored when
    /// `preserve_absolute_rotation` is set.
    pub rotation: UnitQuaternion<f32>,
    /// Blend weight in `[0, 1]`. Out-of-range values are clamped at use.
    pub weight: f32,
    /// Pin the end-effector's world rotation to `rotation` after the
    /// position solve.
    pub preserve_absolute_rotation: bool,
}

impl IkGoal {
    /// Position-only goal. The end-effector's rotation follows its parent
    /// chain.
    pub fn new(end_effector: impl Into<String>, position: Vector3<f32>, weight: f32) -> Self {
        Self {
            end_effector: end_effector.into(),
            position,
            rotation: UnitQuaternion::identity(),
            weight,
            preserve_absolute_rotation: false,
        }
    }

    /// Goal that also pins the end-effector's world rotation.
    pub fn with_rotation(mut self, rotation: UnitQuaternion<f32>) -> Self {
        self.rotation = rotation;
        self.preserve_absolute_rotation = true;
        self
    }
}

/// Collects goals during a frame and consolidates them at solve time.
#[derive(Debug, Default)]
pub struct GoalStore {
    pending: Vec<IkGoal>,
}

impl GoalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_goal(&mut self, goal: IkGoal) {
        self.pending.push(goal);
    }

    pub fn clear_goals(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[IkGoal] {
        &self.pending
    }

    /// Blend pending goals into at most one goal per end-effector.
    ///
    /// Positions are averaged with weight normalization; rotations are
    /// averaged in log-map space, with goals that do not pin a rotation
    /// contributing the effector's current world rotation. The combined
    /// weight is the clamped weight sum capped at 1. Effectors whose
    /// combined weight falls below [`MIN_GOAL_WEIGHT`] are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if any pending goal names an end-effector the rig
    /// does not handle; the caller is expected to skip the frame.
    pub fn consolidate(
        &self,
        handled: &[String],
        skeleton: &Skeleton,
    ) -> Result<Vec<IkGoal>, GoalError> {
        for goal in &self.pending {
            if !handled.contains(&goal.end_effector) {
                return Err(GoalError::UnhandledEndEffector(goal.end_effector.clone()));
            }
        }

        let mut consolidated = Vec::new();
        for tag in handled {
            let goals: Vec<&IkGoal> = self
                .pending
                .iter()
                .filter(|g| &g.end_effector == tag)
                .collect();
            if goals.is_empty() {
                continue;
            }

            let weight_sum: f32 = goals.iter().map(|g| g.weight.clamp(0.0, 1.0)).sum();
            if weight_sum < MIN_GOAL_WEIGHT {
                continue;
            }

            let current_rotation = skeleton
                .find_by_tag(tag)
                .map(|id| skeleton.world_rotation(id))
                .unwrap_or_else(UnitQuaternion::identity);

            let mut position = Vector3::zeros();
            let mut rotation_log = Vector3::zeros();
            for goal in &goals {
                let w = goal.weight.clamp(0.0, 1.0) / weight_sum;
                position += goal.position * w;
                let r = if goal.preserve_absolute_rotation {
                    goal.rotation
                } else {
                    current_rotation
                };
                rotation_log += rotation::log(&r) * w;
            }

            consolidated.push(IkGoal {
                end_effector: tag.clone(),
                position,
                rotation: rotation::exp(&rotation_log),
                weight: weight_sum.min(1.0),
                preserve_absolute_rotation: true,
            });
        }
        Ok(consolidated)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
