//! Closed-form analytical solver for 3-joint limb chains.
//!
//! Poses the shoulder/hip and elbow/knee of one limb so the end-effector
//! approaches its goal: law-of-cosines elbow flex, shoulder alignment
//! toward the goal, and a continuity-preserving resolution of the
//! remaining swivel (roll) ambiguity about the shoulder-to-goal axis.
//! Terminology follows arm joints; leg chains differ only in tags and
//! swivel-axis sign.

use armature_core::error::ConfigError;
use armature_core::skeleton::{is_leg, limb_joint_tags, JointId, Skeleton};
use nalgebra::{Unit, UnitQuaternion, Vector3};

use crate::goal::IkGoal;

/// Swivel-axis recompute tolerance: the axis is only refreshed when the
/// limb is neither near-straight nor near-folded.
const SWIVEL_EPS: f32 = 1e-4;

/// Segments shorter than this are treated as degenerate.
const MIN_SEGMENT_LEN: f32 = 1e-6;

/// Joint ids for one limb, plus the swivel axis cached across frames.
///
/// The cached axis is the one piece of cross-frame solver state: at full
/// extension or full flexion the segment cross product is undefined, so
/// the previous frame's axis is reused.
#[derive(Debug, Clone)]
pub struct LimbChain {
    end_effector: String,
    shoulder: JointId,
    elbow: JointId,
    wrist: JointId,
    is_leg: bool,
    swivel_axis: Vector3<f32>,
}

impl LimbChain {
    /// Resolve a limb chain from its end-effector tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the tag is not a limb end-effector or any chain
    /// joint is missing from the skeleton.
    pub fn from_tags(skeleton: &Skeleton, end_effector: &str) -> Result<Self, ConfigError> {
        let (elbow_tag, shoulder_tag) = limb_joint_tags(end_effector)
            .ok_or_else(|| ConfigError::UnknownEndEffector(end_effector.to_string()))?;
        let find = |tag: &str| {
            skeleton
                .find_by_tag(tag)
                .ok_or_else(|| ConfigError::MissingJoint(tag.to_string()))
        };
        Ok(Self {
            end_effector: end_effector.to_string(),
            shoulder: find(shoulder_tag)?,
            elbow: find(elbow_tag)?,
            wrist: find(end_effector)?,
            is_leg: is_leg(end_effector),
            swivel_axis: Vector3::y(),
        })
    }

    pub fn end_effector(&self) -> &str {
        &self.end_effector
    }

    pub fn shoulder(&self) -> JointId {
        self.shoulder
    }

    pub fn elbow(&self) -> JointId {
        self.elbow
    }

    pub fn wrist(&self) -> JointId {
        self.wrist
    }

    pub fn swivel_axis(&self) -> Vector3<f32> {
        self.swivel_axis
    }
}

/// Analytical IK solver for one limb chain.
#[derive(Debug, Clone)]
pub struct LimbSolver {
    chain: LimbChain,
}

impl LimbSolver {
    pub fn new(skeleton: &Skeleton, end_effector: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            chain: LimbChain::from_tags(skeleton, end_effector)?,
        })
    }

    pub fn end_effector(&self) -> &str {
        self.chain.end_effector()
    }

    pub fn chain(&self) -> &LimbChain {
        &self.chain
    }

    /// Pose the limb toward `goal`, blended by the goal weight.
    ///
    /// Unreachable goals are not clamped here: the flex angle saturates at
    /// the law-of-cosines clamp bound and the limb fully extends toward
    /// the goal direction. Degenerate geometry (zero-length segments, goal
    /// at the shoulder) leaves the pose unchanged for this frame.
    pub fn solve(&mut self, skeleton: &mut Skeleton, goal: &IkGoal) {
        let weight = goal.weight.clamp(0.0, 1.0);
        if weight <= 0.0 {
            return;
        }
        let chain = &mut self.chain;

        let shoulder_local0 = skeleton.local_rotation(chain.shoulder);
        let shoulder_world0 = skeleton.world_rotation(chain.shoulder);
        let elbow_local0 = skeleton.local_rotation(chain.elbow);

        let shoulder_pos = skeleton.world_position(chain.shoulder);
        let elbow_pos = skeleton.world_position(chain.elbow);
        let wrist_pos = skeleton.world_position(chain.wrist);

        let goal_offset = goal.position - shoulder_pos;
        let goal_dist = goal_offset.norm();
        let mut es = shoulder_pos - elbow_pos;
        let mut ew = wrist_pos - elbow_pos;
        let len_es = es.norm();
        let len_ew = ew.norm();
        if len_es < MIN_SEGMENT_LEN || len_ew < MIN_SEGMENT_LEN || goal_dist < MIN_SEGMENT_LEN {
            return;
        }
        es /= len_es;
        ew /= len_ew;

        // Refresh the swivel axis only away from the straight/folded
        // singularity; legs bend the opposite way under the same
        // convention, so their axis is stored inverted.
        if (es.dot(&ew).abs() - 1.0).abs() > SWIVEL_EPS {
            let axis = es.cross(&ew).normalize();
            chain.swivel_axis = if chain.is_leg { -axis } else { axis };
        }

        // Flex the elbow so the goal distance becomes achievable.
        let flex = es.dot(&ew).clamp(-1.0, 1.0).acos();
        let goal_cos_flex =
            (len_es * len_es + len_ew * len_ew - goal_dist * goal_dist) / (2.0 * len_es * len_ew);
        let goal_flex = goal_cos_flex.clamp(-1.0, 1.0).acos();
        let local_axis = skeleton.world_rotation(chain.shoulder).inverse() * chain.swivel_axis;
        let flex_delta =
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(local_axis), goal_flex - flex);
        skeleton.set_local_rotation(chain.elbow, flex_delta * elbow_local0);

        // Align the end-effector direction with the goal direction, in the
        // shoulder-parent frame.
        let cur_dir = skeleton.world_position(chain.wrist) - shoulder_pos;
        if cur_dir.norm() < MIN_SEGMENT_LEN {
            skeleton.set_local_rotation(chain.elbow, elbow_local0);
            return;
        }
        let cur_dir = cur_dir.normalize();
        let goal_dir = goal_offset / goal_dist;
        let parent_world = match skeleton.joint(chain.shoulder).parent {
            Some(parent) => skeleton.world_rotation(parent),
            None => UnitQuaternion::identity(),
        };
        let parent_inv = parent_world.inverse();
        let align = UnitQuaternion::rotation_between(&(parent_inv * cur_dir), &(parent_inv * goal_dir))
            .unwrap_or_else(UnitQuaternion::identity);
        skeleton.set_local_rotation(chain.shoulder, align * skeleton.local_rotation(chain.shoulder));

        // Alignment leaves the swivel about the goal axis undetermined;
        // pick the twist candidate closest to the pre-solve rotation.
        let aligned = skeleton.world_rotation(chain.shoulder);
        let shoulder_world =
            pick_swivel_candidate(&shoulder_world0, &aligned, &goal_dir);
        skeleton.set_local_rotation(chain.shoulder, parent_inv * shoulder_world);

        // Blend from the original pose by goal weight.
        let shoulder_local = skeleton.local_rotation(chain.shoulder);
        skeleton.set_local_rotation(
            chain.shoulder,
            slerp_or(&shoulder_local0, &shoulder_local, weight),
        );
        let elbow_local = skeleton.local_rotation(chain.elbow);
        skeleton.set_local_rotation(chain.elbow, slerp_or(&elbow_local0, &elbow_local, weight));

        if goal.preserve_absolute_rotation {
            let wrist_world = skeleton.world_rotation(chain.wrist);
            skeleton.set_world_rotation(
                chain.wrist,
                slerp_or(&wrist_world, &goal.rotation, weight),
            );
        }
    }
}

/// Choose between the two shoulder rotations that differ by a ±180° twist
/// about the goal direction, keeping the one closest to `before`.
fn pick_swivel_candidate(
    before: &UnitQuaternion<f32>,
    aligned: &UnitQuaternion<f32>,
    goal_dir: &Vector3<f32>,
) -> UnitQuaternion<f32> {
    let v0 = before.imag();
    let vr = aligned.imag();
    let a = before.coords.dot(&aligned.coords);
    let b = aligned.w * goal_dir.dot(&v0) - before.w * goal_dir.dot(&vr)
        + v0.dot(&goal_dir.cross(&vr));
    let alpha = a.atan2(b);

    let twist_axis = Unit::new_normalize(*goal_dir);
    let c1 =
        UnitQuaternion::from_axis_angle(&twist_axis, -2.0 * alpha + std::f32::consts::PI) * aligned;
    let c2 =
        UnitQuaternion::from_axis_angle(&twist_axis, -2.0 * alpha - std::f32::consts::PI) * aligned;
    if before.coords.dot(&c1.coords) > before.coords.dot(&c2.coords) {
        c1
    } else {
        c2
    }
}

/// Slerp that falls back to `from` when the rotations are antipodal.
fn slerp_or(
    from: &UnitQuaternion<f32>,
    to: &UnitQuaternion<f32>,
    t: f32,
) -> UnitQuaternion<f32> {
    from.try_slerp(to, t, 1.0e-6).unwrap_or(*from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use armature_core::skeleton::Skeleton;

    fn arm() -> Skeleton {
        let mut s = Skeleton::new();
        let root = s.add_root("Hips", Vector3::zeros()).unwrap();
        let shoulder = s.add_joint("LShoulder", root, Vector3::zeros()).unwrap();
        let elbow = s
            .add_joint("LElbow", shoulder, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s.add_joint("LWrist", elbow, Vector3::new(0.3, 0.0, 0.0))
            .unwrap();
        s
    }

    fn leg() -> Skeleton {
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

    fn wrist_position(s: &Skeleton) -> Vector3<f32> {
        s.world_position(s.find_by_tag("LWrist").unwrap())
    }

    #[test]
    fn unknown_end_effector_rejected() {
        let err = LimbSolver::new(&arm(), "Head").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEndEffector(_)));
    }

    #[test]
    fn missing_chain_joint_rejected() {
        let err = LimbSolver::new(&arm(), "RWrist").unwrap_err();
        assert!(matches!(err, ConfigError::MissingJoint(_)));
    }

    #[test]
    fn zero_weight_leaves_pose_unchanged() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        let before = wrist_position(&s);
        solver.solve(&mut s, &IkGoal::new("LWrist", Vector3::new(0.5, 0.0, 0.0), 0.0));
        assert_relative_eq!((wrist_position(&s) - before).norm(), 0.0);
    }

    #[test]
    fn reachable_goal_is_reached() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        let goal = Vector3::new(0.5, 0.0, 0.0);
        solver.solve(&mut s, &IkGoal::new("LWrist", goal, 1.0));
        assert!((wrist_position(&s) - goal).norm() < 1e-3);
    }

    #[test]
    fn full_extension_goal_keeps_limb_straight() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        solver.solve(&mut s, &IkGoal::new("LWrist", Vector3::new(0.6, 0.0, 0.0), 1.0));
        let p = wrist_position(&s);
        assert_relative_eq!(p.x, 0.6, epsilon = 1e-4);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-4);
        assert_relative_eq!(p.z, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn unreachable_goal_extends_without_nan() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        // Beyond maximum reach: cos(flex) saturates at the clamp bound.
        solver.solve(&mut s, &IkGoal::new("LWrist", Vector3::new(1.0, 0.0, 0.0), 1.0));
        let p = wrist_position(&s);
        assert!(p.iter().all(|c| c.is_finite()));
        assert_relative_eq!(p.norm(), 0.6, epsilon = 1e-4);
        assert!((p.normalize() - Vector3::x()).norm() < 1e-4);
    }

    #[test]
    fn partial_weight_produces_partial_reach() {
        let mut full = arm();
        let mut half = arm();
        let goal = Vector3::new(0.3, 0.3, 0.0);
        LimbSolver::new(&full, "LWrist")
            .unwrap()
            .solve(&mut full, &IkGoal::new("LWrist", goal, 1.0));
        LimbSolver::new(&half, "LWrist")
            .unwrap()
            .solve(&mut half, &IkGoal::new("LWrist", goal, 0.5));

        let err_full = (wrist_position(&full) - goal).norm();
        let err_half = (wrist_position(&half) - goal).norm();
        assert!(err_full < 1e-3);
        assert!(err_half > err_full + 1e-3);
    }

    #[test]
    fn swivel_axis_stable_across_similar_goals() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        // First solve bends the limb so the axis is recomputed from
        // geometry on the next call.
        solver.solve(&mut s, &IkGoal::new("LWrist", Vector3::new(0.4, 0.1, 0.0), 1.0));
        solver.solve(&mut s, &IkGoal::new("LWrist", Vector3::new(0.4, 0.1, 0.0), 1.0));
        let axis0 = solver.chain().swivel_axis();
        solver.solve(
            &mut s,
            &IkGoal::new("LWrist", Vector3::new(0.4, 0.101, 0.0), 1.0),
        );
        let axis1 = solver.chain().swivel_axis();
        assert!(axis0.dot(&axis1) > 0.99);
    }

    #[test]
    fn straight_limb_reuses_cached_axis() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        let cached = solver.chain().swivel_axis();
        // At full extension the cross product is degenerate and the cached
        // axis must survive.
        solver.solve(&mut s, &IkGoal::new("LWrist", Vector3::new(0.6, 0.0, 0.0), 1.0));
        assert_relative_eq!((solver.chain().swivel_axis() - cached).norm(), 0.0);
    }

    #[test]
    fn leg_axis_is_inverted_arm_axis() {
        let bend = UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::z()), 0.5);
        let mut arm_s = arm();
        let elbow = arm_s.find_by_tag("LElbow").unwrap();
        arm_s.set_local_rotation(elbow, bend);
        let mut leg_s = leg();
        let knee = leg_s.find_by_tag("LKnee").unwrap();
        leg_s.set_local_rotation(knee, bend);

        let mut arm_solver = LimbSolver::new(&arm_s, "LWrist").unwrap();
        let mut leg_solver = LimbSolver::new(&leg_s, "LAnkle").unwrap();
        let goal = Vector3::new(0.4, 0.2, 0.0);
        arm_solver.solve(&mut arm_s, &IkGoal::new("LWrist", goal, 1.0));
        leg_solver.solve(&mut leg_s, &IkGoal::new("LAnkle", goal, 1.0));

        let dot = arm_solver
            .chain()
            .swivel_axis()
            .dot(&leg_solver.chain().swivel_axis());
        assert_relative_eq!(dot, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn preserve_absolute_rotation_pins_wrist() {
        let mut s = arm();
        let mut solver = LimbSolver::new(&s, "LWrist").unwrap();
        let target = UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::y()), 0.8);
        let goal =
            IkGoal::new("LWrist", Vector3::new(0.5, 0.0, 0.0), 1.0).with_rotation(target);
        solver.solve(&mut s, &goal);

        let wrist = s.find_by_tag("LWrist").unwrap();
        let got = s.world_rotation(wrist);
        let dot = got.coords.dot(&target.coords).abs();
        assert_relative_eq!(dot, 1.0, epsilon = 1e-4);
    }
}
