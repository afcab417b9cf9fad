//! Joint-tree skeleton posed by the IK solvers.
//!
//! Joints live in an arena indexed by [`JointId`]. Each joint carries a
//! fixed translation offset from its parent and a mutable local rotation;
//! the root additionally carries a mutable world position. The host owns
//! the skeleton's lifecycle; solvers mutate local rotations (and the root
//! position) but never restructure the tree.

use std::collections::HashMap;

use nalgebra::{UnitQuaternion, Vector3};

use crate::error::SkeletonError;

/// Index of a joint within a [`Skeleton`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JointId(pub usize);

/// A single joint in the tree.
#[derive(Debug, Clone)]
pub struct Joint {
    /// Stable tag used for lookup (e.g. "LWrist").
    pub tag: String,
    /// Parent joint. `None` for the root.
    pub parent: Option<JointId>,
    /// Children in insertion order.
    children: Vec<JointId>,
    /// Fixed translation from the parent joint, in the parent's frame.
    pub offset: Vector3<f32>,
    /// Local rotation relative to the parent.
    pub local_rotation: UnitQuaternion<f32>,
}

/// A rooted joint tree with a world-space root position.
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    joints: Vec<Joint>,
    root_position: Vector3<f32>,
    by_tag: HashMap<String, JointId>,
}

impl Skeleton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the root joint.
    ///
    /// # Errors
    ///
    /// Returns an error if the skeleton already has joints.
    pub fn add_root(
        &mut self,
        tag: &str,
        position: Vector3<f32>,
    ) -> Result<JointId, SkeletonError> {
        if !self.joints.is_empty() {
            return Err(SkeletonError::RootAlreadySet);
        }
        self.root_position = position;
        self.push_joint(tag, None, Vector3::zeros())
    }

    /// Add a joint under `parent` with a fixed translation offset.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate tag or an out-of-range parent id.
    pub fn add_joint(
        &mut self,
        tag: &str,
        parent: JointId,
        offset: Vector3<f32>,
    ) -> Result<JointId, SkeletonError> {
        if parent.0 >= self.joints.len() {
            return Err(SkeletonError::InvalidParent(parent.0));
        }
        let id = self.push_joint(tag, Some(parent), offset)?;
        self.joints[parent.0].children.push(id);
        Ok(id)
    }

    fn push_joint(
        &mut self,
        tag: &str,
        parent: Option<JointId>,
        offset: Vector3<f32>,
    ) -> Result<JointId, SkeletonError> {
        if self.by_tag.contains_key(tag) {
            return Err(SkeletonError::DuplicateTag(tag.to_string()));
        }
        let id = JointId(self.joints.len());
        self.joints.push(Joint {
            tag: tag.to_string(),
            parent,
            children: Vec::new(),
            offset,
            local_rotation: UnitQuaternion::identity(),
        });
        self.by_tag.insert(tag.to_string(), id);
        Ok(id)
    }

    /// The root joint, if any joints exist.
    pub fn root(&self) -> Option<JointId> {
        if self.joints.is_empty() {
            None
        } else {
            Some(JointId(0))
        }
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn joint(&self, id: JointId) -> &Joint {
        &self.joints[id.0]
    }

    pub fn children(&self, id: JointId) -> &[JointId] {
        &self.joints[id.0].children
    }

    /// Look up a joint by its tag.
    pub fn find_by_tag(&self, tag: &str) -> Option<JointId> {
        self.by_tag.get(tag).copied()
    }

    pub fn local_rotation(&self, id: JointId) -> UnitQuaternion<f32> {
        self.joints[id.0].local_rotation
    }

    pub fn set_local_rotation(&mut self, id: JointId, rotation: UnitQuaternion<f32>) {
        self.joints[id.0].local_rotation = rotation;
    }

    pub fn root_position(&self) -> Vector3<f32> {
        self.root_position
    }

    pub fn set_root_position(&mut self, position: Vector3<f32>) {
        self.root_position = position;
    }

    /// World-space rotation of a joint.
    pub fn world_rotation(&self, id: JointId) -> UnitQuaternion<f32> {
        let joint = &self.joints[id.0];
        match joint.parent {
            Some(parent) => self.world_rotation(parent) * joint.local_rotation,
            None => joint.local_rotation,
        }
    }

    /// World-space position of a joint.
    ///
    /// A joint's position depends on its ancestors' rotations but not on
    /// its own.
    pub fn world_position(&self, id: JointId) -> Vector3<f32> {
        let joint = &self.joints[id.0];
        match joint.parent {
            Some(parent) => self.world_position(parent) + self.world_rotation(parent) * joint.offset,
            None => self.root_position,
        }
    }

    /// Set a joint's world-space rotation by converting through the
    /// parent's world rotation.
    pub fn set_world_rotation(&mut self, id: JointId, rotation: UnitQuaternion<f32>) {
        let parent_world = match self.joints[id.0].parent {
            Some(parent) => self.world_rotation(parent),
            None => UnitQuaternion::identity(),
        };
        self.joints[id.0].local_rotation = parent_world.inverse() * rotation;
    }

    /// Joints from the root down to `id`, inclusive.
    pub fn path_from_root(&self, id: JointId) -> Vec<JointId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.joints[current.0].parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Copy the pose (local rotations and root position) from a skeleton
    /// with the same joint layout. No allocation.
    ///
    /// # Panics
    ///
    /// Panics if the two skeletons have different joint counts.
    pub fn copy_pose_from(&mut self, other: &Skeleton) {
        assert_eq!(
            self.joints.len(),
            other.joints.len(),
            "pose copy requires identical joint layouts"
        );
        for (dst, src) in self.joints.iter_mut().zip(&other.joints) {
            dst.local_rotation = src.local_rotation;
        }
        self.root_position = other.root_position;
    }
}

// ---------------------------------------------------------------------------
// End-effector tags
// ---------------------------------------------------------------------------

/// Limb chain tags for a supported end-effector: (mid joint, proximal
/// joint), i.e. (elbow, shoulder) for arms and (knee, hip) for legs.
pub fn limb_joint_tags(end_effector: &str) -> Option<(&'static str, &'static str)> {
    match end_effector {
        "LWrist" => Some(("LElbow", "LShoulder")),
        "RWrist" => Some(("RElbow", "RShoulder")),
        "LAnkle" => Some(("LKnee", "LHip")),
        "RAnkle" => Some(("RKnee", "RHip")),
        _ => None,
    }
}

/// Whether an end-effector tag denotes a leg chain.
pub fn is_leg(end_effector: &str) -> bool {
    matches!(end_effector, "LAnkle" | "RAnkle")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
