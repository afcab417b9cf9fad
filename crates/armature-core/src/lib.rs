// armature-core: skeleton data model, rotation math, config, and errors for Armature IK.

pub mod config;
pub mod error;
pub mod rotation;
pub mod skeleton;
