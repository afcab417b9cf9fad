use thiserror::Error;

/// Top-level error type for armature-core.
#[derive(Debug, Error)]
pub enum ArmatureError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Skeleton error: {0}")]
    Skeleton(#[from] SkeletonError),

    #[error("Goal error: {0}")]
    Goal(#[from] GoalError),
}

/// Configuration errors.
///
/// Detected when a rig is built. The host is expected to log these and
/// leave IK disabled for the character rather than abort its frame loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("No end-effectors configured")]
    NoEndEffectors,

    #[error("Unknown end-effector tag: {0}")]
    UnknownEndEffector(String),

    #[error("Skeleton has no joint with tag: {0}")]
    MissingJoint(String),

    #[error("Skeleton has no joints")]
    EmptySkeleton,

    #[error("No body joints between the root and the configured end-effectors")]
    NoBodyJoints,

    #[error("Invalid value for {field}: {value} (must be >= 0)")]
    InvalidWeight { field: &'static str, value: f32 },

    #[error("max_iterations must be > 0")]
    ZeroIterations,

    #[error("Invalid gradient_tolerance: {0} (must be > 0)")]
    InvalidTolerance(f64),
}

/// Skeleton construction errors.
#[derive(Debug, Error)]
pub enum SkeletonError {
    #[error("Duplicate joint tag: {0}")]
    DuplicateTag(String),

    #[error("Skeleton already has a root joint")]
    RootAlreadySet,

    #[error("Invalid parent joint id: {0}")]
    InvalidParent(usize),
}

/// Goal-set errors.
///
/// Detected at solve time. The whole frame's goal set is rejected and the
/// stale pose retained; nothing propagates across the per-frame boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GoalError {
    #[error("Goal references unhandled end-effector: {0}")]
    UnhandledEndEffector(String),
}
