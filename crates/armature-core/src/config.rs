use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::skeleton::limb_joint_tags;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_base_pose_weight() -> f32 {
    1.0
}
const fn default_root_position_weight() -> f32 {
    1.0
}
const fn default_gaze_direction_weight() -> f32 {
    1.0
}
const fn default_max_iterations() -> u32 {
    10
}
const fn default_gradient_tolerance() -> f64 {
    0.05
}

// ---------------------------------------------------------------------------
// SolverConfig
// ---------------------------------------------------------------------------

/// Which solving strategy a rig uses for its end-effectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStrategyKind {
    /// Closed-form per-limb solve; limbs are posed independently.
    Analytical,
    /// Whole-body optimization honoring all goals at once.
    #[default]
    Numerical,
}

/// IK rig configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// End-effector tags this rig is responsible for. Fixed at
    /// initialization; a goal for any other tag rejects the frame.
    pub end_effectors: Vec<String>,

    #[serde(default)]
    pub strategy: SolveStrategyKind,

    /// How important it is to preserve the pose from the original motion.
    #[serde(default = "default_base_pose_weight")]
    pub base_pose_weight: f32,

    /// Importance of root position relative to joint orientations in the
    /// base-pose regularizer. Only used in full-body mode.
    #[serde(default = "default_root_position_weight")]
    pub root_position_weight: f32,

    /// Blend-in weight reserved for the host's gaze correction layer.
    #[serde(default = "default_gaze_direction_weight")]
    pub gaze_direction_weight: f32,

    /// Iteration cap for the whole-body optimizer. Bounds per-frame
    /// latency; non-convergence at the cap is not an error.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Gradient tolerance for the whole-body optimizer.
    #[serde(default = "default_gradient_tolerance")]
    pub gradient_tolerance: f64,

    /// Log per-goal echo, solve timing, and objective breakdown each frame.
    #[serde(default)]
    pub log_performance: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            end_effectors: Vec::new(),
            strategy: SolveStrategyKind::default(),
            base_pose_weight: default_base_pose_weight(),
            root_position_weight: default_root_position_weight(),
            gaze_direction_weight: default_gaze_direction_weight(),
            max_iterations: default_max_iterations(),
            gradient_tolerance: default_gradient_tolerance(),
            log_performance: false,
        }
    }
}

impl SolverConfig {
    /// Validate configuration. Returns Err on invalid values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.end_effectors.is_empty() {
            return Err(ConfigError::NoEndEffectors);
        }
        for tag in &self.end_effectors {
            if limb_joint_tags(tag).is_none() {
                return Err(ConfigError::UnknownEndEffector(tag.clone()));
            }
        }
        for (field, value) in [
            ("base_pose_weight", self.base_pose_weight),
            ("root_position_weight", self.root_position_weight),
            ("gaze_direction_weight", self.gaze_direction_weight),
        ] {
            if value < 0.0 {
                return Err(ConfigError::InvalidWeight { field, value });
            }
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.gradient_tolerance <= 0.0 {
            return Err(ConfigError::InvalidTolerance(self.gradient_tolerance));
        }
        Ok(())
    }

    /// Load from TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
