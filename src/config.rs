pub use crate::model::ResNetConfig;
use crate::paths;
use burn::config::Config;
use std::path::{Path, PathBuf};

/// Checkpoint location, relative to the program directory.
pub const DEFAULT_CHECKPOINT: &str = "lib/features/chat/models/best_food_model.pth";
/// Traced artifact location, relative to the program directory.
pub const DEFAULT_OUTPUT: &str = "assets/models/food_model.pt";
/// Number of food categories the classifier was trained on.
pub const NUM_CLASSES: usize = 101;

/// Configuration of a conversion run.
#[derive(Config, Debug)]
pub struct ConvertConfig {
    /// The architecture to rebuild.
    pub model: ResNetConfig,
    /// Checkpoint to convert.
    #[config(default = "DEFAULT_CHECKPOINT.to_string()")]
    pub checkpoint: String,
    /// Where the traced artifact is written.
    #[config(default = "DEFAULT_OUTPUT.to_string()")]
    pub output: String,
    /// Shape of the synthetic input used for tracing, `[batch, channels, height, width]`.
    #[config(default = "[1, 3, 224, 224]")]
    pub input_shape: [usize; 4],
    /// Re-run the traced graph and compare it with eager execution.
    #[config(default = true)]
    pub check_trace: bool,
    /// Largest absolute difference tolerated by the trace check.
    #[config(default = 1e-3)]
    pub check_tolerance: f64,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self::new(ResNetConfig::new(NUM_CLASSES))
    }
}

/// Absolute locations of a conversion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub checkpoint: PathBuf,
    pub output: PathBuf,
}

impl ConvertConfig {
    /// Resolves the configured paths against `base_dir`.
    pub fn resolve(&self, base_dir: &Path) -> ResolvedPaths {
        ResolvedPaths {
            checkpoint: paths::absolute(base_dir, &self.checkpoint),
            output: paths::absolute(base_dir, &self.output),
        }
    }

    /// Resolves the configured paths against the program directory.
    pub fn resolve_from_program_dir(&self) -> ResolvedPaths {
        self.resolve(&paths::program_dir())
    }
}
