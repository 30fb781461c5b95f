use crate::checkpoint::CheckpointError;
use crate::trace::ArtifactError;
use std::fmt;
use std::path::PathBuf;

/// Every way a conversion can fail. All of them are fatal.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error("{reason}: {}", .path.display())]
    Path { path: PathBuf, reason: String },

    #[error("Failed to read checkpoint: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Error(s) in loading state_dict: {0}")]
    ParameterMismatch(ParameterMismatch),

    #[error("Failed to trace model: {0}")]
    Tracing(String),

    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid traced artifact: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConvertError {
    pub(crate) fn path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Path {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Disagreement between a checkpoint and the parameters the architecture expects.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParameterMismatch {
    /// Expected parameters absent from the checkpoint.
    pub missing: Vec<String>,
    /// Checkpoint entries the architecture does not know.
    pub unexpected: Vec<String>,
    /// Parameters present under the right name with the wrong shape.
    pub mismatched: Vec<ShapeMismatch>,
    /// Parameters whose checkpoint value is not a tensor.
    pub not_tensors: Vec<NotATensor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotATensor {
    pub name: String,
    /// Python type of the stored value.
    pub found: String,
}

impl ParameterMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
            && self.unexpected.is_empty()
            && self.mismatched.is_empty()
            && self.not_tensors.is_empty()
    }
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for ParameterMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sections = Vec::new();
        if !self.missing.is_empty() {
            sections.push(format!("Missing key(s): {}.", quoted(&self.missing)));
        }
        if !self.unexpected.is_empty() {
            sections.push(format!("Unexpected key(s): {}.", quoted(&self.unexpected)));
        }
        for mismatch in &self.mismatched {
            sections.push(format!(
                "size mismatch for {}: checkpoint shape {:?}, expected {:?}.",
                mismatch.name, mismatch.found, mismatch.expected
            ));
        }
        for value in &self.not_tensors {
            sections.push(format!(
                "While copying the parameter named \"{}\", expected a tensor from checkpoint but received {}.",
                value.name, value.found
            ));
        }
        write!(f, "{}", sections.join(" "))
    }
}
