//! Converts a trained food classifier checkpoint into a traced, self-contained artifact.
//!
//! The checkpoint is a PyTorch `state_dict` of a ResNet-50 whose final layer scores 101 food
//! categories. [convert()] rebuilds the architecture with Burn, loads the checkpoint into it,
//! records the forward pass as a straight-line graph and writes graph and parameters into a
//! single file that [TracedModule](trace::TracedModule) can execute on its own.

pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod error;
pub mod logger;
pub mod model;
pub mod paths;
pub mod trace;

pub use config::ConvertConfig;
pub use convert::{ConvertReport, convert};
pub use error::{ConvertError, ParameterMismatch};

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;
