use crate::checkpoint::load_checkpoint;
use crate::config::ConvertConfig;
use crate::error::ConvertError;
use crate::trace::{ArtifactError, check_trace, trace};
use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Distribution, Tensor};
use std::path::{Path, PathBuf};

/// Outcome of a successful conversion.
#[derive(Debug, Clone)]
pub struct ConvertReport {
    pub checkpoint: PathBuf,
    pub output: PathBuf,
    /// Whether the checkpoint keys carried the replicated-training wrapper prefix.
    pub stripped_prefix: bool,
    /// Size of the written artifact, `None` if it could not be found after writing.
    pub file_size: Option<u64>,
}

/// Converts the checkpoint named by `config` into a traced artifact.
///
/// Relative paths are resolved against `base_dir`. The model is built on the autodiff
/// backend `B` and traced in inference mode on its inner backend.
pub fn convert<B: AutodiffBackend>(
    config: &ConvertConfig,
    base_dir: &Path,
    device: &B::Device,
) -> Result<ConvertReport, ConvertError> {
    let paths = config.resolve(base_dir);
    log::info!("Loading model from: {}", paths.checkpoint.display());
    log::info!("Will save to: {}", paths.output.display());

    if let Some(parent) = paths.output.parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            ConvertError::path(parent, format!("Failed to create output directory ({err})"))
        })?;
    }
    if !paths.checkpoint.is_file() {
        return Err(ConvertError::path(
            &paths.checkpoint,
            "Checkpoint file not found",
        ));
    }

    let model = config.model.init::<B>(device)?;
    log::info!("Model architecture created");

    log::info!("Loading state dict...");
    let mut state = load_checkpoint(&paths.checkpoint)?;
    let stripped_prefix = state.strip_wrapper_prefix();
    if stripped_prefix {
        log::debug!("Removed the replicated-training wrapper prefix from parameter names");
    }
    let model = model.load_state_dict(state)?;
    log::info!("State dict loaded successfully");

    let model = model.valid();
    log::info!("Model set to eval mode");

    let example = Tensor::<B::InnerBackend, 4>::random(
        config.input_shape,
        Distribution::Default,
        device,
    );
    log::info!("Created example input");

    log::info!("Tracing model...");
    let (traced, output) = trace(&model, example.clone())?;
    if config.check_trace {
        check_trace(&traced, example, output, config.check_tolerance)?;
    }

    log::info!("Saving model to {}", paths.output.display());
    traced.save(&paths.output).map_err(|err| ConvertError::Write {
        path: paths.output.clone(),
        source: match err {
            ArtifactError::Io(source) => source,
            other => std::io::Error::other(other.to_string()),
        },
    })?;
    log::info!("Model converted and saved successfully!");

    let file_size = match std::fs::metadata(&paths.output) {
        Ok(metadata) => {
            log::info!("Verified: File exists at {}", paths.output.display());
            log::info!("File size: {} bytes", metadata.len());
            Some(metadata.len())
        }
        Err(_) => {
            log::warn!("Output file was not created!");
            None
        }
    };

    Ok(ConvertReport {
        checkpoint: paths.checkpoint,
        output: paths.output,
        stripped_prefix,
        file_size,
    })
}
