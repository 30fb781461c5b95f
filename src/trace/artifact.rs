//! Single-file storage for traced models.
//!
//! An artifact is a safetensors file: the captured parameters are its tensors (f32, keyed by
//! parameter name) and the graph travels as JSON in the header metadata, next to `format`,
//! `producer` and `version` entries.
use super::graph::TracedGraph;
use crate::checkpoint::{Entry, StateDict};
use burn::tensor::TensorData;
use byteorder::{ByteOrder, LittleEndian};
use safetensors::tensor::{Dtype, SafeTensorError, SafeTensors, TensorView};
use std::collections::HashMap;
use std::path::Path;

/// Value of the `format` metadata entry.
pub const FORMAT: &str = "traced-graph";
/// Version of the graph encoding.
pub const FORMAT_VERSION: &str = "1";

const FORMAT_KEY: &str = "format";
const VERSION_KEY: &str = "version";
const PRODUCER_KEY: &str = "producer";
const GRAPH_KEY: &str = "graph";

#[derive(thiserror::Error, Debug)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0:?}")]
    Safetensors(SafeTensorError),

    #[error("Graph encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor data error: {0}")]
    Data(String),

    #[error("Not a traced graph artifact: {0}")]
    Format(String),

    #[error("Invalid graph: {0}")]
    Graph(String),

    #[error("Invalid input: {0}")]
    Input(String),
}

impl From<SafeTensorError> for ArtifactError {
    fn from(err: SafeTensorError) -> Self {
        Self::Safetensors(err)
    }
}

/// A traced graph together with the parameter values it reads.
#[derive(Debug, Clone)]
pub struct TracedModel {
    pub graph: TracedGraph,
    pub params: StateDict,
}

impl TracedModel {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        let mut buffers = Vec::with_capacity(self.params.len());
        for (name, entry) in self.params.iter() {
            let Entry::Tensor(data) = entry else {
                return Err(ArtifactError::Data(format!("{name} is not a tensor")));
            };
            let values = data
                .clone()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|err| ArtifactError::Data(format!("{name}: {err:?}")))?;
            let mut bytes = vec![0u8; values.len() * 4];
            LittleEndian::write_f32_into(&values, &mut bytes);
            buffers.push((name, data.shape.clone(), bytes));
        }

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (*name, view))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let metadata = HashMap::from([
            (FORMAT_KEY.to_string(), FORMAT.to_string()),
            (VERSION_KEY.to_string(), FORMAT_VERSION.to_string()),
            (
                PRODUCER_KEY.to_string(),
                format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            ),
            (GRAPH_KEY.to_string(), serde_json::to_string(&self.graph)?),
        ]);

        Ok(safetensors::serialize(views, &Some(metadata))?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header
            .metadata()
            .as_ref()
            .ok_or_else(|| ArtifactError::Format("missing metadata".to_string()))?;

        match metadata.get(FORMAT_KEY) {
            Some(format) if format == FORMAT => {}
            other => {
                return Err(ArtifactError::Format(format!(
                    "expected format '{FORMAT}', found {other:?}"
                )));
            }
        }
        match metadata.get(VERSION_KEY) {
            Some(version) if version == FORMAT_VERSION => {}
            other => {
                return Err(ArtifactError::Format(format!(
                    "unsupported version {other:?}"
                )));
            }
        }
        let graph = metadata
            .get(GRAPH_KEY)
            .ok_or_else(|| ArtifactError::Format("missing graph".to_string()))?;
        let graph: TracedGraph = serde_json::from_str(graph)?;

        let tensors = SafeTensors::deserialize(bytes)?;
        let mut params = StateDict::new();
        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(ArtifactError::Data(format!(
                    "{name}: expected F32, found {:?}",
                    view.dtype()
                )));
            }
            let mut values = vec![0.0f32; view.data().len() / 4];
            LittleEndian::read_f32_into(view.data(), &mut values);
            params.insert(name, TensorData::new(values, view.shape().to_vec()));
        }

        Ok(Self { graph, params })
    }

    /// Writes the artifact, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
