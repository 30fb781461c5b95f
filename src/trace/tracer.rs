use super::graph::{Node, Op, TracedGraph, ValueId};
use crate::checkpoint::{KeyPath, StateDict};
use burn::tensor::{Tensor, backend::Backend};
use std::fmt::Display;

/// A tensor flowing through a forward pass, tagged with its id in the trace.
#[derive(Debug, Clone)]
pub struct Traced<B: Backend, const D: usize> {
    pub tensor: Tensor<B, D>,
    pub id: ValueId,
}

/// A module whose forward pass can be recorded.
pub trait Traceable<B: Backend> {
    fn forward_traced(&self, input: Traced<B, 4>, tracer: &mut Tracer) -> Traced<B, 2>;
}

/// State of an active recording.
#[derive(Debug, Default)]
pub struct Recording {
    scope: KeyPath,
    nodes: Vec<Node>,
    params: StateDict,
    next_id: ValueId,
}

impl Recording {
    /// Captures the current value of a parameter and returns its name.
    pub fn param<B: Backend, const D: usize>(&mut self, leaf: &str, value: &Tensor<B, D>) -> String {
        let name = self.scope.key(leaf);
        if self.params.entry(&name).is_none() {
            self.params.insert(name.clone(), value.to_data());
        }
        name
    }

    fn next_id(&mut self) -> ValueId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Records operations as a forward pass executes them.
///
/// An eager tracer records nothing; the same forward code runs either way.
#[derive(Debug, Default)]
pub struct Tracer {
    recording: Option<Recording>,
    input: Option<(ValueId, Vec<usize>)>,
}

impl Tracer {
    pub fn eager() -> Self {
        Self::default()
    }

    pub fn recording() -> Self {
        Self {
            recording: Some(Recording::default()),
            input: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Registers the graph input.
    pub fn input<B: Backend, const D: usize>(&mut self, tensor: Tensor<B, D>) -> Traced<B, D> {
        let id = match self.recording.as_mut() {
            Some(recording) => {
                let id = recording.next_id();
                self.input = Some((id, tensor.dims().to_vec()));
                id
            }
            None => 0,
        };
        Traced { tensor, id }
    }

    /// Runs `f` with `name` appended to the parameter scope.
    pub fn scoped<R>(&mut self, name: impl Display, f: impl FnOnce(&mut Self) -> R) -> R {
        if let Some(recording) = self.recording.as_mut() {
            recording.scope.push(name);
        }
        let result = f(self);
        if let Some(recording) = self.recording.as_mut() {
            recording.scope.pop();
        }
        result
    }

    /// Tags `output` as produced from `inputs` by the operation `op` builds.
    ///
    /// `op` only runs while recording, and receives the recording to capture parameters.
    pub fn record<B: Backend, const D: usize>(
        &mut self,
        inputs: &[ValueId],
        output: Tensor<B, D>,
        op: impl FnOnce(&mut Recording) -> Op,
    ) -> Traced<B, D> {
        let Some(recording) = self.recording.as_mut() else {
            return Traced {
                tensor: output,
                id: 0,
            };
        };

        let op = op(recording);
        let id = recording.next_id();
        recording.nodes.push(Node {
            output: id,
            inputs: inputs.to_vec(),
            op,
            shape: output.dims().to_vec(),
        });
        Traced { tensor: output, id }
    }

    /// Ends the recording with `output` as the graph result.
    pub fn finish<B: Backend, const D: usize>(
        self,
        output: &Traced<B, D>,
    ) -> Result<(TracedGraph, StateDict), String> {
        let recording = self
            .recording
            .ok_or_else(|| "the tracer was not recording".to_string())?;
        let (input, input_shape) = self
            .input
            .ok_or_else(|| "no input was registered".to_string())?;

        if recording.nodes.is_empty() {
            return Err("no operation was recorded".to_string());
        }
        if !recording.nodes.iter().any(|node| node.output == output.id) {
            return Err(format!(
                "the output value {} was not produced by a recorded operation",
                output.id
            ));
        }

        let graph = TracedGraph {
            input,
            input_shape,
            nodes: recording.nodes,
            output: output.id,
        };
        Ok((graph, recording.params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::tensor::activation::relu;

    #[test]
    fn eager_tracer_records_nothing() {
        let device = Default::default();
        let mut tracer = Tracer::eager();
        let x = tracer.input(Tensor::<TestBackend, 2>::ones([1, 2], &device));
        let mut called = false;
        let y = tracer.record(&[x.id], relu(x.tensor.clone()), |_| {
            called = true;
            Op::Relu
        });

        assert!(!called);
        assert_eq!(y.id, 0);
        assert!(tracer.finish(&y).is_err());
    }

    #[test]
    fn recording_assigns_ids_and_scoped_names() {
        let device = Default::default();
        let weight = Tensor::<TestBackend, 2>::ones([3, 2], &device);
        let mut tracer = Tracer::recording();

        let x = tracer.input(Tensor::<TestBackend, 2>::ones([1, 2], &device));
        let y = tracer.scoped("model", |tracer| {
            tracer.scoped("fc", |tracer| {
                let output = x.tensor.clone().matmul(weight.clone().transpose());
                tracer.record(&[x.id], output, |recording| Op::Linear {
                    weight: recording.param("weight", &weight),
                    bias: None,
                })
            })
        });
        let (graph, params) = tracer.finish(&y).unwrap();

        assert_eq!(graph.input, 0);
        assert_eq!(graph.input_shape, vec![1, 2]);
        assert_eq!(graph.output, 1);
        assert_eq!(graph.nodes[0].inputs, vec![0]);
        assert_eq!(graph.nodes[0].shape, vec![1, 3]);
        assert_eq!(params.first_key(), Some("model.fc.weight"));
        assert_eq!(graph.output_shape(), Some([1usize, 3].as_slice()));
    }

    #[test]
    fn finishing_on_the_input_fails() {
        let device = Default::default();
        let mut tracer = Tracer::recording();
        let x = tracer.input(Tensor::<TestBackend, 2>::ones([1, 2], &device));

        assert!(tracer.finish(&x).is_err());
    }
}
