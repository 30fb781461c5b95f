use super::artifact::{ArtifactError, TracedModel};
use super::graph::{Op, TracedGraph, ValueId};
use crate::checkpoint::Entry;
use burn::tensor::activation::relu;
use burn::tensor::module::{adaptive_avg_pool2d, conv2d, max_pool2d};
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, TensorData, backend::Backend};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
enum Value<B: Backend> {
    Rank1(Tensor<B, 1>),
    Rank2(Tensor<B, 2>),
    Rank4(Tensor<B, 4>),
}

impl<B: Backend> Value<B> {
    fn from_data(data: TensorData, device: &B::Device) -> Result<Self, String> {
        let data = data.convert::<B::FloatElem>();
        match data.shape.len() {
            1 => Ok(Self::Rank1(Tensor::from_data(data, device))),
            2 => Ok(Self::Rank2(Tensor::from_data(data, device))),
            4 => Ok(Self::Rank4(Tensor::from_data(data, device))),
            rank => Err(format!("unsupported parameter rank {rank}")),
        }
    }

    fn shape(&self) -> Vec<usize> {
        match self {
            Self::Rank1(tensor) => tensor.dims().to_vec(),
            Self::Rank2(tensor) => tensor.dims().to_vec(),
            Self::Rank4(tensor) => tensor.dims().to_vec(),
        }
    }

    fn rank1(&self) -> Tensor<B, 1> {
        match self {
            Self::Rank1(tensor) => tensor.clone(),
            _ => unreachable!("shape checked when the graph was loaded"),
        }
    }

    fn rank2(&self) -> Tensor<B, 2> {
        match self {
            Self::Rank2(tensor) => tensor.clone(),
            _ => unreachable!("shape checked when the graph was loaded"),
        }
    }

    fn rank4(&self) -> Tensor<B, 4> {
        match self {
            Self::Rank4(tensor) => tensor.clone(),
            _ => unreachable!("shape checked when the graph was loaded"),
        }
    }
}

/// Executes a traced graph without the module that produced it.
#[derive(Debug)]
pub struct TracedModule<B: Backend> {
    graph: TracedGraph,
    params: HashMap<String, Value<B>>,
    /// Index in `nodes` after which each value is no longer read.
    last_use: HashMap<ValueId, usize>,
}

impl<B: Backend> TracedModule<B> {
    /// Loads an artifact from disk.
    pub fn load(path: &Path, device: &B::Device) -> Result<Self, ArtifactError> {
        Self::new(TracedModel::load(path)?, device)
    }

    /// Validates the graph and moves its parameters to `device`.
    pub fn new(model: TracedModel, device: &B::Device) -> Result<Self, ArtifactError> {
        let TracedModel { graph, params } = model;

        let params = params
            .into_iter()
            .map(|(name, entry)| {
                let Entry::Tensor(data) = entry else {
                    return Err(ArtifactError::Graph(format!("{name}: not a tensor")));
                };
                Value::from_data(data, device)
                    .map(|value| (name.clone(), value))
                    .map_err(|err| ArtifactError::Graph(format!("{name}: {err}")))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;

        let last_use = validate(&graph, &params)?;
        Ok(Self {
            graph,
            params,
            last_use,
        })
    }

    pub fn graph(&self) -> &TracedGraph {
        &self.graph
    }

    /// Runs the graph on `input`, `[batch_size, channels, height, width]`.
    ///
    /// Any batch size is accepted; the other dimensions must be the traced ones.
    pub fn forward(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 2>, ArtifactError> {
        let dims = input.dims();
        if dims[0] == 0 || dims[1..] != self.graph.input_shape[1..] {
            return Err(ArtifactError::Input(format!(
                "expected [batch_size, {}], found {dims:?}",
                self.graph.input_shape[1..]
                    .iter()
                    .map(usize::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let mut values: HashMap<ValueId, Value<B>> = HashMap::new();
        values.insert(self.graph.input, Value::Rank4(input));

        for (index, node) in self.graph.nodes.iter().enumerate() {
            let operand = |i: usize| &values[&node.inputs[i]];
            let output = match &node.op {
                Op::Conv2d {
                    weight,
                    bias,
                    stride,
                    padding,
                    dilation,
                    groups,
                } => Value::Rank4(conv2d(
                    operand(0).rank4(),
                    self.params[weight].rank4(),
                    bias.as_ref().map(|bias| self.params[bias].rank1()),
                    ConvOptions::new(*stride, *padding, *dilation, *groups),
                )),
                Op::BatchNorm {
                    weight,
                    bias,
                    running_mean,
                    running_var,
                    epsilon,
                } => {
                    let x = operand(0).rank4();
                    let [_, channels, _, _] = x.dims();
                    let shape = [1, channels, 1, 1];
                    let mean = self.params[running_mean].rank1().reshape(shape);
                    let var = self.params[running_var].rank1().reshape(shape);
                    let gamma = self.params[weight].rank1().reshape(shape);
                    let beta = self.params[bias].rank1().reshape(shape);

                    Value::Rank4((x - mean).div(var.add_scalar(*epsilon).sqrt()) * gamma + beta)
                }
                Op::Relu => match operand(0) {
                    Value::Rank1(x) => Value::Rank1(relu(x.clone())),
                    Value::Rank2(x) => Value::Rank2(relu(x.clone())),
                    Value::Rank4(x) => Value::Rank4(relu(x.clone())),
                },
                Op::MaxPool2d {
                    kernel_size,
                    stride,
                    padding,
                    dilation,
                } => Value::Rank4(max_pool2d(
                    operand(0).rank4(),
                    *kernel_size,
                    *stride,
                    *padding,
                    *dilation,
                )),
                Op::Add => match (operand(0), operand(1)) {
                    (Value::Rank1(a), Value::Rank1(b)) => Value::Rank1(a.clone() + b.clone()),
                    (Value::Rank2(a), Value::Rank2(b)) => Value::Rank2(a.clone() + b.clone()),
                    (Value::Rank4(a), Value::Rank4(b)) => Value::Rank4(a.clone() + b.clone()),
                    _ => unreachable!("operand shapes checked when the graph was loaded"),
                },
                Op::AdaptiveAvgPool2d { output_size } => {
                    Value::Rank4(adaptive_avg_pool2d(operand(0).rank4(), *output_size))
                }
                Op::Flatten => Value::Rank2(operand(0).rank4().flatten(1, 3)),
                Op::Linear { weight, bias } => {
                    let output = operand(0).rank2().matmul(self.params[weight].rank2().transpose());
                    match bias {
                        Some(bias) => Value::Rank2(output + self.params[bias].rank1().unsqueeze()),
                        None => Value::Rank2(output),
                    }
                }
            };

            values.retain(|id, _| self.last_use.get(id).is_some_and(|last| *last > index));
            values.insert(node.output, output);
        }

        values
            .remove(&self.graph.output)
            .map(|value| value.rank2())
            .ok_or_else(|| {
                ArtifactError::Graph(format!("output value {} was not produced", self.graph.output))
            })
    }
}

/// Checks that every operand is defined before use, and propagates shapes from the traced
/// input: parameters must have the shapes their operation needs and every node must produce
/// the shape observed while tracing. The output must be a rank-2 value.
///
/// Returns, for each value, the index of the last node reading it.
fn validate<B: Backend>(
    graph: &TracedGraph,
    params: &HashMap<String, Value<B>>,
) -> Result<HashMap<ValueId, usize>, ArtifactError> {
    let fail = |message: String| Err(ArtifactError::Graph(message));

    if graph.input_shape.len() != 4 || graph.input_shape.contains(&0) {
        return fail(format!(
            "input must be a non-empty rank 4 shape, found {:?}",
            graph.input_shape
        ));
    }

    let mut shapes = HashMap::from([(graph.input, graph.input_shape.clone())]);
    let mut last_use = HashMap::new();

    for (index, node) in graph.nodes.iter().enumerate() {
        if node.inputs.len() != node.op.arity() {
            return fail(format!(
                "node {} expects {} operand(s), found {}",
                node.output,
                node.op.arity(),
                node.inputs.len()
            ));
        }

        let mut operands = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            match shapes.get(input) {
                Some(shape) => operands.push(shape.as_slice()),
                None => {
                    return fail(format!(
                        "node {} reads value {input} before it is defined",
                        node.output
                    ));
                }
            }
            last_use.insert(*input, index);
        }

        let shape = node
            .op
            .output_shape(&operands, |name| params.get(name).map(Value::shape))
            .map_err(|err| ArtifactError::Graph(format!("node {}: {err}", node.output)))?;
        if shape != node.shape {
            return fail(format!(
                "node {} produces shape {shape:?}, traced with {:?}",
                node.output, node.shape
            ));
        }

        if shapes.insert(node.output, shape).is_some() {
            return fail(format!("value {} is defined twice", node.output));
        }
    }

    match shapes.get(&graph.output) {
        Some(shape) if shape.len() == 2 => {}
        Some(shape) => return fail(format!("output must have rank 2, found shape {shape:?}")),
        None => return fail(format!("output value {} is never produced", graph.output)),
    }
    // Keep the output alive until the end.
    last_use.insert(graph.output, usize::MAX);

    Ok(last_use)
}
