use serde::{Deserialize, Serialize};

/// Identifies a tensor value inside a traced graph.
pub type ValueId = usize;

/// A recorded tensor operation. Parameters are referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Conv2d {
        weight: String,
        bias: Option<String>,
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
        groups: usize,
    },
    BatchNorm {
        weight: String,
        bias: String,
        running_mean: String,
        running_var: String,
        epsilon: f64,
    },
    Relu,
    MaxPool2d {
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
    },
    Add,
    AdaptiveAvgPool2d {
        output_size: [usize; 2],
    },
    /// Collapses every dimension after the batch one.
    Flatten,
    /// `y = x @ weight^T + bias`, with `weight` laid out `[d_output, d_input]`.
    Linear {
        weight: String,
        bias: Option<String>,
    },
}

impl Op {
    /// Number of tensor operands.
    pub fn arity(&self) -> usize {
        match self {
            Op::Add => 2,
            _ => 1,
        }
    }

    /// Names of the parameters the operation reads.
    pub fn params(&self) -> Vec<&str> {
        match self {
            Op::Conv2d { weight, bias, .. } | Op::Linear { weight, bias } => {
                let mut params = vec![weight.as_str()];
                params.extend(bias.as_deref());
                params
            }
            Op::BatchNorm {
                weight,
                bias,
                running_mean,
                running_var,
                ..
            } => vec![
                weight.as_str(),
                bias.as_str(),
                running_mean.as_str(),
                running_var.as_str(),
            ],
            Op::Relu
            | Op::MaxPool2d { .. }
            | Op::Add
            | Op::AdaptiveAvgPool2d { .. }
            | Op::Flatten => Vec::new(),
        }
    }

    /// Shape of the value produced from operands of shape `operands`, checking every
    /// parameter against the shape the operation needs. `param` looks up parameter shapes.
    pub fn output_shape(
        &self,
        operands: &[&[usize]],
        param: impl Fn(&str) -> Option<Vec<usize>>,
    ) -> Result<Vec<usize>, String> {
        let lookup = |name: &str| param(name).ok_or_else(|| format!("unknown parameter {name}"));
        let expect = |name: &str, expected: &[usize]| -> Result<(), String> {
            let shape = lookup(name)?;
            match shape == expected {
                true => Ok(()),
                false => Err(format!(
                    "parameter {name} has shape {shape:?}, expected {expected:?}"
                )),
            }
        };

        match self {
            Op::Conv2d {
                weight,
                bias,
                stride,
                padding,
                dilation,
                groups,
            } => {
                let [batch_size, channels, height, width] = rank4(operands[0])?;
                let shape = lookup(weight)?;
                let [channels_out, per_group, kernel_height, kernel_width] = rank4(&shape)
                    .map_err(|_| format!("parameter {weight} has shape {shape:?}, expected rank 4"))?;
                if *groups == 0
                    || channels_out % groups != 0
                    || per_group.checked_mul(*groups) != Some(channels)
                {
                    return Err(format!(
                        "parameter {weight} of shape {shape:?} cannot convolve {channels} channels in {groups} group(s)"
                    ));
                }
                if let Some(bias) = bias {
                    expect(bias, &[channels_out])?;
                }

                Ok(vec![
                    batch_size,
                    channels_out,
                    window(height, kernel_height, stride[0], padding[0], dilation[0])?,
                    window(width, kernel_width, stride[1], padding[1], dilation[1])?,
                ])
            }
            Op::BatchNorm {
                weight,
                bias,
                running_mean,
                running_var,
                ..
            } => {
                let [_, channels, _, _] = rank4(operands[0])?;
                for name in [weight, bias, running_mean, running_var] {
                    let name = name.as_str();
                    expect(name, &[channels])?;
                }
                Ok(operands[0].to_vec())
            }
            Op::Relu => Ok(operands[0].to_vec()),
            Op::MaxPool2d {
                kernel_size,
                stride,
                padding,
                dilation,
            } => {
                let [batch_size, channels, height, width] = rank4(operands[0])?;
                if padding[0] > kernel_size[0] / 2 || padding[1] > kernel_size[1] / 2 {
                    return Err(format!(
                        "padding {padding:?} exceeds half the kernel size {kernel_size:?}"
                    ));
                }

                Ok(vec![
                    batch_size,
                    channels,
                    window(height, kernel_size[0], stride[0], padding[0], dilation[0])?,
                    window(width, kernel_size[1], stride[1], padding[1], dilation[1])?,
                ])
            }
            Op::Add => match operands[0] == operands[1] {
                true => Ok(operands[0].to_vec()),
                false => Err(format!(
                    "cannot add values of shapes {:?} and {:?}",
                    operands[0], operands[1]
                )),
            },
            Op::AdaptiveAvgPool2d { output_size } => {
                let [batch_size, channels, _, _] = rank4(operands[0])?;
                if output_size.contains(&0) {
                    return Err(format!("empty output size {output_size:?}"));
                }
                Ok(vec![batch_size, channels, output_size[0], output_size[1]])
            }
            Op::Flatten => {
                let [batch_size, channels, height, width] = rank4(operands[0])?;
                let features = channels
                    .checked_mul(height)
                    .and_then(|features| features.checked_mul(width))
                    .ok_or_else(|| format!("flattening {:?} overflows", operands[0]))?;
                Ok(vec![batch_size, features])
            }
            Op::Linear { weight, bias } => {
                let [batch_size, features] = <[usize; 2]>::try_from(operands[0])
                    .map_err(|_| format!("expects a rank 2 operand, found shape {:?}", operands[0]))?;
                let shape = lookup(weight)?;
                let [d_output, d_input] = <[usize; 2]>::try_from(shape.as_slice())
                    .map_err(|_| format!("parameter {weight} has shape {shape:?}, expected rank 2"))?;
                if d_input != features {
                    return Err(format!(
                        "parameter {weight} of shape {shape:?} cannot be applied to {features} features"
                    ));
                }
                if let Some(bias) = bias {
                    expect(bias, &[d_output])?;
                }
                Ok(vec![batch_size, d_output])
            }
        }
    }
}

fn rank4(shape: &[usize]) -> Result<[usize; 4], String> {
    <[usize; 4]>::try_from(shape)
        .map_err(|_| format!("expects a rank 4 operand, found shape {shape:?}"))
}

/// Output length of a sliding window over `size` elements.
fn window(
    size: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Result<usize, String> {
    if kernel_size == 0 || stride == 0 || dilation == 0 {
        return Err(format!(
            "window (kernel {kernel_size}, stride {stride}, dilation {dilation}) must be positive"
        ));
    }
    let span = dilation
        .checked_mul(kernel_size - 1)
        .and_then(|span| span.checked_add(1));
    let padded = padding
        .checked_mul(2)
        .and_then(|padding| padding.checked_add(size));

    match (span, padded) {
        (Some(span), Some(padded)) if span <= padded => Ok((padded - span) / stride + 1),
        _ => Err(format!(
            "window of {kernel_size} (dilation {dilation}) does not fit {size} elements padded by {padding}"
        )),
    }
}

/// One executed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub output: ValueId,
    pub inputs: Vec<ValueId>,
    #[serde(flatten)]
    pub op: Op,
    /// Shape observed while tracing.
    pub shape: Vec<usize>,
}

/// A straight-line computation graph: nodes are stored in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedGraph {
    pub input: ValueId,
    pub input_shape: Vec<usize>,
    pub nodes: Vec<Node>,
    pub output: ValueId,
}

impl TracedGraph {
    pub fn output_shape(&self) -> Option<&[usize]> {
        self.nodes
            .iter()
            .find(|node| node.output == self.output)
            .map(|node| node.shape.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nodes_serialize_with_an_op_tag() {
        let node = Node {
            output: 3,
            inputs: vec![2],
            op: Op::Linear {
                weight: "model.fc.weight".into(),
                bias: Some("model.fc.bias".into()),
            },
            shape: vec![1, 101],
        };
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["op"], "linear");
        assert_eq!(json["weight"], "model.fc.weight");
        assert_eq!(serde_json::from_value::<Node>(json).unwrap(), node);
    }

    fn conv(groups: usize) -> Op {
        Op::Conv2d {
            weight: "conv.weight".into(),
            bias: Some("conv.bias".into()),
            stride: [2, 2],
            padding: [3, 3],
            dilation: [1, 1],
            groups,
        }
    }

    #[test]
    fn conv_shapes_follow_the_torch_formula() {
        let params = |name: &str| match name {
            "conv.weight" => Some(vec![8, 3, 7, 7]),
            "conv.bias" => Some(vec![8]),
            _ => None,
        };

        let shape = conv(1).output_shape(&[&[2, 3, 32, 32]], params).unwrap();
        assert_eq!(shape, vec![2, 8, 16, 16]);

        let err = conv(1).output_shape(&[&[2, 4, 32, 32]], params).unwrap_err();
        assert!(err.contains("cannot convolve 4 channels"), "{err}");
        assert!(conv(0).output_shape(&[&[2, 3, 32, 32]], params).is_err());
        assert!(conv(1).output_shape(&[&[2, 3, 2, 2]], params).is_ok());
        assert!(conv(1).output_shape(&[&[2, 3, 32]], params).is_err());
    }

    #[test]
    fn linear_checks_the_feature_count() {
        let op = Op::Linear {
            weight: "fc.weight".into(),
            bias: Some("fc.bias".into()),
        };
        let params = |name: &str| match name {
            "fc.weight" => Some(vec![2, 5]),
            "fc.bias" => Some(vec![2]),
            _ => None,
        };

        assert_eq!(op.output_shape(&[&[3, 5]], params).unwrap(), vec![3, 2]);
        let err = op.output_shape(&[&[1, 4]], params).unwrap_err();
        assert!(err.contains("cannot be applied to 4 features"), "{err}");
        assert_eq!(op.params(), vec!["fc.weight", "fc.bias"]);
    }

    #[test]
    fn parameterless_ops() {
        let none = |_: &str| None;
        let pool = Op::MaxPool2d {
            kernel_size: [3, 3],
            stride: [2, 2],
            padding: [1, 1],
            dilation: [1, 1],
        };

        assert_eq!(pool.output_shape(&[&[1, 4, 8, 8]], none).unwrap(), vec![1, 4, 4, 4]);
        assert_eq!(Op::Flatten.output_shape(&[&[1, 4, 2, 2]], none).unwrap(), vec![1, 16]);
        assert!(Op::Add.output_shape(&[&[1, 4], &[1, 5]], none).is_err());
        assert_eq!(Op::Add.arity(), 2);

        let padded = Op::MaxPool2d {
            kernel_size: [2, 2],
            stride: [1, 1],
            padding: [2, 2],
            dilation: [1, 1],
        };
        assert!(padded.output_shape(&[&[1, 4, 8, 8]], none).is_err());
    }
}
