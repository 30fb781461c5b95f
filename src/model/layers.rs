//! Traced forward passes of the `burn::nn` layers the classifier is built from.
//!
//! Each function runs the layer eagerly and records it on the [Tracer], capturing parameters in
//! their checkpoint layout.
use crate::trace::{Op, Traced, Tracer};
use burn::nn::conv::Conv2d;
use burn::nn::pool::{AdaptiveAvgPool2d, MaxPool2d};
use burn::nn::{BatchNorm, Linear, PaddingConfig2d};
use burn::tensor::activation::relu as relu_op;
use burn::tensor::ops::conv::calculate_conv_padding;
use burn::tensor::backend::Backend;

/// Padding `config` resolves to for a `[height, width]` input.
fn padding_2d(
    config: &PaddingConfig2d,
    [height, width]: [usize; 2],
    kernel_size: &[usize; 2],
    stride: &[usize; 2],
) -> [usize; 2] {
    match config {
        PaddingConfig2d::Same => [
            calculate_conv_padding(kernel_size[0], stride[0], height, height),
            calculate_conv_padding(kernel_size[1], stride[1], width, width),
        ],
        PaddingConfig2d::Valid => [0, 0],
        PaddingConfig2d::Explicit(height, width) => [*height, *width],
    }
}

/// # Shapes
///
/// - input: `[batch_size, channels_in, height_in, width_in]`
/// - output: `[batch_size, channels_out, height_out, width_out]`
pub fn conv2d<B: Backend>(
    conv: &Conv2d<B>,
    input: Traced<B, 4>,
    tracer: &mut Tracer,
) -> Traced<B, 4> {
    let [_, _, height, width] = input.tensor.dims();
    let padding = padding_2d(&conv.padding.0, [height, width], &conv.kernel_size, &conv.stride);
    let output = conv.forward(input.tensor);

    tracer.record(&[input.id], output, |recording| Op::Conv2d {
        weight: recording.param("weight", &conv.weight.val()),
        bias: conv
            .bias
            .as_ref()
            .map(|bias| recording.param("bias", &bias.val())),
        stride: conv.stride,
        padding,
        dilation: conv.dilation,
        groups: conv.groups,
    })
}

/// Batch normalization of `[batch_size, channels, height, width]` inputs.
///
/// Burn normalizes with the batch statistics (and updates the running ones) when autodiff is
/// enabled, with the running statistics otherwise. Only the latter can be recorded faithfully.
pub fn batch_norm<B: Backend>(
    norm: &BatchNorm<B, 2>,
    input: Traced<B, 4>,
    tracer: &mut Tracer,
) -> Traced<B, 4> {
    let output = norm.forward(input.tensor);

    tracer.record(&[input.id], output, |recording| Op::BatchNorm {
        weight: recording.param("weight", &norm.gamma.val()),
        bias: recording.param("bias", &norm.beta.val()),
        running_mean: recording.param("running_mean", &norm.running_mean.value()),
        running_var: recording.param("running_var", &norm.running_var.value()),
        epsilon: norm.epsilon,
    })
}

/// `y = x @ weight + bias`. The weight is recorded `[d_output, d_input]`.
pub fn linear<B: Backend>(
    layer: &Linear<B>,
    input: Traced<B, 2>,
    tracer: &mut Tracer,
) -> Traced<B, 2> {
    let output = layer.forward(input.tensor);

    tracer.record(&[input.id], output, |recording| Op::Linear {
        weight: recording.param("weight", &layer.weight.val().transpose()),
        bias: layer
            .bias
            .as_ref()
            .map(|bias| recording.param("bias", &bias.val())),
    })
}

pub fn relu<B: Backend, const D: usize>(input: Traced<B, D>, tracer: &mut Tracer) -> Traced<B, D> {
    tracer.record(&[input.id], relu_op(input.tensor), |_| Op::Relu)
}

/// Element-wise sum of two values with the same shape.
pub fn add<B: Backend, const D: usize>(
    lhs: Traced<B, D>,
    rhs: Traced<B, D>,
    tracer: &mut Tracer,
) -> Traced<B, D> {
    tracer.record(&[lhs.id, rhs.id], lhs.tensor + rhs.tensor, |_| Op::Add)
}

pub fn max_pool<B: Backend>(
    pool: &MaxPool2d,
    input: Traced<B, 4>,
    tracer: &mut Tracer,
) -> Traced<B, 4> {
    let [_, _, height, width] = input.tensor.dims();
    let padding = padding_2d(&pool.padding.0, [height, width], &pool.kernel_size, &pool.stride);
    let output = pool.forward(input.tensor);

    tracer.record(&[input.id], output, |_| Op::MaxPool2d {
        kernel_size: pool.kernel_size,
        stride: pool.stride,
        padding,
        dilation: pool.dilation,
    })
}

pub fn adaptive_avg_pool<B: Backend>(
    pool: &AdaptiveAvgPool2d,
    input: Traced<B, 4>,
    tracer: &mut Tracer,
) -> Traced<B, 4> {
    let output = pool.forward(input.tensor);
    tracer.record(&[input.id], output, |_| Op::AdaptiveAvgPool2d {
        output_size: pool.output_size,
    })
}

/// `[batch_size, channels, height, width]` to `[batch_size, channels * height * width]`.
pub fn flatten<B: Backend>(input: Traced<B, 4>, tracer: &mut Tracer) -> Traced<B, 2> {
    tracer.record(&[input.id], input.tensor.flatten(1, 3), |_| Op::Flatten)
}
