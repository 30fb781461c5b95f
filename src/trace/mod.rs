//! Straight-line graph tracing.
//!
//! A [Traceable] module is executed once on an example input while a [Tracer] records every
//! tensor operation it performs, yielding a [TracedGraph] whose parameters are captured by
//! name. The result is stored as a single file ([TracedModel]) and can be executed again by a
//! [TracedModule], without the module definition that produced it.

mod artifact;
mod graph;
mod runtime;
mod tracer;

pub use artifact::*;
pub use graph::*;
pub use runtime::*;
pub use tracer::*;

use crate::error::ConvertError;
use burn::tensor::{ElementConversion, Tensor, backend::Backend};

/// Records the forward pass of `module` on `example`.
///
/// Returns the captured model together with the eager output.
pub fn trace<B: Backend, M: Traceable<B>>(
    module: &M,
    example: Tensor<B, 4>,
) -> Result<(TracedModel, Tensor<B, 2>), ConvertError> {
    let mut tracer = Tracer::recording();
    let input = tracer.input(example);
    let output = module.forward_traced(input, &mut tracer);

    let (graph, params) = tracer.finish(&output).map_err(ConvertError::Tracing)?;
    log::debug!(
        "Captured {} operations reading {} parameters",
        graph.nodes.len(),
        params.len()
    );

    Ok((TracedModel { graph, params }, output.tensor))
}

/// Re-executes `traced` on `example` and compares the result with `expected`.
///
/// Fails when the graph cannot be executed or when any element differs by more than
/// `tolerance`.
pub fn check_trace<B: Backend>(
    traced: &TracedModel,
    example: Tensor<B, 4>,
    expected: Tensor<B, 2>,
    tolerance: f64,
) -> Result<(), ConvertError> {
    let device = example.device();
    let module = TracedModule::<B>::new(traced.clone(), &device)
        .map_err(|err| ConvertError::Tracing(err.to_string()))?;
    let actual = module
        .forward(example)
        .map_err(|err| ConvertError::Tracing(err.to_string()))?;

    if actual.dims() != expected.dims() {
        return Err(ConvertError::Tracing(format!(
            "traced output has shape {:?}, eager output has shape {:?}",
            actual.dims(),
            expected.dims()
        )));
    }

    let difference = (actual - expected)
        .abs()
        .max()
        .into_scalar()
        .elem::<f64>();
    if difference.is_nan() || difference > tolerance {
        return Err(ConvertError::Tracing(format!(
            "traced graph diverges from eager execution (max difference {difference}, tolerance {tolerance})"
        )));
    }

    log::debug!("Trace check passed (max difference {difference})");
    Ok(())
}
