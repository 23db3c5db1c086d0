use cortex_core::{Blob, BlobDesc, CpuMathEngine, Result};

use crate::layer::{BackwardContext, Layer, LearnContext, RunContext};

const F16_EPSILON: f32 = 4.88e-04;

pub(crate) fn are_similar(
    result: &Blob,
    expected: &Blob,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    if result.desc() != expected.desc()
        || !result.data().abs_diff_eq(expected.data(), F16_EPSILON)
    {
        return Err(format!("Result: {:?} | Expected: {:?}", result, expected).into());
    }

    Ok(())
}

pub(crate) fn blob(desc: BlobDesc, values: &[f32]) -> Blob {
    Blob::from_vec(desc, values.to_vec()).unwrap()
}

/// A blob holding one object of `values.len()` channels.
pub(crate) fn row(values: &[f32]) -> Blob {
    blob(BlobDesc::channels_only(values.len()), values)
}

/// Outputs and scratch of a standalone forward pass.
pub(crate) struct Pass {
    pub(crate) outputs: Vec<Blob>,
    pub(crate) scratch: Vec<Blob>,
}

pub(crate) fn forward(layer: &mut dyn Layer, inputs: &[&Blob], training: bool) -> Result<Pass> {
    let descs: Vec<BlobDesc> = inputs.iter().map(|input| input.desc()).collect();
    let mut outputs: Vec<Blob> = layer.reshape(&descs)?.into_iter().map(Blob::zeros).collect();
    let mut scratch = Vec::new();
    layer.run_once(RunContext {
        inputs,
        outputs: &mut outputs,
        scratch: &mut scratch,
        engine: &CpuMathEngine,
        training,
        first_step: true,
        feedback: None,
    })?;
    Ok(Pass { outputs, scratch })
}

pub(crate) fn backward(
    layer: &mut dyn Layer,
    inputs: &[&Blob],
    pass: &Pass,
    output_diffs: &[Blob],
) -> Result<Vec<Blob>> {
    let mut input_diffs: Vec<Blob> = inputs.iter().map(|input| Blob::zeros(input.desc())).collect();
    layer.backward_once(BackwardContext {
        inputs,
        outputs: &pass.outputs,
        scratch: &pass.scratch,
        output_diffs,
        input_diffs: &mut input_diffs,
        engine: &CpuMathEngine,
        first_step: true,
        learning: false,
        feedback_diff: None,
    })?;
    Ok(input_diffs)
}

pub(crate) fn learn(
    layer: &mut dyn Layer,
    inputs: &[&Blob],
    pass: &Pass,
    output_diffs: &[Blob],
) -> Result<()> {
    layer.learn_once(LearnContext {
        inputs,
        outputs: &pass.outputs,
        scratch: &pass.scratch,
        output_diffs,
        engine: &CpuMathEngine,
    })
}
