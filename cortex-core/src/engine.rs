use ndarray::{
    linalg::general_mat_mul, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Slice, Zip,
};
use serde::{Deserialize, Serialize};

use crate::blob::{Blob, BlobDim};

/// Element count above which the CPU engine parallelizes elementwise work.
pub const PARALLEL_THRESHOLD: usize = 1 << 16;

/// Pointwise nonlinearities known to the compute backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    Linear,
    Sigmoid,
    Tanh,
    Relu,
    HardSigmoid,
}

const HARD_SIGMOID_SLOPE: f32 = 0.5;
const HARD_SIGMOID_BIAS: f32 = 0.5;

impl ActivationKind {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ActivationKind::Linear => x,
            ActivationKind::Sigmoid => 1. / (1. + (-x).exp()),
            ActivationKind::Tanh => x.tanh(),
            ActivationKind::Relu => x.max(0.),
            ActivationKind::HardSigmoid => {
                (HARD_SIGMOID_SLOPE * x + HARD_SIGMOID_BIAS).clamp(0., 1.)
            }
        }
    }

    /// Derivative expressed through the activation's output `y`.
    pub fn derivative(self, y: f32) -> f32 {
        match self {
            ActivationKind::Linear => 1.,
            ActivationKind::Sigmoid => y * (1. - y),
            ActivationKind::Tanh => 1. - y * y,
            ActivationKind::Relu => {
                if y > 0. {
                    1.
                } else {
                    0.
                }
            }
            ActivationKind::HardSigmoid => {
                if y > 0. && y < 1. {
                    HARD_SIGMOID_SLOPE
                } else {
                    0.
                }
            }
        }
    }
}

/// Arithmetic primitives the layers are written against.
///
/// Shapes are validated by the layers at reshape time, so the primitives
/// only assert them. Every method writes into buffers owned by the caller.
pub trait MathEngine {
    fn name(&self) -> &'static str;

    fn fill(&self, blob: &mut Blob, value: f32);

    fn copy(&self, from: &Blob, to: &mut Blob);

    fn add(&self, a: &Blob, b: &Blob, out: &mut Blob);

    fn sub(&self, a: &Blob, b: &Blob, out: &mut Blob);

    fn mul(&self, a: &Blob, b: &Blob, out: &mut Blob);

    fn div(&self, a: &Blob, b: &Blob, out: &mut Blob);

    fn add_in_place(&self, acc: &mut Blob, other: &Blob);

    fn mul_in_place(&self, acc: &mut Blob, other: &Blob);

    /// `acc += alpha * x`.
    fn add_scaled(&self, acc: &mut Blob, x: &Blob, alpha: f32);

    /// `out = a * multiplier + addend`.
    fn affine(&self, a: &Blob, multiplier: f32, addend: f32, out: &mut Blob);

    /// Elementwise maximum over `inputs`; `indices` receives the position of
    /// the winning input, the lowest one on ties.
    fn max(&self, inputs: &[&Blob], out: &mut Blob, indices: &mut Blob);

    /// Routes `output_diff` to the winners recorded by [`MathEngine::max`].
    fn max_diff(&self, output_diff: &Blob, indices: &Blob, input_diffs: &mut [Blob]);

    /// Cuts `input` into consecutive regions along `dim`, one per output.
    fn split_by_dim(&self, dim: BlobDim, input: &Blob, outputs: &mut [Blob]);

    /// Concatenates `inputs` along `dim`.
    fn merge_by_dim(&self, dim: BlobDim, inputs: &[&Blob], output: &mut Blob);

    /// Copies position `index` of `source` along `dim` into `target`, whose
    /// `dim` has size one.
    fn extract_slice(&self, source: &Blob, dim: BlobDim, index: usize, target: &mut Blob);

    /// Writes `source` at position `index` of `target` along `dim`.
    fn insert_slice(&self, source: &Blob, dim: BlobDim, index: usize, target: &mut Blob);

    /// `out = a · bᵀ`.
    fn multiply_by_transposed(
        &self,
        a: ArrayView2<f32>,
        b: ArrayView2<f32>,
        out: ArrayViewMut2<f32>,
    );

    /// `out = a · b`.
    fn multiply(&self, a: ArrayView2<f32>, b: ArrayView2<f32>, out: ArrayViewMut2<f32>);

    /// `acc += aᵀ · b`.
    fn multiply_transposed_and_add(
        &self,
        a: ArrayView2<f32>,
        b: ArrayView2<f32>,
        acc: ArrayViewMut2<f32>,
    );

    /// Adds `row` to every row of `matrix`.
    fn add_row(&self, matrix: ArrayViewMut2<f32>, row: ArrayView1<f32>);

    /// `acc += Σ rows of matrix`.
    fn sum_rows_and_add(&self, matrix: ArrayView2<f32>, acc: ArrayViewMut1<f32>);

    fn activation(&self, kind: ActivationKind, input: &Blob, out: &mut Blob);

    /// `input_diff = output_diff * f'(output)`.
    fn activation_diff(
        &self,
        kind: ActivationKind,
        output: &Blob,
        output_diff: &Blob,
        input_diff: &mut Blob,
    );
}

/// Reference backend built on ndarray, parallel with rayon for large blobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuMathEngine;

fn binary<F>(a: &Blob, b: &Blob, out: &mut Blob, op: F)
where
    F: Fn(f32, f32) -> f32 + Sync + Send,
{
    debug_assert_eq!(a.desc(), b.desc());
    debug_assert_eq!(a.desc(), out.desc());
    let parallel = out.len() >= PARALLEL_THRESHOLD;
    let zip = Zip::from(out.data_mut()).and(a.data()).and(b.data());
    if parallel {
        zip.par_for_each(|o, &x, &y| *o = op(x, y));
    } else {
        zip.for_each(|o, &x, &y| *o = op(x, y));
    }
}

fn in_place<F>(acc: &mut Blob, other: &Blob, op: F)
where
    F: Fn(&mut f32, f32) + Sync + Send,
{
    debug_assert_eq!(acc.desc(), other.desc());
    let parallel = acc.len() >= PARALLEL_THRESHOLD;
    let zip = Zip::from(acc.data_mut()).and(other.data());
    if parallel {
        zip.par_for_each(|a, &x| op(a, x));
    } else {
        zip.for_each(|a, &x| op(a, x));
    }
}

impl MathEngine for CpuMathEngine {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn fill(&self, blob: &mut Blob, value: f32) {
        blob.data_mut().fill(value);
    }

    fn copy(&self, from: &Blob, to: &mut Blob) {
        debug_assert_eq!(from.desc(), to.desc());
        to.data_mut().assign(from.data());
    }

    fn add(&self, a: &Blob, b: &Blob, out: &mut Blob) {
        binary(a, b, out, |x, y| x + y);
    }

    fn sub(&self, a: &Blob, b: &Blob, out: &mut Blob) {
        binary(a, b, out, |x, y| x - y);
    }

    fn mul(&self, a: &Blob, b: &Blob, out: &mut Blob) {
        binary(a, b, out, |x, y| x * y);
    }

    fn div(&self, a: &Blob, b: &Blob, out: &mut Blob) {
        binary(a, b, out, |x, y| x / y);
    }

    fn add_in_place(&self, acc: &mut Blob, other: &Blob) {
        in_place(acc, other, |a, x| *a += x);
    }

    fn mul_in_place(&self, acc: &mut Blob, other: &Blob) {
        in_place(acc, other, |a, x| *a *= x);
    }

    fn add_scaled(&self, acc: &mut Blob, x: &Blob, alpha: f32) {
        in_place(acc, x, move |a, x| *a += alpha * x);
    }

    fn affine(&self, a: &Blob, multiplier: f32, addend: f32, out: &mut Blob) {
        debug_assert_eq!(a.desc(), out.desc());
        Zip::from(out.data_mut())
            .and(a.data())
            .for_each(|o, &x| *o = x * multiplier + addend);
    }

    fn max(&self, inputs: &[&Blob], out: &mut Blob, indices: &mut Blob) {
        debug_assert!(!inputs.is_empty());
        self.copy(inputs[0], out);
        self.fill(indices, 0.);
        for (position, input) in inputs.iter().enumerate().skip(1) {
            let position = position as f32;
            Zip::from(out.data_mut())
                .and(indices.data_mut())
                .and(input.data())
                .for_each(|o, index, &x| {
                    if x > *o {
                        *o = x;
                        *index = position;
                    }
                });
        }
    }

    fn max_diff(&self, output_diff: &Blob, indices: &Blob, input_diffs: &mut [Blob]) {
        for (position, diff) in input_diffs.iter_mut().enumerate() {
            Zip::from(diff.data_mut())
                .and(output_diff.data())
                .and(indices.data())
                .for_each(|d, &g, &index| {
                    *d = if index as usize == position { g } else { 0. };
                });
        }
    }

    fn split_by_dim(&self, dim: BlobDim, input: &Blob, outputs: &mut [Blob]) {
        let mut start = 0;
        for output in outputs {
            let len = output.desc().dim(dim);
            let region = input
                .data()
                .slice_axis(dim.axis(), Slice::from(start..start + len));
            output.data_mut().assign(&region);
            start += len;
        }
        debug_assert_eq!(start, input.desc().dim(dim));
    }

    fn merge_by_dim(&self, dim: BlobDim, inputs: &[&Blob], output: &mut Blob) {
        let mut start = 0;
        for input in inputs {
            let len = input.desc().dim(dim);
            output
                .data_mut()
                .slice_axis_mut(dim.axis(), Slice::from(start..start + len))
                .assign(input.data());
            start += len;
        }
        debug_assert_eq!(start, output.desc().dim(dim));
    }

    fn extract_slice(&self, source: &Blob, dim: BlobDim, index: usize, target: &mut Blob) {
        let region = source
            .data()
            .slice_axis(dim.axis(), Slice::from(index..index + 1));
        target.data_mut().assign(&region);
    }

    fn insert_slice(&self, source: &Blob, dim: BlobDim, index: usize, target: &mut Blob) {
        target
            .data_mut()
            .slice_axis_mut(dim.axis(), Slice::from(index..index + 1))
            .assign(source.data());
    }

    fn multiply_by_transposed(
        &self,
        a: ArrayView2<f32>,
        b: ArrayView2<f32>,
        mut out: ArrayViewMut2<f32>,
    ) {
        general_mat_mul(1., &a, &b.t(), 0., &mut out);
    }

    fn multiply(&self, a: ArrayView2<f32>, b: ArrayView2<f32>, mut out: ArrayViewMut2<f32>) {
        general_mat_mul(1., &a, &b, 0., &mut out);
    }

    fn multiply_transposed_and_add(
        &self,
        a: ArrayView2<f32>,
        b: ArrayView2<f32>,
        mut acc: ArrayViewMut2<f32>,
    ) {
        general_mat_mul(1., &a.t(), &b, 1., &mut acc);
    }

    fn add_row(&self, mut matrix: ArrayViewMut2<f32>, row: ArrayView1<f32>) {
        matrix += &row;
    }

    fn sum_rows_and_add(&self, matrix: ArrayView2<f32>, mut acc: ArrayViewMut1<f32>) {
        acc += &matrix.sum_axis(ndarray::Axis(0));
    }

    fn activation(&self, kind: ActivationKind, input: &Blob, out: &mut Blob) {
        debug_assert_eq!(input.desc(), out.desc());
        let parallel = out.len() >= PARALLEL_THRESHOLD;
        let zip = Zip::from(out.data_mut()).and(input.data());
        if parallel {
            zip.par_for_each(|o, &x| *o = kind.apply(x));
        } else {
            zip.for_each(|o, &x| *o = kind.apply(x));
        }
    }

    fn activation_diff(
        &self,
        kind: ActivationKind,
        output: &Blob,
        output_diff: &Blob,
        input_diff: &mut Blob,
    ) {
        binary(output, output_diff, input_diff, |y, g| g * kind.derivative(y));
    }
}
