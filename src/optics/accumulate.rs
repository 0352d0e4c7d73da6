//! # Cyclic Matrix Accumulation
//!
//! Accumulates the per-element transfer matrices of a ring, starting at an arbitrary
//! element and walking once around the ring in traversal order:
//! `acc[start] = M[start]`, `acc[pos] = M[pos] · acc[pos - 1]` (positions taken modulo `n`).
//! `acc[k]` therefore maps the entrance of `start` to the exit of element `k`.
//!
//! ## Parameters
//! - **start**: Index of the seed element. Defaults to 0.
//!
//! ## Kernels
//! - **Scalar**: the reference sequential pass of exactly `n - 1` products.
//! - **Parallel**: blocked parallel-prefix scan. Chunk-local prefixes are built in parallel,
//!   chunk totals are carried sequentially, and a parallel pass right-multiplies each chunk
//!   by its carry. Agrees with `Scalar` to rounding, not bit-for-bit.
//!
//! ## Errors
//! - **EmptyData**: accumulate: The matrix sequence is empty.
//! - **IndexOutOfRange**: accumulate: `start` is not a ring position.
//! - **OutputLengthMismatch**: accumulate: Destination slice length differs from the ring.
//!
//! ## Returns
//! - **`Ok(AccumulateOutput)`** with one accumulated matrix per ring position.
//! - **`Err(AccumulateError)`** otherwise; nothing is written on failure.

use crate::utilities::cyclic::{check_index, predecessor, wrap};
use crate::utilities::enums::Kernel;
use crate::utilities::helpers::resolve_kernel;
use crate::utilities::matrix::{mat_mul_into, zeros, Matrix, Matrix6};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AccumulateParams {
    pub start: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AccumulateInput<'a, const N: usize = 6> {
    pub matrices: &'a [Matrix<N>],
    pub params: AccumulateParams,
}

impl<'a, const N: usize> AccumulateInput<'a, N> {
    #[inline]
    pub fn from_slice(matrices: &'a [Matrix<N>], params: AccumulateParams) -> Self {
        Self { matrices, params }
    }

    #[inline]
    pub fn with_default_slice(matrices: &'a [Matrix<N>]) -> Self {
        Self {
            matrices,
            params: AccumulateParams::default(),
        }
    }

    #[inline]
    pub fn get_start(&self) -> usize {
        self.params.start.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccumulateOutput<const N: usize = 6> {
    pub values: Vec<Matrix<N>>,
    pub start: usize,
}

impl<const N: usize> AccumulateOutput<N> {
    /// The full-turn map seen from `start`.
    #[inline]
    pub fn one_turn(&self) -> &Matrix<N> {
        &self.values[predecessor(self.start, self.values.len())]
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct AccumulateBuilder {
    start: Option<usize>,
    kernel: Kernel,
}

impl AccumulateBuilder {
    #[inline(always)]
    pub fn new() -> Self {
        Self::default()
    }
    #[inline(always)]
    pub fn start(mut self, start: usize) -> Self {
        self.start = Some(start);
        self
    }
    #[inline(always)]
    pub fn kernel(mut self, k: Kernel) -> Self {
        self.kernel = k;
        self
    }

    #[inline(always)]
    pub fn apply_slice<const N: usize>(
        self,
        matrices: &[Matrix<N>],
    ) -> Result<AccumulateOutput<N>, AccumulateError> {
        let p = AccumulateParams { start: self.start };
        let i = AccumulateInput::from_slice(matrices, p);
        accumulate_with_kernel(&i, self.kernel)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccumulateError {
    #[error("accumulate: Empty matrix sequence provided.")]
    EmptyData,

    #[error("accumulate: Index out of range: index = {index}, ring length = {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("accumulate: Empty range list provided.")]
    EmptyRanges,

    #[error("accumulate: Output length mismatch: expected = {expected}, got = {got}")]
    OutputLengthMismatch { expected: usize, got: usize },
}

impl From<(usize, usize)> for AccumulateError {
    #[inline]
    fn from((index, len): (usize, usize)) -> Self {
        AccumulateError::IndexOutOfRange { index, len }
    }
}

#[inline]
pub fn accumulate<const N: usize>(
    input: &AccumulateInput<N>,
) -> Result<AccumulateOutput<N>, AccumulateError> {
    accumulate_with_kernel(input, Kernel::Auto)
}

#[inline(always)]
fn accumulate_prepare<const N: usize>(
    input: &AccumulateInput<N>,
    kernel: Kernel,
) -> Result<(usize, Kernel), AccumulateError> {
    let n = input.matrices.len();
    if n == 0 {
        return Err(AccumulateError::EmptyData);
    }
    let start = check_index(input.get_start(), n)?;
    Ok((start, resolve_kernel(kernel, n)))
}

pub fn accumulate_with_kernel<const N: usize>(
    input: &AccumulateInput<N>,
    kernel: Kernel,
) -> Result<AccumulateOutput<N>, AccumulateError> {
    let (start, chosen) = accumulate_prepare(input, kernel)?;
    let mut values = input.matrices.to_vec();
    accumulate_compute_in_place(&mut values, start, chosen);
    Ok(AccumulateOutput { values, start })
}

/// Writes the accumulated matrices into `dst`, which must have the ring's length.
pub fn accumulate_into_slice<const N: usize>(
    dst: &mut [Matrix<N>],
    input: &AccumulateInput<N>,
    kernel: Kernel,
) -> Result<(), AccumulateError> {
    let (start, chosen) = accumulate_prepare(input, kernel)?;
    if dst.len() != input.matrices.len() {
        return Err(AccumulateError::OutputLengthMismatch {
            expected: input.matrices.len(),
            got: dst.len(),
        });
    }
    dst.copy_from_slice(input.matrices);
    accumulate_compute_in_place(dst, start, chosen);
    Ok(())
}

/// Replaces each element matrix of `ring` by its accumulated matrix, without a second buffer.
pub fn accumulate_in_place<const N: usize>(
    ring: &mut [Matrix<N>],
    start: usize,
    kernel: Kernel,
) -> Result<(), AccumulateError> {
    if ring.is_empty() {
        return Err(AccumulateError::EmptyData);
    }
    let start = check_index(start, ring.len())?;
    let chosen = resolve_kernel(kernel, ring.len());
    accumulate_compute_in_place(ring, start, chosen);
    Ok(())
}

#[inline(always)]
fn accumulate_compute_in_place<const N: usize>(buf: &mut [Matrix<N>], start: usize, kernel: Kernel) {
    match kernel {
        Kernel::Parallel => accumulate_scan(buf, start),
        _ => accumulate_scalar(buf, start),
    }
}

/// Sequential pass over a buffer holding the element matrices.
///
/// Position `pos` is read before it is overwritten, and its predecessor already holds the
/// accumulated product, so element storage and output storage may coincide.
#[inline]
pub(crate) fn accumulate_scalar<const N: usize>(buf: &mut [Matrix<N>], start: usize) {
    let n = buf.len();
    let mut prev = start;
    for step in 1..n {
        let pos = wrap(start + step, n);
        let acc_prev = buf[prev];
        let element = buf[pos];
        mat_mul_into(&element, &acc_prev, &mut buf[pos]);
        prev = pos;
    }
}

#[inline]
fn scan_chunk_len(n: usize) -> usize {
    let tasks = rayon::current_num_threads().max(1) * 4;
    n.div_ceil(tasks).max(64)
}

/// Blocked parallel-prefix formulation of [`accumulate_scalar`].
pub(crate) fn accumulate_scan<const N: usize>(buf: &mut [Matrix<N>], start: usize) {
    let n = buf.len();
    let chunk = scan_chunk_len(n);

    // traversal order: rotated[t] is the element at position start + t
    let mut rotated: Vec<Matrix<N>> = Vec::with_capacity(n);
    rotated.extend_from_slice(&buf[start..]);
    rotated.extend_from_slice(&buf[..start]);

    rotated.par_chunks_mut(chunk).for_each(|block| {
        for t in 1..block.len() {
            let acc_prev = block[t - 1];
            let element = block[t];
            mat_mul_into(&element, &acc_prev, &mut block[t]);
        }
    });

    // carries[c] is the product of every block before c; block 0 needs none
    let n_blocks = n.div_ceil(chunk);
    let mut carries: Vec<Matrix<N>> = Vec::with_capacity(n_blocks.saturating_sub(1));
    for c in 1..n_blocks {
        let local_total = rotated[(c * chunk - 1).min(n - 1)];
        let total = match carries.last() {
            Some(before) => {
                let mut t = zeros::<N>();
                mat_mul_into(&local_total, before, &mut t);
                t
            }
            None => local_total,
        };
        carries.push(total);
    }

    rotated
        .par_chunks_mut(chunk)
        .enumerate()
        .skip(1)
        .for_each(|(c, block)| {
            let carry = &carries[c - 1];
            for slot in block.iter_mut() {
                let local = *slot;
                mat_mul_into(&local, carry, slot);
            }
        });

    let tail = n - start;
    buf[start..].copy_from_slice(&rotated[..tail]);
    buf[..start].copy_from_slice(&rotated[tail..]);
}

/// Convenience for the common 6×6 case.
#[inline]
pub fn accumulate_ring(matrices: &[Matrix6], start: usize) -> Result<Vec<Matrix6>, AccumulateError> {
    let params = AccumulateParams { start: Some(start) };
    accumulate(&AccumulateInput::from_slice(matrices, params)).map(|o| o.values)
}
