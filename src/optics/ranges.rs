//! # Ranged Matrix Accumulation
//!
//! Accumulates independent, possibly wrapping segments of a ring in one call. Range `l`
//! seeds with `M[start_l]` and left-multiplies every following element up to and including
//! `end_l`, for `(end_l - start_l) mod n` products. `end_l < start_l` wraps through
//! position 0; `end_l == start_l` yields `M[start_l]` alone.
//!
//! Ranges share no state, so the parallel kernel hands each range to rayon as its own task
//! and lets work stealing absorb uneven spans.
//!
//! ## Errors
//! - **EmptyData**: accumulate: The matrix sequence is empty.
//! - **EmptyRanges**: accumulate: No ranges were supplied.
//! - **IndexOutOfRange**: accumulate: A range endpoint is not a ring position.
//! - **OutputLengthMismatch**: accumulate: Destination slice length differs from the range count.

use crate::optics::accumulate::AccumulateError;
use crate::utilities::cyclic::{check_index, span, wrap};
use crate::utilities::enums::Kernel;
use crate::utilities::helpers::resolve_kernel;
use crate::utilities::matrix::{left_mul_assign, zeros, Matrix};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexRange {
    pub start: usize,
    pub end: usize,
}

impl IndexRange {
    #[inline]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Number of products needed on a ring of `n` positions.
    #[inline]
    pub fn span(&self, n: usize) -> usize {
        span(self.start, self.end, n)
    }

    #[inline]
    pub fn wraps(&self) -> bool {
        self.end < self.start
    }
}

impl From<(usize, usize)> for IndexRange {
    #[inline]
    fn from((start, end): (usize, usize)) -> Self {
        Self::new(start, end)
    }
}

#[derive(Debug, Clone)]
pub struct AccumulateRangesInput<'a, const N: usize = 6> {
    pub matrices: &'a [Matrix<N>],
    pub ranges: &'a [IndexRange],
}

impl<'a, const N: usize> AccumulateRangesInput<'a, N> {
    #[inline]
    pub fn from_slices(matrices: &'a [Matrix<N>], ranges: &'a [IndexRange]) -> Self {
        Self { matrices, ranges }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccumulateRangesOutput<const N: usize = 6> {
    pub values: Vec<Matrix<N>>,
    pub ranges: Vec<IndexRange>,
}

impl<const N: usize> AccumulateRangesOutput<N> {
    pub fn row_for_range(&self, r: &IndexRange) -> Option<usize> {
        self.ranges.iter().position(|c| c == r)
    }

    pub fn matrix_for(&self, r: &IndexRange) -> Option<&Matrix<N>> {
        self.row_for_range(r).map(|row| &self.values[row])
    }
}

#[derive(Clone, Debug, Default)]
pub struct AccumulateRangesBuilder {
    ranges: Vec<IndexRange>,
    kernel: Kernel,
}

impl AccumulateRangesBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn kernel(mut self, k: Kernel) -> Self {
        self.kernel = k;
        self
    }

    #[inline]
    pub fn range(mut self, start: usize, end: usize) -> Self {
        self.ranges.push(IndexRange::new(start, end));
        self
    }

    #[inline]
    pub fn ranges<I>(mut self, ranges: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<IndexRange>,
    {
        self.ranges.extend(ranges.into_iter().map(Into::into));
        self
    }

    /// Splits the ring into consecutive segments ending at each of `ends`, in order.
    ///
    /// The first segment starts right after the last end, so the segments tile the ring.
    pub fn tiling(mut self, ends: &[usize], n: usize) -> Self {
        if let Some(&last) = ends.last() {
            let mut start = wrap(last + 1, n.max(1));
            for &end in ends {
                self.ranges.push(IndexRange::new(start, end));
                start = wrap(end + 1, n.max(1));
            }
        }
        self
    }

    pub fn apply_slice<const N: usize>(
        self,
        matrices: &[Matrix<N>],
    ) -> Result<AccumulateRangesOutput<N>, AccumulateError> {
        let input = AccumulateRangesInput::from_slices(matrices, &self.ranges);
        accumulate_ranges_with_kernel(&input, self.kernel)
    }
}

#[inline]
pub fn accumulate_ranges<const N: usize>(
    input: &AccumulateRangesInput<N>,
) -> Result<AccumulateRangesOutput<N>, AccumulateError> {
    accumulate_ranges_with_kernel(input, Kernel::Auto)
}

fn accumulate_ranges_prepare<const N: usize>(
    input: &AccumulateRangesInput<N>,
    kernel: Kernel,
) -> Result<Kernel, AccumulateError> {
    let n = input.matrices.len();
    if n == 0 {
        return Err(AccumulateError::EmptyData);
    }
    if input.ranges.is_empty() {
        return Err(AccumulateError::EmptyRanges);
    }
    let mut work = 0usize;
    for r in input.ranges {
        check_index(r.start, n)?;
        check_index(r.end, n)?;
        work += r.span(n) + 1;
    }
    Ok(resolve_kernel(kernel, work))
}

pub fn accumulate_ranges_with_kernel<const N: usize>(
    input: &AccumulateRangesInput<N>,
    kernel: Kernel,
) -> Result<AccumulateRangesOutput<N>, AccumulateError> {
    let chosen = accumulate_ranges_prepare(input, kernel)?;
    let mut values = vec![zeros::<N>(); input.ranges.len()];
    accumulate_ranges_compute_into(input.matrices, input.ranges, chosen, &mut values);
    Ok(AccumulateRangesOutput {
        values,
        ranges: input.ranges.to_vec(),
    })
}

/// Writes one accumulated matrix per range into `dst`.
pub fn accumulate_ranges_into_slice<const N: usize>(
    dst: &mut [Matrix<N>],
    input: &AccumulateRangesInput<N>,
    kernel: Kernel,
) -> Result<(), AccumulateError> {
    let chosen = accumulate_ranges_prepare(input, kernel)?;
    if dst.len() != input.ranges.len() {
        return Err(AccumulateError::OutputLengthMismatch {
            expected: input.ranges.len(),
            got: dst.len(),
        });
    }
    accumulate_ranges_compute_into(input.matrices, input.ranges, chosen, dst);
    Ok(())
}

#[inline(always)]
fn accumulate_ranges_compute_into<const N: usize>(
    matrices: &[Matrix<N>],
    ranges: &[IndexRange],
    kernel: Kernel,
    out: &mut [Matrix<N>],
) {
    let do_range = |r: &IndexRange, slot: &mut Matrix<N>| accumulate_range_scalar(matrices, r, slot);

    if kernel.is_parallel() {
        out.par_iter_mut()
            .zip(ranges.par_iter())
            .with_max_len(1)
            .for_each(|(slot, r)| do_range(r, slot));
    } else {
        for (slot, r) in out.iter_mut().zip(ranges.iter()) {
            do_range(r, slot);
        }
    }
}

/// Accumulates one validated range into `slot`.
#[inline]
pub(crate) fn accumulate_range_scalar<const N: usize>(
    matrices: &[Matrix<N>],
    range: &IndexRange,
    slot: &mut Matrix<N>,
) {
    let n = matrices.len();
    *slot = matrices[range.start];
    for step in 1..=range.span(n) {
        left_mul_assign(&matrices[wrap(range.start + step, n)], slot);
    }
}
