//! # Ring Optics
//!
//! Owns the element matrices of one ring and a start position, and caches everything
//! derived from them: accumulated matrices, the one-turn map, the matched reference
//! vector and the Twiss table. Changing the start position or any element matrix drops
//! every cache; the next query recomputes on demand.

use crate::optics::accumulate::{AccumulateBuilder, AccumulateError};
use crate::optics::periodic::{
    betatron_phase, fractional_tunes, periodic_twiss, BetatronPhase, PeriodicError, Stability,
    Tunes,
};
use crate::optics::ranges::{AccumulateRangesBuilder, AccumulateRangesOutput, IndexRange};
use crate::optics::twiss::{TwissBuilder, TwissError, TwissOutput, TwissVector};
use crate::utilities::cyclic::{check_index, predecessor};
use crate::utilities::enums::Kernel;
use crate::utilities::matrix::Matrix6;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RingError {
    #[error(transparent)]
    Accumulate(#[from] AccumulateError),

    #[error(transparent)]
    Twiss(#[from] TwissError),

    #[error(transparent)]
    Periodic(#[from] PeriodicError),
}

#[derive(Debug, Clone)]
pub struct RingOptics {
    matrices: Vec<Matrix6>,
    start: usize,
    kernel: Kernel,
    accumulated: Option<Vec<Matrix6>>,
    matched: Option<TwissVector>,
    twiss: Option<TwissOutput>,
}

impl RingOptics {
    pub fn new(matrices: Vec<Matrix6>, start: usize) -> Result<Self, RingError> {
        if matrices.is_empty() {
            return Err(AccumulateError::EmptyData.into());
        }
        check_index(start, matrices.len()).map_err(AccumulateError::from)?;
        Ok(Self {
            matrices,
            start,
            kernel: Kernel::Auto,
            accumulated: None,
            matched: None,
            twiss: None,
        })
    }

    #[inline]
    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = kernel;
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn matrices(&self) -> &[Matrix6] {
        &self.matrices
    }

    pub fn set_start(&mut self, start: usize) -> Result<(), RingError> {
        check_index(start, self.len()).map_err(AccumulateError::from)?;
        if start != self.start {
            self.start = start;
            self.invalidate();
        }
        Ok(())
    }

    pub fn set_matrix(&mut self, index: usize, matrix: Matrix6) -> Result<(), RingError> {
        check_index(index, self.len()).map_err(AccumulateError::from)?;
        self.matrices[index] = matrix;
        self.invalidate();
        Ok(())
    }

    fn invalidate(&mut self) {
        self.accumulated = None;
        self.matched = None;
        self.twiss = None;
    }

    /// Accumulated matrices relative to the current start position.
    pub fn accumulated(&mut self) -> Result<&[Matrix6], RingError> {
        let values = match self.accumulated.take() {
            Some(values) => values,
            None => {
                tracing::debug!(n = self.len(), start = self.start, "recomputing accumulated matrices");
                AccumulateBuilder::new()
                    .start(self.start)
                    .kernel(self.kernel)
                    .apply_slice(&self.matrices)?
                    .values
            }
        };
        Ok(self.accumulated.insert(values).as_slice())
    }

    pub fn one_turn(&mut self) -> Result<Matrix6, RingError> {
        let at = predecessor(self.start, self.len());
        Ok(self.accumulated()?[at])
    }

    pub fn stability(&mut self) -> Result<Stability, RingError> {
        Ok(Stability::of(&self.one_turn()?))
    }

    pub fn tunes(&mut self) -> Result<Tunes, RingError> {
        Ok(fractional_tunes(&self.one_turn()?)?)
    }

    /// Matched optics at the start position.
    pub fn periodic_twiss(&mut self) -> Result<TwissVector, RingError> {
        if let Some(matched) = self.matched {
            return Ok(matched);
        }
        let matched = periodic_twiss(&self.one_turn()?)?;
        self.matched = Some(matched);
        Ok(matched)
    }

    /// Matched optics propagated to every position.
    pub fn twiss(&mut self) -> Result<&TwissOutput, RingError> {
        if let Some(table) = self.twiss.take() {
            return Ok(self.twiss.insert(table));
        }
        let reference = self.periodic_twiss()?;
        let table = self.propagate(reference)?;
        tracing::debug!(n = table.len(), start = self.start, "twiss table recomputed");
        Ok(self.twiss.insert(table))
    }

    /// Propagates a caller-supplied reference vector from the start position. Not cached.
    pub fn twiss_from(&mut self, reference: TwissVector) -> Result<TwissOutput, RingError> {
        self.propagate(reference)
    }

    fn propagate(&mut self, reference: TwissVector) -> Result<TwissOutput, RingError> {
        let start = self.start;
        let kernel = self.kernel;
        let accumulated = self.accumulated()?;
        Ok(TwissBuilder::new()
            .start(start)
            .kernel(kernel)
            .apply_slice(accumulated, reference)?)
    }

    /// Segment maps over the element matrices; independent of the start position.
    pub fn segments<I>(&self, ranges: I) -> Result<AccumulateRangesOutput, RingError>
    where
        I: IntoIterator,
        I::Item: Into<IndexRange>,
    {
        Ok(AccumulateRangesBuilder::new()
            .ranges(ranges)
            .kernel(self.kernel)
            .apply_slice(&self.matrices)?)
    }

    /// Phase advance of the matched optics; `s[pos]` is the longitudinal position of `pos`.
    pub fn betatron_phase(&mut self, s: &[f64], circumference: f64) -> Result<BetatronPhase, RingError> {
        let table = self.twiss()?;
        Ok(betatron_phase(&table.beta_x, &table.beta_y, s, circumference)?)
    }
}
