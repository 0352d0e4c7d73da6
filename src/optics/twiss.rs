//! # Twiss Propagation
//!
//! Propagates a reference optics vector `(β_x, β_y, α_x, α_y, γ_x, γ_y, η_x, η_x')` given
//! at the start position to every ring position, using the closed-form quadratic transform
//! on the decoupled horizontal (`{0,1}`) and vertical (`{2,3}`) blocks of the accumulated
//! matrices. Dispersion propagates affinely through the `δ` column (index 5).
//!
//! Position `pos` is the entrance of element `pos`; its optics come from the accumulated
//! matrix of the preceding element, `acc[pos - 1]` taken cyclically. The start position
//! receives the reference vector unchanged.
//!
//! [`propagate_envelope`] evaluates the full quadratic form `A · B · Aᵀ` instead and serves
//! as the oracle for the closed form.
//!
//! ## Parameters
//! - **start**: Position of the reference vector. Defaults to 0.
//! - **chunk_size**: Positions per parallel work unit. Defaults to 1000.
//!
//! ## Errors
//! - **EmptyData**: twiss: No accumulated matrices were supplied.
//! - **IndexOutOfRange**: twiss: `start` is not a ring position.
//! - **InvalidChunkSize**: twiss: `chunk_size` is zero.
//! - **OutputLengthMismatch**: twiss: Destination slice is not `8 * n` long.
//!
//! Reference vectors violating `βγ = 1 + α²` are propagated as given; a warning is logged.

use crate::utilities::cyclic::{check_index, predecessor};
use crate::utilities::enums::Kernel;
use crate::utilities::helpers::resolve_kernel;
use crate::utilities::matrix::{mat_mul_into, multiply_each, transpose, zeros, Matrix, Matrix6};
use rayon::prelude::*;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Largest `|βγ - 1 - α²|` accepted without a consistency warning.
pub const DEFAULT_CONSISTENCY_TOLERANCE: f64 = 1e-6;

/// Number of optics components per position.
pub const TWISS_COMPONENTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TwissVector {
    pub beta_x: f64,
    pub beta_y: f64,
    pub alpha_x: f64,
    pub alpha_y: f64,
    pub gamma_x: f64,
    pub gamma_y: f64,
    pub eta_x: f64,
    pub eta_x_dds: f64,
}

impl TwissVector {
    /// Builds a consistent vector, deriving `γ = (1 + α²) / β` for both planes.
    pub fn from_beta_alpha(
        beta_x: f64,
        alpha_x: f64,
        beta_y: f64,
        alpha_y: f64,
        eta_x: f64,
        eta_x_dds: f64,
    ) -> Self {
        Self {
            beta_x,
            beta_y,
            alpha_x,
            alpha_y,
            gamma_x: (1.0 + alpha_x * alpha_x) / beta_x,
            gamma_y: (1.0 + alpha_y * alpha_y) / beta_y,
            eta_x,
            eta_x_dds,
        }
    }

    #[inline]
    pub fn as_array(&self) -> [f64; TWISS_COMPONENTS] {
        [
            self.beta_x,
            self.beta_y,
            self.alpha_x,
            self.alpha_y,
            self.gamma_x,
            self.gamma_y,
            self.eta_x,
            self.eta_x_dds,
        ]
    }

    #[inline]
    pub fn from_array(v: [f64; TWISS_COMPONENTS]) -> Self {
        Self {
            beta_x: v[0],
            beta_y: v[1],
            alpha_x: v[2],
            alpha_y: v[3],
            gamma_x: v[4],
            gamma_y: v[5],
            eta_x: v[6],
            eta_x_dds: v[7],
        }
    }

    /// `|βγ - 1 - α²|` for the horizontal and vertical plane.
    pub fn consistency_residual(&self) -> (f64, f64) {
        (
            (self.beta_x * self.gamma_x - 1.0 - self.alpha_x * self.alpha_x).abs(),
            (self.beta_y * self.gamma_y - 1.0 - self.alpha_y * self.alpha_y).abs(),
        )
    }

    /// Block-diagonal envelope matrix with `[[β, -α], [-α, γ]]` per plane.
    pub fn envelope_matrix(&self) -> Matrix6 {
        let mut b = zeros::<6>();
        b[0][0] = self.beta_x;
        b[0][1] = -self.alpha_x;
        b[1][0] = -self.alpha_x;
        b[1][1] = self.gamma_x;
        b[2][2] = self.beta_y;
        b[2][3] = -self.alpha_y;
        b[3][2] = -self.alpha_y;
        b[3][3] = self.gamma_y;
        b
    }

    /// Reads β/α/γ back from an envelope matrix; dispersion is taken from the arguments.
    pub fn from_envelope(b: &Matrix6, eta_x: f64, eta_x_dds: f64) -> Self {
        Self {
            beta_x: b[0][0],
            beta_y: b[2][2],
            alpha_x: -b[0][1],
            alpha_y: -b[2][3],
            gamma_x: b[1][1],
            gamma_y: b[3][3],
            eta_x,
            eta_x_dds,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TwissParams {
    pub start: Option<usize>,
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TwissInput<'a> {
    pub accumulated: &'a [Matrix6],
    pub reference: TwissVector,
    pub params: TwissParams,
}

impl<'a> TwissInput<'a> {
    #[inline]
    pub fn from_slice(accumulated: &'a [Matrix6], reference: TwissVector, params: TwissParams) -> Self {
        Self {
            accumulated,
            reference,
            params,
        }
    }

    #[inline]
    pub fn with_default_params(accumulated: &'a [Matrix6], reference: TwissVector) -> Self {
        Self::from_slice(accumulated, reference, TwissParams::default())
    }

    #[inline]
    pub fn get_start(&self) -> usize {
        self.params.start.unwrap_or(0)
    }

    #[inline]
    pub fn get_chunk_size(&self) -> usize {
        self.params.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)
    }
}

/// Optics at every ring position, one sequence per component.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TwissOutput {
    pub beta_x: Vec<f64>,
    pub beta_y: Vec<f64>,
    pub alpha_x: Vec<f64>,
    pub alpha_y: Vec<f64>,
    pub gamma_x: Vec<f64>,
    pub gamma_y: Vec<f64>,
    pub eta_x: Vec<f64>,
    pub eta_x_dds: Vec<f64>,
}

impl TwissOutput {
    fn from_rows(rows: &[[f64; TWISS_COMPONENTS]]) -> Self {
        let column = |c: usize| rows.iter().map(|r| r[c]).collect::<Vec<f64>>();
        Self {
            beta_x: column(0),
            beta_y: column(1),
            alpha_x: column(2),
            alpha_y: column(3),
            gamma_x: column(4),
            gamma_y: column(5),
            eta_x: column(6),
            eta_x_dds: column(7),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.beta_x.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.beta_x.is_empty()
    }

    pub fn at(&self, pos: usize) -> Option<TwissVector> {
        if pos >= self.len() {
            return None;
        }
        Some(TwissVector {
            beta_x: self.beta_x[pos],
            beta_y: self.beta_y[pos],
            alpha_x: self.alpha_x[pos],
            alpha_y: self.alpha_y[pos],
            gamma_x: self.gamma_x[pos],
            gamma_y: self.gamma_y[pos],
            eta_x: self.eta_x[pos],
            eta_x_dds: self.eta_x_dds[pos],
        })
    }

    /// Components in `TwissVector::as_array` order.
    pub fn components(&self) -> [&[f64]; TWISS_COMPONENTS] {
        [
            &self.beta_x,
            &self.beta_y,
            &self.alpha_x,
            &self.alpha_y,
            &self.gamma_x,
            &self.gamma_y,
            &self.eta_x,
            &self.eta_x_dds,
        ]
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TwissBuilder {
    start: Option<usize>,
    chunk_size: Option<usize>,
    kernel: Kernel,
}

impl TwissBuilder {
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
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
    #[inline(always)]
    pub fn kernel(mut self, k: Kernel) -> Self {
        self.kernel = k;
        self
    }

    #[inline(always)]
    pub fn apply_slice(
        self,
        accumulated: &[Matrix6],
        reference: TwissVector,
    ) -> Result<TwissOutput, TwissError> {
        let p = TwissParams {
            start: self.start,
            chunk_size: self.chunk_size,
        };
        let i = TwissInput::from_slice(accumulated, reference, p);
        propagate_twiss_with_kernel(&i, self.kernel)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TwissError {
    #[error("twiss: Empty accumulated matrix sequence provided.")]
    EmptyData,

    #[error("twiss: Index out of range: index = {index}, ring length = {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("twiss: Invalid chunk size: {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },

    #[error("twiss: Output length mismatch: expected = {expected}, got = {got}")]
    OutputLengthMismatch { expected: usize, got: usize },
}

/// Closed-form optics transform through one accumulated matrix.
#[inline(always)]
pub fn twiss_transform(m: &Matrix6, b0: &[f64; TWISS_COMPONENTS]) -> [f64; TWISS_COMPONENTS] {
    [
        // beta
        m[0][0] * m[0][0] * b0[0] - 2.0 * m[0][0] * m[0][1] * b0[2] + m[0][1] * m[0][1] * b0[4],
        m[2][2] * m[2][2] * b0[1] - 2.0 * m[2][2] * m[2][3] * b0[3] + m[2][3] * m[2][3] * b0[5],
        // alpha
        -m[0][0] * m[1][0] * b0[0] + (m[0][0] * m[1][1] + m[0][1] * m[1][0]) * b0[2]
            - m[1][1] * m[0][1] * b0[4],
        -m[2][2] * m[3][2] * b0[1] + (m[2][2] * m[3][3] + m[2][3] * m[3][2]) * b0[3]
            - m[3][3] * m[2][3] * b0[5],
        // gamma
        m[1][0] * m[1][0] * b0[0] - 2.0 * m[1][1] * m[1][0] * b0[2] + m[1][1] * m[1][1] * b0[4],
        m[3][2] * m[3][2] * b0[1] - 2.0 * m[3][3] * m[3][2] * b0[3] + m[3][3] * m[3][3] * b0[5],
        // dispersion
        m[0][0] * b0[6] + m[0][1] * b0[7] + m[0][5],
        m[1][0] * b0[6] + m[1][1] * b0[7] + m[1][5],
    ]
}

#[inline]
pub fn propagate_twiss(input: &TwissInput) -> Result<TwissOutput, TwissError> {
    propagate_twiss_with_kernel(input, Kernel::Auto)
}

#[inline(always)]
fn twiss_prepare(input: &TwissInput, kernel: Kernel) -> Result<(usize, usize, Kernel), TwissError> {
    let n = input.accumulated.len();
    if n == 0 {
        return Err(TwissError::EmptyData);
    }
    let start = check_index(input.get_start(), n)
        .map_err(|(index, len)| TwissError::IndexOutOfRange { index, len })?;
    let chunk_size = input.get_chunk_size();
    if chunk_size == 0 {
        return Err(TwissError::InvalidChunkSize { chunk_size });
    }

    let (res_x, res_y) = input.reference.consistency_residual();
    if !(res_x <= DEFAULT_CONSISTENCY_TOLERANCE && res_y <= DEFAULT_CONSISTENCY_TOLERANCE) {
        tracing::warn!(
            residual_x = res_x,
            residual_y = res_y,
            "reference twiss violates beta*gamma = 1 + alpha^2; propagating as given"
        );
    }
    Ok((start, chunk_size, resolve_kernel(kernel, n)))
}

pub fn propagate_twiss_with_kernel(input: &TwissInput, kernel: Kernel) -> Result<TwissOutput, TwissError> {
    let (start, chunk_size, chosen) = twiss_prepare(input, kernel)?;
    let mut rows = vec![[0.0; TWISS_COMPONENTS]; input.accumulated.len()];
    twiss_compute_into(
        input.accumulated,
        &input.reference.as_array(),
        start,
        chunk_size,
        chosen,
        &mut rows,
    );
    Ok(TwissOutput::from_rows(&rows))
}

/// Writes an `8 × n` row-major table into `dst`; row `c` holds component `c` of
/// `TwissVector::as_array` for every position.
pub fn propagate_twiss_into_slice(
    dst: &mut [f64],
    input: &TwissInput,
    kernel: Kernel,
) -> Result<(), TwissError> {
    let (start, chunk_size, chosen) = twiss_prepare(input, kernel)?;
    let n = input.accumulated.len();
    if dst.len() != TWISS_COMPONENTS * n {
        return Err(TwissError::OutputLengthMismatch {
            expected: TWISS_COMPONENTS * n,
            got: dst.len(),
        });
    }
    let mut rows = vec![[0.0; TWISS_COMPONENTS]; n];
    twiss_compute_into(
        input.accumulated,
        &input.reference.as_array(),
        start,
        chunk_size,
        chosen,
        &mut rows,
    );
    for (c, row) in dst.chunks_exact_mut(n).enumerate() {
        for (slot, values) in row.iter_mut().zip(rows.iter()) {
            *slot = values[c];
        }
    }
    Ok(())
}

#[inline(always)]
fn twiss_compute_into(
    accumulated: &[Matrix6],
    b0: &[f64; TWISS_COMPONENTS],
    start: usize,
    chunk_size: usize,
    kernel: Kernel,
    rows: &mut [[f64; TWISS_COMPONENTS]],
) {
    let n = accumulated.len();
    let do_chunk = |first: usize, block: &mut [[f64; TWISS_COMPONENTS]]| {
        for (k, slot) in block.iter_mut().enumerate() {
            let pos = first + k;
            *slot = if pos == start {
                *b0
            } else {
                twiss_transform(&accumulated[predecessor(pos, n)], b0)
            };
        }
    };

    if kernel.is_parallel() {
        rows.par_chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(c, block)| do_chunk(c * chunk_size, block));
    } else {
        do_chunk(0, rows);
    }
}

/// Full quadratic form `out[pos] = A[pos] · B · A[pos]ᵀ` for every position.
#[inline]
pub fn propagate_envelope<const N: usize>(
    accumulated: &[Matrix<N>],
    envelope: &Matrix<N>,
) -> Result<Vec<Matrix<N>>, TwissError> {
    propagate_envelope_with_kernel(accumulated, envelope, Kernel::Auto)
}

pub fn propagate_envelope_with_kernel<const N: usize>(
    accumulated: &[Matrix<N>],
    envelope: &Matrix<N>,
    kernel: Kernel,
) -> Result<Vec<Matrix<N>>, TwissError> {
    if accumulated.is_empty() {
        return Err(TwissError::EmptyData);
    }
    let chosen = resolve_kernel(kernel, accumulated.len());
    let mut out = vec![zeros::<N>(); accumulated.len()];

    let do_chunk = |a: &[Matrix<N>], o: &mut [Matrix<N>]| {
        multiply_each(a, envelope, o);
        for (slot, ai) in o.iter_mut().zip(a.iter()) {
            let left = *slot;
            mat_mul_into(&left, &transpose(ai), slot);
        }
    };

    if chosen.is_parallel() {
        out.par_chunks_mut(DEFAULT_CHUNK_SIZE)
            .zip(accumulated.par_chunks(DEFAULT_CHUNK_SIZE))
            .for_each(|(o, a)| do_chunk(a, o));
    } else {
        do_chunk(accumulated, &mut out);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optics::accumulate::accumulate_ring;
    use crate::utilities::matrix::{identity, mat_mul};
    use crate::utilities::test_lattice::{drift, fodo_ring, scrambled, sector_bend, thin_quad};
    use proptest::prelude::*;
    use std::error::Error;

    fn reference() -> TwissVector {
        TwissVector::from_beta_alpha(8.0, -1.2, 3.5, 0.7, 0.4, -0.05)
    }

    fn assert_close(got: f64, want: f64, tol: f64, what: &str) {
        let scale = want.abs().max(1.0);
        assert!(
            (got - want).abs() <= tol * scale,
            "{}: got {}, expected {}",
            what,
            got,
            want
        );
    }

    fn check_twiss_identity_ring(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let acc = vec![identity::<6>(); 2500];
        let out = TwissBuilder::new()
            .start(17)
            .kernel(kernel)
            .apply_slice(&acc, reference())?;
        assert_eq!(out.len(), 2500);
        for pos in 0..out.len() {
            assert_eq!(
                out.at(pos),
                Some(reference()),
                "[{}] identity ring must keep the reference at pos {}",
                test_name,
                pos
            );
        }
        Ok(())
    }

    fn check_twiss_start_is_seed(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let acc = scrambled(6);
        let out = TwissBuilder::new()
            .start(3)
            .kernel(kernel)
            .apply_slice(&acc, reference())?;
        assert_eq!(out.at(3), Some(reference()), "[{}] start must hold the reference", test_name);
        let expected = twiss_transform(&acc[1], &reference().as_array());
        assert_eq!(out.at(2).map(|t| t.as_array()), Some(expected));
        Ok(())
    }

    fn check_twiss_drift_beta(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let r = reference();
        let s = 2.5;
        let acc = [drift(s), identity::<6>()];
        let out = TwissBuilder::new().kernel(kernel).apply_slice(&acc, r)?;
        let t = out.at(1).ok_or("missing position 1")?;
        assert_close(t.beta_x, r.beta_x - 2.0 * s * r.alpha_x + s * s * r.gamma_x, 1e-14, test_name);
        assert_close(t.alpha_x, r.alpha_x - s * r.gamma_x, 1e-14, test_name);
        assert_close(t.gamma_x, r.gamma_x, 1e-14, test_name);
        assert_close(t.beta_y, r.beta_y - 2.0 * s * r.alpha_y + s * s * r.gamma_y, 1e-14, test_name);
        assert_close(t.eta_x, r.eta_x + s * r.eta_x_dds, 1e-14, test_name);
        assert_close(t.eta_x_dds, r.eta_x_dds, 1e-14, test_name);
        Ok(())
    }

    fn check_twiss_dispersion_column(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let bend = sector_bend(4.0, 0.3);
        let acc = [bend, identity::<6>()];
        let out = TwissBuilder::new().kernel(kernel).apply_slice(&acc, reference())?;
        let t = out.at(1).ok_or("missing position 1")?;
        let r = reference();
        let want = bend[0][0] * r.eta_x + bend[0][1] * r.eta_x_dds + bend[0][5];
        let want_dds = bend[1][0] * r.eta_x + bend[1][1] * r.eta_x_dds + bend[1][5];
        assert_close(t.eta_x, want, 1e-14, test_name);
        assert_close(t.eta_x_dds, want_dds, 1e-14, test_name);
        Ok(())
    }

    fn check_twiss_matches_envelope(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let ring = fodo_ring(8);
        let acc = accumulate_ring(&ring, 0)?;
        let r = reference();
        let out = TwissBuilder::new().kernel(kernel).apply_slice(&acc, r)?;
        let env = propagate_envelope_with_kernel(&acc, &r.envelope_matrix(), kernel)?;
        let n = acc.len();
        for pos in 1..n {
            let t = out.at(pos).ok_or("missing position")?;
            let e = TwissVector::from_envelope(&env[pos - 1], t.eta_x, t.eta_x_dds);
            for (c, (&got, &want)) in t.as_array().iter().zip(e.as_array().iter()).enumerate() {
                assert_close(got, want, 1e-10, &format!("[{}] pos {} component {}", test_name, pos, c));
            }
        }
        Ok(())
    }

    fn check_twiss_parallel_chunks(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let ring: Vec<Matrix6> = fodo_ring(8).into_iter().cycle().take(5000).collect();
        let acc = accumulate_ring(&ring, 0)?;
        let reference_out = TwissBuilder::new()
            .kernel(Kernel::Scalar)
            .apply_slice(&acc, reference())?;
        for chunk in [1, 7, 500, 2000, 10_000] {
            let out = TwissBuilder::new()
                .chunk_size(chunk)
                .kernel(kernel)
                .apply_slice(&acc, reference())?;
            assert_eq!(out, reference_out, "[{}] chunk {} diverged", test_name, chunk);
        }
        Ok(())
    }

    fn check_twiss_into_slice_layout(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let acc = scrambled(5);
        let input = TwissInput::from_slice(&acc, reference(), TwissParams { start: Some(2), chunk_size: None });
        let out = propagate_twiss_with_kernel(&input, kernel)?;
        let mut table = vec![0.0; TWISS_COMPONENTS * acc.len()];
        propagate_twiss_into_slice(&mut table, &input, kernel)?;
        for (c, column) in out.components().iter().enumerate() {
            assert_eq!(
                &table[c * acc.len()..(c + 1) * acc.len()],
                *column,
                "[{}] table row {} mismatch",
                test_name,
                c
            );
        }
        let mut short = vec![0.0; 8];
        let err = propagate_twiss_into_slice(&mut short, &input, kernel).unwrap_err();
        assert_eq!(err, TwissError::OutputLengthMismatch { expected: 40, got: 8 });
        Ok(())
    }

    fn check_twiss_invalid_input(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let empty: [Matrix6; 0] = [];
        let err = TwissBuilder::new().kernel(kernel).apply_slice(&empty, reference()).unwrap_err();
        assert_eq!(err, TwissError::EmptyData, "[{}]", test_name);

        let acc = scrambled(3);
        let err = TwissBuilder::new()
            .start(3)
            .kernel(kernel)
            .apply_slice(&acc, reference())
            .unwrap_err();
        assert_eq!(err, TwissError::IndexOutOfRange { index: 3, len: 3 });

        let err = TwissBuilder::new()
            .chunk_size(0)
            .kernel(kernel)
            .apply_slice(&acc, reference())
            .unwrap_err();
        assert_eq!(err, TwissError::InvalidChunkSize { chunk_size: 0 });

        let err = propagate_envelope_with_kernel(&empty, &identity::<6>(), kernel).unwrap_err();
        assert_eq!(err, TwissError::EmptyData);
        Ok(())
    }

    fn check_twiss_inconsistent_reference(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let mut r = reference();
        r.gamma_x *= 3.0;
        assert!(r.consistency_residual().0 > DEFAULT_CONSISTENCY_TOLERANCE);
        let acc = [thin_quad(0.2), drift(1.0)];
        let out = TwissBuilder::new().kernel(kernel).apply_slice(&acc, r)?;
        assert_eq!(out.at(0), Some(r), "[{}] degenerate reference still seeds", test_name);
        let expected = twiss_transform(&acc[0], &r.as_array());
        assert_eq!(out.at(1).map(|t| t.as_array()), Some(expected));
        Ok(())
    }

    fn check_twiss_nan_propagates(test_name: &str, kernel: Kernel) -> Result<(), Box<dyn Error>> {
        let mut ring = scrambled(6);
        ring[3][0][0] = f64::NAN;
        let acc = accumulate_ring(&ring, 0)?;
        let out = TwissBuilder::new().kernel(kernel).apply_slice(&acc, reference())?;
        for pos in 0..out.len() {
            // position p sees the product up to element p - 1
            let downstream = pos > 3;
            assert_eq!(
                out.beta_x[pos].is_nan(),
                downstream,
                "[{}] beta_x at pos {} = {}",
                test_name,
                pos,
                out.beta_x[pos]
            );
            assert_eq!(out.eta_x[pos].is_nan(), downstream, "[{}] eta_x at pos {}", test_name, pos);
        }
        // the poisoned entry only reaches the vertical block one element later
        assert!(out.beta_y[4].is_finite(), "[{}] beta_y at pos 4", test_name);
        assert!(out.beta_y[5].is_nan(), "[{}] beta_y at pos 5", test_name);

        let mut r = reference();
        r.beta_y = f64::INFINITY;
        let out = TwissBuilder::new().kernel(kernel).apply_slice(&scrambled(4), r)?;
        assert_eq!(out.beta_y[0], f64::INFINITY);
        assert!(out.beta_y.iter().all(|v| !v.is_finite()));
        assert!(out.beta_x.iter().all(|v| v.is_finite()));

        let env = propagate_envelope_with_kernel(&acc, &reference().envelope_matrix(), kernel)?;
        assert!(env[2][0][0].is_finite());
        assert!(env[3][0][0].is_nan());
        Ok(())
    }

    #[test]
    fn test_twiss_vector_roundtrip_and_envelope() {
        let r = reference();
        assert_eq!(TwissVector::from_array(r.as_array()), r);
        let (rx, ry) = r.consistency_residual();
        assert!(rx < 1e-14 && ry < 1e-14);
        let b = r.envelope_matrix();
        assert_eq!(TwissVector::from_envelope(&b, r.eta_x, r.eta_x_dds), r);
        assert_eq!(b[0][2], 0.0);
        assert_eq!(b[4][4], 0.0);
    }

    #[test]
    fn test_twiss_default_params() {
        let acc = scrambled(2);
        let input = TwissInput::with_default_params(&acc, reference());
        assert_eq!(input.get_start(), 0);
        assert_eq!(input.get_chunk_size(), DEFAULT_CHUNK_SIZE);
        let out = propagate_twiss(&input).unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out.is_empty());
        assert_eq!(out.at(2), None);
    }

    #[test]
    fn test_envelope_reduced_size() {
        let mut a = identity::<4>();
        a[0][1] = 2.0;
        let b = [
            [2.0, 0.5, 0.0, 0.0],
            [0.5, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let out = propagate_envelope(&[a], &b).unwrap();
        let expected = mat_mul(&mat_mul(&a, &b), &transpose(&a));
        assert_eq!(out[0], expected);
        assert_eq!(out[0][0][0], 2.0 + 2.0 * 2.0 * 0.5 + 4.0 * 1.0);
    }

    macro_rules! generate_all_twiss_tests {
        ($($test_fn:ident),*) => {
            paste::paste! {
                $(
                    #[test]
                    fn [<$test_fn _scalar>]() {
                        $test_fn(stringify!([<$test_fn _scalar>]), Kernel::Scalar).unwrap();
                    }
                    #[test]
                    fn [<$test_fn _parallel>]() {
                        $test_fn(stringify!([<$test_fn _parallel>]), Kernel::Parallel).unwrap();
                    }
                    #[test]
                    fn [<$test_fn _auto_detect>]() {
                        $test_fn(stringify!([<$test_fn _auto_detect>]), Kernel::Auto).unwrap();
                    }
                )*
            }
        }
    }

    generate_all_twiss_tests!(
        check_twiss_identity_ring,
        check_twiss_start_is_seed,
        check_twiss_drift_beta,
        check_twiss_dispersion_column,
        check_twiss_matches_envelope,
        check_twiss_parallel_chunks,
        check_twiss_into_slice_layout,
        check_twiss_invalid_input,
        check_twiss_inconsistent_reference,
        check_twiss_nan_propagates
    );

    fn block_diagonal(h: [f64; 4], v: [f64; 4], extra: [f64; 4]) -> Matrix6 {
        let mut m = identity::<6>();
        m[0][0] = h[0];
        m[0][1] = h[1];
        m[1][0] = h[2];
        m[1][1] = h[3];
        m[2][2] = v[0];
        m[2][3] = v[1];
        m[3][2] = v[2];
        m[3][3] = v[3];
        m[0][5] = extra[0];
        m[1][5] = extra[1];
        m[4][0] = extra[2];
        m[5][5] = extra[3];
        m
    }

    proptest! {
        #[test]
        fn prop_closed_form_matches_quadratic_form(
            h in prop::array::uniform4(-3.0f64..3.0),
            v in prop::array::uniform4(-3.0f64..3.0),
            extra in prop::array::uniform4(-1.0f64..1.0),
            beta_x in 0.1f64..50.0,
            beta_y in 0.1f64..50.0,
            alpha_x in -5.0f64..5.0,
            alpha_y in -5.0f64..5.0,
        ) {
            let m = block_diagonal(h, v, extra);
            let r = TwissVector::from_beta_alpha(beta_x, alpha_x, beta_y, alpha_y, 0.0, 0.0);
            let closed = twiss_transform(&m, &r.as_array());
            let env = propagate_envelope(&[m], &r.envelope_matrix()).unwrap();
            let full = TwissVector::from_envelope(&env[0], closed[6], closed[7]).as_array();
            // bound by the size of the summed terms, since cancellation can leave a tiny result
            let magnitude = 9.0
                * (r.beta_x + r.beta_y + r.gamma_x + r.gamma_y
                    + 2.0 * r.alpha_x.abs()
                    + 2.0 * r.alpha_y.abs());
            for c in 0..6 {
                let scale = full[c].abs().max(closed[c].abs()).max(magnitude);
                prop_assert!(
                    (closed[c] - full[c]).abs() <= 1e-12 * scale,
                    "component {}: closed {} vs full {}", c, closed[c], full[c]
                );
            }
        }
    }
}
