//! # Periodic Optics
//!
//! Closed solution of a one-turn matrix: per-plane stability, the matched reference
//! vector, fractional tunes, and betatron phase advance integrated along the ring.
//!
//! A plane is stable when `2 - m00² - 2·m01·m10 - m11² > 0`, i.e. `|trace| < 2` for a
//! symplectic 2×2 block. The matched vector follows from `cos μ = trace / 2`:
//! `β = |2·m01| / sqrt(term)`, `α = (m00 - m11) / (2·m01) · β`, `γ = (1 + α²) / β`.
//! Periodic dispersion solves `η = M·η + M[·][5]` on the horizontal block.
//!
//! ## Errors
//! - **UnstableLattice**: periodic: At least one plane has no periodic solution.
//! - **EmptyData**: periodic: No positions were supplied.
//! - **LengthMismatch**: periodic: β and `s` sequences differ in length.
//! - **NonMonotonicPositions**: periodic: `s` decreases at some index.
//! - **InvalidCircumference**: periodic: Circumference shorter than the covered span.
//! - **NonPositiveBeta**: periodic: β is zero, negative or NaN somewhere.

use crate::optics::twiss::TwissVector;
use crate::utilities::matrix::Matrix6;
use std::f64::consts::TAU;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PeriodicError {
    #[error("periodic: Lattice is unstable: horizontal stable = {stable_x}, vertical stable = {stable_y}")]
    UnstableLattice { stable_x: bool, stable_y: bool },

    #[error("periodic: Empty position data provided.")]
    EmptyData,

    #[error("periodic: Length mismatch: expected = {expected}, got = {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("periodic: Positions decrease at index {index}")]
    NonMonotonicPositions { index: usize },

    #[error("periodic: Invalid circumference: {circumference} < covered span {span}")]
    InvalidCircumference { circumference: f64, span: f64 },

    #[error("periodic: Non-positive beta at index {index}")]
    NonPositiveBeta { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stability {
    pub term_x: f64,
    pub term_y: f64,
}

impl Stability {
    #[inline]
    pub fn of(m: &Matrix6) -> Self {
        Self {
            term_x: 2.0 - m[0][0] * m[0][0] - 2.0 * m[0][1] * m[1][0] - m[1][1] * m[1][1],
            term_y: 2.0 - m[2][2] * m[2][2] - 2.0 * m[2][3] * m[3][2] - m[3][3] * m[3][3],
        }
    }

    #[inline]
    pub fn stable_x(&self) -> bool {
        self.term_x > 0.0
    }

    #[inline]
    pub fn stable_y(&self) -> bool {
        self.term_y > 0.0
    }

    #[inline]
    pub fn is_stable(&self) -> bool {
        self.stable_x() && self.stable_y()
    }

    fn require(&self) -> Result<(), PeriodicError> {
        if self.is_stable() {
            Ok(())
        } else {
            tracing::warn!(
                stable_x = self.stable_x(),
                stable_y = self.stable_y(),
                "one-turn matrix has no periodic solution"
            );
            Err(PeriodicError::UnstableLattice {
                stable_x: self.stable_x(),
                stable_y: self.stable_y(),
            })
        }
    }
}

/// Matched optics at the position where `one_turn` starts and ends.
pub fn periodic_twiss(one_turn: &Matrix6) -> Result<TwissVector, PeriodicError> {
    let m = one_turn;
    let stability = Stability::of(m);
    stability.require()?;

    let beta_x = (2.0 * m[0][1]).abs() / stability.term_x.sqrt();
    let alpha_x = (m[0][0] - m[1][1]) / (2.0 * m[0][1]) * beta_x;
    let beta_y = (2.0 * m[2][3]).abs() / stability.term_y.sqrt();
    let alpha_y = (m[2][2] - m[3][3]) / (2.0 * m[2][3]) * beta_y;

    let eta_x_dds = (m[1][0] * m[0][5] + m[1][5] * (1.0 - m[0][0])) / (2.0 - m[0][0] - m[1][1]);
    // solve from whichever row is better conditioned
    let eta_x = if (1.0 - m[0][0]).abs() >= m[1][0].abs() {
        (m[0][1] * eta_x_dds + m[0][5]) / (1.0 - m[0][0])
    } else {
        (eta_x_dds * (1.0 - m[1][1]) - m[1][5]) / m[1][0]
    };

    Ok(TwissVector::from_beta_alpha(
        beta_x, alpha_x, beta_y, alpha_y, eta_x, eta_x_dds,
    ))
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Tunes {
    pub x: f64,
    pub y: f64,
}

impl Tunes {
    /// Converts tunes per turn into frequencies for the given revolution frequency.
    #[inline]
    pub fn to_hz(&self, revolution_frequency: f64) -> Tunes {
        Tunes {
            x: self.x * revolution_frequency,
            y: self.y * revolution_frequency,
        }
    }
}

/// Fractional tunes in `[0, 0.5]` from the one-turn trace.
pub fn fractional_tunes(one_turn: &Matrix6) -> Result<Tunes, PeriodicError> {
    let m = one_turn;
    Stability::of(m).require()?;
    Ok(Tunes {
        x: ((m[0][0] + m[1][1]) / 2.0).acos() / TAU,
        y: ((m[2][2] + m[3][3]) / 2.0).acos() / TAU,
    })
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BetatronPhase {
    pub psi_x: Vec<f64>,
    pub psi_y: Vec<f64>,
    pub tunes: Tunes,
}

/// Cumulative phase `ψ(s) = ∫ ds / β` by the trapezoidal rule.
///
/// `s[i]` is the longitudinal position of sample `i`; `ψ` is zero at the first sample.
/// The tune adds the closing segment from the last sample back to the first one turn later,
/// so it converges with sample density, not exactly.
pub fn betatron_phase(
    beta_x: &[f64],
    beta_y: &[f64],
    s: &[f64],
    circumference: f64,
) -> Result<BetatronPhase, PeriodicError> {
    let n = s.len();
    if n == 0 {
        return Err(PeriodicError::EmptyData);
    }
    for len in [beta_x.len(), beta_y.len()] {
        if len != n {
            return Err(PeriodicError::LengthMismatch { expected: n, got: len });
        }
    }
    if let Some(index) = (1..n).find(|&i| !(s[i] >= s[i - 1])) {
        return Err(PeriodicError::NonMonotonicPositions { index });
    }
    if let Some(index) = (0..n).find(|&i| !(beta_x[i] > 0.0 && beta_y[i] > 0.0)) {
        return Err(PeriodicError::NonPositiveBeta { index });
    }
    let span = s[n - 1] - s[0];
    if !(circumference >= span) {
        return Err(PeriodicError::InvalidCircumference {
            circumference,
            span,
        });
    }

    let integrate = |beta: &[f64]| -> (Vec<f64>, f64) {
        let mut psi = Vec::with_capacity(n);
        let mut acc = 0.0;
        psi.push(acc);
        for i in 1..n {
            acc += 0.5 * (s[i] - s[i - 1]) * (1.0 / beta[i] + 1.0 / beta[i - 1]);
            psi.push(acc);
        }
        let closing = 0.5 * (circumference - span) * (1.0 / beta[0] + 1.0 / beta[n - 1]);
        (psi, (acc + closing) / TAU)
    };

    let (psi_x, tune_x) = integrate(beta_x);
    let (psi_y, tune_y) = integrate(beta_y);
    Ok(BetatronPhase {
        psi_x,
        psi_y,
        tunes: Tunes { x: tune_x, y: tune_y },
    })
}
