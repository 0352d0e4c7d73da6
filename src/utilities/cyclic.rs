//! Index arithmetic on a ring of `n` positions.
//!
//! All kernels normalise positions through these helpers; `n` must be non-zero.

#[inline(always)]
pub fn wrap(i: usize, n: usize) -> usize {
    i % n
}

/// Cyclic predecessor of `pos`: `n - 1` for position 0.
#[inline(always)]
pub fn predecessor(pos: usize, n: usize) -> usize {
    (pos + n - 1) % n
}

/// Number of steps from `start` forward to `end`, in `[0, n)`.
///
/// `end < start` wraps through position 0.
#[inline(always)]
pub fn span(start: usize, end: usize, n: usize) -> usize {
    (end + n - start) % n
}

/// Returns `Err((index, len))` when `index` is not a valid position.
#[inline(always)]
pub fn check_index(index: usize, len: usize) -> Result<usize, (usize, usize)> {
    if index < len {
        Ok(index)
    } else {
        Err((index, len))
    }
}
