//! Fixed-size dense matrices stored as plain row-major arrays.
//!
//! Every matrix is a `Copy` value living on the stack, so hot loops never allocate.
//! Products are written into caller-owned slots; a slot must not alias either operand.

/// Square `N`×`N` matrix of doubles, row-major.
pub type Matrix<const N: usize> = [[f64; N]; N];

/// Full 6-dimensional phase-space transfer matrix `(x, x', y, y', l, δ)`.
pub type Matrix6 = Matrix<6>;

#[inline(always)]
pub const fn zeros<const N: usize>() -> Matrix<N> {
    [[0.0; N]; N]
}

#[inline]
pub fn identity<const N: usize>() -> Matrix<N> {
    let mut m = zeros::<N>();
    for i in 0..N {
        m[i][i] = 1.0;
    }
    m
}

/// `out = a · b`.
#[inline(always)]
pub fn mat_mul_into<const N: usize>(a: &Matrix<N>, b: &Matrix<N>, out: &mut Matrix<N>) {
    for i in 0..N {
        for j in 0..N {
            let mut acc = 0.0;
            for k in 0..N {
                acc += a[i][k] * b[k][j];
            }
            out[i][j] = acc;
        }
    }
}

#[inline(always)]
pub fn mat_mul<const N: usize>(a: &Matrix<N>, b: &Matrix<N>) -> Matrix<N> {
    let mut out = zeros::<N>();
    mat_mul_into(a, b, &mut out);
    out
}

/// Left-multiplies `acc` in place: `acc = a · acc`.
#[inline(always)]
pub fn left_mul_assign<const N: usize>(a: &Matrix<N>, acc: &mut Matrix<N>) {
    let mut tmp = zeros::<N>();
    mat_mul_into(a, acc, &mut tmp);
    *acc = tmp;
}

#[inline]
pub fn transpose<const N: usize>(m: &Matrix<N>) -> Matrix<N> {
    let mut t = zeros::<N>();
    for i in 0..N {
        for j in 0..N {
            t[j][i] = m[i][j];
        }
    }
    t
}

/// Multiplies every matrix of `a` by the same right operand: `out[pos] = a[pos] · b`.
///
/// # Panics
/// If `a` and `out` differ in length.
pub fn multiply_each<const N: usize>(a: &[Matrix<N>], b: &Matrix<N>, out: &mut [Matrix<N>]) {
    assert_eq!(a.len(), out.len(), "`out` must match the length of `a`");
    for (src, dst) in a.iter().zip(out.iter_mut()) {
        mat_mul_into(src, b, dst);
    }
}

/// Largest absolute element-wise difference, used for tolerance comparisons.
#[inline]
pub fn max_abs_diff<const N: usize>(a: &Matrix<N>, b: &Matrix<N>) -> f64 {
    let mut worst: f64 = 0.0;
    for i in 0..N {
        for j in 0..N {
            worst = worst.max((a[i][j] - b[i][j]).abs());
        }
    }
    worst
}
