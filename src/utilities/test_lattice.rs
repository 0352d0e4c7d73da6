//! Element matrices for unit tests: drifts, thin quadrupoles, sector bends.

use crate::utilities::matrix::{identity, Matrix6};

pub fn drift(length: f64) -> Matrix6 {
    let mut m = identity::<6>();
    m[0][1] = length;
    m[2][3] = length;
    m
}

/// Thin quadrupole with integrated strength `k` (focusing in x for `k > 0`).
pub fn thin_quad(k: f64) -> Matrix6 {
    let mut m = identity::<6>();
    m[1][0] = -k;
    m[3][2] = k;
    m
}

/// Horizontal sector bend of radius `rho` and angle `angle`.
pub fn sector_bend(rho: f64, angle: f64) -> Matrix6 {
    let (s, c) = angle.sin_cos();
    let mut m = identity::<6>();
    m[0][0] = c;
    m[0][1] = rho * s;
    m[0][5] = rho * (1.0 - c);
    m[1][0] = -s / rho;
    m[1][1] = c;
    m[1][5] = s;
    m[2][3] = rho * angle;
    m[4][0] = -s;
    m[4][1] = -rho * (1.0 - c);
    m[4][5] = -rho * (angle - s);
    m
}

/// FODO cells with a sector bend inside each drift, `cells` times.
pub fn fodo_ring(cells: usize) -> Vec<Matrix6> {
    let angle = std::f64::consts::PI / cells as f64;
    let mut ring = Vec::with_capacity(cells * 6);
    for _ in 0..cells {
        ring.push(thin_quad(0.4));
        ring.push(drift(0.5));
        ring.push(sector_bend(5.0, angle));
        ring.push(thin_quad(-0.4));
        ring.push(drift(0.5));
        ring.push(sector_bend(5.0, angle));
    }
    ring
}

/// Deterministic, well-conditioned matrices that do not commute with each other.
pub fn scrambled(n: usize) -> Vec<Matrix6> {
    (0..n)
        .map(|p| {
            let mut m = identity::<6>();
            for i in 0..6 {
                for j in 0..6 {
                    let h = ((p * 31 + i * 7 + j * 13) % 17) as f64;
                    m[i][j] += (h - 8.0) * 0.01;
                }
            }
            m
        })
        .collect()
}
