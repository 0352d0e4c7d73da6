//! Shared lattice builders and comparison helpers for the integration tests.
#![allow(dead_code)]

use ring_optics::utilities::matrix::{identity, Matrix6};

/// One lattice element: its transfer matrix and its length in metres.
#[derive(Debug, Clone, Copy)]
pub struct Element {
    pub matrix: Matrix6,
    pub length: f64,
}

pub fn drift(length: f64) -> Element {
    let mut m = identity::<6>();
    m[0][1] = length;
    m[2][3] = length;
    Element { matrix: m, length }
}

pub fn thin_quad(k: f64) -> Element {
    let mut m = identity::<6>();
    m[1][0] = -k;
    m[3][2] = k;
    Element { matrix: m, length: 0.0 }
}

pub fn sector_bend(rho: f64, angle: f64) -> Element {
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
    Element {
        matrix: m,
        length: rho * angle,
    }
}

/// Thin-lens FODO ring with `cells` cells; drifts and bends are cut into `slices` pieces.
pub fn fodo_ring(cells: usize, slices: usize) -> Vec<Element> {
    let angle = std::f64::consts::PI / cells as f64;
    let mut ring = Vec::new();
    let half_cell = |ring: &mut Vec<Element>, k: f64| {
        ring.push(thin_quad(k));
        for _ in 0..slices {
            ring.push(drift(0.5 / slices as f64));
        }
        for _ in 0..slices {
            ring.push(sector_bend(5.0, angle / slices as f64));
        }
    };
    for _ in 0..cells {
        half_cell(&mut ring, 0.4);
        half_cell(&mut ring, -0.4);
    }
    ring
}

pub fn matrices(ring: &[Element]) -> Vec<Matrix6> {
    ring.iter().map(|e| e.matrix).collect()
}

/// Longitudinal position of each element entrance, and the circumference.
pub fn positions(ring: &[Element]) -> (Vec<f64>, f64) {
    let mut s = Vec::with_capacity(ring.len());
    let mut acc = 0.0;
    for e in ring {
        s.push(acc);
        acc += e.length;
    }
    (s, acc)
}

/// Compare two arrays with a tolerance
pub fn assert_array_close(actual: &[f64], expected: &[f64], rtol: f64, atol: f64, name: &str) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "{}: Length mismatch: actual {} vs expected {}",
        name,
        actual.len(),
        expected.len()
    );

    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        if a.is_nan() && e.is_nan() {
            continue;
        }

        let diff = (a - e).abs();
        let tol = atol + rtol * e.abs();

        assert!(
            diff <= tol,
            "{}: Value mismatch at index {}: actual {} vs expected {} (diff: {}, tol: {})",
            name,
            i,
            a,
            e,
            diff,
            tol
        );
    }
}

pub fn assert_matrix_close(actual: &Matrix6, expected: &Matrix6, tol: f64, name: &str) {
    for i in 0..6 {
        assert_array_close(&actual[i], &expected[i], tol, tol, &format!("{} row {}", name, i));
    }
}
