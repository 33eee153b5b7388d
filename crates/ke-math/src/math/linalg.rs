//! 2×2 matrix algebra for the constant-velocity state model.
//!
//! Covariance matrices in the engine are always 2×2 symmetric positive
//! semi-definite. [`Mat2::stabilize`] is the single repair path: it
//! symmetrizes and floors eigenvalues using the closed-form decomposition
//! for symmetric 2×2 matrices, so no general eigen solver is needed.

use serde::{Deserialize, Serialize};

/// Two-element column vector `[value, trend]`.
pub type Vec2 = [f64; 2];

/// Tolerance used when checking symmetry of a covariance matrix.
pub const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// 2x2 matrix, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mat2 {
    m: [[f64; 2]; 2],
}

/// Result of repairing a covariance matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stabilized {
    pub matrix: Mat2,
    /// Largest absolute off-diagonal mismatch before symmetrizing.
    pub asymmetry: f64,
    /// Whether any eigenvalue had to be raised to the floor.
    pub eigen_floored: bool,
}

impl Mat2 {
    pub const fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { m: [[a, b], [c, d]] }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }

    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 1.0)
    }

    pub const fn diag(a: f64, d: f64) -> Self {
        Self::new(a, 0.0, 0.0, d)
    }

    /// Constant-velocity transition `F = [[1, dt], [0, 1]]`.
    pub const fn transition(dt: f64) -> Self {
        Self::new(1.0, dt, 0.0, 1.0)
    }

    pub const fn from_rows(rows: [[f64; 2]; 2]) -> Self {
        Self { m: rows }
    }

    pub fn rows(&self) -> [[f64; 2]; 2] {
        self.m
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.m[row][col]
    }

    pub fn mul(&self, other: &Mat2) -> Mat2 {
        Mat2::new(
            self.m[0][0] * other.m[0][0] + self.m[0][1] * other.m[1][0],
            self.m[0][0] * other.m[0][1] + self.m[0][1] * other.m[1][1],
            self.m[1][0] * other.m[0][0] + self.m[1][1] * other.m[1][0],
            self.m[1][0] * other.m[0][1] + self.m[1][1] * other.m[1][1],
        )
    }

    pub fn transpose(&self) -> Mat2 {
        Mat2::new(self.m[0][0], self.m[1][0], self.m[0][1], self.m[1][1])
    }

    pub fn add(&self, other: &Mat2) -> Mat2 {
        Mat2::new(
            self.m[0][0] + other.m[0][0],
            self.m[0][1] + other.m[0][1],
            self.m[1][0] + other.m[1][0],
            self.m[1][1] + other.m[1][1],
        )
    }

    pub fn sub(&self, other: &Mat2) -> Mat2 {
        Mat2::new(
            self.m[0][0] - other.m[0][0],
            self.m[0][1] - other.m[0][1],
            self.m[1][0] - other.m[1][0],
            self.m[1][1] - other.m[1][1],
        )
    }

    pub fn scale(&self, k: f64) -> Mat2 {
        Mat2::new(
            self.m[0][0] * k,
            self.m[0][1] * k,
            self.m[1][0] * k,
            self.m[1][1] * k,
        )
    }

    pub fn mul_vec(&self, v: Vec2) -> Vec2 {
        [
            self.m[0][0] * v[0] + self.m[0][1] * v[1],
            self.m[1][0] * v[0] + self.m[1][1] * v[1],
        ]
    }

    /// Congruence transform `A · self · Aᵗ`.
    pub fn congruence(&self, a: &Mat2) -> Mat2 {
        a.mul(self).mul(&a.transpose())
    }

    /// Outer product `u · vᵗ`.
    pub fn outer(u: Vec2, v: Vec2) -> Mat2 {
        Mat2::new(u[0] * v[0], u[0] * v[1], u[1] * v[0], u[1] * v[1])
    }

    pub fn trace(&self) -> f64 {
        self.m[0][0] + self.m[1][1]
    }

    pub fn determinant(&self) -> f64 {
        self.m[0][0] * self.m[1][1] - self.m[0][1] * self.m[1][0]
    }

    pub fn is_finite(&self) -> bool {
        self.m.iter().flatten().all(|v| v.is_finite())
    }

    pub fn asymmetry(&self) -> f64 {
        (self.m[0][1] - self.m[1][0]).abs()
    }

    pub fn is_symmetric(&self, tol: f64) -> bool {
        self.asymmetry() <= tol * (1.0 + self.max_abs())
    }

    pub fn max_abs(&self) -> f64 {
        self.m.iter().flatten().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }

    /// Average the off-diagonal terms.
    pub fn symmetrize(&self) -> Mat2 {
        let off = 0.5 * (self.m[0][1] + self.m[1][0]);
        Mat2::new(self.m[0][0], off, off, self.m[1][1])
    }

    /// Eigenvalues of the symmetric part, largest first.
    pub fn symmetric_eigenvalues(&self) -> (f64, f64) {
        let s = self.symmetrize();
        let mean = 0.5 * (s.m[0][0] + s.m[1][1]);
        let half_diff = 0.5 * (s.m[0][0] - s.m[1][1]);
        let radius = half_diff.hypot(s.m[0][1]);
        (mean + radius, mean - radius)
    }

    /// Unit eigenvector of the symmetric part for its largest eigenvalue.
    ///
    /// Picks whichever of the two equivalent null-space rows is better
    /// conditioned.
    fn principal_axis(&self, lambda_max: f64) -> Vec2 {
        let a = self.m[0][0];
        let b = self.m[0][1];
        let d = self.m[1][1];
        let u = [lambda_max - d, b];
        let w = [b, lambda_max - a];
        let nu = u[0].hypot(u[1]);
        let nw = w[0].hypot(w[1]);
        if nu.max(nw) <= f64::MIN_POSITIVE {
            return if a >= d { [1.0, 0.0] } else { [0.0, 1.0] };
        }
        if nu >= nw {
            [u[0] / nu, u[1] / nu]
        } else {
            [w[0] / nw, w[1] / nw]
        }
    }

    /// Symmetrize and raise any eigenvalue below `floor` to `floor`.
    pub fn stabilize(&self, floor: f64) -> Stabilized {
        let asymmetry = self.asymmetry();
        let sym = self.symmetrize();
        let (l1, l2) = sym.symmetric_eigenvalues();
        if l2 >= floor {
            return Stabilized {
                matrix: sym,
                asymmetry,
                eigen_floored: false,
            };
        }

        let v1 = sym.principal_axis(l1);
        let v2 = [-v1[1], v1[0]];
        let l1 = l1.max(floor);
        let l2 = l2.max(floor);
        let rebuilt = Mat2::outer(v1, v1)
            .scale(l1)
            .add(&Mat2::outer(v2, v2).scale(l2))
            .symmetrize();

        Stabilized {
            matrix: rebuilt,
            asymmetry,
            eigen_floored: true,
        }
    }

    /// Positive semi-definite check with a relative tolerance.
    pub fn is_psd(&self, tol: f64) -> bool {
        let (_, l2) = self.symmetric_eigenvalues();
        l2 >= -tol * (1.0 + self.max_abs())
    }
}

impl Default for Mat2 {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<[[f64; 2]; 2]> for Mat2 {
    fn from(rows: [[f64; 2]; 2]) -> Self {
        Self::from_rows(rows)
    }
}
