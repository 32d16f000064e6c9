//! Similarity measures and dense linear solvers shared by the algorithms.

use ndarray::{Array1, Array2};
use std::collections::HashSet;

use crate::error::{RecommendError, Result};

/// Pivot floor below which Gauss-Jordan adds inline regularization.
const SINGULAR_EPS: f64 = 1e-10;

/// Cosine similarity of two dense vectors. Zero when either has no norm.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Pearson correlation of two paired samples. Zero for degenerate samples.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Jaccard similarity of two id sets.
pub fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Logistic sigmoid.
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Cholesky factorization A = L L^T for a symmetric positive-definite matrix.
/// Returns `None` when A is not positive-definite.
pub fn cholesky_decompose(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return None;
    }

    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Some(l)
}

/// Solve A x = b given the Cholesky factor L of A, by forward then backward
/// substitution.
pub fn cholesky_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in i + 1..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Invert a symmetric positive-definite matrix via its Cholesky factor.
/// Returns `None` when the factorization fails.
pub fn cholesky_inverse(a: &Array2<f64>) -> Option<Array2<f64>> {
    let l = cholesky_decompose(a)?;
    let n = a.nrows();
    let mut inverse = Array2::<f64>::zeros((n, n));
    let mut unit = Array1::<f64>::zeros(n);
    for col in 0..n {
        unit.fill(0.0);
        unit[col] = 1.0;
        let x = cholesky_solve(&l, &unit);
        for row in 0..n {
            inverse[[row, col]] = x[row];
        }
    }
    Some(inverse)
}

/// Newton-Schulz iteration for an approximate pseudo-inverse. The fallback
/// when Cholesky reports a non-positive-definite matrix.
pub fn newton_schulz_pinv(a: &Array2<f64>, iterations: usize) -> Array2<f64> {
    let n = a.nrows();

    // Row- and column-sum norms bound the spectral norm; scaling A^T by their
    // product guarantees convergence of the iteration.
    let norm_inf = (0..n)
        .map(|i| (0..a.ncols()).map(|j| a[[i, j]].abs()).sum::<f64>())
        .fold(0.0f64, f64::max);
    let norm_one = (0..a.ncols())
        .map(|j| (0..n).map(|i| a[[i, j]].abs()).sum::<f64>())
        .fold(0.0f64, f64::max);
    let scale = norm_inf * norm_one;
    if scale == 0.0 {
        return Array2::zeros((a.ncols(), n));
    }

    let mut x = a.t().to_owned() / scale;
    let identity2 = Array2::<f64>::eye(n) * 2.0;
    for _ in 0..iterations {
        let ax = a.dot(&x);
        x = x.dot(&(&identity2 - &ax));
    }
    x
}

/// Invert a square matrix by Gauss-Jordan elimination with partial pivoting.
/// Near-singular pivots get `1e-10` added inline instead of failing outright.
pub fn gauss_jordan_inverse(a: &Array2<f64>) -> Result<Array2<f64>> {
    let n = a.nrows();
    if a.ncols() != n {
        return Err(RecommendError::Numerical(
            "matrix must be square to invert".to_string(),
        ));
    }

    let mut work = a.clone();
    let mut inverse = Array2::<f64>::eye(n);

    for col in 0..n {
        // Partial pivot on the largest magnitude in this column.
        let mut pivot_row = col;
        for row in col + 1..n {
            if work[[row, col]].abs() > work[[pivot_row, col]].abs() {
                pivot_row = row;
            }
        }
        if pivot_row != col {
            for j in 0..n {
                work.swap([col, j], [pivot_row, j]);
                inverse.swap([col, j], [pivot_row, j]);
            }
        }

        let mut pivot = work[[col, col]];
        if pivot.abs() < SINGULAR_EPS {
            work[[col, col]] += SINGULAR_EPS;
            pivot = work[[col, col]];
        }

        for j in 0..n {
            work[[col, j]] /= pivot;
            inverse[[col, j]] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                work[[row, j]] -= factor * work[[col, j]];
                inverse[[row, j]] -= factor * inverse[[col, j]];
            }
        }
    }

    Ok(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cosine_basics() {
        assert_relative_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_relative_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_relative_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_pearson_perfect_correlation() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        assert_relative_eq!(pearson(&a, &b), 1.0, epsilon = 1e-12);

        let inverted = [8.0, 6.0, 4.0, 2.0];
        assert_relative_eq!(pearson(&a, &inverted), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_jaccard_overlap() {
        let a: HashSet<i64> = [1, 2, 3].into_iter().collect();
        let b: HashSet<i64> = [2, 3, 4].into_iter().collect();
        assert_relative_eq!(jaccard(&a, &b), 0.5);
    }

    #[test]
    fn test_cholesky_solves_spd_system() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let b = ndarray::arr1(&[10.0, 8.0]);
        let l = cholesky_decompose(&a).unwrap();
        let x = cholesky_solve(&l, &b);
        assert_relative_eq!(4.0 * x[0] + 2.0 * x[1], 10.0, epsilon = 1e-9);
        assert_relative_eq!(2.0 * x[0] + 3.0 * x[1], 8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_cholesky_rejects_non_pd() {
        let a = ndarray::arr2(&[[0.0, 1.0], [1.0, 0.0]]);
        assert!(cholesky_decompose(&a).is_none());
    }

    #[test]
    fn test_cholesky_inverse_matches_identity() {
        let a = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let inv = cholesky_inverse(&a).unwrap();
        let product = a.dot(&inv);
        assert_relative_eq!(product[[0, 0]], 1.0, epsilon = 1e-9);
        assert_relative_eq!(product[[0, 1]], 0.0, epsilon = 1e-9);
        assert_relative_eq!(product[[1, 1]], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_newton_schulz_approximates_inverse() {
        let a = ndarray::arr2(&[[3.0, 1.0], [1.0, 2.0]]);
        let pinv = newton_schulz_pinv(&a, 30);
        let product = a.dot(&pinv);
        assert_relative_eq!(product[[0, 0]], 1.0, epsilon = 1e-6);
        assert_relative_eq!(product[[1, 1]], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_gauss_jordan_inverse() {
        let a = ndarray::arr2(&[[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 8.0]]);
        let inv = gauss_jordan_inverse(&a).unwrap();
        assert_relative_eq!(inv[[0, 0]], 0.5);
        assert_relative_eq!(inv[[1, 1]], 0.25);
        assert_relative_eq!(inv[[2, 2]], 0.125);
    }

    #[test]
    fn test_gauss_jordan_regularizes_singular() {
        let a = ndarray::arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        // Singular input does not error; the inline regularization keeps the
        // elimination moving.
        assert!(gauss_jordan_inverse(&a).is_ok());
    }

    #[test]
    fn test_sigmoid_bounds() {
        assert_relative_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(20.0) > 0.999);
        assert!(sigmoid(-20.0) < 0.001);
    }
}
