//! Polynomial fingerprinting of normalized curves.
use statrs::statistics::Statistics;

use crate::error::{PipelineError, Result};
use super::containers::{Curve, Fingerprint};

/// Fits degrees `1..=max_degree` in turn and keeps the last one that succeeded.
///
/// The fingerprint's expressiveness is therefore capped by `max_degree`, not picked by the
/// lowest error; per-degree errors are reported alongside for inspection.
pub struct PolynomialFitter {
    max_degree: usize,
}

impl PolynomialFitter {
    pub fn new(max_degree: usize) -> Self {
        Self { max_degree }
    }

    pub fn fit(&self, curve: &Curve) -> Fingerprint {
        let (time, value) = (&curve.time, &curve.value);
        if time.len() < 2 || time.len() != value.len() {
            log::debug!("Invalid input for polynomial fitting ({} points)", value.len());
            return Fingerprint::invalid();
        }
        if time.iter().chain(value.iter()).any(|x| !x.is_finite()) {
            log::debug!("Curve contains non-finite values");
            return Fingerprint::invalid();
        }
        let min = value.iter().copied().fold(f64::INFINITY, f64::min);
        let max = value.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max == min {
            log::debug!("Curve has no variation, using constant polynomial");
            return Fingerprint::constant(min);
        }

        let t_min = time.iter().copied().fold(f64::INFINITY, f64::min);
        let t_max = time.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let x: Vec<f64> = time.iter().map(|t| (t - t_min) / (t_max - t_min + 1e-10)).collect();

        let mut fitted: Option<(usize, Vec<f64>)> = None;
        let mut errors = Vec::new();
        for degree in 1..=self.max_degree {
            match polyfit(&x, value, degree) {
                Ok(coefficients) => {
                    errors.push(mean_squared_error(&coefficients, &x, value));
                    fitted = Some((degree, coefficients));
                }
                Err(e) => {
                    log::debug!("{e}, keeping lower degrees");
                    break;
                }
            }
        }

        match fitted {
            Some((degree, coefficients)) => Fingerprint {
                degree,
                coefficients,
                errors,
            },
            None => Fingerprint {
                degree: 1,
                coefficients: vec![value.iter().mean()],
                errors: vec![value.iter().population_variance()],
            },
        }
    }
}

/// Least-squares polynomial of the given degree, highest-order coefficient first.
///
/// Fails when the Vandermonde system is rank deficient or the solution is not finite.
pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<Vec<f64>> {
    let rows = x.len();
    let cols = degree + 1;
    if rows < cols || rows != y.len() {
        return Err(PipelineError::FitFailure { degree });
    }

    // Column-major Vandermonde matrix, column j holds x^(degree - j).
    let mut a: Vec<Vec<f64>> = (0..cols)
        .map(|j| x.iter().map(|xi| xi.powi((degree - j) as i32)).collect())
        .collect();
    let mut b = y.to_vec();

    householder_qr(&mut a, &mut b);

    let max_diag = (0..cols).map(|k| a[k][k].abs()).fold(0.0, f64::max);
    let tolerance = rows as f64 * f64::EPSILON * max_diag;
    if (0..cols).any(|k| !(a[k][k].abs() > tolerance)) {
        return Err(PipelineError::FitFailure { degree });
    }

    let mut coefficients = vec![0.0; cols];
    for k in (0..cols).rev() {
        let tail: f64 = ((k + 1)..cols).map(|j| a[j][k] * coefficients[j]).sum();
        coefficients[k] = (b[k] - tail) / a[k][k];
    }

    if coefficients.iter().all(|c| c.is_finite()) {
        Ok(coefficients)
    } else {
        Err(PipelineError::FitFailure { degree })
    }
}

/// In-place Householder triangularization of `a` (column-major), applied to `b` as well.
fn householder_qr(a: &mut [Vec<f64>], b: &mut [f64]) {
    let rows = b.len();
    for k in 0..a.len() {
        let norm = a[k][k..].iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm == 0.0 {
            continue;
        }
        let alpha = if a[k][k] > 0.0 { -norm } else { norm };
        let mut v: Vec<f64> = a[k][k..].to_vec();
        v[0] -= alpha;
        let v_norm2: f64 = v.iter().map(|x| x * x).sum();
        if v_norm2 == 0.0 {
            continue;
        }

        let reflect = |column: &mut [f64]| {
            let s: f64 = v.iter().zip(column.iter()).map(|(vi, ci)| vi * ci).sum();
            let factor = 2.0 * s / v_norm2;
            column.iter_mut().zip(v.iter()).for_each(|(ci, vi)| *ci -= factor * vi);
        };
        for column in a.iter_mut().skip(k) {
            reflect(&mut column[k..rows]);
        }
        reflect(&mut b[k..rows]);
    }
}

/// Evaluates a highest-order-first polynomial with Horner's scheme.
pub fn polyval(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().fold(0.0, |acc, c| acc * x + c)
}

fn mean_squared_error(coefficients: &[f64], x: &[f64], y: &[f64]) -> f64 {
    x.iter()
        .zip(y.iter())
        .map(|(xi, yi)| (yi - polyval(coefficients, *xi)).powi(2))
        .mean()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic(points: usize) -> Curve {
        let time: Vec<f64> = (0..points).map(|i| i as f64 / (points - 1) as f64).collect();
        let value = time.iter().map(|t| 3.0 * t * t - 2.0 * t + 5.0).collect();
        Curve::new(time, value)
    }

    #[test]
    fn test_recovers_quadratic() {
        let fingerprint = PolynomialFitter::new(2).fit(&quadratic(100));
        assert_eq!(fingerprint.degree, 2);
        assert_eq!(fingerprint.coefficients.len(), 3);
        for (got, want) in fingerprint.coefficients.iter().zip([3.0, -2.0, 5.0]) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
        assert!(fingerprint.errors[1] < 1e-12);
        assert!(fingerprint.errors[0] > fingerprint.errors[1]);
    }

    #[test]
    fn test_keeps_highest_degree_not_lowest_error() {
        let fingerprint = PolynomialFitter::new(5).fit(&quadratic(100));
        assert_eq!(fingerprint.degree, 5);
        assert_eq!(fingerprint.coefficients.len(), 6);
        assert_eq!(fingerprint.errors.len(), 5);
        assert!(fingerprint.errors[1] < 1e-12);
        // Higher-order terms of a quadratic come out (numerically) zero.
        assert!(fingerprint.coefficients[0].abs() < 1e-4);
    }

    #[test]
    fn test_constant_curve_falls_back() {
        let curve = Curve::new(vec![0.0, 0.1, 0.2, 0.3, 0.4], vec![500.0; 5]);
        assert_eq!(
            PolynomialFitter::new(5).fit(&curve),
            Fingerprint {
                degree: 1,
                coefficients: vec![500.0],
                errors: vec![0.0],
            }
        );
    }

    #[test]
    fn test_fallback_only_for_constant_values() {
        let curve = Curve::new(vec![0.0, 0.1, 0.2, 0.3, 0.4], vec![500.0, 500.0, 500.0, 500.0, 500.5]);
        let fingerprint = PolynomialFitter::new(3).fit(&curve);
        assert_eq!(fingerprint.degree, 3);
        assert_eq!(fingerprint.coefficients.len(), 4);
    }

    #[test]
    fn test_invalid_inputs() {
        let fitter = PolynomialFitter::new(5);
        assert_eq!(fitter.fit(&Curve::new(vec![0.0], vec![1.0])), Fingerprint::invalid());
        assert_eq!(fitter.fit(&Curve::new(vec![0.0, 1.0], vec![1.0])), Fingerprint::invalid());
        assert_eq!(
            fitter.fit(&Curve::new(vec![0.0, 1.0, 2.0], vec![1.0, f64::NAN, 2.0])),
            Fingerprint::invalid()
        );
    }

    #[test]
    fn test_rank_deficiency_caps_degree() {
        let curve = Curve::new(vec![0.0, 1.0, 2.0], vec![1.0, 4.0, 2.0]);
        let fingerprint = PolynomialFitter::new(5).fit(&curve);
        assert_eq!(fingerprint.degree, 2);
        assert_eq!(fingerprint.errors.len(), 2);
        assert!(fingerprint.errors[1] < 1e-12);
    }

    #[test]
    fn test_singular_first_degree_uses_mean() {
        let curve = Curve::new(vec![1.0, 1.0, 1.0, 1.0], vec![1.0, 2.0, 3.0, 4.0]);
        let fingerprint = PolynomialFitter::new(5).fit(&curve);
        assert_eq!(fingerprint.degree, 1);
        assert_eq!(fingerprint.coefficients, vec![2.5]);
        assert!((fingerprint.errors[0] - 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_polyfit_rejects_underdetermined() {
        assert_eq!(
            polyfit(&[0.0, 1.0], &[1.0, 2.0], 2),
            Err(PipelineError::FitFailure { degree: 2 })
        );
    }

    #[test]
    fn test_polyval() {
        assert_eq!(polyval(&[2.0, 0.0, -1.0], 3.0), 17.0);
        assert_eq!(polyval(&[], 3.0), 0.0);
    }
}
