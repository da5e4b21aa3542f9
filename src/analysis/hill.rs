// src/analysis/hill.rs
//! Dose-response fitting: `A·xⁿ/(Kⁿ+xⁿ) + b` by Levenberg-Marquardt, plus the
//! sensitivity and detection limits derived from the fitted curve.
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use crate::analysis::error::{AnalysisError, FitError};
const PARAMETERS: usize = 4;
/// Hill curve with a vertical offset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HillCurve {
    pub amplitude: f64,
    pub half_saturation: f64,
    pub hill_coefficient: f64,
    pub offset: f64,
}
impl HillCurve {
    fn from_params(p: &Array1<f64>) -> Self {
        Self {
            amplitude: p[0],
            half_saturation: p[1],
            hill_coefficient: p[2],
            offset: p[3],
        }
    }
    fn params(&self) -> Array1<f64> {
        Array1::from(vec![
            self.amplitude,
            self.half_saturation,
            self.hill_coefficient,
            self.offset,
        ])
    }
    fn is_valid(&self) -> bool {
        self.half_saturation > 0.0
            && self.hill_coefficient > 0.0
            && self.amplitude.is_finite()
            && self.offset.is_finite()
            && self.half_saturation.is_finite()
            && self.hill_coefficient.is_finite()
    }
    /// Fraction of saturation `xⁿ/(Kⁿ+xⁿ)`.
    fn occupancy(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        let xn = x.powf(self.hill_coefficient);
        xn / (self.half_saturation.powf(self.hill_coefficient) + xn)
    }
    pub fn evaluate(&self, x: f64) -> f64 {
        self.amplitude * self.occupancy(x) + self.offset
    }
    /// `df/dx = A·n·Kⁿ·xⁿ⁻¹ / (Kⁿ+xⁿ)²`
    pub fn derivative(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return 0.0;
        }
        let n = self.hill_coefficient;
        let kn = self.half_saturation.powf(n);
        let xn = x.powf(n);
        self.amplitude * n * kn * x.powf(n - 1.0) / ((kn + xn) * (kn + xn))
    }
    /// `K·((n−1)/(n+1))^(1/n)`; the curve has no inflection for `n <= 1`.
    pub fn inflection_point(&self) -> Option<f64> {
        let n = self.hill_coefficient;
        (n > 1.0).then(|| self.half_saturation * ((n - 1.0) / (n + 1.0)).powf(1.0 / n))
    }
    /// Partial derivatives with respect to (A, K, n, b).
    fn gradient(&self, x: f64) -> [f64; PARAMETERS] {
        if x <= 0.0 {
            return [0.0, 0.0, 0.0, 1.0];
        }
        let (a, k, n) = (self.amplitude, self.half_saturation, self.hill_coefficient);
        let kn = k.powf(n);
        let xn = x.powf(n);
        let denom = (kn + xn) * (kn + xn);
        [
            xn / (kn + xn),
            -a * xn * n * k.powf(n - 1.0) / denom,
            a * xn * kn * (x.ln() - k.ln()) / denom,
            1.0,
        ]
    }
}
#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    pub max_iterations: usize,
    /// Relative change in cost or parameters below which the fit has converged.
    pub tolerance: f64,
    /// Starting point; estimated from the data when absent.
    pub initial: Option<HillCurve>,
}
impl Default for FitOptions {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-12,
            initial: None,
        }
    }
}
/// Baseline from the lowest dose, amplitude from the highest, K where the
/// group means cross half way.
fn initial_guess(x: &[f64], y: &[f64]) -> HillCurve {
    let mut pairs: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut means: Vec<(f64, f64)> = Vec::new();
    let mut start = 0;
    while start < pairs.len() {
        let dose = pairs[start].0;
        let end = pairs[start..]
            .iter()
            .position(|p| p.0 != dose)
            .map_or(pairs.len(), |offset| start + offset);
        let group = &pairs[start..end];
        means.push((dose, group.iter().map(|p| p.1).sum::<f64>() / group.len() as f64));
        start = end;
    }
    let (x_lo, b) = means[0];
    let (x_hi, top) = means[means.len() - 1];
    let mut amplitude = top - b;
    if amplitude == 0.0 {
        amplitude = 1.0;
    }
    let half = b + amplitude / 2.0;
    let crossing = means.windows(2).find_map(|w| {
        let ((x0, y0), (x1, y1)) = (w[0], w[1]);
        let crosses = (y0 - half) * (y1 - half) <= 0.0 && y0 != y1;
        crosses.then(|| x0 + (half - y0) * (x1 - x0) / (y1 - y0))
    });
    let mut k = crossing.unwrap_or((x_lo + x_hi) / 2.0);
    if k <= 0.0 {
        k = if x_hi > 0.0 { x_hi / 2.0 } else { 1.0 };
    }
    HillCurve {
        amplitude,
        half_saturation: k,
        hill_coefficient: 2.0,
        offset: b,
    }
}
fn residuals(curve: &HillCurve, x: &[f64], y: &[f64]) -> Array1<f64> {
    x.iter()
        .zip(y)
        .map(|(&xi, &yi)| yi - curve.evaluate(xi))
        .collect()
}
fn jacobian(curve: &HillCurve, x: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((x.len(), PARAMETERS), |(i, j)| curve.gradient(x[i])[j])
}
/// Gaussian elimination with partial pivoting; `None` when singular.
fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
        if a[[pivot, col]].abs() < 1e-300 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in col + 1..n {
            let factor = a[[row, col]] / a[[col, col]];
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut out = Array1::zeros(n);
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[[row, k]] * out[k]).sum();
        out[row] = (b[row] - tail) / a[[row, row]];
    }
    out.iter().all(|v: &f64| v.is_finite()).then_some(out)
}
/// Least-squares fit of `A·xⁿ/(Kⁿ+xⁿ) + b` to `(x, y)`.
pub fn fit_hill(x: &[f64], y: &[f64], options: &FitOptions) -> Result<HillCurve, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    if x.len() <= PARAMETERS {
        return Err(FitError::TooFewPoints {
            parameters: PARAMETERS,
            points: x.len(),
        });
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(FitError::NonFiniteInput);
    }
    let mut curve = options.initial.unwrap_or_else(|| initial_guess(x, y));
    let mut cost = residuals(&curve, x, y).mapv(|r| r * r).sum();
    let mut lambda = 1e-3;
    let tol = options.tolerance;
    for iteration in 0..options.max_iterations {
        let r = residuals(&curve, x, y);
        let j = jacobian(&curve, x);
        let jt = j.t();
        let hessian = jt.dot(&j);
        let grad = jt.dot(&r);
        let params = curve.params();
        let mut improved = None;
        while lambda < 1e16 {
            let mut damped = hessian.clone();
            for d in 0..PARAMETERS {
                damped[[d, d]] += lambda * hessian[[d, d]].max(1e-12);
            }
            if let Some(step) = solve(damped, grad.clone()) {
                let candidate = HillCurve::from_params(&(&params + &step));
                if candidate.is_valid() {
                    let candidate_cost = residuals(&candidate, x, y).mapv(|r| r * r).sum();
                    if candidate_cost.is_finite() && candidate_cost < cost {
                        improved = Some((candidate, candidate_cost, step));
                        break;
                    }
                }
            }
            lambda *= 10.0;
        }
        let Some((candidate, candidate_cost, step)) = improved else {
            // no damping improves the cost: already at the minimum
            debug!("Hill fit stalled at iteration {iteration}, cost {cost:e}");
            return Ok(curve);
        };
        let cost_drop = cost - candidate_cost;
        let step_size = step.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        let scale = params.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        curve = candidate;
        cost = candidate_cost;
        lambda = (lambda / 10.0).max(1e-12);
        if cost_drop <= tol * cost || step_size <= tol * (scale + tol) || cost < 1e-30 {
            debug!("Hill fit converged after {} iterations", iteration + 1);
            return Ok(curve);
        }
    }
    Err(FitError::NotConverged {
        iterations: options.max_iterations,
    })
}
/// Sample standard deviation; zero for fewer than two values.
fn sample_std(values: ArrayView1<'_, f64>) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.std(1.0)
}
/// Output of [`analysis`].
#[derive(Clone, Debug, Serialize)]
pub struct HillAnalysis {
    /// Concentration index of every flattened value.
    pub labels: Vec<f64>,
    pub data: Vec<f64>,
    pub coefficients: HillCurve,
    /// Per concentration, of the residuals against the fitted curve.
    pub std_devs: Vec<f64>,
    pub inflection_point: Option<f64>,
    /// Dose at which the sensitivity was taken.
    pub slope_at: f64,
    pub sensitivity: f64,
    pub reference_sigma: f64,
    /// `3.3 * reference_sigma / |sensitivity|`. Identical devices at the
    /// reference concentration give a limit of exactly zero.
    pub lod: f64,
    pub loq: f64,
}
/// Fits a concentration x device table against the concentration index and
/// derives sensitivity, LOD and LOQ, using the spread of the raw values at
/// `reference_index` as the noise level.
pub fn analysis(data: &Array2<f64>, reference_index: usize) -> Result<HillAnalysis, AnalysisError> {
    let (concentrations, devices) = data.dim();
    if reference_index >= concentrations {
        return Err(AnalysisError::ReferenceOutOfRange {
            index: reference_index,
            count: concentrations,
        });
    }
    let labels: Vec<f64> = (0..concentrations)
        .flat_map(|c| std::iter::repeat(c as f64).take(devices))
        .collect();
    let flat: Vec<f64> = data.iter().copied().collect();
    let coefficients = fit_hill(&labels, &flat, &FitOptions::default())?;
    let std_devs = data
        .outer_iter()
        .enumerate()
        .map(|(c, row)| sample_std(row.mapv(|v| v - coefficients.evaluate(c as f64)).view()))
        .collect();
    let inflection_point = coefficients.inflection_point();
    let slope_at = inflection_point.unwrap_or(coefficients.half_saturation);
    let sensitivity = coefficients.derivative(slope_at);
    let reference_sigma = sample_std(data.row(reference_index));
    let lod = 3.3 * reference_sigma / sensitivity.abs();
    let loq = 10.0 * reference_sigma / sensitivity.abs();
    info!(
        "Hill fit A={:.4} K={:.4} n={:.4} b={:.4}, LOD={lod:.4} LOQ={loq:.4}",
        coefficients.amplitude,
        coefficients.half_saturation,
        coefficients.hill_coefficient,
        coefficients.offset
    );
    Ok(HillAnalysis {
        labels,
        data: flat,
        coefficients,
        std_devs,
        inflection_point,
        slope_at,
        sensitivity,
        reference_sigma,
        lod,
        loq,
    })
}
#[cfg(test)]
mod tests {
    use super::*;
    const TRUE: HillCurve = HillCurve {
        amplitude: 5.0,
        half_saturation: 3.5,
        hill_coefficient: 2.5,
        offset: 1.0,
    };
    fn table(noise: impl Fn(usize, usize) -> f64) -> Array2<f64> {
        Array2::from_shape_fn((9, 3), |(c, d)| TRUE.evaluate(c as f64) + noise(c, d))
    }
    #[test]
    fn derivative_matches_finite_difference() {
        for x in [0.5, 2.0, 3.5, 7.0] {
            let h = 1e-6;
            let numeric = (TRUE.evaluate(x + h) - TRUE.evaluate(x - h)) / (2.0 * h);
            assert!((TRUE.derivative(x) - numeric).abs() < 1e-6, "x={x}");
        }
    }
    #[test]
    fn gradient_matches_finite_difference() {
        let x = 2.7;
        let base = TRUE.params();
        let analytic = TRUE.gradient(x);
        for j in 0..PARAMETERS {
            let mut plus = base.clone();
            let mut minus = base.clone();
            plus[j] += 1e-6;
            minus[j] -= 1e-6;
            let numeric = (HillCurve::from_params(&plus).evaluate(x)
                - HillCurve::from_params(&minus).evaluate(x))
                / 2e-6;
            assert!((analytic[j] - numeric).abs() < 1e-5, "param {j}");
        }
    }
    #[test]
    fn inflection_requires_cooperativity() {
        let x = TRUE.inflection_point().unwrap();
        assert!((x - 3.5 * (1.5f64 / 3.5).powf(0.4)).abs() < 1e-12);
        let flat = HillCurve {
            hill_coefficient: 1.0,
            ..TRUE
        };
        assert_eq!(flat.inflection_point(), None);
    }
    #[test]
    fn recovers_noise_free_coefficients() {
        let result = analysis(&table(|_, _| 0.0), 0).unwrap();
        let fit = result.coefficients;
        assert!((fit.amplitude - 5.0).abs() < 1e-4, "{fit:?}");
        assert!((fit.half_saturation - 3.5).abs() < 1e-4, "{fit:?}");
        assert!((fit.hill_coefficient - 2.5).abs() < 1e-4, "{fit:?}");
        assert!((fit.offset - 1.0).abs() < 1e-4, "{fit:?}");
        assert_eq!(result.labels.len(), 27);
        assert_eq!(&result.labels[..4], [0.0, 0.0, 0.0, 1.0]);
        assert!(result.std_devs.iter().all(|s| *s < 1e-6));
        assert_eq!(result.reference_sigma, 0.0);
        assert_eq!(result.lod, 0.0);
        assert_eq!(result.loq, 0.0);
    }
    #[test]
    fn lod_is_below_loq() {
        let noise = |c: usize, d: usize| 0.05 * ((c * 7 + d * 3) % 5) as f64 - 0.1;
        let result = analysis(&table(noise), 0).unwrap();
        assert!(result.reference_sigma > 0.0);
        assert!(result.sensitivity > 0.0);
        assert!(result.lod > 0.0);
        assert!(result.lod < result.loq);
        assert!((result.loq / result.lod - 10.0 / 3.3).abs() < 1e-9);
        assert!(result.inflection_point.is_some());
    }
    #[test]
    fn decreasing_response_is_fitted() {
        let falling = HillCurve {
            amplitude: -4.0,
            ..TRUE
        };
        let x: Vec<f64> = (0..9).flat_map(|c| [c as f64; 2]).collect();
        let y: Vec<f64> = x.iter().map(|&v| falling.evaluate(v)).collect();
        let fit = fit_hill(&x, &y, &FitOptions::default()).unwrap();
        assert!((fit.amplitude + 4.0).abs() < 1e-4, "{fit:?}");
    }
    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            fit_hill(&[0.0, 1.0], &[0.0], &FitOptions::default()),
            Err(FitError::LengthMismatch { .. })
        ));
        assert!(matches!(
            fit_hill(&[0.0, 1.0, 2.0], &[1.0, 2.0, 3.0], &FitOptions::default()),
            Err(FitError::TooFewPoints { .. })
        ));
        let err = analysis(&table(|_, _| 0.0), 9).unwrap_err();
        assert!(matches!(err, AnalysisError::ReferenceOutOfRange { index: 9, count: 9 }));
    }
    #[test]
    fn iteration_limit_is_a_fit_error() {
        let x: Vec<f64> = (0..9).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|&v| TRUE.evaluate(v)).collect();
        let options = FitOptions {
            max_iterations: 1,
            tolerance: 0.0,
            initial: Some(HillCurve {
                amplitude: 1.0,
                half_saturation: 1.0,
                hill_coefficient: 1.0,
                offset: 0.0,
            }),
        };
        assert!(matches!(
            fit_hill(&x, &y, &options),
            Err(FitError::NotConverged { iterations: 1 })
        ));
    }
}
