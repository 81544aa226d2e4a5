//! Skewed-Lorentzian resonance fit.
//!
//! Model, in physical units:
//!
//! ```text
//! a(f) = (pmax + skew·(f − f0)) / sqrt(1 + 4·((f − f0)/bw)²)
//! ```
//!
//! The fit runs Levenberg–Marquardt on normalized coordinates (frequency mapped to [0, 1]
//! over the slice, amplitude divided by its maximum) with an analytic Jacobian, then maps
//! the parameters back. Pure functions, no shared state.

use nalgebra::{Matrix4, Vector4};
use thiserror::Error;

use daq_core::DaqError;

const MAX_ITERATIONS: usize = 200;
const MAX_DAMPING: f64 = 1e12;
const STEP_TOLERANCE: f64 = 1e-12;
const COST_TOLERANCE: f64 = 1e-15;
/// Fewer points than parameters plus one cannot constrain the fit.
pub const MIN_POINTS: usize = 5;

/// Why a fit was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Not enough points.
    #[error("need at least {MIN_POINTS} points, got {0}")]
    TooFewPoints(usize),
    /// Frequency and amplitude slices differ in length.
    #[error("frequency and amplitude lengths differ ({0} vs {1})")]
    LengthMismatch(usize, usize),
    /// An input sample is NaN or infinite.
    #[error("non-finite {0} at index {1}")]
    NonFiniteInput(&'static str, usize),
    /// All frequencies are equal.
    #[error("zero frequency span")]
    ZeroSpan,
    /// The amplitude has no positive maximum.
    #[error("amplitude has no positive peak")]
    NoSignal,
    /// The normal equations could not be solved.
    #[error("singular normal equations")]
    Singular,
    /// Damping saturated before any step improved the starting guess.
    #[error("no step improved the initial guess")]
    Stalled,
    /// The iteration limit was reached.
    #[error("no convergence after {0} iterations")]
    NotConverged(usize),
    /// The result contains NaN/inf or a non-positive bandwidth or peak.
    #[error("non-physical result: {0}")]
    NonPhysical(&'static str),
}

impl From<FitError> for DaqError {
    fn from(e: FitError) -> Self {
        DaqError::FitConvergence(e.to_string())
    }
}

/// Fitted resonance parameters, physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LorentzFit {
    /// Center frequency in Hz.
    pub center_frequency: f64,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Linear peak amplitude.
    pub peak: f64,
    /// Amplitude slope in 1/Hz.
    pub skew: f64,
    /// `center_frequency / bandwidth`.
    pub quality_factor: f64,
    /// `20·log10(peak)`.
    pub insertion_loss: f64,
}

/// Evaluate the skewed Lorentzian at `f`.
pub fn skewed_lorentzian(f: f64, f0: f64, bw: f64, pmax: f64, skew: f64) -> f64 {
    let t = f - f0;
    (pmax + skew * t) / (1.0 + 4.0 * (t / bw).powi(2)).sqrt()
}

/// Parameter vector in normalized space: `[x0, w, p, s]`.
type Params = Vector4<f64>;

fn model_and_gradient(u: f64, theta: &Params) -> (f64, Vector4<f64>) {
    let (x0, w, p, s) = (theta[0], theta[1], theta[2], theta[3]);
    let t = u - x0;
    let d = 1.0 + 4.0 * t * t / (w * w);
    let g = d.sqrt().recip();
    let g3 = g * g * g;
    let num = p + s * t;
    let value = num * g;
    let grad = Vector4::new(
        -s * g + num * 4.0 * t / (w * w) * g3,
        num * 4.0 * t * t / (w * w * w) * g3,
        g,
        t * g,
    );
    (value, grad)
}

fn cost(u: &[f64], y: &[f64], theta: &Params) -> f64 {
    u.iter()
        .zip(y)
        .map(|(&ui, &yi)| {
            let r = model_and_gradient(ui, theta).0 - yi;
            r * r
        })
        .sum()
}

fn initial_guess(u: &[f64], y: &[f64]) -> Params {
    let (peak_idx, _) = y
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    let threshold = y[peak_idx] / std::f64::consts::SQRT_2;
    let mut lo = peak_idx;
    while lo > 0 && y[lo - 1] >= threshold {
        lo -= 1;
    }
    let mut hi = peak_idx;
    while hi + 1 < y.len() && y[hi + 1] >= threshold {
        hi += 1;
    }
    let step = 1.0 / (u.len() - 1) as f64;
    let width = (u[hi] - u[lo]).max(2.0 * step);
    Vector4::new(u[peak_idx], width, y[peak_idx], 0.0)
}

/// Levenberg–Marquardt on normalized data. Returns the converged parameters.
fn levenberg_marquardt(u: &[f64], y: &[f64], mut theta: Params) -> Result<Params, FitError> {
    let mut lambda = 1e-3;
    let mut current = cost(u, y, &theta);
    if !current.is_finite() {
        return Err(FitError::NonPhysical("non-finite initial cost"));
    }
    if current < 1e-30 {
        return Ok(theta);
    }
    let mut accepted = false;

    for _ in 0..MAX_ITERATIONS {
        let mut jtj = Matrix4::<f64>::zeros();
        let mut jtr = Vector4::<f64>::zeros();
        for (&ui, &yi) in u.iter().zip(y) {
            let (value, grad) = model_and_gradient(ui, &theta);
            let r = value - yi;
            jtj += grad * grad.transpose();
            jtr += grad * r;
        }
        if !jtj.iter().all(|v| v.is_finite()) {
            return Err(FitError::NonPhysical("non-finite jacobian"));
        }

        loop {
            let mut damped = jtj;
            for i in 0..4 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(step) = damped.cholesky().map(|c| c.solve(&(-jtr))) else {
                lambda *= 10.0;
                if lambda > MAX_DAMPING {
                    return Err(FitError::Singular);
                }
                continue;
            };

            let candidate = theta + step;
            let next = cost(u, y, &candidate);
            if next.is_finite() && next < current {
                let improvement = current - next;
                theta = candidate;
                accepted = true;
                let small_step = step.norm() <= STEP_TOLERANCE * (theta.norm() + STEP_TOLERANCE);
                let small_gain = improvement <= COST_TOLERANCE * current.max(f64::MIN_POSITIVE);
                current = next;
                lambda = (lambda / 10.0).max(1e-12);
                if small_step || small_gain || current < 1e-30 {
                    return Ok(theta);
                }
                break;
            }

            lambda *= 10.0;
            if lambda > MAX_DAMPING {
                // No descent direction left: at the minimum to machine precision.
                return if accepted { Ok(theta) } else { Err(FitError::Stalled) };
            }
        }
    }
    Err(FitError::NotConverged(MAX_ITERATIONS))
}

/// Fit the skewed Lorentzian to one segment slice.
pub fn lorentz_fit(frequency: &[f64], amplitude: &[f64]) -> Result<LorentzFit, FitError> {
    if frequency.len() != amplitude.len() {
        return Err(FitError::LengthMismatch(frequency.len(), amplitude.len()));
    }
    if frequency.len() < MIN_POINTS {
        return Err(FitError::TooFewPoints(frequency.len()));
    }
    if let Some(i) = frequency.iter().position(|f| !f.is_finite()) {
        return Err(FitError::NonFiniteInput("frequency", i));
    }
    if let Some(i) = amplitude.iter().position(|a| !a.is_finite()) {
        return Err(FitError::NonFiniteInput("amplitude", i));
    }

    let max_amplitude = amplitude.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(max_amplitude > 0.0 && max_amplitude.is_finite()) {
        return Err(FitError::NoSignal);
    }
    let min_f = frequency.iter().copied().fold(f64::INFINITY, f64::min);
    let max_f = frequency.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let fspan = max_f - min_f;
    if !(fspan > 0.0 && fspan.is_finite()) {
        return Err(FitError::ZeroSpan);
    }

    let u: Vec<f64> = frequency.iter().map(|f| (f - min_f) / fspan).collect();
    let y: Vec<f64> = amplitude.iter().map(|a| a / max_amplitude).collect();

    let theta = levenberg_marquardt(&u, &y, initial_guess(&u, &y))?;
    if !theta.iter().all(|v| v.is_finite()) {
        return Err(FitError::NonPhysical("non-finite parameters"));
    }

    let center_frequency = theta[0] * fspan + min_f;
    let bandwidth = theta[1].abs() * fspan;
    let peak = theta[2] * max_amplitude;
    let skew = theta[3] * max_amplitude / fspan;
    if bandwidth <= 0.0 {
        return Err(FitError::NonPhysical("zero bandwidth"));
    }
    if peak <= 0.0 {
        return Err(FitError::NonPhysical("non-positive peak"));
    }

    Ok(LorentzFit {
        center_frequency,
        bandwidth,
        peak,
        skew,
        quality_factor: center_frequency / bandwidth,
        insertion_loss: 20.0 * peak.log10(),
    })
}

/// Least-squares slope of `y` over `x`; zero when `x` is constant.
pub fn linear_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;
    let (sxy, sxx) = x[..n]
        .iter()
        .zip(&y[..n])
        .fold((0.0, 0.0), |(sxy, sxx), (&xi, &yi)| {
            let dx = xi - mean_x;
            (sxy + dx * (yi - mean_y), sxx + dx * dx)
        });
    if sxx == 0.0 {
        0.0
    } else {
        sxy / sxx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(f0: f64, bw: f64, pmax: f64, skew: f64, center: f64, span: f64, n: usize) -> (Vec<f64>, Vec<f64>) {
        let freq: Vec<f64> = (0..n)
            .map(|i| center - span / 2.0 + span * i as f64 / (n - 1) as f64)
            .collect();
        let ampl = freq.iter().map(|&f| skewed_lorentzian(f, f0, bw, pmax, skew)).collect();
        (freq, ampl)
    }

    fn assert_rel(actual: f64, expected: f64, tol: f64) {
        let rel = ((actual - expected) / expected).abs();
        assert!(rel < tol, "expected {expected}, got {actual} (rel err {rel:e})");
    }

    #[test]
    fn recovers_symmetric_resonance() {
        let (f, a) = synthetic(2.5e9, 5e5, 0.05, 0.0, 2.5e9, 2e6, 201);
        let fit = lorentz_fit(&f, &a).unwrap();
        assert_rel(fit.center_frequency, 2.5e9, 1e-9);
        assert_rel(fit.bandwidth, 5e5, 1e-3);
        assert_rel(fit.peak, 0.05, 1e-3);
        assert_rel(fit.insertion_loss, 20.0 * 0.05f64.log10(), 1e-3);
        assert_rel(fit.quality_factor, 5000.0, 1e-3);
        assert!(fit.skew.abs() < 1e-12);
    }

    #[test]
    fn recovers_skewed_off_center_resonance() {
        let skew = 4e-9;
        let (f, a) = synthetic(4.5293e9, 3e5, 0.02, skew, 4.529e9, 2e6, 301);
        let fit = lorentz_fit(&f, &a).unwrap();
        assert_rel(fit.center_frequency, 4.5293e9, 1e-6);
        assert_rel(fit.bandwidth, 3e5, 1e-3);
        assert_rel(fit.peak, 0.02, 1e-3);
        assert_rel(fit.skew, skew, 1e-3);
    }

    #[test]
    fn rejects_degenerate_input() {
        assert_eq!(lorentz_fit(&[1.0; 3], &[1.0; 3]), Err(FitError::TooFewPoints(3)));
        assert_eq!(lorentz_fit(&[1.0; 8], &[1.0; 8]), Err(FitError::ZeroSpan));
        let f: Vec<f64> = (0..8).map(f64::from).collect();
        assert_eq!(lorentz_fit(&f, &[0.0; 8]), Err(FitError::NoSignal));
        assert_eq!(lorentz_fit(&f, &[1.0; 7]), Err(FitError::LengthMismatch(8, 7)));
    }

    #[test]
    fn rejects_non_finite_samples() {
        let (f, mut a) = synthetic(2.5e9, 5e5, 0.05, 0.0, 2.5e9, 2e6, 201);
        a[7] = f64::NAN;
        assert_eq!(lorentz_fit(&f, &a), Err(FitError::NonFiniteInput("amplitude", 7)));

        let (mut f, a) = synthetic(2.5e9, 5e5, 0.05, 0.0, 2.5e9, 2e6, 201);
        f[200] = f64::INFINITY;
        assert_eq!(lorentz_fit(&f, &a), Err(FitError::NonFiniteInput("frequency", 200)));
    }

    #[test]
    fn non_finite_cost_is_not_a_converged_fit() {
        let u: Vec<f64> = (0..11).map(|i| f64::from(i) / 10.0).collect();
        let mut y: Vec<f64> = u.iter().map(|&x| skewed_lorentzian(x, 0.5, 0.2, 1.0, 0.0)).collect();
        y[3] = f64::NAN;
        let guess = Vector4::new(0.5, 0.2, 1.0, 0.0);
        assert!(matches!(levenberg_marquardt(&u, &y, guess), Err(FitError::NonPhysical(_))));
    }

    #[test]
    fn exact_guess_is_accepted() {
        let u: Vec<f64> = (0..11).map(|i| f64::from(i) / 10.0).collect();
        let y: Vec<f64> = u.iter().map(|&x| skewed_lorentzian(x, 0.5, 0.2, 1.0, 0.0)).collect();
        let guess = Vector4::new(0.5, 0.2, 1.0, 0.0);
        assert_eq!(levenberg_marquardt(&u, &y, guess), Ok(guess));
    }

    #[test]
    fn fit_error_maps_to_convergence_error() {
        let err: DaqError = FitError::Singular.into();
        assert!(matches!(err, DaqError::FitConvergence(_)));
    }

    #[test]
    fn slope_sign_follows_the_trend() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert!((linear_slope(&x, &[2.0, 4.0, 6.0, 8.0]) - 2.0).abs() < 1e-12);
        assert!(linear_slope(&x, &[5.0, 4.0, 3.0, 1.0]) < 0.0);
        assert_eq!(linear_slope(&[1.0, 1.0], &[0.0, 3.0]), 0.0);
    }
}
