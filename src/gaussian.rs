//! 2D Gaussian least-squares fitting.
//!
//! Levenberg-Marquardt optimization of the elliptical Gaussian model
//! `f(x, y) = A * exp(-((x - x0)^2 / 2 sx^2 + (y - y0)^2 / 2 sy^2)) + B`
//! with an analytic Jacobian. Six parameters: center, amplitude, per-axis
//! sigma, and a constant background.

use nalgebra::{Matrix6, Vector6};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Tuning knobs for the Levenberg-Marquardt loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianFitConfig {
    /// Maximum optimizer iterations
    pub max_iterations: usize,
    /// Convergence threshold on the largest parameter step
    pub convergence_threshold: f64,
    /// Initial damping parameter
    pub initial_lambda: f64,
    /// Damping increase factor on a rejected step
    pub lambda_up: f64,
    /// Damping decrease factor on an accepted step
    pub lambda_down: f64,
}

impl Default for GaussianFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

/// Converged (or best-effort) Gaussian model parameters.
#[derive(Debug, Clone, Copy)]
pub struct GaussianFit {
    /// Fitted center column, in the coordinates of the fitted array
    pub x0: f64,
    /// Fitted center row
    pub y0: f64,
    /// Fitted amplitude above background
    pub amplitude: f64,
    /// Standard deviation along x
    pub sigma_x: f64,
    /// Standard deviation along y
    pub sigma_y: f64,
    /// Constant background level
    pub background: f64,
    /// RMS of the final residuals
    pub rms_residual: f64,
    /// Whether the parameter step fell below the convergence threshold
    pub converged: bool,
    /// Iterations consumed
    pub iterations: usize,
}

/// Fit a 2D Gaussian to an array of pixel values.
///
/// Coordinates are array-local: `x` is the column index, `y` the row index.
/// Non-finite pixels are excluded from the fit, so NaN-filled boundary
/// pixels of a truncated cutout simply carry no weight. Returns `None` when
/// fewer than seven finite pixels remain or the solution degenerates.
pub fn fit_gaussian_2d(data: ArrayView2<f64>, config: &GaussianFitConfig) -> Option<GaussianFit> {
    let mut xs = Vec::with_capacity(data.len());
    let mut ys = Vec::with_capacity(data.len());
    let mut zs = Vec::with_capacity(data.len());

    for ((y, x), &value) in data.indexed_iter() {
        if value.is_finite() {
            xs.push(x as f64);
            ys.push(y as f64);
            zs.push(value);
        }
    }

    // Six parameters need at least seven samples.
    let n = zs.len();
    if n < 7 {
        return None;
    }

    let side = data.nrows().max(data.ncols()) as f64;
    let mut params = initial_guess(&xs, &ys, &zs, side);

    let mut lambda = config.initial_lambda;
    let mut prev_chi2 = chi2(&xs, &ys, &zs, &params);
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let (jtj, jtr) = normal_equations(&xs, &ys, &zs, &params);

        let mut damped = jtj;
        for i in 0..6 {
            damped[(i, i)] *= 1.0 + lambda;
        }

        let delta = match damped.lu().solve(&jtr) {
            Some(d) => d,
            None => break, // Singular system
        };

        let mut trial = params;
        for (p, d) in trial.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        trial[2] = trial[2].max(f64::EPSILON); // Amplitude stays positive
        trial[3] = trial[3].clamp(0.3, side); // Sigma_x
        trial[4] = trial[4].clamp(0.3, side); // Sigma_y

        let trial_chi2 = chi2(&xs, &ys, &zs, &trial);
        let max_step = delta.iter().map(|d| d.abs()).fold(0.0_f64, f64::max);

        if trial_chi2 <= prev_chi2 {
            params = trial;
            prev_chi2 = trial_chi2;
            lambda *= config.lambda_down;
        } else {
            lambda *= config.lambda_up;
            if lambda > 1e12 {
                break;
            }
        }

        // A vanishing step means the optimum is reached whether or not the
        // last trial improved chi-squared.
        if max_step < config.convergence_threshold {
            converged = true;
            break;
        }
    }

    let [x0, y0, amplitude, sigma_x, sigma_y, background] = params;

    // Reject solutions that wandered off the array or collapsed.
    if x0 < -1.0 || x0 > data.ncols() as f64 || y0 < -1.0 || y0 > data.nrows() as f64 {
        return None;
    }
    if !(sigma_x >= 0.3 && sigma_x <= 2.0 * side && sigma_y >= 0.3 && sigma_y <= 2.0 * side) {
        return None;
    }

    Some(GaussianFit {
        x0,
        y0,
        amplitude,
        sigma_x,
        sigma_y,
        background,
        rms_residual: (prev_chi2 / n as f64).sqrt(),
        converged,
        iterations,
    })
}

/// Seed the optimizer from the data itself: background from the minimum,
/// center and widths from intensity-weighted moments of the residual.
fn initial_guess(xs: &[f64], ys: &[f64], zs: &[f64], side: f64) -> [f64; 6] {
    let mut zmin = f64::INFINITY;
    let mut zmax = f64::NEG_INFINITY;
    let mut peak_x = 0.0;
    let mut peak_y = 0.0;

    for i in 0..zs.len() {
        if zs[i] < zmin {
            zmin = zs[i];
        }
        if zs[i] > zmax {
            zmax = zs[i];
            peak_x = xs[i];
            peak_y = ys[i];
        }
    }

    let background = zmin;
    let amplitude = (zmax - zmin).max(f64::EPSILON);

    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    for i in 0..zs.len() {
        let w = (zs[i] - background).max(0.0);
        m00 += w;
        m10 += w * xs[i];
        m01 += w * ys[i];
    }

    let (cx, cy) = if m00 > 0.0 {
        (m10 / m00, m01 / m00)
    } else {
        (peak_x, peak_y)
    };

    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..zs.len() {
        let w = (zs[i] - background).max(0.0);
        var_x += w * (xs[i] - cx) * (xs[i] - cx);
        var_y += w * (ys[i] - cy) * (ys[i] - cy);
    }
    let (sx, sy) = if m00 > 0.0 {
        (
            (var_x / m00).sqrt().clamp(0.5, side / 2.0),
            (var_y / m00).sqrt().clamp(0.5, side / 2.0),
        )
    } else {
        (2.0, 2.0)
    };

    [cx, cy, amplitude, sx, sy, background]
}

#[inline]
fn model(x: f64, y: f64, params: &[f64; 6]) -> f64 {
    let [x0, y0, amplitude, sigma_x, sigma_y, background] = *params;
    let dx = x - x0;
    let dy = y - y0;
    let exponent = -0.5 * (dx * dx / (sigma_x * sigma_x) + dy * dy / (sigma_y * sigma_y));
    amplitude * exponent.exp() + background
}

fn chi2(xs: &[f64], ys: &[f64], zs: &[f64], params: &[f64; 6]) -> f64 {
    let mut sum = 0.0;
    for i in 0..zs.len() {
        let r = zs[i] - model(xs[i], ys[i], params);
        sum += r * r;
    }
    sum
}

/// Accumulate the normal equations `J^T J` and `J^T r` for the current
/// parameters.
fn normal_equations(
    xs: &[f64],
    ys: &[f64],
    zs: &[f64],
    params: &[f64; 6],
) -> (Matrix6<f64>, Vector6<f64>) {
    let [x0, y0, amplitude, sigma_x, sigma_y, _background] = *params;
    let sx2 = sigma_x * sigma_x;
    let sy2 = sigma_y * sigma_y;

    let mut jtj = Matrix6::<f64>::zeros();
    let mut jtr = Vector6::<f64>::zeros();

    for i in 0..zs.len() {
        let dx = xs[i] - x0;
        let dy = ys[i] - y0;
        let exp_val = (-0.5 * (dx * dx / sx2 + dy * dy / sy2)).exp();

        let row = Vector6::new(
            amplitude * exp_val * dx / sx2,
            amplitude * exp_val * dy / sy2,
            exp_val,
            amplitude * exp_val * dx * dx / (sx2 * sigma_x),
            amplitude * exp_val * dy * dy / (sy2 * sigma_y),
            1.0,
        );

        let residual = zs[i] - (amplitude * exp_val + params[5]);

        jtj += row * row.transpose();
        jtr += row * residual;
    }

    (jtj, jtr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn gaussian_stamp(
        side: usize,
        cx: f64,
        cy: f64,
        amplitude: f64,
        sigma_x: f64,
        sigma_y: f64,
        background: f64,
    ) -> Array2<f64> {
        Array2::from_shape_fn((side, side), |(y, x)| {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let e = -0.5 * (dx * dx / (sigma_x * sigma_x) + dy * dy / (sigma_y * sigma_y));
            background + amplitude * e.exp()
        })
    }

    #[test]
    fn test_fit_centered() {
        let stamp = gaussian_stamp(21, 10.0, 10.0, 1000.0, 2.5, 2.5, 100.0);
        let fit = fit_gaussian_2d(stamp.view(), &GaussianFitConfig::default()).unwrap();

        assert!(fit.converged);
        assert_relative_eq!(fit.x0, 10.0, epsilon = 0.05);
        assert_relative_eq!(fit.y0, 10.0, epsilon = 0.05);
        assert_relative_eq!(fit.sigma_x, 2.5, epsilon = 0.05);
        assert_relative_eq!(fit.sigma_y, 2.5, epsilon = 0.05);
        assert_relative_eq!(fit.background, 100.0, epsilon = 1.0);
    }

    #[test]
    fn test_fit_subpixel_center() {
        let stamp = gaussian_stamp(21, 10.3, 9.7, 500.0, 2.0, 2.0, 10.0);
        let fit = fit_gaussian_2d(stamp.view(), &GaussianFitConfig::default()).unwrap();

        assert_relative_eq!(fit.x0, 10.3, epsilon = 0.05);
        assert_relative_eq!(fit.y0, 9.7, epsilon = 0.05);
    }

    #[test]
    fn test_fit_asymmetric() {
        let stamp = gaussian_stamp(25, 12.0, 12.0, 300.0, 2.0, 3.5, 0.0);
        let fit = fit_gaussian_2d(stamp.view(), &GaussianFitConfig::default()).unwrap();

        assert_relative_eq!(fit.sigma_x, 2.0, epsilon = 0.1);
        assert_relative_eq!(fit.sigma_y, 3.5, epsilon = 0.1);
    }

    #[test]
    fn test_nan_pixels_excluded() {
        let mut stamp = gaussian_stamp(21, 10.0, 10.0, 800.0, 2.5, 2.5, 50.0);
        // Knock out a boundary strip, as a truncated cutout would have
        for x in 0..21 {
            stamp[[0, x]] = f64::NAN;
            stamp[[1, x]] = f64::NAN;
        }

        let fit = fit_gaussian_2d(stamp.view(), &GaussianFitConfig::default()).unwrap();
        assert_relative_eq!(fit.sigma_x, 2.5, epsilon = 0.1);
        assert_relative_eq!(fit.sigma_y, 2.5, epsilon = 0.1);
    }

    #[test]
    fn test_too_few_finite_pixels() {
        let stamp = Array2::from_elem((3, 2), f64::NAN);
        assert!(fit_gaussian_2d(stamp.view(), &GaussianFitConfig::default()).is_none());
    }
}
