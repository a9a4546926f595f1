//! Sigma-clipped image statistics.
//!
//! Robust background and noise estimation via iterative outlier rejection:
//! pixels further than `sigma` standard deviations from the running mean are
//! excluded and the statistics recomputed, until convergence or an iteration
//! limit. The clipped median feeds background subtraction and the clipped
//! standard deviation scales the detection threshold.

use ndarray::ArrayView2;

use crate::error::SeeingError;

/// Robust statistics of a pixel distribution after sigma clipping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    /// Mean of the surviving pixels
    pub mean: f64,
    /// Median of the surviving pixels
    pub median: f64,
    /// Population standard deviation of the surviving pixels
    pub std_dev: f64,
}

/// Compute sigma-clipped (mean, median, std) over a whole image.
///
/// Non-finite pixels are excluded before the first pass. Clipping is
/// performed about the running mean and converges early when a pass rejects
/// nothing.
///
/// # Arguments
/// * `image` - The input image
/// * `sigma` - Clipping threshold in standard deviations
/// * `max_iters` - Maximum number of clipping passes
pub fn sigma_clipped_stats(
    image: ArrayView2<f64>,
    sigma: f64,
    max_iters: usize,
) -> Result<ClippedStats, SeeingError> {
    if image.is_empty() {
        return Err(SeeingError::EmptyImage);
    }
    if !(sigma > 0.0) {
        return Err(SeeingError::InvalidParameter {
            name: "sigma",
            value: sigma,
        });
    }

    let values: Vec<f64> = image.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return Err(SeeingError::NoFinitePixels);
    }

    Ok(clip_values(values, sigma, max_iters))
}

/// Sigma-clip a flat sample of finite values.
///
/// Callers must have removed non-finite entries already.
pub(crate) fn clip_values(mut values: Vec<f64>, sigma: f64, max_iters: usize) -> ClippedStats {
    for _ in 0..max_iters {
        let (mean, std_dev) = mean_and_std(&values);

        if std_dev <= 0.0 {
            break;
        }

        let limit = sigma * std_dev;
        let before = values.len();
        values.retain(|v| (v - mean).abs() <= limit);

        // Keep at least a handful of pixels so the statistics stay defined.
        if values.len() == before || values.len() < 3 {
            break;
        }
    }

    let (mean, std_dev) = mean_and_std(&values);
    let median = median_mut(&mut values);

    ClippedStats {
        mean,
        median,
        std_dev,
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Median via partial sort. Averages the two middle elements for even
/// lengths. Mutates the buffer.
fn median_mut(values: &mut [f64]) -> f64 {
    let len = values.len();
    let mid = len / 2;

    if len % 2 == 1 {
        let (_, median, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
        *median
    } else {
        let (left, right_median, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
        let right = *right_median;
        let left = left.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (left + right) * 0.5
    }
}
