//! Per-source FWHM estimation.
//!
//! For each detected source a square cutout of side `5 x fwhm_estimate` is
//! extracted around the centroid and the width is measured one of two ways:
//! a least-squares 2D Gaussian fit, or intensity-weighted second central
//! moments of the sky-subtracted cutout. Sources are independent, so the
//! loop fans out across a thread pool; results keep table order.
//!
//! The two methods use different spread-to-FWHM constants. The fit converts
//! a fitted standard deviation with `2 sqrt(2 ln 2)`; the moment method
//! applies `2 sqrt(ln 2 * mu)` to the normalized second moment. They measure
//! different shape parameters and are not interchangeable.

use ndarray::ArrayView2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use starfield::image::starfinders::ImageMoments;

use crate::cutout::Cutout;
use crate::detection::{Source, SourceTable};
use crate::error::SeeingError;
use crate::gaussian::{fit_gaussian_2d, GaussianFitConfig};

/// Multiplier converting a Gaussian standard deviation to FWHM,
/// `2 * sqrt(2 * ln 2)`.
pub const GAUSSIAN_SIGMA_TO_FWHM: f64 = 2.354_820_045_030_949;

/// Cutout side length as a multiple of the FWHM estimate.
const CUTOUT_FWHM_FACTOR: f64 = 5.0;

/// Width estimation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FwhmMethod {
    /// Fit a 2D Gaussian to the cutout and convert the fitted sigmas
    GaussianFit,
    /// Second central moments of the sky-subtracted, clamped cutout
    Moments,
}

/// Estimate per-source widths along x and y.
///
/// Returns two sequences parallel to the input table: same length, same
/// order. A source whose estimate degenerates (cutout fully outside the
/// image, all-zero moment sums, diverged fit) contributes NaN to both
/// sequences and is reported at warn level; the rest of the batch is
/// unaffected.
pub fn compute_fwhm(
    image: ArrayView2<f64>,
    sources: &SourceTable,
    fwhm_estimate: f64,
    method: FwhmMethod,
) -> Result<(Vec<f64>, Vec<f64>), SeeingError> {
    if !(fwhm_estimate > 0.0) {
        return Err(SeeingError::InvalidParameter {
            name: "fwhm_estimate",
            value: fwhm_estimate,
        });
    }

    let side = ((CUTOUT_FWHM_FACTOR * fwhm_estimate).round() as usize).max(3);

    let widths: Vec<(f64, f64)> = sources
        .as_slice()
        .par_iter()
        .map(|source| source_fwhm(image, source, side, method))
        .collect();

    Ok(widths.into_iter().unzip())
}

fn source_fwhm(
    image: ArrayView2<f64>,
    source: &Source,
    side: usize,
    method: FwhmMethod,
) -> (f64, f64) {
    let cutout = match Cutout::new(image, (source.x_center, source.y_center), side) {
        Ok(cutout) => cutout,
        Err(e) => {
            log::warn!("source {}: cutout extraction failed: {e}", source.id);
            return (f64::NAN, f64::NAN);
        }
    };

    if cutout.valid_pixels() == 0 {
        log::warn!(
            "source {} at ({:.1}, {:.1}): cutout lies entirely outside the image",
            source.id,
            source.x_center,
            source.y_center,
        );
        return (f64::NAN, f64::NAN);
    }
    if !cutout.is_complete() {
        log::warn!(
            "source {} at ({:.1}, {:.1}): cutout truncated at the image edge, {} of {} pixels usable",
            source.id,
            source.x_center,
            source.y_center,
            cutout.valid_pixels(),
            side * side,
        );
    }

    match method {
        FwhmMethod::GaussianFit => {
            log::trace!("fitting source {}", source.id);
            match fit_gaussian_2d(cutout.data(), &GaussianFitConfig::default()) {
                Some(fit) => (
                    GAUSSIAN_SIGMA_TO_FWHM * fit.sigma_x,
                    GAUSSIAN_SIGMA_TO_FWHM * fit.sigma_y,
                ),
                None => {
                    log::warn!("source {}: Gaussian fit did not converge", source.id);
                    (f64::NAN, f64::NAN)
                }
            }
        }
        FwhmMethod::Moments => {
            // Subtract the local sky and clamp negative residuals so noise
            // troughs cannot corrupt the moment sums. NaN fill pixels
            // clamp to zero as well.
            let sky = source.sky_per_pix_avg;
            let dat = cutout.data().mapv(|v| (v - sky).max(0.0));

            let moments = ImageMoments::calculate(&dat);
            match moments.centroid() {
                Some((xc, yc)) => {
                    let (_mu11, mu20, mu02) = moments.central_moments(xc, yc, &dat);
                    (
                        2.0 * (std::f64::consts::LN_2 * mu20).sqrt(),
                        2.0 * (std::f64::consts::LN_2 * mu02).sqrt(),
                    )
                }
                None => {
                    log::warn!(
                        "source {}: no flux above sky in cutout, cannot form moments",
                        source.id,
                    );
                    (f64::NAN, f64::NAN)
                }
            }
        }
    }
}
