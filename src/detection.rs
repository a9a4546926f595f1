//! Source detection for astronomical CCD frames.
//!
//! Wraps the DAOPHOT-style matched-filter star finder: robust background
//! statistics are estimated by sigma clipping, the clipped median is
//! subtracted from the frame, and the detection threshold is scaled by the
//! clipped standard deviation. Detected sources are returned brightest
//! first, each with a local per-pixel sky estimate taken from an annulus
//! around the detection.

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use starfield::image::starfinders::{DAOStarFinder, DAOStarFinderConfig, StellarSource};

use crate::error::SeeingError;
use crate::fwhm::{compute_fwhm, FwhmMethod};
use crate::stats::{clip_values, sigma_clipped_stats};

/// Settings for a detection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Expected full-width-half-max of stars in the image, in pixels
    pub fwhm: f64,
    /// Clipping limit for background statistics, in standard deviations
    pub sigma: f64,
    /// Maximum sigma-clipping iterations
    pub iters: usize,
    /// Detection threshold in units of the clipped background std
    pub threshold: f64,
    /// Estimate each source's FWHM after detection
    pub find_fwhm: bool,
    /// Width estimation method used when `find_fwhm` is set
    pub fwhm_method: FwhmMethod,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            fwhm: 8.0,
            sigma: 3.0,
            iters: 5,
            threshold: 10.0,
            find_fwhm: true,
            fwhm_method: FwhmMethod::GaussianFit,
        }
    }
}

/// One detected source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Row index in the table (0 = most significant detection)
    pub id: usize,
    /// Sub-pixel centroid column
    pub x_center: f64,
    /// Sub-pixel centroid row
    pub y_center: f64,
    /// Integrated flux reported by the matched filter
    pub flux: f64,
    /// Local sky background per pixel at the source position
    pub sky_per_pix_avg: f64,
    /// Average of the x and y width estimates, filled in when FWHM
    /// estimation runs
    pub fwhm: Option<f64>,
}

impl Source {
    /// Instrumental magnitude, `-2.5 * log10(flux)`.
    ///
    /// Returns infinity for non-positive flux and NaN for non-finite flux.
    pub fn mag(&self) -> f64 {
        if self.flux > 0.0 && self.flux.is_finite() {
            -2.5 * self.flux.log10()
        } else if self.flux <= 0.0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    }
}

/// An ordered table of detected sources, descending by significance.
///
/// Row count and order are fixed at detection time; FWHM estimation only
/// fills in the `fwhm` field of existing rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceTable {
    sources: Vec<Source>,
}

impl SourceTable {
    /// Build a table from pre-existing rows, e.g. positions measured
    /// elsewhere that only need width estimation.
    pub fn from_sources(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Source> {
        self.sources.iter()
    }

    pub fn as_slice(&self) -> &[Source] {
        &self.sources
    }

    pub fn get(&self, index: usize) -> Option<&Source> {
        self.sources.get(index)
    }
}

impl std::ops::Index<usize> for SourceTable {
    type Output = Source;

    fn index(&self, index: usize) -> &Source {
        &self.sources[index]
    }
}

impl<'a> IntoIterator for &'a SourceTable {
    type Item = &'a Source;
    type IntoIter = std::slice::Iter<'a, Source>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.iter()
    }
}

/// Detect sources in an image without estimating widths.
///
/// The clipped median is subtracted before running the matched filter and
/// the absolute detection cutoff is `config.threshold` times the clipped
/// standard deviation. An image with no peak above the cutoff yields an
/// empty table, not an error.
pub fn find_sources(
    image: ArrayView2<f64>,
    config: &DetectionConfig,
) -> Result<SourceTable, SeeingError> {
    if !(config.fwhm > 0.0) {
        return Err(SeeingError::InvalidParameter {
            name: "fwhm",
            value: config.fwhm,
        });
    }
    if !(config.threshold > 0.0) {
        return Err(SeeingError::InvalidParameter {
            name: "threshold",
            value: config.threshold,
        });
    }

    let stats = sigma_clipped_stats(image, config.sigma, config.iters)?;

    // Background-subtract for the matched filter; non-finite pixels are
    // flattened to the background level so they cannot trigger detections.
    let subtracted = image.mapv(|v| if v.is_finite() { v - stats.median } else { 0.0 });

    let finder_config = DAOStarFinderConfig {
        threshold: config.threshold * stats.std_dev,
        fwhm: config.fwhm,
        ratio: 1.0,
        theta: 0.0,
        sigma_radius: 1.5,
        sharpness: 0.2..=5.0,
        roundness: -1.0..=1.0,
        exclude_border: false,
        brightest: None,
        peakmax: None,
        min_separation: 0.8 * config.fwhm,
    };

    let finder = DAOStarFinder::new(finder_config)
        .map_err(|e| SeeingError::DetectorInit(e.to_string()))?;

    let mut stars = finder.find_stars(&subtracted, None);
    stars.sort_by(|a, b| b.flux().total_cmp(&a.flux()));

    let sources = stars
        .iter()
        .enumerate()
        .map(|(id, star)| {
            let (x, y) = star.get_centroid();
            let sky = annulus_sky(
                image,
                x,
                y,
                2.0 * config.fwhm,
                3.0 * config.fwhm,
                config.sigma,
                config.iters,
                stats.median,
            );
            Source {
                id,
                x_center: x,
                y_center: y,
                flux: star.flux(),
                sky_per_pix_avg: sky,
                fwhm: None,
            }
        })
        .collect();

    let table = SourceTable { sources };
    log::debug!(
        "{} source(s) above {:.2} ({} x std {:.3}), background median {:.3}",
        table.len(),
        config.threshold * stats.std_dev,
        config.threshold,
        stats.std_dev,
        stats.median,
    );
    for source in &table {
        log::trace!(
            "source {}: x={:.2} y={:.2} flux={:.1} sky={:.2}",
            source.id,
            source.x_center,
            source.y_center,
            source.flux,
            source.sky_per_pix_avg,
        );
    }

    Ok(table)
}

/// Detect sources and, unless disabled, estimate each one's FWHM.
///
/// Runs background estimation, matched-filter detection, and per-source
/// width estimation; `config.fwhm` doubles as the cutout sizing estimate.
/// With `find_fwhm` unset the `fwhm` field of every row stays `None`.
pub fn source_detection(
    image: ArrayView2<f64>,
    config: &DetectionConfig,
) -> Result<SourceTable, SeeingError> {
    let mut table = find_sources(image, config)?;

    if config.find_fwhm && !table.is_empty() {
        let (fwhm_x, fwhm_y) = compute_fwhm(image, &table, config.fwhm, config.fwhm_method)?;
        for (source, (fx, fy)) in table
            .sources
            .iter_mut()
            .zip(fwhm_x.into_iter().zip(fwhm_y))
        {
            source.fwhm = Some((fx + fy) / 2.0);
        }
    }

    Ok(table)
}

/// Sigma-clipped median of the pixels in an annulus around `(x, y)`.
///
/// Falls back to `fallback` (the global clipped median) when the annulus
/// holds too few usable pixels to clip meaningfully.
#[allow(clippy::too_many_arguments)]
fn annulus_sky(
    image: ArrayView2<f64>,
    x: f64,
    y: f64,
    r_in: f64,
    r_out: f64,
    sigma: f64,
    iters: usize,
    fallback: f64,
) -> f64 {
    const MIN_ANNULUS_PIXELS: usize = 12;

    let (height, width) = image.dim();
    let x_lo = (x - r_out).floor().max(0.0) as usize;
    let x_hi = ((x + r_out).ceil() as usize).min(width.saturating_sub(1));
    let y_lo = (y - r_out).floor().max(0.0) as usize;
    let y_hi = ((y + r_out).ceil() as usize).min(height.saturating_sub(1));

    let r_in2 = r_in * r_in;
    let r_out2 = r_out * r_out;

    let mut values = Vec::new();
    for iy in y_lo..=y_hi {
        for ix in x_lo..=x_hi {
            let dx = ix as f64 - x;
            let dy = iy as f64 - y;
            let r2 = dx * dx + dy * dy;
            if r2 < r_in2 || r2 > r_out2 {
                continue;
            }
            let value = image[[iy, ix]];
            if value.is_finite() {
                values.push(value);
            }
        }
    }

    if values.len() < MIN_ANNULUS_PIXELS {
        return fallback;
    }

    clip_values(values, sigma, iters).median
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_default_config() {
        let config = DetectionConfig::default();
        assert_eq!(config.fwhm, 8.0);
        assert_eq!(config.sigma, 3.0);
        assert_eq!(config.iters, 5);
        assert_eq!(config.threshold, 10.0);
        assert!(config.find_fwhm);
        assert_eq!(config.fwhm_method, FwhmMethod::GaussianFit);
    }

    #[test]
    fn test_magnitude_contract() {
        let mut source = Source {
            id: 0,
            x_center: 0.0,
            y_center: 0.0,
            flux: 100.0,
            sky_per_pix_avg: 0.0,
            fwhm: None,
        };
        assert_relative_eq!(source.mag(), -5.0, epsilon = 1e-12);

        source.flux = 0.0;
        assert_eq!(source.mag(), f64::INFINITY);

        source.flux = -3.0;
        assert_eq!(source.mag(), f64::INFINITY);

        source.flux = f64::NAN;
        assert!(source.mag().is_nan());
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let image = Array2::<f64>::zeros((0, 0));
        assert_eq!(
            find_sources(image.view(), &DetectionConfig::default()),
            Err(SeeingError::EmptyImage)
        );
    }

    #[test]
    fn test_invalid_fwhm_rejected() {
        let image = Array2::<f64>::zeros((16, 16));
        let config = DetectionConfig {
            fwhm: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            find_sources(image.view(), &config),
            Err(SeeingError::InvalidParameter { name: "fwhm", .. })
        ));
    }

    #[test]
    fn test_annulus_sky_flat_background() {
        let image = Array2::from_elem((64, 64), 250.0);
        let sky = annulus_sky(image.view(), 32.0, 32.0, 6.0, 10.0, 3.0, 5, 0.0);
        assert_relative_eq!(sky, 250.0);
    }

    #[test]
    fn test_annulus_sky_starved_falls_back() {
        // Annulus lies entirely outside a tiny frame
        let image = Array2::from_elem((5, 5), 250.0);
        let sky = annulus_sky(image.view(), 2.0, 2.0, 16.0, 24.0, 3.0, 5, 99.0);
        assert_eq!(sky, 99.0);
    }

    #[test]
    fn test_annulus_sky_ignores_central_star() {
        // Bright center pixel sits inside r_in and must not bias the sky
        let mut image = Array2::from_elem((64, 64), 100.0);
        image[[32, 32]] = 10_000.0;
        let sky = annulus_sky(image.view(), 32.0, 32.0, 6.0, 10.0, 3.0, 5, 0.0);
        assert_relative_eq!(sky, 100.0);
    }

    #[test]
    fn test_source_table_indexing() {
        let table = SourceTable {
            sources: vec![Source {
                id: 0,
                x_center: 1.0,
                y_center: 2.0,
                flux: 10.0,
                sky_per_pix_avg: 0.5,
                fwhm: None,
            }],
        };
        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
        assert_eq!(table[0].x_center, 1.0);
        assert_eq!(table.get(1), None);
    }
}
