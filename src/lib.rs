//! Star detection and FWHM estimation for astronomical CCD images.
//!
//! Given a pre-calibrated 2D image, this crate finds point-like sources
//! with a DAOPHOT-style matched filter and measures how spread out each
//! source's light profile is on the detector, reported as the
//! full-width-half-maximum of an assumed Gaussian point-spread function.
//!
//! The pipeline has three stages:
//!
//! 1. [`sigma_clipped_stats`] estimates the robust background level and
//!    noise of the frame.
//! 2. [`find_sources`] subtracts the background median and runs the
//!    matched-filter detector with a noise-scaled threshold.
//! 3. [`compute_fwhm`] extracts a cutout around each detection and
//!    measures its width, either by fitting a 2D Gaussian or from
//!    intensity-weighted image moments.
//!
//! [`source_detection`] chains all three and returns a [`SourceTable`]
//! with an optional FWHM column:
//!
//! ```no_run
//! use ndarray::Array2;
//! use seeing::{source_detection, DetectionConfig};
//!
//! let image: Array2<f64> = Array2::zeros((512, 512));
//! let sources = source_detection(image.view(), &DetectionConfig::default()).unwrap();
//! for source in &sources {
//!     println!(
//!         "({:.2}, {:.2}) fwhm {:?}",
//!         source.x_center, source.y_center, source.fwhm
//!     );
//! }
//! ```
//!
//! Image I/O, calibration, and astrometry are upstream concerns; the input
//! here is a plain `ndarray` array in `[row, column]` order.

pub mod cutout;
pub mod detection;
pub mod error;
pub mod fwhm;
pub mod gaussian;
pub mod stats;

// Re-export key functionality for easier access
pub use cutout::Cutout;
pub use detection::{find_sources, source_detection, DetectionConfig, Source, SourceTable};
pub use error::SeeingError;
pub use fwhm::{compute_fwhm, FwhmMethod, GAUSSIAN_SIGMA_TO_FWHM};
pub use gaussian::{fit_gaussian_2d, GaussianFit, GaussianFitConfig};
pub use stats::{sigma_clipped_stats, ClippedStats};
