//! Error types for source detection and FWHM estimation.

use thiserror::Error;

/// Errors that invalidate an entire detection or estimation call.
///
/// Degeneracies local to a single source (an empty cutout, a diverged fit)
/// are reported as NaN for that source instead, so one bad star does not
/// abort the batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SeeingError {
    #[error("image contains no pixels")]
    EmptyImage,

    #[error("image contains no finite pixels")]
    NoFinitePixels,

    #[error("invalid parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("star finder construction failed: {0}")]
    DetectorInit(String),
}
