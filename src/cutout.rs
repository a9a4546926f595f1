//! Square cutout extraction around a source position.
//!
//! A cutout is addressed by a (possibly fractional) center in image
//! coordinates and a side length in pixels. The center is rounded to the
//! nearest pixel. Pixels falling outside the parent image are filled with
//! NaN and the cutout records how many were lost, so downstream width
//! estimation can flag partially covered sources instead of silently
//! trusting the fill value.

use ndarray::{Array2, ArrayView2};

use crate::error::SeeingError;

/// A square sub-image extracted around a point of interest.
#[derive(Debug, Clone)]
pub struct Cutout {
    data: Array2<f64>,
    /// Image column of the cutout's first column (may be negative)
    x0: isize,
    /// Image row of the cutout's first row (may be negative)
    y0: isize,
    /// Number of cutout pixels that fell inside the parent image
    valid: usize,
}

impl Cutout {
    /// Extract a `side` x `side` cutout centered at `(x, y)`.
    ///
    /// The center is rounded to the nearest pixel. Out-of-bounds pixels
    /// are NaN-filled; use [`Cutout::is_complete`] to detect truncation.
    pub fn new(
        image: ArrayView2<f64>,
        center: (f64, f64),
        side: usize,
    ) -> Result<Self, SeeingError> {
        let (x, y) = center;
        if !x.is_finite() {
            return Err(SeeingError::InvalidParameter {
                name: "center.x",
                value: x,
            });
        }
        if !y.is_finite() {
            return Err(SeeingError::InvalidParameter {
                name: "center.y",
                value: y,
            });
        }
        if side == 0 {
            return Err(SeeingError::InvalidParameter {
                name: "side",
                value: 0.0,
            });
        }

        let (height, width) = image.dim();
        let half = (side / 2) as isize;
        let x0 = x.round() as isize - half;
        let y0 = y.round() as isize - half;

        let mut data = Array2::from_elem((side, side), f64::NAN);
        let mut valid = 0usize;

        for row in 0..side {
            let iy = y0 + row as isize;
            if iy < 0 || iy >= height as isize {
                continue;
            }
            for col in 0..side {
                let ix = x0 + col as isize;
                if ix < 0 || ix >= width as isize {
                    continue;
                }
                data[[row, col]] = image[[iy as usize, ix as usize]];
                valid += 1;
            }
        }

        Ok(Self { data, x0, y0, valid })
    }

    /// The cutout pixel data, NaN where outside the parent image.
    pub fn data(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    /// Side length in pixels.
    pub fn side(&self) -> usize {
        self.data.nrows()
    }

    /// Image coordinates of the cutout's `[0, 0]` pixel.
    pub fn origin(&self) -> (isize, isize) {
        (self.x0, self.y0)
    }

    /// Number of pixels that fell inside the parent image.
    pub fn valid_pixels(&self) -> usize {
        self.valid
    }

    /// True when no pixel was NaN-filled at the image boundary.
    pub fn is_complete(&self) -> bool {
        self.valid == self.data.len()
    }
}
