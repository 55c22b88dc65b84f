//! Brightest-spot localization
//!
//! A lit LED is found as the global intensity maximum of a blurred grayscale
//! frame. The blur suppresses single hot pixels (sensor salt noise) that
//! would otherwise win over the actual LED.

use image::{GrayImage, RgbImage};
use rayon::prelude::*;

use crate::transform::Point;

/// Integer pixel location of a detected spot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spot {
    pub x: u32,
    pub y: u32,
    /// Blurred intensity at the spot
    pub value: u8,
}

impl Spot {
    pub fn to_point(self) -> Point {
        Point::new(self.x as f64, self.y as f64)
    }
}

#[derive(Debug, Clone)]
pub struct BrightSpotDetector {
    radius: u32,
}

impl BrightSpotDetector {
    /// `radius` is the blur kernel size, coerced to an odd value of at least 1
    pub fn new(radius: i64) -> Self {
        Self {
            radius: coerce_radius(radius),
        }
    }

    /// Gaussian sigma matching a `radius x radius` kernel, `None` for no blur
    fn sigma(&self) -> Option<f32> {
        if self.radius <= 1 {
            return None;
        }
        Some(0.3 * ((self.radius as f32 - 1.0) * 0.5 - 1.0) + 0.8)
    }

    /// Locate the brightest point of `frame`
    ///
    /// Returns `None` for an empty frame. Ties resolve to the first pixel in
    /// row-major order.
    pub fn detect(&self, frame: &RgbImage) -> Option<Spot> {
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }

        let gray = image::imageops::grayscale(frame);
        let gray = match self.sigma() {
            Some(sigma) => imageproc::filter::gaussian_blur_f32(&gray, sigma),
            None => gray,
        };

        brightest(&gray)
    }
}

/// Coerce a blur radius to an odd value of at least 1
pub fn coerce_radius(radius: i64) -> u32 {
    let r = radius.max(1);
    let r = if r % 2 == 0 { r + 1 } else { r };
    r.min(u32::MAX as i64) as u32
}

/// First global maximum in row-major order
fn brightest(gray: &GrayImage) -> Option<Spot> {
    let width = gray.width() as usize;

    gray.as_raw()
        .par_chunks(width)
        .enumerate()
        .map(|(y, row)| {
            let mut best = Spot {
                x: 0,
                y: y as u32,
                value: row[0],
            };
            for (x, &v) in row.iter().enumerate().skip(1) {
                if v > best.value {
                    best.x = x as u32;
                    best.value = v;
                }
            }
            best
        })
        // Ordered reduction: the earlier row is kept unless strictly beaten
        .reduce_with(|a, b| if b.value > a.value { b } else { a })
}
