//! Affine placement of LED coordinates
//!
//! Fixtures are positioned in the scene with a per-axis scale followed by a
//! translation. The solver derives that pair from an original bounding box and
//! the box the fixture should occupy.
//!
//! Corners follow the scene convention where y grows upward: the top-left
//! corner is `(min x, max y)` and the bottom-right corner is `(max x, min y)`.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 2D point in pixel or scene units
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn to_vector(self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    fn from_vector(v: Vector2<f64>) -> Self {
        Self { x: v.x, y: v.y }
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("cannot compute corners of an empty point set")]
    EmptyPointSet,

    #[error("degenerate bounding box ({width} x {height})")]
    DegenerateBox { width: f64, height: f64 },
}

/// Bounding corners of a point set
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Corners {
    pub top_left: Point,
    pub bottom_right: Point,
}

impl Corners {
    pub fn new(top_left: Point, bottom_right: Point) -> Self {
        Self {
            top_left,
            bottom_right,
        }
    }

    pub fn width(&self) -> f64 {
        self.bottom_right.x - self.top_left.x
    }

    pub fn height(&self) -> f64 {
        self.bottom_right.y - self.top_left.y
    }

    /// Swap the y components, mirroring across the horizontal axis
    pub fn mirrored_x(&self) -> Self {
        Self {
            top_left: Point::new(self.top_left.x, self.bottom_right.y),
            bottom_right: Point::new(self.bottom_right.x, self.top_left.y),
        }
    }

    /// Swap the x components, mirroring across the vertical axis
    pub fn mirrored_y(&self) -> Self {
        Self {
            top_left: Point::new(self.bottom_right.x, self.top_left.y),
            bottom_right: Point::new(self.top_left.x, self.bottom_right.y),
        }
    }
}

/// Find the top-left `(min x, max y)` and bottom-right `(max x, min y)` corners
pub fn find_corners(points: &[Point]) -> Result<Corners, GeometryError> {
    let first = points.first().ok_or(GeometryError::EmptyPointSet)?;

    let mut top_left = *first;
    let mut bottom_right = *first;
    for p in &points[1..] {
        top_left.x = top_left.x.min(p.x);
        top_left.y = top_left.y.max(p.y);
        bottom_right.x = bottom_right.x.max(p.x);
        bottom_right.y = bottom_right.y.min(p.y);
    }

    Ok(Corners::new(top_left, bottom_right))
}

/// Per-axis scale followed by translation: `p' = p * scale + translate`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub scale: Vector2<f64>,
    pub translate: Vector2<f64>,
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Affine {
    pub fn new(scale: Vector2<f64>, translate: Vector2<f64>) -> Self {
        Self { scale, translate }
    }

    pub fn identity() -> Self {
        Self {
            scale: Vector2::new(1.0, 1.0),
            translate: Vector2::zeros(),
        }
    }

    #[inline]
    pub fn apply(&self, p: Point) -> Point {
        Point::from_vector(p.to_vector().component_mul(&self.scale) + self.translate)
    }
}

/// Compute the affine transform that maps the `original` box onto `target`
///
/// A zero-width or zero-height original box cannot be scaled and is rejected.
pub fn solve(original: &Corners, target: &Corners) -> Result<Affine, GeometryError> {
    let orig_w = original.width();
    let orig_h = original.height();
    if orig_w == 0.0 || orig_h == 0.0 {
        return Err(GeometryError::DegenerateBox {
            width: orig_w,
            height: orig_h,
        });
    }

    let scale = Vector2::new(target.width() / orig_w, target.height() / orig_h);
    let translate =
        target.top_left.to_vector() - scale.component_mul(&original.top_left.to_vector());

    Ok(Affine::new(scale, translate))
}
