//! Remap a coordinate set onto a target frame
//!
//! Used on raw scanner output or a merged scene: the points' integer bounding
//! box, grown by a border, is stretched onto `[0, width] x [0, height]`, with
//! optional mirroring on either axis.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::transform::{GeometryError, Point};

/// Integer bounding box in image orientation (`top` is the minimum y)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Bounds {
    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeOptions {
    /// Unused margin around the outer LEDs, in source pixels
    pub border: i64,
    pub width: u32,
    pub height: u32,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl Default for ResizeOptions {
    fn default() -> Self {
        Self {
            border: 4,
            width: 1280,
            height: 720,
            flip_x: false,
            flip_y: true,
        }
    }
}

/// Smallest integer box containing every point
pub fn find_bounds(points: &[Point]) -> Result<Bounds, GeometryError> {
    let first = points.first().ok_or(GeometryError::EmptyPointSet)?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &points[1..] {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    Ok(Bounds {
        left: min_x.floor() as i64,
        top: min_y.floor() as i64,
        right: max_x.ceil() as i64,
        bottom: max_y.ceil() as i64,
    })
}

/// Grow the box by `border` on every side; a negative border shrinks it
pub fn apply_border(bounds: Bounds, border: i64) -> Bounds {
    Bounds {
        left: bounds.left - border,
        top: bounds.top - border,
        right: bounds.right + border,
        bottom: bounds.bottom + border,
    }
}

/// Remap points from `frame` onto the target size
pub fn remap(points: &[Point], frame: Bounds, opts: &ResizeOptions) -> Result<Vec<Point>, GeometryError> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(GeometryError::DegenerateBox {
            width: frame.width() as f64,
            height: frame.height() as f64,
        });
    }

    let target_w = opts.width as f64;
    let target_h = opts.height as f64;

    let mut xmult = target_w / frame.width() as f64;
    if opts.flip_x {
        xmult = -xmult;
    }
    let mut ymult = target_h / frame.height() as f64;
    if opts.flip_y {
        ymult = -ymult;
    }
    info!("Transformation: X {} Y {}", xmult, ymult);

    let out = points
        .iter()
        .map(|p| {
            let mut lx = (p.x - frame.left as f64) * xmult;
            if opts.flip_x {
                lx += target_w;
            }
            let mut ly = (p.y - frame.top as f64) * ymult;
            if opts.flip_y {
                ly += target_h;
            }
            Point::new(lx, ly)
        })
        .collect();

    Ok(out)
}

/// Bounds, border and remap in one step
pub fn resize(points: &[Point], opts: &ResizeOptions) -> Result<Vec<Point>, GeometryError> {
    let bounds = find_bounds(points)?;
    info!(
        "Area with pixels from {} x {} to {} x {}",
        bounds.left, bounds.top, bounds.right, bounds.bottom
    );

    let frame = apply_border(bounds, opts.border);
    info!(
        "Border from {} x {} to {} x {}",
        frame.left, frame.top, frame.right, frame.bottom
    );
    info!(
        "Resize {} x {} to {} x {}",
        frame.width(),
        frame.height(),
        opts.width,
        opts.height
    );

    remap(points, frame, opts)
}
