//! Fixture geometry
//!
//! A fixture is one physical LED strip or array with the coordinates recorded
//! for it, one point per LED in wiring order. Placement in the scene is an
//! affine transform applied to every point; the recorded points themselves
//! are never modified or reordered.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::coords::read_points_lenient;
use crate::transform::{find_corners, solve, Affine, Corners, GeometryError, Point};

/// Mirror axis for [`Fixture::flip`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Mirror across the horizontal axis (swaps the y extents)
    X,
    /// Mirror across the vertical axis (swaps the x extents)
    Y,
}

#[derive(Debug, Clone)]
pub struct Fixture {
    points: Vec<Point>,
    transformed: Vec<Point>,
    corners: Corners,
    transformed_corners: Corners,
    /// Corner pair the fixture was last asked to occupy
    placement: Corners,
}

impl Fixture {
    /// Build a fixture from an ordered point sequence
    pub fn load(points: Vec<Point>) -> Result<Self, GeometryError> {
        let corners = find_corners(&points)?;
        Ok(Self {
            transformed: points.clone(),
            points,
            corners,
            transformed_corners: corners,
            placement: corners,
        })
    }

    /// Load a fixture from a coordinate file, skipping malformed lines
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open fixture file {:?}", path))?;
        let points = read_points_lenient(file, &path.display().to_string())
            .with_context(|| format!("Failed to read fixture file {:?}", path))?;
        let fixture = Self::load(points)
            .with_context(|| format!("Fixture file {:?} has no usable points", path))?;
        debug!(
            "Loaded {} points from {:?}, corners {:?}",
            fixture.len(),
            path,
            fixture.corners
        );
        Ok(fixture)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn corners(&self) -> Corners {
        self.corners
    }

    pub fn transformed_top_left(&self) -> Point {
        self.transformed_corners.top_left
    }

    pub fn transformed_bottom_right(&self) -> Point {
        self.transformed_corners.bottom_right
    }

    /// Apply a new scale/translate pair to every recorded point
    pub fn transform(&mut self, affine: Affine) {
        self.transformed = self.points.iter().map(|&p| affine.apply(p)).collect();
        // Points are non-empty by construction
        if let Ok(c) = find_corners(&self.transformed) {
            self.transformed_corners = c;
        }
    }

    /// Place the fixture so its original corners land on `target`
    pub fn transform_to(&mut self, target: Corners) -> Result<Affine, GeometryError> {
        let affine = solve(&self.corners, &target)?;
        self.placement = target;
        self.transform(affine);
        debug!(
            "Placed fixture at {:?}: scale {:?} translate {:?}",
            target, affine.scale, affine.translate
        );
        Ok(affine)
    }

    /// Mirror the fixture in place without changing its width or height
    pub fn flip(&mut self, axis: Axis) -> Result<Affine, GeometryError> {
        let target = match axis {
            Axis::X => self.placement.mirrored_x(),
            Axis::Y => self.placement.mirrored_y(),
        };
        self.transform_to(target)
    }

    /// Iterate over the transformed points in wiring order
    pub fn iter(&self) -> TransformedPoints<'_> {
        TransformedPoints {
            points: &self.transformed,
            idx: 0,
        }
    }
}

/// Restartable iterator over a fixture's transformed points
#[derive(Debug, Clone)]
pub struct TransformedPoints<'a> {
    points: &'a [Point],
    idx: usize,
}

impl TransformedPoints<'_> {
    /// Rewind to the first point
    pub fn reset(&mut self) {
        self.idx = 0;
    }
}

impl Iterator for TransformedPoints<'_> {
    type Item = Point;

    fn next(&mut self) -> Option<Point> {
        let p = self.points.get(self.idx).copied()?;
        self.idx += 1;
        Some(p)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.points.len() - self.idx;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TransformedPoints<'_> {}
