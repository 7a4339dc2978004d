use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SifterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameDims {
    pub width: u32,
    pub height: u32,
}

impl FrameDims {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for FrameDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel rectangle relative to the frame's top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rectangle {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u64 {
        u64::from(self.x) + u64::from(self.width)
    }

    pub fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.height)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && u64::from(x) < self.right() && u64::from(y) < self.bottom()
    }

    /// Checks the rectangle invariant against `dims`, returning a readable
    /// reason on violation. Callers pick the error category.
    pub fn check_within(&self, dims: FrameDims) -> Result<(), String> {
        if self.is_empty() {
            return Err(format!("rectangle {self} has zero area"));
        }
        if self.right() > u64::from(dims.width) {
            return Err(format!(
                "rectangle {self} exceeds frame width {} (x+width={})",
                dims.width,
                self.right()
            ));
        }
        if self.bottom() > u64::from(dims.height) {
            return Err(format!(
                "rectangle {self} exceeds frame height {} (y+height={})",
                dims.height,
                self.bottom()
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{} {}x{})", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Rectangle {
    type Err = SifterError;

    /// Parses `x,y,width,height`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .collect();
        if parts.len() != 4 {
            return Err(SifterError::MalformedInput(format!(
                "rectangle must be x,y,width,height (got '{raw}')"
            )));
        }
        let mut values = [0u32; 4];
        for (slot, part) in values.iter_mut().zip(parts) {
            *slot = part.parse::<u32>().map_err(|_| {
                SifterError::MalformedInput(format!(
                    "rectangle component '{part}' is not a non-negative integer"
                ))
            })?;
        }
        Ok(Rectangle::new(values[0], values[1], values[2], values[3]))
    }
}

/// Result of resolving a region, either from direct input or from a
/// detection collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionOutcome {
    Region(Rectangle),
    NoRegion,
}

impl RegionOutcome {
    pub fn rectangle(&self) -> Option<Rectangle> {
        match self {
            RegionOutcome::Region(rect) => Some(*rect),
            RegionOutcome::NoRegion => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, RegionOutcome::NoRegion)
    }
}

/// Bounding box exactly as a detection model reported it.
///
/// Models answer in loose JSON numbers: fractions, `-1` sentinels and
/// negative values all occur, so nothing here is trusted until
/// [`DetectedBox::resolve`] has run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectedBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DetectedBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Maps a box reported against a downscaled still back to frame pixels.
    pub fn scaled(&self, sx: f64, sy: f64) -> Self {
        Self::new(self.x * sx, self.y * sy, self.width * sx, self.height * sy)
    }

    /// Normalises a detected box against the analysed frame.
    ///
    /// Non-positive extents (including the `-1` sentinel) mean the model
    /// found nothing. A box that is present but unusable is an
    /// `InvalidRegion` failure, never silently clamped.
    pub fn resolve(&self, dims: FrameDims) -> Result<RegionOutcome, SifterError> {
        let values = [self.x, self.y, self.width, self.height];
        if values.iter().any(|value| !value.is_finite()) {
            return Err(SifterError::InvalidRegion(format!(
                "detected box has non-finite coordinates: {self:?}"
            )));
        }
        let width = self.width.round();
        let height = self.height.round();
        if width <= 0.0 || height <= 0.0 {
            return Ok(RegionOutcome::NoRegion);
        }
        let x = self.x.round();
        let y = self.y.round();
        if x < 0.0 || y < 0.0 {
            return Err(SifterError::InvalidRegion(format!(
                "detected box has a negative origin ({x},{y})"
            )));
        }
        let limit = f64::from(u32::MAX);
        if x > limit || y > limit || width > limit || height > limit {
            return Err(SifterError::InvalidRegion(format!(
                "detected box is out of range: {self:?}"
            )));
        }
        let rect = Rectangle::new(x as u32, y as u32, width as u32, height as u32);
        rect.check_within(dims).map_err(SifterError::InvalidRegion)?;
        Ok(RegionOutcome::Region(rect))
    }
}
