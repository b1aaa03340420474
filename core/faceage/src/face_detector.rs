use std::fmt;

use crate::error::{FaceAgeError, Result};

/// Axis-aligned bounding box of a detected face, in grayscale image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceBox {
    /// X coordinate of the top-left corner.
    pub x: u32,
    /// Y coordinate of the top-left corner.
    pub y: u32,
    /// Width of the box.
    pub width: u32,
    /// Height of the box.
    pub height: u32,
}

impl FaceBox {
    /// Create a new face box.
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Area of the box in pixels.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether the box lies entirely within a `width` × `height` image.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.width > 0
            && self.height > 0
            && self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

impl fmt::Display for FaceBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({}, {})",
            self.width, self.height, self.x, self.y
        )
    }
}

/// Multi-scale detection parameters shared by the cascade backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Growth factor between successive search scales. Must be > 1.0.
    pub scale_factor: f64,
    /// Neighbouring raw detections a candidate needs to be kept.
    pub min_neighbors: u32,
    /// Smallest face edge, in pixels, that will be reported.
    pub min_size: u32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 3,
            min_size: 200,
        }
    }
}

impl DetectionParams {
    /// Set the scale factor (default: 1.1).
    pub fn scale_factor(mut self, factor: f64) -> Self {
        self.scale_factor = factor;
        self
    }

    /// Set the neighbour threshold (default: 3).
    pub fn min_neighbors(mut self, neighbors: u32) -> Self {
        self.min_neighbors = neighbors;
        self
    }

    /// Set the minimum face size (default: 200).
    pub fn min_size(mut self, size: u32) -> Self {
        self.min_size = size;
        self
    }

    /// Reject parameter sets the detectors cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(self.scale_factor > 1.0) || !self.scale_factor.is_finite() {
            return Err(FaceAgeError::InvalidScaleFactor(self.scale_factor));
        }
        if self.min_size == 0 {
            return Err(FaceAgeError::InvalidMinSize);
        }
        Ok(())
    }
}

/// Pluggable face detection backend.
///
/// Implement this trait to provide a custom face detector and pass it to
/// [`crate::AgePipeline::new`]. Implementations hold their artifact in memory
/// and are shared read-only across concurrent pipeline calls.
///
/// The returned order is backend-defined (usually scan order). Callers must
/// not assume boxes are sorted by size or confidence.
pub trait FaceDetector: Send + Sync {
    /// Detect faces in a row-major grayscale buffer of `width` × `height` bytes.
    ///
    /// A buffer whose length does not equal `width * height` is a caller
    /// error; the built-in backends log it and return no faces, which the
    /// pipeline then reports as `NoFaceFound`.
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox>;
}
