//! Orientation correction: rotate decoded pixels so visual "up" is row 0.

use std::io::Cursor;

use image::metadata::Orientation as ExifOrientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use log::debug;

use crate::error::{FaceAgeError, Result};

/// Rotation needed to display an image upright, as declared by the image source.
///
/// Only the three pure rotations are acted upon; mirrored EXIF orientations
/// and missing tags leave the pixels untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Orientation {
    /// Already upright.
    #[default]
    Normal,
    /// Rotate 90° clockwise to display.
    Rotate90,
    /// Rotate 180° to display.
    Rotate180,
    /// Rotate 270° clockwise to display.
    Rotate270,
    /// No usable orientation information.
    Undefined,
}

impl Orientation {
    /// Map an EXIF `Orientation` (0x0112) value.
    pub fn from_exif(value: u16) -> Self {
        match value {
            1 => Orientation::Normal,
            3 => Orientation::Rotate180,
            6 => Orientation::Rotate90,
            8 => Orientation::Rotate270,
            _ => Orientation::Undefined,
        }
    }

    /// Read the orientation tag embedded in the image's own metadata.
    ///
    /// Falls back to [`Orientation::Normal`] when the format carries no EXIF
    /// block or the block cannot be read.
    pub fn read_from_bytes(bytes: &[u8]) -> Self {
        let decoder = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.into_decoder().ok());
        let Some(mut decoder) = decoder else {
            return Orientation::Normal;
        };
        match decoder.orientation() {
            Ok(ExifOrientation::NoTransforms) => Orientation::Normal,
            Ok(ExifOrientation::Rotate90) => Orientation::Rotate90,
            Ok(ExifOrientation::Rotate180) => Orientation::Rotate180,
            Ok(ExifOrientation::Rotate270) => Orientation::Rotate270,
            Ok(_) => Orientation::Undefined,
            Err(e) => {
                debug!("ignoring unreadable orientation metadata: {e}");
                Orientation::Normal
            }
        }
    }

    /// The tag that undoes this rotation.
    pub fn inverse(self) -> Self {
        match self {
            Orientation::Rotate90 => Orientation::Rotate270,
            Orientation::Rotate270 => Orientation::Rotate90,
            other => other,
        }
    }

    /// Rotate `image` so that it displays upright.
    pub fn apply(self, image: DynamicImage) -> DynamicImage {
        match self {
            Orientation::Rotate90 => image.rotate90(),
            Orientation::Rotate180 => image.rotate180(),
            Orientation::Rotate270 => image.rotate270(),
            Orientation::Normal | Orientation::Undefined => image,
        }
    }
}

/// Encoded image bytes together with the orientation declared by their source.
///
/// One `RawImage` is one estimation request: it is consumed by a single
/// [`crate::AgePipeline::estimate`] call and carries everything that call needs.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Vec<u8>,
    orientation: Orientation,
}

impl RawImage {
    /// Wrap encoded bytes (JPEG, PNG, or WebP) with an explicit orientation hint.
    pub fn new(bytes: Vec<u8>, orientation: Orientation) -> Self {
        Self { bytes, orientation }
    }

    /// Wrap encoded bytes, taking the orientation from their EXIF metadata.
    pub fn with_embedded_orientation(bytes: Vec<u8>) -> Self {
        let orientation = Orientation::read_from_bytes(&bytes);
        Self { bytes, orientation }
    }

    /// The encoded payload.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The declared orientation.
    pub fn orientation(&self) -> Orientation {
        self.orientation
    }
}

/// Decode the payload and rotate it upright.
pub fn decode_oriented(raw: &RawImage) -> Result<DynamicImage> {
    let decoded =
        image::load_from_memory(raw.bytes()).map_err(|e| FaceAgeError::DecodeError(e.to_string()))?;

    if decoded.width() == 0 || decoded.height() == 0 {
        return Err(FaceAgeError::ZeroDimensions);
    }

    debug!(
        "decoded {}x{} image, orientation {:?}",
        decoded.width(),
        decoded.height(),
        raw.orientation()
    );
    Ok(raw.orientation().apply(decoded))
}
