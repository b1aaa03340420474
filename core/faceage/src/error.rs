use thiserror::Error;

use crate::face_detector::FaceBox;

#[derive(Debug, Error)]
pub enum FaceAgeError {
    #[error("failed to decode image: {0}")]
    DecodeError(String),

    #[error("image dimensions are zero")]
    ZeroDimensions,

    #[error("failed to load model artifact: {0}")]
    ModelLoadError(String),

    #[error("face box {face} exceeds {image_width}x{image_height} image")]
    BoundsError {
        face: FaceBox,
        image_width: u32,
        image_height: u32,
    },

    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatchError {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("model inference failed: {0}")]
    InferenceError(String),

    #[error("scale factor must be greater than 1.0, got {0}")]
    InvalidScaleFactor(f64),

    #[error("minimum face size must be > 0")]
    InvalidMinSize,
}

pub type Result<T> = std::result::Result<T, FaceAgeError>;
