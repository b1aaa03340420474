//! Age estimation from a single photo: fix orientation, detect a face with a
//! Haar cascade, normalize the crop to a 200×200 intensity tensor, and run a
//! regression model on it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use faceage::{AgePipeline, AgeResult, CascadeDetector, DetectionParams, OnnxAgeEstimator, RawImage};
//!
//! let detector = CascadeDetector::from_path(
//!     "haarcascade_frontalface_default.xml",
//!     DetectionParams::default(),
//! )
//! .unwrap();
//! let estimator = OnnxAgeEstimator::from_path("age_model.onnx").unwrap();
//! let pipeline = AgePipeline::new(Arc::new(detector), Arc::new(estimator));
//!
//! let raw = RawImage::with_embedded_orientation(std::fs::read("photo.jpg").unwrap());
//! match pipeline.estimate(&raw).unwrap() {
//!     AgeResult::FaceFound { age, face, .. } => println!("Predicted age: {age} ({face})"),
//!     AgeResult::NoFaceFound { .. } => println!("No face detected"),
//! }
//! ```
//!
//! Detection and estimation sit behind the [`FaceDetector`] and
//! [`AgeEstimator`] traits, so other backends can be plugged in.
#![warn(missing_docs)]

/// Viola-Jones cascade detector for OpenCV Haar XML files.
pub mod cascade;
mod error;
/// Age regression trait and output rounding.
pub mod estimator;
/// Face detection traits and data types.
pub mod face_detector;
#[cfg(feature = "onnx")]
/// Built-in tract-based ONNX age model backend.
pub mod onnx_backend;
/// Orientation tags, EXIF lookup, and oriented decoding.
pub mod orientation;
/// End-to-end estimation pipeline.
pub mod pipeline;
/// Crop, normalization, and resizing into the model tensor.
pub mod preprocess;
#[cfg(feature = "rustface")]
/// Alternate SeetaFace-based face detector backend.
pub mod rustface_backend;
/// Choosing one face among several detections.
pub mod select;

/// Cascade loading and detection.
pub use cascade::{group_rectangles, CascadeDetector, HaarCascade};
/// Error type returned by faceage operations.
pub use error::{FaceAgeError, Result};
/// Age model trait and rounding.
pub use estimator::{round_age, AgeEstimator};
/// Face detection trait, bounding box, and tuning parameters.
pub use face_detector::{DetectionParams, FaceBox, FaceDetector};
#[cfg(feature = "onnx")]
/// Built-in age model running on tract.
pub use onnx_backend::OnnxAgeEstimator;
/// Orientation handling and decoding.
pub use orientation::{decode_oriented, Orientation, RawImage};
/// Pipeline entry point and its outcome.
pub use pipeline::{AgePipeline, AgeResult, PipelineStage};
/// Model tensor and preprocessing entry points.
pub use preprocess::{preprocess_face, FaceTensor, PreprocessedFace, ResizeFilter};
#[cfg(feature = "rustface")]
/// Detector that loads a SeetaFace model.
pub use rustface_backend::RustfaceDetector;
/// Face selection.
pub use select::{select_first, SelectionPolicy};
