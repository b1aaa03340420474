//! End-to-end estimation: decode, detect, select, preprocess, predict.

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use log::debug;

use crate::error::Result;
use crate::estimator::{round_age, AgeEstimator};
use crate::face_detector::{FaceBox, FaceDetector};
use crate::orientation::{decode_oriented, RawImage};
use crate::preprocess::{preprocess_face, ResizeFilter};
use crate::select::SelectionPolicy;

/// Where a single [`AgePipeline::estimate`] call currently is.
///
/// Every call walks `Idle → Decoding → Detecting` and then either ends in
/// `NoFace` or continues `Preprocessing → Estimating → Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Request accepted, nothing done yet.
    Idle,
    /// Decoding bytes and applying orientation.
    Decoding,
    /// Running the face detector on the grayscale image.
    Detecting,
    /// Detector found nothing; the call ends here.
    NoFace,
    /// Cropping and normalizing the selected face.
    Preprocessing,
    /// Running the age model.
    Estimating,
    /// Age produced.
    Done,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Decoding => "decoding",
            PipelineStage::Detecting => "detecting",
            PipelineStage::NoFace => "no face",
            PipelineStage::Preprocessing => "preprocessing",
            PipelineStage::Estimating => "estimating",
            PipelineStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful estimation call.
#[derive(Debug, Clone)]
pub enum AgeResult {
    /// A face was found and its age estimated.
    FaceFound {
        /// Color crop of the selected face.
        crop: DynamicImage,
        /// The selected box in oriented image coordinates.
        face: FaceBox,
        /// Estimated age in whole years.
        age: i32,
    },
    /// The detector reported no face. Not an error.
    NoFaceFound {
        /// The decoded image after orientation correction.
        image: DynamicImage,
    },
}

impl AgeResult {
    /// The estimated age, if a face was found.
    pub fn age(&self) -> Option<i32> {
        match self {
            AgeResult::FaceFound { age, .. } => Some(*age),
            AgeResult::NoFaceFound { .. } => None,
        }
    }

    /// The selected face box, if a face was found.
    pub fn face(&self) -> Option<FaceBox> {
        match self {
            AgeResult::FaceFound { face, .. } => Some(*face),
            AgeResult::NoFaceFound { .. } => None,
        }
    }
}

/// Age estimation pipeline over a shared detector and model.
///
/// Both artifacts are loaded once by the caller and shared read-only, so a
/// pipeline is cheap to clone and may serve concurrent calls.
///
/// ```no_run
/// use std::sync::Arc;
/// use faceage::{AgePipeline, AgeResult, CascadeDetector, DetectionParams, OnnxAgeEstimator, RawImage};
///
/// let detector = CascadeDetector::from_path("haarcascade_frontalface_default.xml", DetectionParams::default()).unwrap();
/// let estimator = OnnxAgeEstimator::from_path("age_model.onnx").unwrap();
/// let pipeline = AgePipeline::new(Arc::new(detector), Arc::new(estimator));
///
/// let raw = RawImage::with_embedded_orientation(std::fs::read("photo.jpg").unwrap());
/// match pipeline.estimate(&raw).unwrap() {
///     AgeResult::FaceFound { age, .. } => println!("Predicted age: {age}"),
///     AgeResult::NoFaceFound { .. } => println!("No face detected"),
/// }
/// ```
#[derive(Clone)]
pub struct AgePipeline {
    detector: Arc<dyn FaceDetector>,
    estimator: Arc<dyn AgeEstimator>,
    selection: SelectionPolicy,
    resize: ResizeFilter,
}

impl AgePipeline {
    /// Create a pipeline with first-face selection and area resizing.
    pub fn new(detector: Arc<dyn FaceDetector>, estimator: Arc<dyn AgeEstimator>) -> Self {
        Self {
            detector,
            estimator,
            selection: SelectionPolicy::default(),
            resize: ResizeFilter::default(),
        }
    }

    /// Set how one face is chosen among several (default: first).
    pub fn selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection = policy;
        self
    }

    /// Set the resampling used to reach the model input size (default: area).
    pub fn resize_filter(mut self, filter: ResizeFilter) -> Self {
        self.resize = filter;
        self
    }

    /// Run one request to completion.
    ///
    /// Returns `NoFaceFound` when the detector reports nothing, in which case
    /// the model is never invoked. The first failing step aborts the call.
    pub fn estimate(&self, raw: &RawImage) -> Result<AgeResult> {
        let mut stage = StageLog::new();

        stage.enter(PipelineStage::Decoding);
        let image = decode_oriented(raw)?;

        stage.enter(PipelineStage::Detecting);
        let gray = image.to_luma8();
        let faces = self.detector.detect(gray.as_raw(), gray.width(), gray.height());
        debug!("detector returned {} face box(es)", faces.len());

        let Some(face) = self.selection.select(&faces) else {
            stage.enter(PipelineStage::NoFace);
            return Ok(AgeResult::NoFaceFound { image });
        };

        stage.enter(PipelineStage::Preprocessing);
        debug!("selected face {face} ({:?})", self.selection);
        let prepared = preprocess_face(&gray, &image, face, self.resize)?;

        stage.enter(PipelineStage::Estimating);
        let raw_age = self.estimator.predict(&prepared.tensor)?;
        let age = round_age(raw_age)?;

        stage.enter(PipelineStage::Done);
        debug!("model output {raw_age} rounded to {age}");
        Ok(AgeResult::FaceFound {
            crop: prepared.crop,
            face,
            age,
        })
    }
}

impl fmt::Debug for AgePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgePipeline")
            .field("selection", &self.selection)
            .field("resize", &self.resize)
            .finish_non_exhaustive()
    }
}

struct StageLog {
    current: PipelineStage,
}

impl StageLog {
    fn new() -> Self {
        Self {
            current: PipelineStage::Idle,
        }
    }

    fn enter(&mut self, next: PipelineStage) {
        debug!("pipeline: {} -> {}", self.current, next);
        self.current = next;
    }
}
