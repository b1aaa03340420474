use std::io::Read;
use std::path::Path;

use crate::error::{FaceAgeError, Result};
use crate::face_detector::{DetectionParams, FaceBox, FaceDetector};

/// Face detector backed by the `rustface` crate (SeetaFace funnel cascade).
///
/// The model is read once on construction and cloned into a lightweight
/// detector per call. SeetaFace merges overlapping windows itself, so
/// `min_neighbors` does not apply; `scale_factor` becomes the pyramid step
/// and `min_size` the smallest face searched for.
pub struct RustfaceDetector {
    model: rustface::Model,
    params: DetectionParams,
    score_threshold: f64,
}

impl RustfaceDetector {
    /// Load a SeetaFace model file.
    pub fn from_path<P: AsRef<Path>>(path: P, params: DetectionParams) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| FaceAgeError::ModelLoadError(format!("{}: {e}", path.display())))?;
        Self::from_reader(std::io::BufReader::new(file), params)
    }

    /// Load a SeetaFace model from a reader (e.g. an embedded resource).
    pub fn from_reader<R: Read>(reader: R, params: DetectionParams) -> Result<Self> {
        params.validate()?;
        let model = rustface::read_model(reader).map_err(|e| {
            FaceAgeError::ModelLoadError(format!("failed to load SeetaFace model: {e}"))
        })?;
        Ok(Self {
            model,
            params,
            score_threshold: 2.0,
        })
    }

    /// Set the minimum classifier score for a window to count as a face
    /// (default: 2.0).
    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = threshold;
        self
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.params.min_size);
        detector.set_score_thresh(self.score_threshold);
        detector.set_pyramid_scale_factor((1.0 / self.params.scale_factor) as f32);
        detector.set_slide_window_step(4, 4);

        let faces = detector.detect(&rustface::ImageData::new(gray, width, height));

        faces
            .iter()
            .filter_map(|face| {
                let bbox = face.bbox();
                // SeetaFace boxes may start off-image; keep the visible part.
                let x0 = bbox.x().max(0) as u32;
                let y0 = bbox.y().max(0) as u32;
                let x1 = ((bbox.x() + bbox.width() as i32).max(0) as u32).min(width);
                let y1 = ((bbox.y() + bbox.height() as i32).max(0) as u32).min(height);
                (x1 > x0 && y1 > y0).then(|| FaceBox::new(x0, y0, x1 - x0, y1 - y0))
            })
            .collect()
    }
}
