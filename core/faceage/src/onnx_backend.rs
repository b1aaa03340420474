use std::io::Read;
use std::path::Path;

use log::debug;
use tract_onnx::prelude::{
    tvec, DatumExt, Framework, Graph, InferenceModel, InferenceModelExt, SimplePlan, Tensor,
    TypedFact, TypedOp,
};

use crate::error::{FaceAgeError, Result};
use crate::estimator::{check_tensor_shape, AgeEstimator};
use crate::preprocess::{FaceTensor, FACE_TENSOR_SHAPE};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Age regression model executed with the pure-Rust tract ONNX runtime.
///
/// The graph's input is pinned to `f32 (1, 200, 200, 1)` and optimized once
/// on load; the resulting plan is immutable and safe to share across threads.
#[derive(Debug)]
pub struct OnnxAgeEstimator {
    runnable: RunnableModel,
}

impl OnnxAgeEstimator {
    /// Load and optimize an ONNX model file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FaceAgeError::ModelLoadError(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let model = tract_onnx::onnx().model_for_path(path).map_err(|e| {
            FaceAgeError::ModelLoadError(format!(
                "failed to parse ONNX graph from {}: {e}",
                path.display()
            ))
        })?;
        let estimator = Self::from_model(model)?;
        debug!("age model {} ready", path.display());
        Ok(estimator)
    }

    /// Load and optimize an ONNX model from a reader (e.g. an embedded resource).
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut reader)
            .map_err(|e| FaceAgeError::ModelLoadError(format!("failed to parse ONNX graph: {e}")))?;
        Self::from_model(model)
    }

    fn from_model(model: InferenceModel) -> Result<Self> {
        let runnable = model
            .with_input_fact(0, f32::fact(FACE_TENSOR_SHAPE).into())
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| {
                FaceAgeError::ModelLoadError(format!(
                    "model does not accept a {FACE_TENSOR_SHAPE:?} f32 input: {e}"
                ))
            })?;
        Ok(Self { runnable })
    }
}

impl AgeEstimator for OnnxAgeEstimator {
    fn predict(&self, tensor: &FaceTensor) -> Result<f32> {
        check_tensor_shape(tensor)?;

        let input = Tensor::from_shape(&FACE_TENSOR_SHAPE, tensor.as_slice())
            .map_err(|e| FaceAgeError::InferenceError(e.to_string()))?;
        let outputs = self
            .runnable
            .run(tvec!(input.into()))
            .map_err(|e| FaceAgeError::InferenceError(format!("age model execution failed: {e}")))?;

        let output = outputs
            .first()
            .ok_or_else(|| FaceAgeError::InferenceError("age model produced no outputs".into()))?;
        let values = output
            .as_slice::<f32>()
            .map_err(|e| FaceAgeError::InferenceError(e.to_string()))?;

        match values {
            [age] => Ok(*age),
            _ => Err(FaceAgeError::ShapeMismatchError {
                expected: vec![1, 1],
                actual: output.shape().to_vec(),
            }),
        }
    }
}
