use crate::error::{FaceAgeError, Result};
use crate::preprocess::{FaceTensor, FACE_TENSOR_SHAPE};

/// Pluggable age regression backend.
///
/// Implementations load their model once and are shared read-only across
/// concurrent pipeline calls. The built-in [`crate::OnnxAgeEstimator`] is
/// available with the `onnx` feature; tests and alternative runtimes can
/// provide their own.
pub trait AgeEstimator: Send + Sync {
    /// Run the model on a face tensor, returning its raw scalar output.
    fn predict(&self, tensor: &FaceTensor) -> Result<f32>;
}

/// Confirm the tensor has the `(1, 200, 200, 1)` layout the model declares.
pub fn check_tensor_shape(tensor: &FaceTensor) -> Result<()> {
    let expected: usize = FACE_TENSOR_SHAPE.iter().product();
    let len = tensor.as_slice().len();
    if tensor.shape() != FACE_TENSOR_SHAPE || len != expected {
        return Err(FaceAgeError::ShapeMismatchError {
            expected: FACE_TENSOR_SHAPE.to_vec(),
            actual: vec![len],
        });
    }
    Ok(())
}

/// Round a raw model output to whole years, half away from zero.
///
/// `0.5` becomes 1 and `0.49` becomes 0.
pub fn round_age(raw: f32) -> Result<i32> {
    if !raw.is_finite() {
        return Err(FaceAgeError::InferenceError(format!(
            "model produced a non-finite age: {raw}"
        )));
    }
    let rounded = raw.round();
    if rounded < i32::MIN as f32 || rounded > i32::MAX as f32 {
        return Err(FaceAgeError::InferenceError(format!(
            "model output {raw} is out of range"
        )));
    }
    Ok(rounded as i32)
}
