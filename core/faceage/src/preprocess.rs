//! Face crop normalization: crop, scale intensities to `[0, 1]`, resize to the
//! model's fixed 200×200 input.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};

use crate::error::{FaceAgeError, Result};
use crate::face_detector::FaceBox;

/// Edge length of the square model input.
pub const FACE_TENSOR_SIZE: u32 = 200;

/// Model input shape: batch, height, width, channels.
pub const FACE_TENSOR_SHAPE: [usize; 4] = [1, FACE_TENSOR_SIZE as usize, FACE_TENSOR_SIZE as usize, 1];

const FACE_TENSOR_LEN: usize = (FACE_TENSOR_SIZE * FACE_TENSOR_SIZE) as usize;

/// Single-channel float image with intensities in `[0, 1]`.
pub type IntensityImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Resampling used to bring a face crop to the model input size.
///
/// Must match whatever the model was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    /// Exact pixel-area averaging.
    #[default]
    Area,
    /// Triangle-filter resampling via `image::imageops::resize`.
    ///
    /// When shrinking, the kernel widens with the scale factor, so this
    /// antialiases and does not reproduce OpenCV's 2×2 `INTER_LINEAR` output.
    Bilinear,
}

/// The regression model's only valid input: 200×200×1 floats in `[0, 1]`,
/// row-major, channel-last.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceTensor {
    data: Vec<f32>,
}

impl FaceTensor {
    /// Build a tensor from raw row-major values.
    ///
    /// Fails with `ShapeMismatchError` unless `width` and `height` are both 200
    /// and `data` holds exactly one value per pixel. Values are clamped into
    /// `[0, 1]`; NaN becomes 0.
    pub fn from_vec(width: u32, height: u32, mut data: Vec<f32>) -> Result<Self> {
        if width != FACE_TENSOR_SIZE || height != FACE_TENSOR_SIZE {
            return Err(FaceAgeError::ShapeMismatchError {
                expected: FACE_TENSOR_SHAPE.to_vec(),
                actual: vec![1, height as usize, width as usize, 1],
            });
        }
        if data.len() != FACE_TENSOR_LEN {
            return Err(FaceAgeError::ShapeMismatchError {
                expected: vec![FACE_TENSOR_LEN],
                actual: vec![data.len()],
            });
        }
        for value in &mut data {
            *value = if value.is_nan() {
                0.0
            } else {
                value.clamp(0.0, 1.0)
            };
        }
        Ok(Self { data })
    }

    /// Build a tensor from an already-resized intensity image.
    pub fn from_luma(image: &IntensityImage) -> Result<Self> {
        Self::from_vec(image.width(), image.height(), image.as_raw().clone())
    }

    /// Always [`FACE_TENSOR_SHAPE`].
    pub fn shape(&self) -> [usize; 4] {
        FACE_TENSOR_SHAPE
    }

    /// Values in model buffer order.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Intensity at column `x`, row `y`.
    pub fn get(&self, x: u32, y: u32) -> Option<f32> {
        if x >= FACE_TENSOR_SIZE || y >= FACE_TENSOR_SIZE {
            return None;
        }
        self.data
            .get((y * FACE_TENSOR_SIZE + x) as usize)
            .copied()
    }

    /// Consume the tensor, returning its buffer.
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Output of [`preprocess_face`].
#[derive(Debug, Clone)]
pub struct PreprocessedFace {
    /// Model input built from the grayscale crop.
    pub tensor: FaceTensor,
    /// Color crop of the same region, for display.
    pub crop: DynamicImage,
}

fn ensure_within(face: FaceBox, width: u32, height: u32) -> Result<()> {
    if face.fits_within(width, height) {
        Ok(())
    } else {
        Err(FaceAgeError::BoundsError {
            face,
            image_width: width,
            image_height: height,
        })
    }
}

/// Crop the grayscale image to `face`.
pub fn crop_gray(gray: &GrayImage, face: FaceBox) -> Result<GrayImage> {
    ensure_within(face, gray.width(), gray.height())?;
    Ok(image::imageops::crop_imm(gray, face.x, face.y, face.width, face.height).to_image())
}

/// Crop the color image to `face`.
pub fn crop_color(image: &DynamicImage, face: FaceBox) -> Result<DynamicImage> {
    ensure_within(face, image.width(), image.height())?;
    Ok(image.crop_imm(face.x, face.y, face.width, face.height))
}

/// Map 8-bit intensities onto `[0, 1]`.
pub fn normalize_intensity(gray: &GrayImage) -> IntensityImage {
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y).0[0] as f32 / 255.0])
    })
}

/// Resize an intensity image to `width` × `height`.
pub fn resize_intensity(
    image: &IntensityImage,
    width: u32,
    height: u32,
    filter: ResizeFilter,
) -> IntensityImage {
    match filter {
        ResizeFilter::Area => resize_area(image, width, height),
        ResizeFilter::Bilinear => {
            image::imageops::resize(image, width, height, FilterType::Triangle)
        }
    }
}

/// Resize a normalized crop to the model input size and wrap it as a tensor.
pub fn resize_to_tensor(image: &IntensityImage, filter: ResizeFilter) -> Result<FaceTensor> {
    let resized = resize_intensity(image, FACE_TENSOR_SIZE, FACE_TENSOR_SIZE, filter);
    FaceTensor::from_luma(&resized)
}

/// Crop both images to `face` and turn the grayscale crop into a model tensor.
pub fn preprocess_face(
    gray: &GrayImage,
    color: &DynamicImage,
    face: FaceBox,
    filter: ResizeFilter,
) -> Result<PreprocessedFace> {
    let gray_crop = crop_gray(gray, face)?;
    let crop = crop_color(color, face)?;
    let normalized = normalize_intensity(&gray_crop);
    let tensor = resize_to_tensor(&normalized, filter)?;
    Ok(PreprocessedFace { tensor, crop })
}

/// Source pixels and weights contributing to each destination pixel along
/// one axis. Weights are overlap lengths divided by the scale, so each
/// destination pixel's weights sum to 1.
fn area_taps(src: u32, dst: u32) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = (start + scale).min(src as f64);
            let mut taps = Vec::new();
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src as usize {
                let overlap = end.min(s as f64 + 1.0) - start.max(s as f64);
                if overlap > 1e-9 {
                    taps.push((s, (overlap / scale) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

fn resize_area(image: &IntensityImage, width: u32, height: u32) -> IntensityImage {
    let (src_w, src_h) = image.dimensions();
    let (src_w, dst_w) = (src_w as usize, width as usize);
    let columns = area_taps(src_w as u32, width);
    let rows = area_taps(src_h, height);
    let src = image.as_raw();

    // Horizontal pass: src_h rows of dst_w values.
    let mut horizontal = vec![0f32; src_h as usize * dst_w];
    for (y, row) in src.chunks_exact(src_w).enumerate() {
        for (x, taps) in columns.iter().enumerate() {
            horizontal[y * dst_w + x] = taps.iter().map(|&(i, w)| row[i] * w).sum();
        }
    }

    let mut out = vec![0f32; height as usize * dst_w];
    for (y, taps) in rows.iter().enumerate() {
        for x in 0..dst_w {
            out[y * dst_w + x] = taps
                .iter()
                .map(|&(i, w)| horizontal[i * dst_w + x] * w)
                .sum();
        }
    }

    ImageBuffer::from_fn(width, height, |x, y| {
        Luma([out[y as usize * dst_w + x as usize]])
    })
}
