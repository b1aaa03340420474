use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use faceage::{
    AgeEstimator, AgePipeline, AgeResult, CascadeDetector, DetectionParams, FaceAgeError, FaceBox,
    FaceDetector, FaceTensor, Orientation, RawImage, ResizeFilter, SelectionPolicy,
};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage};

fn make_test_png(width: u32, height: u32) -> Vec<u8> {
    let mut img = RgbImage::new(width, height);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ]);
    }
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn make_gray_png(width: u32, height: u32, value: u8) -> Vec<u8> {
    let img = GrayImage::from_pixel(width, height, Luma([value]));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

fn make_test_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 150, 100]));
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, 90)
        .encode_image(&img)
        .unwrap();
    buffer
}

/// Insert a big-endian EXIF APP1 segment carrying one Orientation entry
/// right after the JPEG SOI marker.
fn with_exif_orientation(jpeg: &[u8], orientation: u16) -> Vec<u8> {
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    let mut tiff = Vec::new();
    tiff.extend_from_slice(b"MM\x00\x2A\x00\x00\x00\x08");
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0112u16.to_be_bytes());
    tiff.extend_from_slice(&3u16.to_be_bytes());
    tiff.extend_from_slice(&1u32.to_be_bytes());
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0, 0]);
    tiff.extend_from_slice(&0u32.to_be_bytes());

    let mut payload = b"Exif\x00\x00".to_vec();
    payload.extend_from_slice(&tiff);

    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

/// Mock face detector for integration tests.
struct MockDetector {
    faces: Vec<FaceBox>,
    seen: Mutex<Vec<(u32, u32)>>,
}

impl MockDetector {
    fn with_faces(faces: Vec<FaceBox>) -> Self {
        Self {
            faces,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn none() -> Self {
        Self::with_faces(Vec::new())
    }
}

impl FaceDetector for MockDetector {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox> {
        assert_eq!(gray.len(), (width * height) as usize);
        self.seen.lock().unwrap().push((width, height));
        self.faces.clone()
    }
}

/// Stub model returning a fixed value and remembering what it was fed.
struct StubEstimator {
    output: f32,
    calls: AtomicUsize,
    last_input: Mutex<Option<FaceTensor>>,
}

impl StubEstimator {
    fn returning(output: f32) -> Self {
        Self {
            output,
            calls: AtomicUsize::new(0),
            last_input: Mutex::new(None),
        }
    }
}

impl AgeEstimator for StubEstimator {
    fn predict(&self, tensor: &FaceTensor) -> faceage::Result<f32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock().unwrap() = Some(tensor.clone());
        Ok(self.output)
    }
}

#[test]
fn mid_gray_crop_with_low_output_is_age_zero() {
    let estimator = Arc::new(StubEstimator::returning(0.35));
    let pipeline = AgePipeline::new(
        Arc::new(MockDetector::with_faces(vec![FaceBox::new(0, 0, 200, 200)])),
        estimator.clone(),
    );

    let result = pipeline
        .estimate(&RawImage::new(make_gray_png(200, 200, 128), Orientation::Normal))
        .unwrap();
    assert_eq!(result.age(), Some(0));

    let tensor = estimator.last_input.lock().unwrap().take().unwrap();
    assert_eq!(tensor.shape(), [1, 200, 200, 1]);
    let expected = 128.0 / 255.0;
    assert!(tensor
        .as_slice()
        .iter()
        .all(|v| (v - expected).abs() < 1e-5));
}

#[test]
fn rounding_boundaries_through_the_pipeline() {
    for (output, age) in [(0.5, 1), (0.49, 0), (29.5, 30), (71.2, 71)] {
        let pipeline = AgePipeline::new(
            Arc::new(MockDetector::with_faces(vec![FaceBox::new(0, 0, 50, 50)])),
            Arc::new(StubEstimator::returning(output)),
        );
        let result = pipeline
            .estimate(&RawImage::new(make_test_png(50, 50), Orientation::Normal))
            .unwrap();
        assert_eq!(result.age(), Some(age), "model output {output}");
    }
}

#[test]
fn no_face_returns_oriented_original_and_skips_model() {
    let input = make_test_png(60, 40);
    let estimator = Arc::new(StubEstimator::returning(30.0));
    let pipeline = AgePipeline::new(Arc::new(MockDetector::none()), estimator.clone());

    let result = pipeline
        .estimate(&RawImage::new(input.clone(), Orientation::Rotate90))
        .unwrap();

    let expected = image::load_from_memory(&input).unwrap().rotate90();
    match result {
        AgeResult::NoFaceFound { image } => {
            assert_eq!(image.to_rgb8(), expected.to_rgb8());
        }
        other => panic!("expected NoFaceFound, got {other:?}"),
    }
    assert_eq!(estimator.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn two_faces_yield_one_result_for_the_first() {
    let first = FaceBox::new(5, 5, 30, 30);
    let second = FaceBox::new(60, 20, 100, 100);
    let estimator = Arc::new(StubEstimator::returning(40.0));
    let pipeline = AgePipeline::new(
        Arc::new(MockDetector::with_faces(vec![first, second])),
        estimator.clone(),
    );

    let result = pipeline
        .estimate(&RawImage::new(make_test_png(200, 150), Orientation::Normal))
        .unwrap();

    match result {
        AgeResult::FaceFound { crop, face, age } => {
            assert_eq!(face, first);
            assert_eq!((crop.width(), crop.height()), (30, 30));
            assert_eq!(age, 40);
        }
        other => panic!("expected FaceFound, got {other:?}"),
    }
    assert_eq!(estimator.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn detector_sees_the_rotated_image() {
    let detector = Arc::new(MockDetector::none());
    let pipeline = AgePipeline::new(detector.clone(), Arc::new(StubEstimator::returning(0.0)));

    for orientation in [
        Orientation::Normal,
        Orientation::Rotate90,
        Orientation::Rotate180,
        Orientation::Rotate270,
        Orientation::Undefined,
    ] {
        pipeline
            .estimate(&RawImage::new(make_test_png(60, 40), orientation))
            .unwrap();
    }

    assert_eq!(
        *detector.seen.lock().unwrap(),
        vec![(60, 40), (40, 60), (60, 40), (40, 60), (60, 40)]
    );
}

#[test]
fn embedded_exif_orientation_is_honoured() {
    let jpeg = with_exif_orientation(&make_test_jpeg(60, 40), 6);
    let raw = RawImage::with_embedded_orientation(jpeg);
    assert_eq!(raw.orientation(), Orientation::Rotate90);

    let pipeline = AgePipeline::new(
        Arc::new(MockDetector::none()),
        Arc::new(StubEstimator::returning(0.0)),
    );
    match pipeline.estimate(&raw).unwrap() {
        AgeResult::NoFaceFound { image } => {
            assert_eq!((image.width(), image.height()), (40, 60));
        }
        other => panic!("expected NoFaceFound, got {other:?}"),
    }
}

#[test]
fn png_without_exif_is_upright() {
    let raw = RawImage::with_embedded_orientation(make_test_png(30, 20));
    assert_eq!(raw.orientation(), Orientation::Normal);
}

#[test]
fn mirrored_exif_orientation_is_undefined() {
    let jpeg = with_exif_orientation(&make_test_jpeg(60, 40), 2);
    assert_eq!(
        RawImage::with_embedded_orientation(jpeg).orientation(),
        Orientation::Undefined
    );
}

#[test]
fn truncated_image_is_a_decode_error() {
    let mut png = make_test_png(40, 40);
    png.truncate(png.len() / 3);
    let pipeline = AgePipeline::new(
        Arc::new(MockDetector::none()),
        Arc::new(StubEstimator::returning(0.0)),
    );
    let result = pipeline.estimate(&RawImage::new(png, Orientation::Normal));
    assert!(matches!(result, Err(FaceAgeError::DecodeError(_))));
}

#[test]
fn resize_is_deterministic_for_both_filters() {
    for filter in [ResizeFilter::Area, ResizeFilter::Bilinear] {
        let estimator = Arc::new(StubEstimator::returning(10.0));
        let pipeline = AgePipeline::new(
            Arc::new(MockDetector::with_faces(vec![FaceBox::new(13, 7, 123, 91)])),
            estimator.clone(),
        )
        .resize_filter(filter);
        let raw = RawImage::new(make_test_png(180, 140), Orientation::Normal);

        pipeline.estimate(&raw).unwrap();
        let first = estimator.last_input.lock().unwrap().take().unwrap();
        pipeline.estimate(&raw).unwrap();
        let second = estimator.last_input.lock().unwrap().take().unwrap();

        assert_eq!(first.as_slice(), second.as_slice());
        assert!(first.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
    }
}

#[test]
fn largest_selection_is_opt_in() {
    let small = FaceBox::new(0, 0, 20, 20);
    let large = FaceBox::new(40, 40, 80, 80);
    let detector = Arc::new(MockDetector::with_faces(vec![small, large]));
    let estimator = Arc::new(StubEstimator::returning(33.0));
    let raw = RawImage::new(make_test_png(160, 160), Orientation::Normal);

    let default = AgePipeline::new(detector.clone(), estimator.clone());
    assert_eq!(default.estimate(&raw).unwrap().face(), Some(small));

    let largest = default.selection_policy(SelectionPolicy::Largest);
    assert_eq!(largest.estimate(&raw).unwrap().face(), Some(large));
}

/// One-stage 6x6 cascade firing where the top half of the window is
/// brighter than the bottom half.
const EDGE_CASCADE: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>6</height>
  <width>6</width>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 5.0000000000000003e-02</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          0 0 6 6 -1.</_>
        <_>
          0 0 6 3 2.</_></rects></_></features></cascade>
</opencv_storage>
"#;

#[test]
fn cascade_detector_loaded_from_disk_drives_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge_cascade.xml");
    std::fs::write(&path, EDGE_CASCADE).unwrap();

    let params = DetectionParams::default()
        .scale_factor(10.0)
        .min_size(6)
        .min_neighbors(0);
    let detector = CascadeDetector::from_path(&path, params).unwrap();

    let edge = GrayImage::from_fn(40, 40, |_, y| Luma([if y < 20 { 255 } else { 0 }]));
    let mut png = Cursor::new(Vec::new());
    edge.write_to(&mut png, ImageFormat::Png).unwrap();

    let pipeline = AgePipeline::new(Arc::new(detector), Arc::new(StubEstimator::returning(18.4)));
    let result = pipeline
        .estimate(&RawImage::new(png.into_inner(), Orientation::Normal))
        .unwrap();

    match result {
        AgeResult::FaceFound { face, age, .. } => {
            assert_eq!(face, FaceBox::new(0, 16, 6, 6));
            assert_eq!(age, 18);
        }
        other => panic!("expected FaceFound, got {other:?}"),
    }
}

#[test]
fn cascade_finds_nothing_on_a_flat_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge_cascade.xml");
    std::fs::write(&path, EDGE_CASCADE).unwrap();
    let detector = CascadeDetector::from_path(
        &path,
        DetectionParams::default().min_size(6).min_neighbors(0),
    )
    .unwrap();

    let pipeline = AgePipeline::new(Arc::new(detector), Arc::new(StubEstimator::returning(18.0)));
    let result = pipeline
        .estimate(&RawImage::new(make_gray_png(64, 64, 90), Orientation::Normal))
        .unwrap();
    assert!(matches!(result, AgeResult::NoFaceFound { .. }));
}

#[test]
fn invalid_detection_params_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edge_cascade.xml");
    std::fs::write(&path, EDGE_CASCADE).unwrap();

    assert!(matches!(
        CascadeDetector::from_path(&path, DetectionParams::default().scale_factor(1.0)),
        Err(FaceAgeError::InvalidScaleFactor(_))
    ));
    assert!(matches!(
        CascadeDetector::from_path(&path, DetectionParams::default().min_size(0)),
        Err(FaceAgeError::InvalidMinSize)
    ));
}

#[cfg(feature = "onnx")]
#[test]
fn missing_onnx_model_is_a_load_error() {
    let result = faceage::OnnxAgeEstimator::from_path("/nonexistent/age_model.onnx");
    assert!(matches!(result, Err(FaceAgeError::ModelLoadError(_))));
}
