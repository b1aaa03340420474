//! Estimate the age of the person in a photo.
//!
//! Usage:
//!   faceage photo.jpg --cascade haarcascade_frontalface_default.xml --model age_model.onnx
//!   faceage photo.jpg --cascade ... --model ... --json
//!   faceage photo.jpg --cascade ... --model ... --save-crop face.png

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use faceage::{
    AgePipeline, AgeResult, CascadeDetector, DetectionParams, FaceBox, OnnxAgeEstimator,
    Orientation, RawImage, ResizeFilter, SelectionPolicy,
};
use log::{debug, error, info, LevelFilter};
use serde::Serialize;

const FAILURE_MESSAGE: &str = "Error: could not estimate age (run with --verbose for details)";

#[derive(Parser, Debug)]
#[command(name = "faceage")]
#[command(author, version, about = "Estimate a person's age from a photo", long_about = None)]
struct Args {
    /// Input image (JPEG, PNG, or WebP)
    image: PathBuf,

    /// OpenCV Haar cascade XML for face detection
    #[arg(long)]
    cascade: PathBuf,

    /// ONNX age model taking a (1, 200, 200, 1) float input
    #[arg(long)]
    model: PathBuf,

    /// Rotation needed to display the image upright; `auto` reads EXIF
    #[arg(long, value_enum, default_value_t = OrientationArg::Auto)]
    orientation: OrientationArg,

    /// Detector scale step between pyramid levels (> 1.0)
    #[arg(long, default_value_t = 1.1)]
    scale_factor: f64,

    /// Neighbouring hits a face needs to be kept
    #[arg(long, default_value_t = 3)]
    min_neighbors: u32,

    /// Smallest face searched for, in pixels
    #[arg(long, default_value_t = 200)]
    min_size: u32,

    /// Which face to use when several are found
    #[arg(long, value_enum, default_value_t = SelectionArg::First)]
    selection: SelectionArg,

    /// Resampling used to reach the model input size
    #[arg(long, value_enum, default_value_t = ResizeArg::Area)]
    resize: ResizeArg,

    /// Write the face crop to this path (format from the extension)
    #[arg(long)]
    save_crop: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OrientationArg {
    /// Read the EXIF orientation tag.
    Auto,
    Normal,
    #[value(name = "rotate90")]
    Rotate90,
    #[value(name = "rotate180")]
    Rotate180,
    #[value(name = "rotate270")]
    Rotate270,
    Undefined,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum SelectionArg {
    /// First face in detector order.
    First,
    /// Face with the largest area.
    Largest,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ResizeArg {
    /// Pixel-area averaging.
    Area,
    /// Linear interpolation.
    Bilinear,
}

fn to_orientation(arg: OrientationArg) -> Option<Orientation> {
    match arg {
        OrientationArg::Auto => None,
        OrientationArg::Normal => Some(Orientation::Normal),
        OrientationArg::Rotate90 => Some(Orientation::Rotate90),
        OrientationArg::Rotate180 => Some(Orientation::Rotate180),
        OrientationArg::Rotate270 => Some(Orientation::Rotate270),
        OrientationArg::Undefined => Some(Orientation::Undefined),
    }
}

fn to_selection(arg: SelectionArg) -> SelectionPolicy {
    match arg {
        SelectionArg::First => SelectionPolicy::First,
        SelectionArg::Largest => SelectionPolicy::Largest,
    }
}

fn to_resize(arg: ResizeArg) -> ResizeFilter {
    match arg {
        ResizeArg::Area => ResizeFilter::Area,
        ResizeArg::Bilinear => ResizeFilter::Bilinear,
    }
}

/// Output structure for JSON serialization
#[derive(Debug, Serialize, PartialEq)]
struct Report {
    image: String,
    face_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    face: Option<FaceOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    age: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crop: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
struct FaceOutput {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl From<FaceBox> for FaceOutput {
    fn from(face: FaceBox) -> Self {
        Self {
            x: face.x,
            y: face.y,
            width: face.width,
            height: face.height,
        }
    }
}

impl Report {
    fn new(image: &Path, result: &AgeResult, crop: Option<&Path>) -> Self {
        Self {
            image: image.display().to_string(),
            face_detected: result.face().is_some(),
            face: result.face().map(FaceOutput::from),
            age: result.age(),
            crop: crop.map(|p| p.display().to_string()),
        }
    }

    /// The line shown to a person reading the terminal.
    fn message(&self) -> String {
        match self.age {
            Some(age) => format!("Predicted age: {age}"),
            None => "No face detected".to_string(),
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args) {
        Ok(report) => {
            if args.json {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        error!("failed to serialize report: {e}");
                        eprintln!("{FAILURE_MESSAGE}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("{}", report.message());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("{FAILURE_MESSAGE}");
            ExitCode::FAILURE
        }
    }
}

fn build_pipeline(args: &Args) -> Result<AgePipeline> {
    let params = DetectionParams::default()
        .scale_factor(args.scale_factor)
        .min_neighbors(args.min_neighbors)
        .min_size(args.min_size);

    info!("loading face cascade from {}", args.cascade.display());
    let detector = CascadeDetector::from_path(&args.cascade, params)
        .with_context(|| format!("loading cascade {}", args.cascade.display()))?;

    info!("loading age model from {}", args.model.display());
    let estimator = OnnxAgeEstimator::from_path(&args.model)
        .with_context(|| format!("loading model {}", args.model.display()))?;

    Ok(AgePipeline::new(Arc::new(detector), Arc::new(estimator))
        .selection_policy(to_selection(args.selection))
        .resize_filter(to_resize(args.resize)))
}

fn run(args: &Args) -> Result<Report> {
    let pipeline = build_pipeline(args)?;

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;
    let raw = match to_orientation(args.orientation) {
        Some(orientation) => RawImage::new(bytes, orientation),
        None => RawImage::with_embedded_orientation(bytes),
    };
    debug!("orientation for {}: {:?}", args.image.display(), raw.orientation());

    let result = pipeline
        .estimate(&raw)
        .with_context(|| format!("estimating age for {}", args.image.display()))?;

    let mut saved = None;
    match (&result, &args.save_crop) {
        (AgeResult::FaceFound { crop, .. }, Some(path)) => {
            crop.save(path)
                .with_context(|| format!("writing crop to {}", path.display()))?;
            info!("face crop written to {}", path.display());
            saved = Some(path.as_path());
        }
        (AgeResult::NoFaceFound { .. }, Some(path)) => {
            info!("no face found; {} not written", path.display());
        }
        _ => {}
    }

    Ok(Report::new(&args.image, &result, saved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec![
            "faceage",
            "photo.jpg",
            "--cascade",
            "cascade.xml",
            "--model",
            "age.onnx",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_library_defaults() {
        let args = parse(&[]);
        let params = DetectionParams::default();
        assert_eq!(args.scale_factor, params.scale_factor);
        assert_eq!(args.min_neighbors, params.min_neighbors);
        assert_eq!(args.min_size, params.min_size);
        assert_eq!(to_selection(args.selection), SelectionPolicy::default());
        assert_eq!(to_resize(args.resize), ResizeFilter::default());
        assert_eq!(to_orientation(args.orientation), None);
        assert!(!args.json);
    }

    #[test]
    fn explicit_orientation_is_parsed() {
        let args = parse(&["--orientation", "rotate270"]);
        assert_eq!(to_orientation(args.orientation), Some(Orientation::Rotate270));
    }

    #[test]
    fn cascade_and_model_are_required() {
        assert!(Args::try_parse_from(["faceage", "photo.jpg"]).is_err());
        assert!(Args::try_parse_from(["faceage", "photo.jpg", "--cascade", "c.xml"]).is_err());
    }

    #[test]
    fn unknown_selection_is_rejected() {
        let argv = [
            "faceage", "photo.jpg", "--cascade", "c.xml", "--model", "m.onnx", "--selection",
            "random",
        ];
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn face_found_report() {
        let result = AgeResult::FaceFound {
            crop: DynamicImage::new_luma8(10, 10),
            face: FaceBox::new(4, 8, 10, 10),
            age: 37,
        };
        let report = Report::new(Path::new("photo.jpg"), &result, None);
        assert_eq!(report.message(), "Predicted age: 37");

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["face_detected"], true);
        assert_eq!(json["age"], 37);
        assert_eq!(json["face"]["x"], 4);
        assert!(json.get("crop").is_none());
    }

    #[test]
    fn no_face_report() {
        let result = AgeResult::NoFaceFound {
            image: DynamicImage::new_luma8(10, 10),
        };
        let report = Report::new(Path::new("photo.jpg"), &result, None);
        assert_eq!(report.message(), "No face detected");

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["face_detected"], false);
        assert!(json.get("age").is_none());
        assert!(json.get("face").is_none());
    }

    #[test]
    fn missing_artifacts_fail_without_panicking() {
        let args = parse(&[]);
        assert!(run(&args).is_err());
    }
}
