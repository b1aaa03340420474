//! Run the Haar cascade on images and print every raw and grouped box.
//!
//! Usage:
//!   cargo run --example debug_face_detection -- <cascade.xml> <image>...

use faceage::cascade::GROUP_EPS;
use faceage::{group_rectangles, CascadeDetector, DetectionParams, Orientation, RawImage, SelectionPolicy};

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(cascade_path) = args.next() else {
        eprintln!("usage: debug_face_detection <cascade.xml> <image>...");
        std::process::exit(2);
    };
    let params = DetectionParams::default();
    let detector = CascadeDetector::from_path(&cascade_path, params).expect("failed to load cascade");

    for path in args {
        let input = std::fs::read(&path).unwrap();
        let raw = RawImage::with_embedded_orientation(input);
        let image = faceage::decode_oriented(&raw).unwrap();
        let gray = image.to_luma8();
        let (width, height) = gray.dimensions();

        println!("=== {path} ({width}x{height}, {:?}) ===", raw.orientation());
        if raw.orientation() == Orientation::Undefined {
            println!("  orientation tag ignored (mirrored or unknown)");
        }

        let candidates = detector.detect_candidates(&gray);
        println!("  {} raw window hit(s)", candidates.len());

        for neighbors in [0, 1, 3, 5] {
            let grouped = group_rectangles(&candidates, neighbors, GROUP_EPS);
            println!("  min_neighbors={neighbors}: {} group(s)", grouped.len());
        }

        let faces = detector.detect_image(&gray);
        if faces.is_empty() {
            println!("  NO FACES DETECTED");
            continue;
        }
        for (i, face) in faces.iter().enumerate() {
            println!("    face {i}: {face}, area={}", face.area());
        }
        if let Some(first) = SelectionPolicy::First.select(&faces) {
            println!("  first: {first}");
        }
        if let Some(largest) = SelectionPolicy::Largest.select(&faces) {
            println!("  largest: {largest}");
        }
    }
}
