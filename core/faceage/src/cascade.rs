//! Haar cascade face detector reading OpenCV's XML cascade format.
//!
//! The detector follows the classic Viola-Jones scheme:
//!
//! 1. Build an image pyramid, one level per search scale.
//! 2. Slide the cascade's base window over each level using integral images.
//! 3. Reject a window as soon as one boosted stage scores below its threshold.
//! 4. Cluster the surviving windows and keep clusters with enough neighbours.
//!
//! Only upright HAAR features with BOOST stages are supported. That covers
//! the stock frontal-face cascades.

use std::io::Read;
use std::path::Path;

use image::imageops::FilterType;
use image::{GenericImageView, ImageBuffer, Luma};
use log::{debug, warn};

use crate::error::{FaceAgeError, Result};
use crate::face_detector::{DetectionParams, FaceBox, FaceDetector};

/// Relative tolerance used when clustering raw detections.
pub const GROUP_EPS: f64 = 0.2;

/// Stage thresholds are relaxed by this amount on load.
const THRESHOLD_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

impl HaarFeature {
    fn raw_value(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        self.rects
            .iter()
            .map(|r| r.weight * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

impl Tree {
    // Non-positive child indices address leaves: `-idx`.
    fn evaluate(&self, mut feature_value: impl FnMut(usize) -> f64) -> f64 {
        let mut idx = 0i32;
        loop {
            let node = &self.nodes[idx as usize];
            idx = if feature_value(node.feature) < node.threshold {
                node.left
            } else {
                node.right
            };
            if idx <= 0 {
                return self.leaves[idx.unsigned_abs() as usize];
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<Tree>,
}

/// A boosted Haar cascade loaded from OpenCV's XML format.
///
/// Load it once and share it: parsing a stock frontal-face cascade is far
/// more expensive than running it over a photo.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Parse a cascade from XML text.
    pub fn from_xml_str(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| load_error(format!("invalid cascade XML: {e}")))?;
        let cascade = doc
            .descendants()
            .find(|n| n.has_tag_name("cascade"))
            .ok_or_else(|| load_error("missing <cascade> element"))?;

        let stage_type = child_text(cascade, "stageType")?;
        if stage_type != "BOOST" {
            return Err(load_error(format!("unsupported stage type {stage_type}")));
        }
        let feature_type = child_text(cascade, "featureType")?;
        if feature_type != "HAAR" {
            return Err(load_error(format!(
                "unsupported feature type {feature_type}"
            )));
        }

        let window_width: u32 = parse_child(cascade, "width")?;
        let window_height: u32 = parse_child(cascade, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(load_error(format!(
                "cascade window {window_width}x{window_height} is too small"
            )));
        }

        let features = elements(child(cascade, "features")?)
            .enumerate()
            .map(|(idx, node)| parse_feature(node, idx, window_width, window_height))
            .collect::<Result<Vec<_>>>()?;

        let stages = elements(child(cascade, "stages")?)
            .enumerate()
            .map(|(idx, node)| parse_stage(node, idx, features.len()))
            .collect::<Result<Vec<_>>>()?;

        if stages.is_empty() {
            return Err(load_error("cascade has no stages"));
        }

        debug!(
            "loaded Haar cascade: {}x{} window, {} stages, {} features",
            window_width,
            window_height,
            stages.len(),
            features.len()
        );

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Read and parse a cascade file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path)
            .map_err(|e| load_error(format!("{}: {e}", path.display())))?;
        Self::from_xml_str(&xml)
    }

    /// Read and parse a cascade from any reader (e.g. an embedded resource).
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut xml = String::new();
        reader
            .read_to_string(&mut xml)
            .map_err(|e| load_error(format!("failed to read cascade: {e}")))?;
        Self::from_xml_str(&xml)
    }

    /// Size of the base detection window.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    /// Number of boosted stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Run every stage on the base window whose top-left corner is `(x, y)`.
    fn accepts(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        let (w, h) = (self.window_width, self.window_height);
        let area = ((w - 2) * (h - 2)) as f64;
        let sum = integral.sum(x + 1, y + 1, w - 2, h - 2) as f64;
        let squared = integral.squared_sum(x + 1, y + 1, w - 2, h - 2) as f64;
        let spread = area * squared - sum * sum;
        let norm = if spread > 0.0 { spread.sqrt() } else { 1.0 };
        let inv_norm = 1.0 / norm;

        self.stages.iter().all(|stage| {
            let score: f64 = stage
                .trees
                .iter()
                .map(|tree| {
                    tree.evaluate(|feature| {
                        self.features[feature].raw_value(integral, x, y) * inv_norm
                    })
                })
                .sum();
            score >= stage.threshold
        })
    }
}

/// Multi-scale sliding-window face detector over a [`HaarCascade`].
#[derive(Debug, Clone)]
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectionParams,
}

impl CascadeDetector {
    /// Create a detector, validating the parameters.
    pub fn new(cascade: HaarCascade, params: DetectionParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { cascade, params })
    }

    /// Load the cascade at `path` and create a detector.
    pub fn from_path<P: AsRef<Path>>(path: P, params: DetectionParams) -> Result<Self> {
        Self::new(HaarCascade::from_path(path)?, params)
    }

    /// Parameters in use.
    pub fn params(&self) -> &DetectionParams {
        &self.params
    }

    /// Ungrouped window hits in scan order: smallest scale first, then
    /// top-to-bottom, left-to-right.
    pub fn detect_candidates<I>(&self, image: &I) -> Vec<FaceBox>
    where
        I: GenericImageView<Pixel = Luma<u8>>,
    {
        let (img_w, img_h) = image.dimensions();
        let (base_w, base_h) = self.cascade.window_size();
        let min_size = self.params.min_size;
        let mut candidates = Vec::new();

        let mut factor = 1.0f64;
        loop {
            let win_w = (base_w as f64 * factor).round() as u32;
            let win_h = (base_h as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;

            if win_w > img_w || win_h > img_h || scaled_w <= base_w || scaled_h <= base_h {
                break;
            }

            if win_w >= min_size && win_h >= min_size {
                let integral = if scaled_w == img_w && scaled_h == img_h {
                    IntegralImage::new(image)
                } else {
                    let scaled = image::imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle);
                    IntegralImage::new(&scaled)
                };

                let step = if factor > 2.0 { 1 } else { 2 };
                let before = candidates.len();
                for y in (0..scaled_h - base_h).step_by(step) {
                    for x in (0..scaled_w - base_w).step_by(step) {
                        if self.cascade.accepts(&integral, x, y) {
                            candidates.push(FaceBox::new(
                                (x as f64 * factor).round() as u32,
                                (y as f64 * factor).round() as u32,
                                win_w,
                                win_h,
                            ));
                        }
                    }
                }
                debug!(
                    "scale {factor:.3}: {win_w}x{win_h} window, {} hits",
                    candidates.len() - before
                );
            }

            factor *= self.params.scale_factor;
        }

        candidates
    }

    /// Grouped detections for a grayscale image.
    pub fn detect_image<I>(&self, image: &I) -> Vec<FaceBox>
    where
        I: GenericImageView<Pixel = Luma<u8>>,
    {
        let (img_w, img_h) = image.dimensions();
        let candidates = self.detect_candidates(image);
        let grouped = group_rectangles(&candidates, self.params.min_neighbors, GROUP_EPS);
        debug!(
            "{} raw candidates grouped into {} faces",
            candidates.len(),
            grouped.len()
        );
        grouped
            .into_iter()
            .filter_map(|face| clip_to_image(face, img_w, img_h))
            .collect()
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<FaceBox> {
        let Some(view) = ImageBuffer::<Luma<u8>, &[u8]>::from_raw(width, height, gray) else {
            warn!(
                "grayscale buffer of {} bytes does not match {width}x{height}",
                gray.len()
            );
            return Vec::new();
        };
        self.detect_image(&view)
    }
}

/// Cluster overlapping detections.
///
/// Boxes are similar when every edge differs by at most
/// `eps * (min width + min height) / 2`. Each cluster is replaced by its
/// average box. Clusters with `min_neighbors` members or fewer are dropped,
/// as are clusters nested inside a better-supported one. Output order follows
/// each cluster's first member in `candidates`.
///
/// With `min_neighbors == 0` the candidates are returned unchanged.
pub fn group_rectangles(candidates: &[FaceBox], min_neighbors: u32, eps: f64) -> Vec<FaceBox> {
    if min_neighbors == 0 || candidates.is_empty() {
        return candidates.to_vec();
    }

    let labels = partition(candidates, |a, b| similar(a, b, eps));
    let classes = labels.iter().copied().max().map_or(0, |m| m + 1);

    let mut sums = vec![[0u64; 4]; classes];
    let mut counts = vec![0u32; classes];
    for (face, &label) in candidates.iter().zip(&labels) {
        let sum = &mut sums[label];
        sum[0] += face.x as u64;
        sum[1] += face.y as u64;
        sum[2] += face.width as u64;
        sum[3] += face.height as u64;
        counts[label] += 1;
    }

    let averaged: Vec<FaceBox> = sums
        .iter()
        .zip(&counts)
        .map(|(sum, &n)| {
            let avg = |v: u64| (v as f64 / n as f64).round() as u32;
            FaceBox::new(avg(sum[0]), avg(sum[1]), avg(sum[2]), avg(sum[3]))
        })
        .collect();

    let mut grouped = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            let (x1, y1, w1, h1) = signed(r1);
            let (x2, y2, w2, h2) = signed(r2);
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            grouped.push(*r1);
        }
    }
    grouped
}

fn signed(face: &FaceBox) -> (i64, i64, i64, i64) {
    (
        face.x as i64,
        face.y as i64,
        face.width as i64,
        face.height as i64,
    )
}

fn similar(a: &FaceBox, b: &FaceBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64) * 0.5;
    let (ax, ay, aw, ah) = signed(a);
    let (bx, by, bw, bh) = signed(b);
    ((ax - bx).abs() as f64) <= delta
        && ((ay - by).abs() as f64) <= delta
        && ((ax + aw - bx - bw).abs() as f64) <= delta
        && ((ay + ah - by - bh).abs() as f64) <= delta
}

/// Union-find labelling; labels are numbered by first appearance.
fn partition<T>(items: &[T], same: impl Fn(&T, &T) -> bool) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..items.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            if same(&items[i], &items[j]) {
                let ri = find(&mut parent, i);
                let rj = find(&mut parent, j);
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; items.len()];
    let mut next = 0;
    (0..items.len())
        .map(|i| {
            let root = find(&mut parent, i);
            if class_of_root[root] == usize::MAX {
                class_of_root[root] = next;
                next += 1;
            }
            class_of_root[root]
        })
        .collect()
}

fn clip_to_image(face: FaceBox, width: u32, height: u32) -> Option<FaceBox> {
    if face.x >= width || face.y >= height {
        return None;
    }
    let clipped = FaceBox::new(
        face.x,
        face.y,
        face.width.min(width - face.x),
        face.height.min(height - face.y),
    );
    (clipped.width > 0 && clipped.height > 0).then_some(clipped)
}

/// Summed-area tables of pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sums: Vec<u64>,
    squares: Vec<u64>,
}

impl IntegralImage {
    fn new<I>(image: &I) -> Self
    where
        I: GenericImageView<Pixel = Luma<u8>>,
    {
        let (width, height) = image.dimensions();
        let stride = width as usize + 1;
        let len = stride * (height as usize + 1);
        let mut sums = vec![0u64; len];
        let mut squares = vec![0u64; len];

        for y in 0..height {
            let mut row_sum = 0u64;
            let mut row_squares = 0u64;
            for x in 0..width {
                let v = image.get_pixel(x, y).0[0] as u64;
                row_sum += v;
                row_squares += v * v;
                let idx = (y as usize + 1) * stride + x as usize + 1;
                sums[idx] = sums[idx - stride] + row_sum;
                squares[idx] = squares[idx - stride] + row_squares;
            }
        }

        Self {
            stride,
            sums,
            squares,
        }
    }

    fn sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        Self::rect(&self.sums, self.stride, x, y, width, height)
    }

    fn squared_sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        Self::rect(&self.squares, self.stride, x, y, width, height)
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, width: u32, height: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + width as usize, y0 + height as usize);
        (table[y1 * stride + x1] + table[y0 * stride + x0])
            - (table[y0 * stride + x1] + table[y1 * stride + x0])
    }
}

fn load_error(message: impl Into<String>) -> FaceAgeError {
    FaceAgeError::ModelLoadError(message.into())
}

fn elements<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> impl Iterator<Item = roxmltree::Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn find_child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Result<roxmltree::Node<'a, 'input>> {
    find_child(node, name).ok_or_else(|| load_error(format!("missing <{name}> element")))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Result<&'a str> {
    Ok(child(node, name)?.text().unwrap_or_default().trim())
}

fn parse_child<T: std::str::FromStr>(node: roxmltree::Node<'_, '_>, name: &str) -> Result<T> {
    let text = child_text(node, name)?;
    text.parse()
        .map_err(|_| load_error(format!("<{name}> is not a valid number: {text:?}")))
}

fn numbers(node: roxmltree::Node<'_, '_>, name: &str) -> Result<Vec<f64>> {
    child_text(node, name)?
        .split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| load_error(format!("<{name}> contains {token:?}")))
        })
        .collect()
}

fn parse_feature(
    node: roxmltree::Node<'_, '_>,
    idx: usize,
    window_width: u32,
    window_height: u32,
) -> Result<HaarFeature> {
    if let Some(tilted) = find_child(node, "tilted") {
        if tilted.text().map(str::trim).unwrap_or("0") != "0" {
            return Err(load_error(format!("feature {idx}: tilted features are not supported")));
        }
    }

    let rects = elements(child(node, "rects")?)
        .map(|rect| {
            let values: Vec<f64> = rect
                .text()
                .unwrap_or_default()
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| load_error(format!("feature {idx}: malformed rect")))?;
            let &[x, y, width, height, weight] = values.as_slice() else {
                return Err(load_error(format!("feature {idx}: rect needs 5 values")));
            };
            if !(x >= 0.0 && y >= 0.0 && width > 0.0 && height > 0.0) {
                return Err(load_error(format!("feature {idx}: negative rect")));
            }
            // Bounds are checked before the integer cast so huge values cannot wrap.
            if x + width > window_width as f64 || y + height > window_height as f64 {
                return Err(load_error(format!("feature {idx}: rect outside window")));
            }
            let rect = WeightedRect {
                x: x as u32,
                y: y as u32,
                width: width as u32,
                height: height as u32,
                weight,
            };
            Ok(rect)
        })
        .collect::<Result<Vec<_>>>()?;

    if rects.is_empty() {
        return Err(load_error(format!("feature {idx}: no rects")));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(node: roxmltree::Node<'_, '_>, idx: usize, feature_count: usize) -> Result<Stage> {
    let threshold: f64 = parse_child(node, "stageThreshold")?;
    let trees = elements(child(node, "weakClassifiers")?)
        .map(|weak| parse_tree(weak, idx, feature_count))
        .collect::<Result<Vec<_>>>()?;
    if trees.is_empty() {
        return Err(load_error(format!("stage {idx}: no weak classifiers")));
    }
    Ok(Stage {
        threshold: threshold - THRESHOLD_EPS,
        trees,
    })
}

fn parse_tree(node: roxmltree::Node<'_, '_>, stage: usize, feature_count: usize) -> Result<Tree> {
    let raw = numbers(node, "internalNodes")?;
    let leaves = numbers(node, "leafValues")?;
    let bad = |what: &str| load_error(format!("stage {stage}: {what}"));

    if raw.is_empty() || raw.len() % 4 != 0 {
        return Err(bad("internal nodes must come in groups of 4"));
    }

    let count = raw.len() / 4;
    let mut nodes = Vec::with_capacity(count);
    for (i, chunk) in raw.chunks_exact(4).enumerate() {
        let node = Node {
            left: chunk[0] as i32,
            right: chunk[1] as i32,
            feature: chunk[2] as usize,
            threshold: chunk[3],
        };
        if chunk[2] < 0.0 || node.feature >= feature_count {
            return Err(bad("feature index out of range"));
        }
        for next in [node.left, node.right] {
            let valid = if next > 0 {
                (next as usize) > i && (next as usize) < count
            } else {
                (next.unsigned_abs() as usize) < leaves.len()
            };
            if !valid {
                return Err(bad("tree child index out of range"));
            }
        }
        nodes.push(node);
    }

    Ok(Tree { nodes, leaves })
}
