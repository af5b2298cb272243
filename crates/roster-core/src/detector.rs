//! Face detection: SCRFD backends via ONNX Runtime behind a fallback cascade.
//!
//! Each backend implements SCRFD (Sample and Computation Redistribution for
//! Efficient Face Detection) with 3-stride anchor-free decoding and NMS.
//! [`FaceDetector`] tries backends in priority order and keeps only
//! high-confidence detections, cropped with a context margin.

use crate::types::{BoundingBox, DetectedFace, FaceBox, FaceId};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
/// Raw anchor score below which candidates are not decoded.
const SCRFD_SCORE_FLOOR: f32 = 0.5;
const SCRFD_NMS_IOU: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Detections at or below this confidence are discarded.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.95;
/// Margin added around each face box before cropping, as a percentage of its size.
pub const DEFAULT_EXPAND_PERCENTAGE: u32 = 15;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face detection algorithm producing raw boxes for an RGB image.
pub trait DetectorBackend: Send {
    fn name(&self) -> &str;
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// What one backend produced for one image, after confidence filtering.
#[derive(Debug)]
pub enum BackendOutcome {
    Faces(Vec<BoundingBox>),
    Empty,
    Failed(DetectorError),
}

/// Run one backend and classify its result.
pub fn run_backend(
    backend: &mut dyn DetectorBackend,
    image: &RgbImage,
    min_confidence: f32,
) -> BackendOutcome {
    match backend.detect(image) {
        Ok(boxes) => {
            let kept: Vec<BoundingBox> = boxes
                .into_iter()
                .filter(|b| b.confidence > min_confidence && b.is_finite())
                .collect();
            if kept.is_empty() {
                BackendOutcome::Empty
            } else {
                BackendOutcome::Faces(kept)
            }
        }
        Err(e) => BackendOutcome::Failed(e),
    }
}

/// Prioritized cascade of detector backends.
pub struct FaceDetector {
    backends: Vec<Box<dyn DetectorBackend>>,
    min_confidence: f32,
    expand_percentage: u32,
}

impl FaceDetector {
    pub fn new(backends: Vec<Box<dyn DetectorBackend>>) -> Self {
        Self {
            backends,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            expand_percentage: DEFAULT_EXPAND_PERCENTAGE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_expand_percentage(mut self, expand_percentage: u32) -> Self {
        self.expand_percentage = expand_percentage;
        self
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Detect every face in `image`.
    ///
    /// The first backend that yields at least one detection above the
    /// confidence floor wins; failures and empty results fall through to the
    /// next backend. Returns an empty list when no backend finds a face.
    pub fn detect(&mut self, image: &RgbImage) -> Vec<DetectedFace> {
        let (width, height) = image.dimensions();

        for backend in self.backends.iter_mut() {
            let boxes = match run_backend(backend.as_mut(), image, self.min_confidence) {
                BackendOutcome::Faces(boxes) => boxes,
                BackendOutcome::Empty => {
                    tracing::debug!(backend = backend.name(), "no confident faces, trying next backend");
                    continue;
                }
                BackendOutcome::Failed(err) => {
                    tracing::warn!(backend = backend.name(), error = %err, "detector backend failed");
                    continue;
                }
            };

            let faces: Vec<DetectedFace> = boxes
                .iter()
                .filter_map(|b| FaceBox::expanded(b, self.expand_percentage, width, height).map(|a| (a, b.confidence)))
                .enumerate()
                .map(|(ordinal, (area, confidence))| DetectedFace {
                    id: FaceId::new(ordinal, &area),
                    crop: imageops::crop_imm(image, area.x, area.y, area.w, area.h).to_image(),
                    area,
                    confidence,
                })
                .collect();

            if faces.is_empty() {
                continue;
            }

            tracing::info!(backend = backend.name(), count = faces.len(), "faces detected");
            return faces;
        }

        Vec::new()
    }
}

/// Where an image landed inside the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Fit a `width`×`height` image into a `size`×`size` input, centred.
    fn fit(width: usize, height: usize, size: usize) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let pad_x = ((size as f32 - (width as f32 * scale).round()) / 2.0).max(0.0);
        let pad_y = ((size as f32 - (height as f32 * scale).round()) / 2.0).max(0.0);
        Self { scale, pad_x, pad_y }
    }

    /// Model-input coordinates back to source-image coordinates.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHeads {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw head outputs for one stride level of a single image.
struct LevelOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

/// SCRFD detector backend over one ONNX model file.
pub struct ScrfdBackend {
    name: String,
    session: Session,
    heads: [StrideHeads; 3],
}

impl ScrfdBackend {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if outputs.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "expected 9 SCRFD outputs (score, bbox and kps per stride), found {}",
                outputs.len()
            )));
        }
        let heads = map_output_heads(&outputs);

        let name = Path::new(model_path)
            .file_stem()
            .map(|s| format!("scrfd:{}", s.to_string_lossy()))
            .unwrap_or_else(|| "scrfd".to_string());

        tracing::info!(path = model_path, backend = %name, outputs = ?outputs, heads = ?heads, "detector backend loaded");
        Ok(Self { name, session, heads })
    }

    /// Letterbox `image` into a normalized 1×3×640×640 tensor.
    fn input_tensor(image: &RgbImage) -> (Array4<f32>, Letterbox) {
        let letterbox = Letterbox::fit(image.width() as usize, image.height() as usize, SCRFD_INPUT_SIZE);
        let fitted_w = ((image.width() as f32 * letterbox.scale).round() as u32).max(1);
        let fitted_h = ((image.height() as f32 * letterbox.scale).round() as u32).max(1);
        let fitted = imageops::resize(image, fitted_w, fitted_h, FilterType::Triangle);

        let (left, top) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        // Zero is the normalized value of the padding colour.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        for (x, y, px) in fitted.enumerate_pixels() {
            let (tx, ty) = (left + x as usize, top + y as usize);
            if tx < SCRFD_INPUT_SIZE && ty < SCRFD_INPUT_SIZE {
                for c in 0..3 {
                    tensor[[0, c, ty, tx]] = (px[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }
        (tensor, letterbox)
    }
}

impl DetectorBackend for ScrfdBackend {
    fn name(&self) -> &str {
        &self.name
    }

    /// Boxes in source-image coordinates, most confident first.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = Self::input_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let extract = |index: usize, what: &str, stride: usize| {
            outputs[index]
                .try_extract_tensor::<f32>()
                .map(|(_, data)| data)
                .map_err(|e| DetectorError::InferenceFailed(format!("{what} head, stride {stride}: {e}")))
        };

        let mut candidates = Vec::new();
        for (heads, stride) in self.heads.iter().zip(SCRFD_STRIDES) {
            let level = LevelOutputs {
                stride,
                scores: extract(heads.score, "score", stride)?,
                boxes: extract(heads.bbox, "bbox", stride)?,
                landmarks: extract(heads.kps, "kps", stride)?,
            };
            candidates.extend(decode_level(&level, &letterbox, SCRFD_SCORE_FLOOR));
        }

        Ok(suppress_overlaps(candidates, SCRFD_NMS_IOU))
    }
}

/// Locate the score/bbox/kps output for each stride.
///
/// Models exported with `score_8`-style names are matched by name; anything
/// else is assumed to use the stock layout of three score heads, then three
/// bbox heads, then three landmark heads.
fn map_output_heads(names: &[String]) -> [StrideHeads; 3] {
    let position = |head: &str, stride: usize| names.iter().position(|n| *n == format!("{head}_{stride}"));
    let by_name = |stride: usize| -> Option<StrideHeads> {
        Some(StrideHeads {
            score: position("score", stride)?,
            bbox: position("bbox", stride)?,
            kps: position("kps", stride)?,
        })
    };

    match (by_name(8), by_name(16), by_name(32)) {
        (Some(a), Some(b), Some(c)) => [a, b, c],
        _ => {
            tracing::debug!(?names, "unrecognised SCRFD output names; assuming stock ordering");
            [0, 1, 2].map(|i| StrideHeads { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Turn one stride level's anchor outputs into boxes above `floor`.
///
/// Anchors are laid out row-major over the stride grid, two per cell. Box
/// outputs are left/top/right/bottom distances from the cell origin in units
/// of the stride; landmark outputs are five (dx, dy) offsets in the same units.
fn decode_level(level: &LevelOutputs<'_>, letterbox: &Letterbox, floor: f32) -> Vec<BoundingBox> {
    let stride = level.stride as f32;
    let columns = SCRFD_INPUT_SIZE / level.stride;

    level
        .scores
        .iter()
        .enumerate()
        .filter(|(_, &score)| score > floor)
        .filter_map(|(anchor, &score)| {
            let cell = anchor / SCRFD_ANCHORS_PER_CELL;
            let origin_x = (cell % columns) as f32 * stride;
            let origin_y = (cell / columns) as f32 * stride;

            let d = level.boxes.get(anchor * 4..anchor * 4 + 4)?;
            let (left, top) = letterbox.unmap(origin_x - d[0] * stride, origin_y - d[1] * stride);
            let (right, bottom) = letterbox.unmap(origin_x + d[2] * stride, origin_y + d[3] * stride);

            let landmarks = level.landmarks.get(anchor * 10..anchor * 10 + 10).map(|k| {
                let mut points = [(0.0f32, 0.0f32); 5];
                for (i, point) in points.iter_mut().enumerate() {
                    *point = letterbox.unmap(origin_x + k[2 * i] * stride, origin_y + k[2 * i + 1] * stride);
                }
                points
            });

            Some(BoundingBox {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by confidence, highest first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, max_iou: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| intersection_over_union(k, &candidate) <= max_iou) {
            kept.push(candidate);
        }
    }
    kept
}

fn intersection_over_union(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let intersection = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
