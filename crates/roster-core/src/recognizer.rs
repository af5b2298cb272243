//! Face embedding extraction via ONNX Runtime.
//!
//! Each recognition model is an ONNX export with its own input geometry and
//! pixel normalization. Faces arrive already detected and cropped; the
//! extractor only resizes, normalizes, runs inference and L2-normalizes.

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unknown recognition model: {0}")]
    UnknownModel(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A face recognition model: cropped face in, embedding out.
pub trait EmbeddingModel: Send {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// Run `model` on `face`, logging and swallowing any failure.
pub fn extract(model: &mut dyn EmbeddingModel, name: &str, face: &RgbImage) -> Option<Embedding> {
    match model.embed(face) {
        Ok(mut embedding) => {
            embedding.model = Some(name.to_string());
            Some(embedding)
        }
        Err(e) => {
            tracing::warn!(model = name, error = %e, "embedding extraction failed");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// [1, 3, H, W], as in PyTorch and insightface exports.
    Nchw,
    /// [1, H, W, 3], as in Keras exports.
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// `(pixel - mean[c]) / std`, with `mean` given in the model's channel order.
    Affine { mean: [f32; 3], std: f32 },
    /// Per-image standardization: subtract the crop mean, divide by its std deviation.
    Standardize,
}

/// Input geometry and pixel normalization for one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocessing {
    pub width: u32,
    pub height: u32,
    pub layout: TensorLayout,
    pub channels: ChannelOrder,
    pub normalization: Normalization,
}

impl Preprocessing {
    /// Resize `face` and pack it into a float tensor for inference.
    pub fn tensor(&self, face: &RgbImage) -> Array4<f32> {
        let (w, h) = (self.width as usize, self.height as usize);
        let resized = imageops::resize(face, self.width, self.height, FilterType::Triangle);

        let (mean, std) = match self.normalization {
            Normalization::Affine { mean, std } => (mean, std),
            Normalization::Standardize => {
                let (m, s) = pixel_stats(&resized);
                ([m; 3], s)
            }
        };

        let mut tensor = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
        };

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                let src = match self.channels {
                    ChannelOrder::Rgb => c,
                    ChannelOrder::Bgr => 2 - c,
                };
                let value = (pixel[src] as f32 - mean[c]) / std;
                match self.layout {
                    TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                    TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
                }
            }
        }

        tensor
    }
}

/// Mean and (floored) standard deviation over every channel value.
fn pixel_stats(image: &RgbImage) -> (f32, f32) {
    let raw = image.as_raw();
    if raw.is_empty() {
        return (0.0, 1.0);
    }
    let n = raw.len() as f32;
    let mean = raw.iter().map(|&v| v as f32).sum::<f32>() / n;
    let variance = raw.iter().map(|&v| (v as f32 - mean).powi(2)).sum::<f32>() / n;
    // Floor at 1/sqrt(N) so a flat crop does not divide by zero.
    (mean, variance.sqrt().max(1.0 / n.sqrt()))
}

/// The recognition models this deployment knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    ArcFace,
    Facenet,
    Facenet512,
    #[serde(rename = "VGG-Face")]
    VggFace,
    DeepFace,
    SFace,
}

impl ModelKind {
    pub const ALL: [ModelKind; 6] = [
        ModelKind::ArcFace,
        ModelKind::Facenet,
        ModelKind::Facenet512,
        ModelKind::VggFace,
        ModelKind::DeepFace,
        ModelKind::SFace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::ArcFace => "ArcFace",
            ModelKind::Facenet => "Facenet",
            ModelKind::Facenet512 => "Facenet512",
            ModelKind::VggFace => "VGG-Face",
            ModelKind::DeepFace => "DeepFace",
            ModelKind::SFace => "SFace",
        }
    }

    /// ONNX file expected in the model directory.
    pub fn file_name(self) -> &'static str {
        match self {
            ModelKind::ArcFace => "arcface_w600k_r50.onnx",
            ModelKind::Facenet => "facenet128.onnx",
            ModelKind::Facenet512 => "facenet512.onnx",
            ModelKind::VggFace => "vgg_face.onnx",
            ModelKind::DeepFace => "deepface.onnx",
            ModelKind::SFace => "face_recognition_sface_2021dec.onnx",
        }
    }

    /// Cosine similarity a candidate must exceed to earn this model's vote.
    pub fn default_threshold(self) -> f32 {
        match self {
            ModelKind::ArcFace => 0.35,
            ModelKind::Facenet => 0.40,
            ModelKind::Facenet512 => 0.30,
            ModelKind::VggFace => 0.50,
            ModelKind::DeepFace => 0.35,
            ModelKind::SFace => 0.30,
        }
    }

    pub fn default_enabled(self) -> bool {
        // VGG-Face trails the others on accuracy.
        !matches!(self, ModelKind::VggFace)
    }

    pub fn embedding_dim(self) -> usize {
        match self {
            ModelKind::ArcFace | ModelKind::Facenet512 => 512,
            ModelKind::Facenet | ModelKind::SFace => 128,
            ModelKind::VggFace | ModelKind::DeepFace => 4096,
        }
    }

    pub fn preprocessing(self) -> Preprocessing {
        match self {
            ModelKind::ArcFace => Preprocessing {
                width: 112,
                height: 112,
                layout: TensorLayout::Nchw,
                channels: ChannelOrder::Rgb,
                normalization: Normalization::Affine { mean: [127.5; 3], std: 127.5 },
            },
            ModelKind::Facenet | ModelKind::Facenet512 => Preprocessing {
                width: 160,
                height: 160,
                layout: TensorLayout::Nhwc,
                channels: ChannelOrder::Rgb,
                normalization: Normalization::Standardize,
            },
            ModelKind::VggFace => Preprocessing {
                width: 224,
                height: 224,
                layout: TensorLayout::Nhwc,
                channels: ChannelOrder::Bgr,
                normalization: Normalization::Affine { mean: [93.5940, 104.7624, 129.1863], std: 1.0 },
            },
            ModelKind::DeepFace => Preprocessing {
                width: 152,
                height: 152,
                layout: TensorLayout::Nhwc,
                channels: ChannelOrder::Rgb,
                normalization: Normalization::Affine { mean: [0.0; 3], std: 255.0 },
            },
            ModelKind::SFace => Preprocessing {
                width: 112,
                height: 112,
                layout: TensorLayout::Nchw,
                channels: ChannelOrder::Bgr,
                normalization: Normalization::Affine { mean: [0.0; 3], std: 1.0 },
            },
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = RecognizerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| RecognizerError::UnknownModel(s.to_string()))
    }
}

/// ONNX-backed recognition model.
pub struct OnnxEmbedder {
    kind: ModelKind,
    session: Session,
    preprocessing: Preprocessing,
}

impl OnnxEmbedder {
    /// Load the ONNX file for `kind` from the given path.
    pub fn load(kind: ModelKind, model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            model = kind.name(),
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded recognition model"
        );

        Ok(Self {
            kind,
            session,
            preprocessing: kind.preprocessing(),
        })
    }
}

impl EmbeddingModel for OnnxEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        let input = self.preprocessing.tensor(face);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let expected = self.kind.embedding_dim();
        if raw_data.len() != expected {
            return Err(RecognizerError::InferenceFailed(format!(
                "{}: expected {expected}-dim embedding, got {}",
                self.kind,
                raw_data.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw_data.to_vec()),
            model: Some(self.kind.name().to_string()),
        })
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct Broken;

    impl EmbeddingModel for Broken {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RecognizerError> {
            Err(RecognizerError::InferenceFailed("boom".into()))
        }
    }

    struct Constant;

    impl EmbeddingModel for Constant {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(vec![0.6, 0.8]))
        }
    }

    #[test]
    fn test_extract_swallows_failure() {
        let face = RgbImage::new(4, 4);
        assert!(extract(&mut Broken, "ArcFace", &face).is_none());
    }

    #[test]
    fn test_extract_tags_model_name() {
        let face = RgbImage::new(4, 4);
        let embedding = extract(&mut Constant, "SFace", &face).unwrap();
        assert_eq!(embedding.model.as_deref(), Some("SFace"));
        assert_eq!(embedding.values, vec![0.6, 0.8]);
    }

    #[test]
    fn test_arcface_tensor_shape_and_normalization() {
        let face = RgbImage::from_pixel(50, 70, Rgb([128, 128, 128]));
        let tensor = ModelKind::ArcFace.preprocessing().tensor(&face);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (128.0 - 127.5) / 127.5;
        assert!((tensor[[0, 0, 10, 10]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nhwc_layout_shape() {
        let face = RgbImage::from_pixel(30, 30, Rgb([10, 20, 30]));
        let tensor = ModelKind::DeepFace.preprocessing().tensor(&face);
        assert_eq!(tensor.shape(), &[1, 152, 152, 3]);
        assert!((tensor[[0, 5, 5, 0]] - 10.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 5, 5, 2]] - 30.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_bgr_channel_order() {
        let face = RgbImage::from_pixel(8, 8, Rgb([10, 20, 30]));
        let tensor = ModelKind::SFace.preprocessing().tensor(&face);
        assert_eq!(tensor[[0, 0, 0, 0]], 30.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 20.0);
        assert_eq!(tensor[[0, 2, 0, 0]], 10.0);
    }

    #[test]
    fn test_standardize_is_zero_mean() {
        let face = RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 6) as u8, (y * 6) as u8, 100]));
        let tensor = ModelKind::Facenet.preprocessing().tensor(&face);
        let mean = tensor.iter().sum::<f32>() / tensor.len() as f32;
        assert!(mean.abs() < 1e-3, "mean = {mean}");
    }

    #[test]
    fn test_standardize_flat_crop_is_finite() {
        let face = RgbImage::from_pixel(16, 16, Rgb([200, 200, 200]));
        let tensor = ModelKind::Facenet512.preprocessing().tensor(&face);
        assert!(tensor.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_model_kind_parse_and_defaults() {
        assert_eq!("vgg-face".parse::<ModelKind>().unwrap(), ModelKind::VggFace);
        assert_eq!("ArcFace".parse::<ModelKind>().unwrap(), ModelKind::ArcFace);
        assert!("Dlib".parse::<ModelKind>().is_err());

        for kind in ModelKind::ALL {
            let t = kind.default_threshold();
            assert!(t > 0.0 && t < 1.0, "{kind} threshold {t}");
        }
        assert!(!ModelKind::VggFace.default_enabled());
        assert!(ModelKind::SFace.default_enabled());
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
