use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Label reported for a face no enabled model could attribute to a known identity.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Raw detector output in source-image coordinates, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// True when position and size are all finite numbers.
    pub fn is_finite(&self) -> bool {
        [self.x, self.y, self.width, self.height].iter().all(|v| v.is_finite())
    }
}

/// Integer pixel region of a face, already expanded and clamped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl FaceBox {
    /// Expand a detector box by `percentage` of its size (half on each side),
    /// clamped to an image of `image_width` × `image_height`.
    ///
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn expanded(
        bbox: &BoundingBox,
        percentage: u32,
        image_width: u32,
        image_height: u32,
    ) -> Option<Self> {
        if !bbox.is_finite() {
            return None;
        }
        let x = bbox.x.max(0.0).floor() as i64;
        let y = bbox.y.max(0.0).floor() as i64;
        let w = bbox.width.max(0.0).round() as i64;
        let h = bbox.height.max(0.0).round() as i64;

        let margin_w = w.checked_mul(percentage as i64)? / 100;
        let margin_h = h.checked_mul(percentage as i64)? / 100;

        let x = (x - margin_w / 2).max(0);
        let y = (y - margin_h / 2).max(0);
        let w = (w + margin_w).min(image_width as i64 - x);
        let h = (h + margin_h).min(image_height as i64 - y);

        if w <= 0 || h <= 0 {
            return None;
        }

        Some(Self {
            x: x as u32,
            y: y as u32,
            w: w as u32,
            h: h as u32,
        })
    }
}

/// Identifier for one face within one detection pass: ordinal plus a hash of its box.
///
/// Re-detecting the same image with the same backends yields the same ids, and a
/// shifted box yields a different one, so a client can refer back to a face it
/// was shown without relying on list position alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceId(String);

impl FaceId {
    pub fn new(ordinal: usize, area: &FaceBox) -> Self {
        let mut hasher = Sha256::new();
        for v in [area.x, area.y, area.w, area.h] {
            hasher.update(v.to_le_bytes());
        }
        let digest = hasher.finalize();
        let hash: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("face-{}-{hash}", ordinal + 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FaceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A face found by the detector, cropped and ready for embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub id: FaceId,
    /// 8-bit RGB crop of `area`.
    pub crop: RgbImage,
    pub area: FaceBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

/// Face embedding vector produced by one recognition model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Name of the model that produced this embedding (e.g., "ArcFace").
    pub model: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector is
    /// similar to nothing.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance, `1 - similarity`. Smaller = more similar.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }
}

/// Final identity decision for one detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    /// Winning identity, or `None` when no model voted.
    pub identity: Option<String>,
    /// Mean similarity over the contributing models, 0 for unknown faces.
    pub confidence: f32,
    pub face_id: FaceId,
    pub area: FaceBox,
    /// Models whose vote went to `identity`, in registry order.
    pub models: Vec<String>,
    pub detection_confidence: f32,
}

impl MatchResult {
    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }

    /// Identity name, or [`UNKNOWN_LABEL`].
    pub fn name(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.99, landmarks: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.cosine_distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_cosine_similarity_scale_invariant() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![10.0, 20.0, 30.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_expanded_adds_half_margin_each_side() {
        let area = FaceBox::expanded(&bbox(100.0, 100.0, 100.0, 100.0), 15, 1000, 1000).unwrap();
        // 15% of 100 = 15 → 7 on the leading edge, total size 115
        assert_eq!(area, FaceBox { x: 93, y: 93, w: 115, h: 115 });
    }

    #[test]
    fn test_expanded_clamps_to_image() {
        let area = FaceBox::expanded(&bbox(2.0, 0.0, 100.0, 100.0), 20, 105, 90).unwrap();
        assert_eq!(area.x, 0);
        assert_eq!(area.y, 0);
        assert_eq!(area.w, 105);
        assert_eq!(area.h, 90);
    }

    #[test]
    fn test_expanded_negative_origin() {
        let area = FaceBox::expanded(&bbox(-10.0, -5.0, 50.0, 50.0), 0, 200, 200).unwrap();
        assert_eq!(area.x, 0);
        assert_eq!(area.y, 0);
    }

    #[test]
    fn test_expanded_outside_image() {
        assert!(FaceBox::expanded(&bbox(300.0, 300.0, 50.0, 50.0), 15, 200, 200).is_none());
        assert!(FaceBox::expanded(&bbox(10.0, 10.0, 0.0, 40.0), 15, 200, 200).is_none());
    }

    #[test]
    fn test_expanded_rejects_non_finite_and_huge_boxes() {
        assert!(FaceBox::expanded(&bbox(10.0, 10.0, f32::INFINITY, 40.0), 15, 200, 200).is_none());
        assert!(FaceBox::expanded(&bbox(f32::NAN, 10.0, 40.0, 40.0), 15, 200, 200).is_none());
        // Saturates to i64::MAX; the margin must not overflow.
        let area = FaceBox::expanded(&bbox(0.0, 0.0, 1e30, 1e30), 15, 200, 200);
        assert!(area.is_none());
    }

    #[test]
    fn test_face_id_stable_and_box_sensitive() {
        let a = FaceBox { x: 10, y: 20, w: 30, h: 40 };
        let b = FaceBox { x: 11, y: 20, w: 30, h: 40 };
        assert_eq!(FaceId::new(0, &a), FaceId::new(0, &a));
        assert_ne!(FaceId::new(0, &a), FaceId::new(0, &b));
        assert_ne!(FaceId::new(0, &a), FaceId::new(1, &a));
        assert!(FaceId::new(0, &a).as_str().starts_with("face-1-"));
        assert_eq!(FaceId::new(0, &a).as_str().len(), "face-1-".len() + 8);
    }

    #[test]
    fn test_match_result_name() {
        let mut result = MatchResult {
            identity: None,
            confidence: 0.0,
            face_id: FaceId::from("face-1-00000000"),
            area: FaceBox { x: 0, y: 0, w: 1, h: 1 },
            models: Vec::new(),
            detection_confidence: 0.99,
        };
        assert_eq!(result.name(), UNKNOWN_LABEL);
        assert!(!result.is_known());
        result.identity = Some("alice".into());
        assert_eq!(result.name(), "alice");
    }
}
