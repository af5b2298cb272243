//! roster-core: face matching pipeline for attendance tracking.
//!
//! Decodes data-URI images, detects faces with a cascade of SCRFD backends,
//! embeds each face with several recognition models via ONNX Runtime, and
//! fuses the models' per-threshold votes into one identity per face.

pub mod annotate;
pub mod codec;
pub mod detector;
pub mod matcher;
pub mod recognizer;
pub mod registry;
pub mod types;

pub use annotate::Annotator;
pub use detector::{DetectorBackend, FaceDetector};
pub use matcher::{KnownFaceIndex, MatchVote, VoteTally};
pub use recognizer::{EmbeddingModel, ModelKind};
pub use registry::{ModelConfig, ModelRegistry, RegistrySettings};
pub use types::{BoundingBox, DetectedFace, Embedding, FaceBox, FaceId, MatchResult, UNKNOWN_LABEL};
