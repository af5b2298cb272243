//! Process-wide model registry, built once at startup.
//!
//! Holds the detector cascade and one [`ModelConfig`] per recognition model.
//! Only enabled models with a loaded handle take part in matching.

use crate::detector::{DetectorBackend, FaceDetector, ScrfdBackend, DEFAULT_EXPAND_PERCENTAGE, DEFAULT_MIN_CONFIDENCE};
use crate::recognizer::{EmbeddingModel, ModelKind, OnnxEmbedder};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("decision threshold for {model} must lie in (0, 1), got {threshold}")]
    InvalidThreshold { model: String, threshold: f32 },
    #[error("duplicate model name: {0}")]
    DuplicateModel(String),
    #[error("no face detector could be loaded from {0}")]
    NoDetector(String),
}

/// One recognition model and its decision rule.
pub struct ModelConfig {
    pub name: String,
    /// Similarity a candidate must strictly exceed to earn this model's vote.
    pub threshold: f32,
    pub enabled: bool,
    handle: Option<Box<dyn EmbeddingModel>>,
}

impl ModelConfig {
    pub fn new(
        name: impl Into<String>,
        threshold: f32,
        handle: Box<dyn EmbeddingModel>,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        validate_threshold(&name, threshold)?;
        Ok(Self {
            name,
            threshold,
            enabled: true,
            handle: Some(handle),
        })
    }

    /// A model that is configured but takes no part in matching.
    pub fn disabled(name: impl Into<String>, threshold: f32) -> Self {
        Self {
            name: name.into(),
            threshold,
            enabled: false,
            handle: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.handle.is_some()
    }

    /// Mutable access to the model for inference; `None` unless active.
    pub fn handle_mut(&mut self) -> Option<&mut (dyn EmbeddingModel + 'static)> {
        if !self.enabled {
            return None;
        }
        self.handle.as_deref_mut()
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("enabled", &self.enabled)
            .field("loaded", &self.handle.is_some())
            .finish()
    }
}

fn validate_threshold(model: &str, threshold: f32) -> Result<(), RegistryError> {
    if threshold > 0.0 && threshold < 1.0 {
        Ok(())
    } else {
        Err(RegistryError::InvalidThreshold {
            model: model.to_string(),
            threshold,
        })
    }
}

/// Per-model overrides read from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSettings {
    pub name: String,
    pub threshold: Option<f32>,
    pub enabled: Option<bool>,
    /// File name inside the model directory; defaults to the model's standard file.
    pub file: Option<String>,
}

/// Everything needed to load the registry from disk.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub model_dir: PathBuf,
    /// Detector model files in priority order.
    pub detectors: Vec<String>,
    pub models: Vec<ModelSettings>,
    pub min_confidence: f32,
    pub expand_percentage: u32,
}

impl RegistrySettings {
    pub fn new(model_dir: PathBuf) -> Self {
        Self {
            model_dir,
            detectors: vec!["det_10g.onnx".to_string(), "det_500m.onnx".to_string()],
            models: Vec::new(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            expand_percentage: DEFAULT_EXPAND_PERCENTAGE,
        }
    }

    fn path_of(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }

    fn overrides_for(&self, kind: ModelKind) -> Option<&ModelSettings> {
        self.models
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(kind.name()))
    }
}

/// Detector cascade plus recognition models, loaded once and reused per request.
pub struct ModelRegistry {
    detector: FaceDetector,
    models: Vec<ModelConfig>,
}

impl ModelRegistry {
    pub fn new(detector: FaceDetector, models: Vec<ModelConfig>) -> Result<Self, RegistryError> {
        for (i, m) in models.iter().enumerate() {
            if models[..i].iter().any(|other| other.name == m.name) {
                return Err(RegistryError::DuplicateModel(m.name.clone()));
            }
        }
        Ok(Self { detector, models })
    }

    /// Load detectors and every known recognition model from `settings.model_dir`.
    ///
    /// A recognition model that fails to load is logged and disabled. Fails
    /// only when no detector backend loads.
    pub fn load(settings: &RegistrySettings) -> Result<Self, RegistryError> {
        let mut backends: Vec<Box<dyn DetectorBackend>> = Vec::new();
        for file in &settings.detectors {
            let path = settings.path_of(file);
            match ScrfdBackend::load(&path) {
                Ok(backend) => backends.push(Box::new(backend)),
                Err(e) => tracing::warn!(path = %path, error = %e, "detector backend unavailable"),
            }
        }
        if backends.is_empty() {
            return Err(RegistryError::NoDetector(settings.model_dir.display().to_string()));
        }

        let detector = FaceDetector::new(backends)
            .with_min_confidence(settings.min_confidence)
            .with_expand_percentage(settings.expand_percentage);

        let mut models = Vec::new();
        for kind in ModelKind::ALL {
            let overrides = settings.overrides_for(kind);
            let threshold = overrides
                .and_then(|o| o.threshold)
                .unwrap_or_else(|| kind.default_threshold());
            let enabled = overrides
                .and_then(|o| o.enabled)
                .unwrap_or_else(|| kind.default_enabled());

            validate_threshold(kind.name(), threshold)?;

            if !enabled {
                tracing::info!(model = kind.name(), "recognition model disabled");
                models.push(ModelConfig::disabled(kind.name(), threshold));
                continue;
            }

            let file = overrides
                .and_then(|o| o.file.as_deref())
                .unwrap_or_else(|| kind.file_name());
            let path = settings.path_of(file);
            match OnnxEmbedder::load(kind, &path) {
                Ok(embedder) => models.push(ModelConfig::new(kind.name(), threshold, Box::new(embedder))?),
                Err(e) => {
                    tracing::warn!(model = kind.name(), path = %path, error = %e, "recognition model failed to load; disabling");
                    models.push(ModelConfig::disabled(kind.name(), threshold));
                }
            }
        }

        for unknown in settings
            .models
            .iter()
            .filter(|m| m.name.parse::<ModelKind>().is_err())
        {
            tracing::warn!(model = %unknown.name, "ignoring settings for unknown recognition model");
        }

        let registry = Self::new(detector, models)?;
        tracing::info!(
            detectors = ?registry.detector.backend_names(),
            models = ?registry.active_model_names(),
            "model registry ready"
        );
        Ok(registry)
    }

    pub fn detector(&self) -> &FaceDetector {
        &self.detector
    }

    pub fn detector_mut(&mut self) -> &mut FaceDetector {
        &mut self.detector
    }

    /// Active models in registry order.
    pub fn active_models_mut(&mut self) -> impl Iterator<Item = &mut ModelConfig> {
        self.models.iter_mut().filter(|m| m.is_active())
    }

    pub fn active_model_names(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::RecognizerError;
    use crate::types::Embedding;
    use image::RgbImage;

    struct Fixed;

    impl EmbeddingModel for Fixed {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, RecognizerError> {
            Ok(Embedding::new(vec![1.0]))
        }
    }

    #[test]
    fn test_threshold_must_be_open_unit_interval() {
        assert!(ModelConfig::new("a", 0.5, Box::new(Fixed)).is_ok());
        assert!(matches!(
            ModelConfig::new("a", 0.0, Box::new(Fixed)),
            Err(RegistryError::InvalidThreshold { .. })
        ));
        assert!(ModelConfig::new("a", 1.0, Box::new(Fixed)).is_err());
        assert!(ModelConfig::new("a", f32::NAN, Box::new(Fixed)).is_err());
    }

    #[test]
    fn test_only_enabled_models_are_active() {
        let mut registry = ModelRegistry::new(
            FaceDetector::new(Vec::new()),
            vec![
                ModelConfig::new("ArcFace", 0.35, Box::new(Fixed)).unwrap(),
                ModelConfig::disabled("VGG-Face", 0.5),
                ModelConfig::new("SFace", 0.30, Box::new(Fixed)).unwrap(),
            ],
        )
        .unwrap();

        assert_eq!(registry.active_model_names(), vec!["ArcFace", "SFace"]);
        assert_eq!(registry.active_models_mut().count(), 2);

        registry.models[0].enabled = false;
        assert!(registry.models[0].handle_mut().is_none());
        assert_eq!(registry.active_model_names(), vec!["SFace"]);
    }

    #[test]
    fn test_duplicate_model_names_rejected() {
        let result = ModelRegistry::new(
            FaceDetector::new(Vec::new()),
            vec![
                ModelConfig::new("ArcFace", 0.35, Box::new(Fixed)).unwrap(),
                ModelConfig::new("ArcFace", 0.40, Box::new(Fixed)).unwrap(),
            ],
        );
        assert!(matches!(result, Err(RegistryError::DuplicateModel(_))));
    }

    #[test]
    fn test_load_without_detectors_fails() {
        let settings = RegistrySettings::new(PathBuf::from("/nonexistent/roster-models"));
        assert!(matches!(ModelRegistry::load(&settings), Err(RegistryError::NoDetector(_))));
    }

    #[test]
    fn test_settings_overrides_lookup_is_case_insensitive() {
        let mut settings = RegistrySettings::new(PathBuf::from("/models"));
        settings.models.push(ModelSettings {
            name: "arcface".into(),
            threshold: Some(0.5),
            enabled: None,
            file: None,
        });
        let found = settings.overrides_for(ModelKind::ArcFace).unwrap();
        assert_eq!(found.threshold, Some(0.5));
        assert!(settings.overrides_for(ModelKind::SFace).is_none());
        assert_eq!(settings.path_of("x.onnx"), "/models/x.onnx");
    }
}
