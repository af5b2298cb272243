use ab_glyph::FontArc;
use roster_core::detector::{DEFAULT_EXPAND_PERCENTAGE, DEFAULT_MIN_CONFIDENCE};
use roster_core::registry::ModelSettings;
use roster_core::RegistrySettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Optional TOML file named by `ROSTER_CONFIG`. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    font_path: Option<PathBuf>,
    detection_confidence: Option<f32>,
    expand_percentage: Option<u32>,
    /// Detector model files, highest priority first.
    detectors: Option<Vec<String>>,
    models: Vec<ModelSettings>,
}

/// Runtime configuration: defaults, then the config file, then `ROSTER_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Font for annotation labels, replacing the bundled DejaVu Sans.
    pub font_path: Option<PathBuf>,
    /// Detections must score strictly above this to be kept.
    pub detection_confidence: f32,
    /// Margin added around each face box before cropping, in percent.
    pub expand_percentage: u32,
    pub detectors: Option<Vec<String>>,
    pub models: Vec<ModelSettings>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let file = match var("ROSTER_CONFIG") {
            Some(path) => read_file(Path::new(&path))?,
            None => FileConfig::default(),
        };

        let data_dir = var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("roster");

        let model_dir = var("ROSTER_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let db_path = var("ROSTER_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("roster.db"));

        let font_path = var("ROSTER_FONT_PATH").map(PathBuf::from).or(file.font_path);

        let detection_confidence = parsed(&var, "ROSTER_DETECTION_CONFIDENCE")
            .or(file.detection_confidence)
            .unwrap_or(DEFAULT_MIN_CONFIDENCE);
        if !(0.0..1.0).contains(&detection_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detection confidence must lie in [0, 1), got {detection_confidence}"
            )));
        }

        let expand_percentage = parsed(&var, "ROSTER_EXPAND_PERCENTAGE")
            .or(file.expand_percentage)
            .unwrap_or(DEFAULT_EXPAND_PERCENTAGE);

        Ok(Self {
            model_dir,
            db_path,
            font_path,
            detection_confidence,
            expand_percentage,
            detectors: file.detectors,
            models: file.models,
        })
    }

    /// Settings for loading the model registry.
    pub fn registry_settings(&self) -> RegistrySettings {
        let mut settings = RegistrySettings::new(self.model_dir.clone());
        if let Some(detectors) = &self.detectors {
            settings.detectors = detectors.clone();
        }
        settings.models = self.models.clone();
        settings.min_confidence = self.detection_confidence;
        settings.expand_percentage = self.expand_percentage;
        settings
    }

    /// Load the configured annotation font, if set and readable.
    pub fn load_font(&self) -> Option<FontArc> {
        let path = self.font_path.as_ref()?;
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "annotation font unreadable; using bundled font");
                return None;
            }
        };
        match FontArc::try_from_vec(bytes) {
            Ok(font) => Some(font),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "annotation font invalid; using bundled font");
                None
            }
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_file(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_file(text: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(text)
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
