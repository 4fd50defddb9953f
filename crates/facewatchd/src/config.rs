use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use facewatch_stream::MotionConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::notify::NotifyConfig;

/// Environment variable naming an optional TOML config file.
pub const CONFIG_FILE_VAR: &str = "FACEWATCH_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built once at startup from defaults, an optional TOML file named by
/// `FACEWATCH_CONFIG`, then `FACEWATCH_*` environment variables, and
/// passed by value into each component.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP gateway bind address.
    pub addr: String,
    /// RGB24 video input; stdin when unset.
    pub video_path: Option<PathBuf>,
    /// Motion-vector pipe; motion monitoring is off when unset.
    pub motion_path: Option<PathBuf>,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub classifier_model: String,
    /// JSON roster of known people.
    pub people_path: Option<PathBuf>,
    /// Euclidean distance below which a face matches a person.
    pub match_distance: f32,
    /// Minimum SCRFD score for a detection to be kept.
    pub detection_confidence: f32,
    /// Scale factor applied to detection boxes before cropping.
    pub detection_padding: f32,
    /// Normalize embeddings to unit length before matching and caching.
    pub normalize_embeddings: bool,
    pub face_cache_size: usize,
    pub jpeg_quality: u8,
    /// When set, every classified face is also written here.
    pub output_faces_dir: Option<PathBuf>,
    pub notification_url: Option<String>,
    pub motion_notification_url: Option<String>,
    pub notify_timeout_ms: u64,
    pub notify_workers: usize,
    pub notify_queue: usize,
    pub mbx: usize,
    pub mby: usize,
    pub magnitude: u32,
    pub total_motion: usize,
    /// Minimum gap between motion events, in milliseconds.
    pub motion_throttle_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:9081".to_string(),
            video_path: None,
            motion_path: None,
            frame_width: 672,
            frame_height: 384,
            model_dir: default_model_dir(),
            detector_model: "det_10g.onnx".to_string(),
            classifier_model: "w600k_r50.onnx".to_string(),
            people_path: None,
            match_distance: 2.5,
            detection_confidence: facewatch_core::detector::SCRFD_CONFIDENCE_THRESHOLD,
            detection_padding: 1.5,
            normalize_embeddings: false,
            face_cache_size: facewatch_core::cache::DEFAULT_CAPACITY,
            jpeg_quality: facewatch_core::jpeg::DEFAULT_QUALITY,
            output_faces_dir: None,
            notification_url: None,
            motion_notification_url: None,
            notify_timeout_ms: 1000,
            notify_workers: 2,
            notify_queue: 32,
            mbx: 42,
            mby: 24,
            magnitude: 20,
            total_motion: 4,
            motion_throttle_ms: 60_000,
        }
    }
}

/// `$XDG_DATA_HOME/facewatch/models`, falling back to `~/.local/share`.
fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch/models")
}

impl Config {
    /// Load the file named by `FACEWATCH_CONFIG` (if any), apply
    /// `FACEWATCH_*` overrides, and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEWATCH_*` values returned by `lookup`. Empty strings clear
    /// optional settings.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let lookup = &lookup;
        override_value(lookup, "FACEWATCH_ADDR", &mut self.addr)?;
        override_optional(lookup, "FACEWATCH_VIDEO", &mut self.video_path);
        override_optional(lookup, "FACEWATCH_MOTION", &mut self.motion_path);
        override_value(lookup, "FACEWATCH_WIDTH", &mut self.frame_width)?;
        override_value(lookup, "FACEWATCH_HEIGHT", &mut self.frame_height)?;
        override_value(lookup, "FACEWATCH_MODEL_DIR", &mut self.model_dir)?;
        override_value(lookup, "FACEWATCH_DETECTOR_MODEL", &mut self.detector_model)?;
        override_value(lookup, "FACEWATCH_CLASSIFIER_MODEL", &mut self.classifier_model)?;
        override_optional(lookup, "FACEWATCH_PEOPLE", &mut self.people_path);
        override_value(lookup, "FACEWATCH_DISTANCE", &mut self.match_distance)?;
        override_value(lookup, "FACEWATCH_CONFIDENCE", &mut self.detection_confidence)?;
        override_value(lookup, "FACEWATCH_PADDING", &mut self.detection_padding)?;
        override_flag(lookup, "FACEWATCH_NORMALIZE_EMBEDDING", &mut self.normalize_embeddings)?;
        override_value(lookup, "FACEWATCH_CACHE_SIZE", &mut self.face_cache_size)?;
        override_value(lookup, "FACEWATCH_JPEG_QUALITY", &mut self.jpeg_quality)?;
        override_optional(lookup, "FACEWATCH_OUTPUT_FACES_DIR", &mut self.output_faces_dir);
        override_optional(lookup, "FACEWATCH_NOTIFICATION_URL", &mut self.notification_url);
        override_optional(
            lookup,
            "FACEWATCH_MOTION_NOTIFICATION_URL",
            &mut self.motion_notification_url,
        );
        override_value(lookup, "FACEWATCH_NOTIFY_TIMEOUT_MS", &mut self.notify_timeout_ms)?;
        override_value(lookup, "FACEWATCH_NOTIFY_WORKERS", &mut self.notify_workers)?;
        override_value(lookup, "FACEWATCH_NOTIFY_QUEUE", &mut self.notify_queue)?;
        override_value(lookup, "FACEWATCH_MBX", &mut self.mbx)?;
        override_value(lookup, "FACEWATCH_MBY", &mut self.mby)?;
        override_value(lookup, "FACEWATCH_MAGNITUDE", &mut self.magnitude)?;
        override_value(lookup, "FACEWATCH_TOTAL_MOTION", &mut self.total_motion)?;
        override_value(lookup, "FACEWATCH_MOTION_THROTTLE_MS", &mut self.motion_throttle_ms)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.frame_width == 0 || self.frame_height == 0 {
            return invalid("frame_width and frame_height must be non-zero");
        }
        if self.face_cache_size == 0 {
            return invalid("face_cache_size must be at least 1");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality must be between 1 and 100");
        }
        if !(self.detection_confidence > 0.0 && self.detection_confidence <= 1.0) {
            return invalid("detection_confidence must be in (0, 1]");
        }
        if self.detection_padding.is_nan() || self.detection_padding <= 0.0 {
            return invalid("detection_padding must be positive");
        }
        if self.mbx == 0 || self.mby == 0 {
            return invalid("mbx and mby must be non-zero");
        }
        if self.notify_workers == 0 || self.notify_queue == 0 {
            return invalid("notify_workers and notify_queue must be non-zero");
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace classification model.
    pub fn classifier_model_path(&self) -> String {
        self.model_dir
            .join(&self.classifier_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn motion_config(&self) -> MotionConfig {
        MotionConfig {
            mbx: self.mbx,
            mby: self.mby,
            magnitude: self.magnitude,
            total_threshold: self.total_motion,
            throttle: Duration::from_millis(self.motion_throttle_ms),
        }
    }

    pub fn notify_config(&self) -> NotifyConfig {
        NotifyConfig {
            match_url: self.notification_url.clone(),
            motion_url: self.motion_notification_url.clone(),
            timeout: Duration::from_millis(self.notify_timeout_ms),
            workers: self.notify_workers,
            queue: self.notify_queue,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

fn override_value<T: FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })?;
    }
    Ok(())
}

fn override_optional<T: From<String>>(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut Option<T>,
) {
    if let Some(value) = lookup(key) {
        *slot = if value.is_empty() {
            None
        } else {
            Some(T::from(value))
        };
    }
}

fn override_flag(
    lookup: &dyn Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut bool,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(key) {
        *slot = match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(ConfigError::InvalidValue { key, value }),
        };
    }
    Ok(())
}
