use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown backend {0:?} (expected \"yolo\" or \"mock\")")]
    InvalidBackend(String),
}

/// Which detection backend the daemon serves with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    Yolo,
    Mock,
}

impl FromStr for BackendChoice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yolo" | "real" => Ok(Self::Yolo),
            "mock" => Ok(Self::Mock),
            other => Err(ConfigError::InvalidBackend(other.to_string())),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `HEADCOUNT_CONFIG`, then `HEADCOUNT_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:$PORT or 0.0.0.0:8080).
    pub bind: String,
    /// Detection backend selected at start.
    pub backend: BackendChoice,
    /// Path to the YOLO ONNX model.
    pub model_path: PathBuf,
    /// Model class names; more than one enables the face/person class filter.
    pub class_names: Vec<String>,
    /// Minimum confidence for class-aware detections.
    pub confidence_floor: f32,
    /// Seed for repeatable mock output.
    pub mock_seed: Option<u64>,
    /// Directory for uploaded originals and annotated copies.
    pub upload_dir: PathBuf,
    pub persist_uploads: bool,
    /// Upload / download size ceiling in bytes.
    pub max_upload_bytes: usize,
    pub fetch_timeout_secs: u64,
    pub jpeg_quality: u8,
    /// TTF/OTF font used for "Face N" labels; labels are off without one.
    pub label_font: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{DEFAULT_PORT}"),
            backend: BackendChoice::Yolo,
            model_path: PathBuf::from("models/yolov8n-face.onnx"),
            class_names: Vec::new(),
            confidence_floor: headcount_core::detector::DEFAULT_CONFIDENCE_FLOOR,
            mock_seed: None,
            upload_dir: PathBuf::from("uploads"),
            persist_uploads: true,
            max_upload_bytes: headcount_core::source::DEFAULT_MAX_UPLOAD_BYTES,
            fetch_timeout_secs: headcount_core::source::DEFAULT_FETCH_TIMEOUT.as_secs(),
            jpeg_quality: headcount_core::encoder::DEFAULT_JPEG_QUALITY,
            label_font: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("HEADCOUNT_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `HEADCOUNT_*` overrides read through `lookup`. Unparseable
    /// numeric values keep the current setting.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(bind) = lookup("HEADCOUNT_BIND") {
            self.bind = bind;
        } else if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.bind = format!("0.0.0.0:{port}");
        }
        if let Some(backend) = lookup("HEADCOUNT_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(path) = lookup("HEADCOUNT_MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(names) = lookup("HEADCOUNT_CLASS_NAMES") {
            self.class_names = names
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect();
        }
        self.confidence_floor = parsed(&lookup, "HEADCOUNT_CONFIDENCE_FLOOR", self.confidence_floor);
        if let Some(seed) = lookup("HEADCOUNT_MOCK_SEED").and_then(|v| v.parse().ok()) {
            self.mock_seed = Some(seed);
        }
        if let Some(dir) = lookup("HEADCOUNT_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("HEADCOUNT_PERSIST_UPLOADS") {
            self.persist_uploads = v != "0";
        }
        self.max_upload_bytes = parsed(&lookup, "HEADCOUNT_MAX_UPLOAD_BYTES", self.max_upload_bytes);
        self.fetch_timeout_secs = parsed(&lookup, "HEADCOUNT_FETCH_TIMEOUT_SECS", self.fetch_timeout_secs);
        self.jpeg_quality = parsed(&lookup, "HEADCOUNT_JPEG_QUALITY", self.jpeg_quality);
        if let Some(font) = lookup("HEADCOUNT_LABEL_FONT") {
            self.label_font = Some(PathBuf::from(font));
        }
        Ok(self)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Request body limit: the image ceiling plus room for multipart framing.
    pub fn body_limit(&self) -> usize {
        self.max_upload_bytes.saturating_add(1024 * 1024)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
