use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FacewatchConfig {
    pub stream: StreamConfig,
    pub detection: DetectionConfig,
    pub matcher: MatcherConfig,
    pub persistence: PersistenceConfig,
}

/// Settings shared by every stream worker
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    /// Frame rate cap applied to every source (frames per second)
    #[serde(default = "default_max_fps")]
    pub max_fps: u32,

    /// Decode resolution (width, height) requested from every source
    #[serde(default = "default_resolution")]
    pub resolution: (u32, u32),

    /// Connectivity probe timeout in seconds
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Consecutive read failures tolerated before a reconnect cycle
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Fixed wait between reconnect attempts in seconds
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Reconnect attempts before a stream is marked stopped
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Upper bound on concurrently registered streams
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Per-worker join timeout during shutdown, in seconds
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DetectionConfig {
    /// Whether the detection pipeline is active
    #[serde(default = "default_detection_enabled")]
    pub enabled: bool,

    /// Minimum detection score for a face to be evaluated
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,

    /// Face detection model path (onnx backend)
    #[serde(default = "default_detector_model_path")]
    pub detector_model_path: String,

    /// Face recognition model path (onnx backend)
    #[serde(default = "default_recognition_model_path")]
    pub recognition_model_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MatcherConfig {
    /// Cosine-similarity threshold for a qualifying match
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Interval between scheduled detection passes, in seconds
    #[serde(default = "default_detection_interval_secs")]
    pub detection_interval_secs: u64,

    /// Path to TrueType font file for annotation labels
    #[serde(default = "default_label_font_path")]
    pub label_font_path: String,

    /// Font size for annotation labels
    #[serde(default = "default_label_font_size")]
    pub label_font_size: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PersistenceConfig {
    /// Registered streams database file
    #[serde(default = "default_streams_file")]
    pub streams_file: String,

    /// Watch-list persons database file
    #[serde(default = "default_persons_file")]
    pub persons_file: String,

    /// Detection event log file
    #[serde(default = "default_detections_file")]
    pub detections_file: String,
}

impl FacewatchConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("facewatch.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("stream.max_fps", default_max_fps())?
            .set_default(
                "stream.resolution",
                vec![default_resolution().0, default_resolution().1],
            )?
            .set_default("stream.probe_timeout_secs", default_probe_timeout_secs())?
            .set_default("stream.error_threshold", default_error_threshold())?
            .set_default(
                "stream.reconnect_interval_secs",
                default_reconnect_interval_secs(),
            )?
            .set_default(
                "stream.max_reconnect_attempts",
                default_max_reconnect_attempts(),
            )?
            .set_default("stream.max_streams", default_max_streams() as i64)?
            .set_default("stream.join_timeout_secs", default_join_timeout_secs())?
            .set_default("detection.enabled", default_detection_enabled())?
            .set_default(
                "detection.quality_threshold",
                default_quality_threshold() as f64,
            )?
            .set_default(
                "detection.detector_model_path",
                default_detector_model_path(),
            )?
            .set_default(
                "detection.recognition_model_path",
                default_recognition_model_path(),
            )?
            .set_default(
                "matcher.similarity_threshold",
                default_similarity_threshold() as f64,
            )?
            .set_default(
                "matcher.detection_interval_secs",
                default_detection_interval_secs(),
            )?
            .set_default("matcher.label_font_path", default_label_font_path())?
            .set_default(
                "matcher.label_font_size",
                default_label_font_size() as f64,
            )?
            .set_default("persistence.streams_file", default_streams_file())?
            .set_default("persistence.persons_file", default_persons_file())?
            .set_default("persistence.detections_file", default_detections_file())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("FACEWATCH").separator("_"))
            .build()?;

        let config: FacewatchConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.resolution.0 == 0 || self.stream.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Stream resolution must be greater than 0".to_string(),
            ));
        }

        if self.stream.max_fps == 0 {
            return Err(ConfigError::Message(
                "Stream max_fps must be greater than 0".to_string(),
            ));
        }

        if self.stream.max_streams == 0 {
            return Err(ConfigError::Message(
                "Stream max_streams must be greater than 0".to_string(),
            ));
        }

        if self.stream.error_threshold == 0 {
            return Err(ConfigError::Message(
                "Stream error_threshold must be greater than 0".to_string(),
            ));
        }

        if self.stream.max_reconnect_attempts == 0 {
            return Err(ConfigError::Message(
                "Stream max_reconnect_attempts must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.quality_threshold) {
            return Err(ConfigError::Message(
                "Detection quality_threshold must be within [0, 1]".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.matcher.similarity_threshold) {
            return Err(ConfigError::Message(
                "Matcher similarity_threshold must be within [0, 1]".to_string(),
            ));
        }

        if self.matcher.detection_interval_secs == 0 {
            return Err(ConfigError::Message(
                "Matcher detection_interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for FacewatchConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig {
                max_fps: default_max_fps(),
                resolution: default_resolution(),
                probe_timeout_secs: default_probe_timeout_secs(),
                error_threshold: default_error_threshold(),
                reconnect_interval_secs: default_reconnect_interval_secs(),
                max_reconnect_attempts: default_max_reconnect_attempts(),
                max_streams: default_max_streams(),
                join_timeout_secs: default_join_timeout_secs(),
            },
            detection: DetectionConfig {
                enabled: default_detection_enabled(),
                quality_threshold: default_quality_threshold(),
                detector_model_path: default_detector_model_path(),
                recognition_model_path: default_recognition_model_path(),
            },
            matcher: MatcherConfig {
                similarity_threshold: default_similarity_threshold(),
                detection_interval_secs: default_detection_interval_secs(),
                label_font_path: default_label_font_path(),
                label_font_size: default_label_font_size(),
            },
            persistence: PersistenceConfig {
                streams_file: default_streams_file(),
                persons_file: default_persons_file(),
                detections_file: default_detections_file(),
            },
        }
    }
}

// Default value functions
fn default_max_fps() -> u32 {
    15
}
fn default_resolution() -> (u32, u32) {
    (640, 480)
}
fn default_probe_timeout_secs() -> u64 {
    10
}
fn default_error_threshold() -> u32 {
    10
}
fn default_reconnect_interval_secs() -> u64 {
    5
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_max_streams() -> usize {
    16
}
fn default_join_timeout_secs() -> u64 {
    5
}

fn default_detection_enabled() -> bool {
    true
}
fn default_quality_threshold() -> f32 {
    0.7
}
fn default_detector_model_path() -> String {
    "./models/face_detector.onnx".to_string()
}
fn default_recognition_model_path() -> String {
    "./models/face_recognition.onnx".to_string()
}

fn default_similarity_threshold() -> f32 {
    0.6
}
fn default_detection_interval_secs() -> u64 {
    2
}
fn default_label_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}
fn default_label_font_size() -> f32 {
    16.0
}

fn default_streams_file() -> String {
    "./data/streams.json".to_string()
}
fn default_persons_file() -> String {
    "./data/persons.json".to_string()
}
fn default_detections_file() -> String {
    "./data/detections.json".to_string()
}
