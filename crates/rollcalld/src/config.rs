use rollcall_core::{ModelFormat, ModelSource, Normalization, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {key}={value}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path, or an image file used as a fixed capture source.
    pub camera_device: String,
    /// Whether to open the capture source at all.
    pub camera_enabled: bool,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Model candidates, tried in order.
    pub model_sources: Vec<ModelSource>,
    pub normalization: Normalization,
    /// Maximum Euclidean distance for an accepted match.
    pub match_threshold: f32,
    pub inference_threads: usize,
    pub model_version: Option<String>,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Number of frames to capture per camera enrollment.
    pub enroll_samples: usize,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

/// Optional overrides read from the TOML file named by `ROLLCALL_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub camera_device: Option<String>,
    pub camera_enabled: Option<bool>,
    pub warmup_frames: Option<usize>,
    pub model_dir: Option<PathBuf>,
    pub model_sources: Option<Vec<ModelSource>>,
    pub normalization: Option<Normalization>,
    pub match_threshold: Option<f32>,
    pub inference_threads: Option<usize>,
    pub model_version: Option<String>,
    pub db_path: Option<PathBuf>,
    pub enroll_samples: Option<usize>,
    pub session_bus: Option<bool>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }
}

impl Config {
    /// Load configuration: `ROLLCALL_*` environment variables over the
    /// optional TOML file over built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => {
                tracing::info!(path = %path, "reading config file");
                FileConfig::read(Path::new(&path))?
            }
            Err(_) => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge a file layer with an environment lookup.
    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(rollcall_core::default_model_dir);

        let model_sources = match env("ROLLCALL_MODEL_SOURCES") {
            Some(spec) => parse_model_sources(&spec)?,
            None => file
                .model_sources
                .unwrap_or_else(|| rollcall_core::default_model_sources(&model_dir)),
        };

        let normalization = match env("ROLLCALL_NORMALIZATION") {
            Some(v) => v.parse::<Normalization>().map_err(|reason| ConfigError::Invalid {
                key: "ROLLCALL_NORMALIZATION",
                value: v.clone(),
                reason,
            })?,
            None => file.normalization.unwrap_or_default(),
        };

        let match_threshold = env_parse(&env, "ROLLCALL_MATCH_THRESHOLD", |v| v.parse().ok())
            .or(file.match_threshold)
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);
        if !(match_threshold.is_finite() && match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                value: match_threshold.to_string(),
                reason: "must be a finite positive distance".into(),
            });
        }

        let db_path = env("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(&env).join("rollcall.db"));

        Ok(Self {
            camera_device: env("ROLLCALL_CAMERA_DEVICE")
                .or(file.camera_device)
                .unwrap_or_else(|| "/dev/video0".to_string()),
            camera_enabled: env_parse(&env, "ROLLCALL_CAMERA_ENABLED", parse_bool)
                .or(file.camera_enabled)
                .unwrap_or(true),
            warmup_frames: env_parse(&env, "ROLLCALL_WARMUP_FRAMES", |v| v.parse().ok())
                .or(file.warmup_frames)
                .unwrap_or(4),
            model_sources,
            normalization,
            match_threshold,
            inference_threads: env_parse(&env, "ROLLCALL_INFERENCE_THREADS", |v| v.parse().ok())
                .or(file.inference_threads)
                .unwrap_or(2),
            model_version: env("ROLLCALL_MODEL_VERSION").or(file.model_version),
            db_path,
            enroll_samples: env_parse(&env, "ROLLCALL_ENROLL_SAMPLES", |v| v.parse().ok())
                .or(file.enroll_samples)
                .unwrap_or(3),
            session_bus: env_parse(&env, "ROLLCALL_SESSION_BUS", parse_bool)
                .or(file.session_bus)
                .unwrap_or(false),
        })
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Parse an env value, ignoring it (with a warning) when malformed.
fn env_parse<T>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = env(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring malformed value");
    }
    parsed
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Parse `format:path[,format:path...]`, e.g. `onnx:/models/facenet.onnx,ort:/models/facenet.ort`.
fn parse_model_sources(spec: &str) -> Result<Vec<ModelSource>, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "ROLLCALL_MODEL_SOURCES",
        value: spec.to_string(),
        reason: reason.to_string(),
    };

    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (format, path) = entry
                .split_once(':')
                .ok_or_else(|| invalid("expected format:path"))?;
            let format = match format {
                "onnx" => ModelFormat::Onnx,
                "ort" => ModelFormat::Ort,
                _ => return Err(invalid("format must be onnx or ort")),
            };
            Ok(ModelSource::new(format, path))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(FileConfig::default(), env_of(&[("HOME", "/home/t")])).unwrap();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.normalization, Normalization::Symmetric);
        assert!((config.match_threshold - 0.6).abs() < 1e-6);
        assert_eq!(config.db_path, PathBuf::from("/home/t/.local/share/rollcall/rollcall.db"));
        assert_eq!(config.model_sources.len(), 2);
        assert_eq!(config.model_sources[0].format, ModelFormat::Onnx);
        assert_eq!(config.model_sources[1].format, ModelFormat::Ort);
    }

    #[test]
    fn test_env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            match_threshold = 0.8
            normalization = "unit"
            camera_device = "/dev/video4"
            "#,
        )
        .unwrap();
        let config = Config::resolve(file, env_of(&[("ROLLCALL_MATCH_THRESHOLD", "0.45")])).unwrap();
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.normalization, Normalization::Unit);
        assert_eq!(config.camera_device, "/dev/video4");
    }

    #[test]
    fn test_file_model_sources() {
        let file: FileConfig = toml::from_str(
            r#"
            [[model_sources]]
            format = "ort"
            path = "/opt/models/face.ort"
            "#,
        )
        .unwrap();
        let config = Config::resolve(file, env_of(&[])).unwrap();
        assert_eq!(
            config.model_sources,
            vec![ModelSource::new(ModelFormat::Ort, "/opt/models/face.ort")]
        );
    }

    #[test]
    fn test_model_dir_drives_default_sources() {
        let config =
            Config::resolve(FileConfig::default(), env_of(&[("ROLLCALL_MODEL_DIR", "/srv/m")])).unwrap();
        assert_eq!(config.model_sources[0].path, PathBuf::from("/srv/m/facenet.onnx"));
    }

    #[test]
    fn test_env_model_sources() {
        let config = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_MODEL_SOURCES", "onnx:/a/x.onnx, ort:/b/y.ort")]),
        )
        .unwrap();
        assert_eq!(config.model_sources[1], ModelSource::new(ModelFormat::Ort, "/b/y.ort"));

        let err = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_MODEL_SOURCES", "tflite:/a/x.tflite")]),
        );
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_bad_normalization_rejected() {
        let err = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_NORMALIZATION", "xception")]),
        );
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_unusable_threshold_rejected() {
        for raw in ["NaN", "inf", "-0.5", "0"] {
            let err = Config::resolve(
                FileConfig::default(),
                env_of(&[("ROLLCALL_MATCH_THRESHOLD", raw)]),
            );
            assert!(matches!(err, Err(ConfigError::Invalid { key: "match_threshold", .. })), "{raw}");
        }

        let file: FileConfig = toml::from_str("match_threshold = -1.0").unwrap();
        assert!(matches!(
            Config::resolve(file, env_of(&[])),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_malformed_numbers_fall_back() {
        let config = Config::resolve(
            FileConfig::default(),
            env_of(&[("ROLLCALL_WARMUP_FRAMES", "lots"), ("ROLLCALL_CAMERA_ENABLED", "0")]),
        )
        .unwrap();
        assert_eq!(config.warmup_frames, 4);
        assert!(!config.camera_enabled);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(toml::from_str::<FileConfig>("threshold = 0.5").is_err());
    }
}
