use attend_core::TrainConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which face detector the daemon runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    /// Skin-region detector, no model files.
    Skin,
    /// SCRFD via ONNX Runtime.
    Scrfd,
}

impl FromStr for DetectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skin" => Ok(DetectorKind::Skin),
            "scrfd" => Ok(DetectorKind::Scrfd),
            other => Err(format!("unknown detector '{other}' (expected skin or scrfd)")),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    /// SQLite database holding users, embeddings and attendance.
    pub db_path: PathBuf,
    /// Trained deep model artifact (JSON).
    pub model_path: PathBuf,
    pub detector: DetectorKind,
    pub scrfd_model: PathBuf,
    /// Minimum confidence for a classical match.
    pub classical_threshold: f32,
    /// Minimum confidence for a deep match.
    pub deep_threshold: f32,
    /// Secondary faces at least this fraction of the largest face's area make a photo ambiguous.
    pub ambiguity_ratio: f32,
    /// Uploads are downscaled to fit this size (0 = no limit).
    pub max_image_dimension: u32,
    pub max_upload_bytes: usize,
    /// When false, registering an existing user id fails instead of overwriting.
    pub allow_reregistration: bool,
    pub train: TrainConfig,
    pub train_timeout: Duration,
}

/// Values read from the optional TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub model_path: Option<PathBuf>,
    pub detector: Option<String>,
    pub scrfd_model: Option<PathBuf>,
    pub classical_threshold: Option<f32>,
    pub deep_threshold: Option<f32>,
    pub ambiguity_ratio: Option<f32>,
    pub max_image_dimension: Option<u32>,
    pub max_upload_bytes: Option<usize>,
    pub allow_reregistration: Option<bool>,
    pub train_epochs: Option<usize>,
    pub fine_tune_epochs: Option<usize>,
    pub train_batch_size: Option<usize>,
    pub train_hidden: Option<usize>,
    pub train_learning_rate: Option<f32>,
    pub train_seed: Option<u64>,
    pub train_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Defaults, then the TOML file named by `ATTEND_CONFIG`, then `ATTEND_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("ATTEND_CONFIG") {
            Some(path) => FileConfig::read(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merge file values and environment lookups over the defaults, then validate.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = env("ATTEND_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let db_path = env("ATTEND_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| data_dir.join("attend.db"));
        let model_path = env("ATTEND_MODEL_PATH")
            .map(PathBuf::from)
            .or(file.model_path)
            .unwrap_or_else(|| data_dir.join("deep_model.json"));
        let scrfd_model = env("ATTEND_SCRFD_MODEL")
            .map(PathBuf::from)
            .or(file.scrfd_model)
            .unwrap_or_else(|| data_dir.join("models").join("det_10g.onnx"));

        let defaults = TrainConfig::default();
        let train = TrainConfig {
            hidden: pick(&env, "ATTEND_TRAIN_HIDDEN", file.train_hidden, defaults.hidden),
            epochs: pick(&env, "ATTEND_TRAIN_EPOCHS", file.train_epochs, defaults.epochs),
            fine_tune_epochs: pick(
                &env,
                "ATTEND_FINE_TUNE_EPOCHS",
                file.fine_tune_epochs,
                defaults.fine_tune_epochs,
            ),
            batch_size: pick(&env, "ATTEND_TRAIN_BATCH_SIZE", file.train_batch_size, defaults.batch_size),
            learning_rate: pick(
                &env,
                "ATTEND_TRAIN_LEARNING_RATE",
                file.train_learning_rate,
                defaults.learning_rate,
            ),
            seed: pick(&env, "ATTEND_TRAIN_SEED", file.train_seed, defaults.seed),
            min_classes: defaults.min_classes,
        };

        let file_detector = match file.detector {
            Some(name) => Some(name.parse::<DetectorKind>().map_err(ConfigError::Invalid)?),
            None => None,
        };
        let file_bind = match file.bind {
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|e| ConfigError::Invalid(format!("bind '{addr}': {e}")))?,
            ),
            None => None,
        };

        let config = Self {
            bind: pick(&env, "ATTEND_BIND", file_bind, SocketAddr::from(([0, 0, 0, 0], 5000))),
            data_dir,
            db_path,
            model_path,
            detector: pick(&env, "ATTEND_DETECTOR", file_detector, DetectorKind::Skin),
            scrfd_model,
            classical_threshold: pick(&env, "ATTEND_CLASSICAL_THRESHOLD", file.classical_threshold, 0.75),
            deep_threshold: pick(&env, "ATTEND_DEEP_THRESHOLD", file.deep_threshold, 0.80),
            ambiguity_ratio: pick(&env, "ATTEND_AMBIGUITY_RATIO", file.ambiguity_ratio, 0.25),
            max_image_dimension: pick(&env, "ATTEND_MAX_IMAGE_DIMENSION", file.max_image_dimension, 1024),
            max_upload_bytes: pick(&env, "ATTEND_MAX_UPLOAD_BYTES", file.max_upload_bytes, 10 * 1024 * 1024),
            allow_reregistration: env("ATTEND_ALLOW_REREGISTRATION")
                .and_then(|v| parse_bool(&v))
                .or(file.allow_reregistration)
                .unwrap_or(true),
            train,
            train_timeout: Duration::from_secs(pick(
                &env,
                "ATTEND_TRAIN_TIMEOUT_SECS",
                file.train_timeout_secs,
                300,
            )),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("classical_threshold", self.classical_threshold),
            ("deep_threshold", self.deep_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if !(self.ambiguity_ratio > 0.0 && self.ambiguity_ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "ambiguity_ratio must be within (0, 1], got {}",
                self.ambiguity_ratio
            )));
        }
        if self.train.hidden == 0 || self.train.batch_size == 0 || self.train.epochs == 0 {
            return Err(ConfigError::Invalid(
                "train_hidden, train_batch_size and train_epochs must be positive".into(),
            ));
        }
        if !(self.train.learning_rate > 0.0 && self.train.learning_rate.is_finite()) {
            return Err(ConfigError::Invalid("train_learning_rate must be positive".into()));
        }
        if self.train_timeout.is_zero() {
            return Err(ConfigError::Invalid("train_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attend")
}

/// Environment value if it parses, else the file value, else the default.
fn pick<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    file: Option<T>,
    default: T,
) -> T {
    let from_env = env(key).and_then(|raw| match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    });
    from_env.or(file).unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
