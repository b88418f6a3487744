use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    #[default]
    Session,
    System,
}

impl FromStr for Bus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Bus::Session),
            "system" => Ok(Bus::System),
            other => Err(format!("unknown bus {other:?}")),
        }
    }
}

/// Optional on-disk configuration; every field may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub encryption_key: Option<String>,
    pub key_instructions_path: Option<PathBuf>,
    pub min_face_size: Option<u32>,
    pub similarity_threshold: Option<f32>,
    pub bus: Option<Bus>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
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

/// Daemon configuration: TOML file named by `LIKENESS_CONFIG`, overridden by
/// `LIKENESS_*` environment variables, then defaults.
pub struct Config {
    /// Root of the mapping file and both artifact trees.
    pub data_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Base64url key; a fresh one is generated when absent or invalid.
    pub encryption_key: Option<String>,
    /// Example-configuration file that receives generated key instructions.
    pub key_instructions_path: PathBuf,
    /// Minimum face width and height in pixels.
    pub min_face_size: u32,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    pub bus: Bus,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("model_dir", &self.model_dir)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("key_instructions_path", &self.key_instructions_path)
            .field("min_face_size", &self.min_face_size)
            .field("similarity_threshold", &self.similarity_threshold)
            .field("bus", &self.bus)
            .finish()
    }
}

impl Config {
    /// Load from the process environment and the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os("LIKENESS_CONFIG") {
            Some(path) => {
                let path = PathBuf::from(path);
                tracing::info!(path = %path.display(), "loading config file");
                FileConfig::from_path(&path)?
            }
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge file values with overrides from `env`.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("LIKENESS_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        let model_dir = env("LIKENESS_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(likeness_core::default_model_dir);

        let key_instructions_path = env("LIKENESS_KEY_INSTRUCTIONS_PATH")
            .map(PathBuf::from)
            .or(file.key_instructions_path)
            .unwrap_or_else(|| data_dir.join("likeness.env.example"));

        Self {
            encryption_key: env(likeness_vault::KEY_ENV_VAR).or(file.encryption_key),
            min_face_size: parsed(&env, "LIKENESS_MIN_FACE_SIZE")
                .or(file.min_face_size)
                .unwrap_or(likeness_core::detection::DEFAULT_MIN_FACE_SIZE.0),
            similarity_threshold: parsed(&env, "LIKENESS_SIMILARITY_THRESHOLD")
                .or(file.similarity_threshold)
                .unwrap_or(likeness_core::recognizer::DEFAULT_SIMILARITY_THRESHOLD),
            bus: parsed(&env, "LIKENESS_BUS").or(file.bus).unwrap_or_default(),
            data_dir,
            model_dir,
            key_instructions_path,
        }
    }

    pub fn min_face_size(&self) -> (u32, u32) {
        (self.min_face_size, self.min_face_size)
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("likeness")
}

fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
