//! Config resolution: explicit path → `KE_CONFIG` → XDG config dir → defaults.
//!
//! An explicitly named file (flag or env var) must exist; the XDG location is
//! optional and silently skipped when absent.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::EngineConfig;
use crate::snapshot::ConfigSnapshot;
use crate::validate::{validate, ValidationResult};

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "KE_CONFIG";

/// Directory name under the XDG config dir.
pub const CONFIG_DIR_NAME: &str = "kalman_estimate";

/// File names tried in the XDG config dir, in order.
const CONFIG_FILE_NAMES: [&str; 2] = ["config.json", "config.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config validation failed: {}", .0.summary())]
    Validation(ValidationResult),

    #[error("config snapshot failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Candidate config locations.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// `--config` flag.
    pub explicit: Option<PathBuf>,
    /// Value of `KE_CONFIG`.
    pub env: Option<PathBuf>,
    /// `$XDG_CONFIG_HOME/kalman_estimate`.
    pub config_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Discover locations from the process environment.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        Self {
            explicit,
            env: std::env::var_os(CONFIG_ENV_VAR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            config_dir: dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME)),
        }
    }
}

/// Where the resolved config came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Env(PathBuf),
    ConfigDir(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn describe(&self) -> String {
        match self {
            ConfigSource::Explicit(p) | ConfigSource::Env(p) | ConfigSource::ConfigDir(p) => {
                p.display().to_string()
            }
            ConfigSource::Defaults => "defaults".to_string(),
        }
    }

    pub fn is_defaults(&self) -> bool {
        matches!(self, ConfigSource::Defaults)
    }
}

/// A validated config plus its provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: EngineConfig,
    pub source: ConfigSource,
    pub snapshot: ConfigSnapshot,
}

/// Load a config file, choosing the parser by extension (`.toml`, else JSON).
pub fn load_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    if is_toml {
        EngineConfig::from_toml(&text).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    } else {
        EngineConfig::from_json(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Resolve, load, and validate the effective configuration.
pub fn resolve_config(paths: &ConfigPaths) -> Result<ResolvedConfig, ConfigError> {
    let (config, source) = if let Some(path) = &paths.explicit {
        (load_file(path)?, ConfigSource::Explicit(path.clone()))
    } else if let Some(path) = &paths.env {
        (load_file(path)?, ConfigSource::Env(path.clone()))
    } else if let Some(path) = paths.config_dir.as_ref().and_then(|dir| {
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }) {
        (load_file(&path)?, ConfigSource::ConfigDir(path))
    } else {
        (EngineConfig::default(), ConfigSource::Defaults)
    };

    let result = validate(&config);
    if !result.is_ok() {
        return Err(ConfigError::Validation(result));
    }

    let snapshot = ConfigSnapshot::capture(&config, source.describe())?;
    Ok(ResolvedConfig {
        config,
        source,
        snapshot,
    })
}
