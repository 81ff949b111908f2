use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "cocotap.yaml";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/cocotap/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the rule-table tool gains root privileges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    /// Already root, or use the first of run0, sudo, pkexec that is installed.
    #[default]
    Auto,
    None,
    Sudo,
    Pkexec,
    Run0,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `iptables` or `ip6tables`; also decides the address family.
    pub binary: String,
    pub elevation: Elevation,
    pub timeout_secs: u64,
    /// Seconds to wait for the xtables lock; 0 disables `-w`.
    pub lock_wait_secs: u32,
    pub dry_run: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
            elevation: Elevation::Auto,
            timeout_secs: 10,
            lock_wait_secs: 5,
            dry_run: false,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub compact: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            compact: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen: SocketAddr,
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 9139)),
            interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub presets_dir: PathBuf,
    /// Journal entries kept for undo.
    pub undo_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            presets_dir: PathBuf::from("/etc/cocotap/presets"),
            undo_depth: 32,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the explicit path if given, otherwise the first file found on the
    /// search path, otherwise the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for candidate in Self::search_path() {
            if candidate.is_file() {
                tracing::debug!(path = ?candidate, "loading config");
                return Self::from_file(&candidate);
            }
        }

        Ok(Self::default())
    }

    pub fn search_path() -> Vec<PathBuf> {
        vec![PathBuf::from(CONFIG_FILE_NAME), PathBuf::from(SYSTEM_CONFIG_PATH)]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let binary = self.backend.binary.trim();
        if binary.is_empty() {
            return Err(ConfigError::Invalid("backend.binary is empty".into()));
        }
        if binary.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!(
                "backend.binary '{}' must be a single program",
                binary
            )));
        }
        if self.backend.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend.timeout_secs must be at least 1".into(),
            ));
        }
        if self.metrics.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "metrics.interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backend.binary, "iptables");
        assert_eq!(config.backend.elevation, Elevation::Auto);
        assert_eq!(config.backend.timeout(), Duration::from_secs(10));
        assert_eq!(config.metrics.listen.port(), 9139);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
backend:
  binary: ip6tables
  elevation: sudo
logging:
  level: debug
"#,
        )
        .unwrap();
        assert_eq!(config.backend.binary, "ip6tables");
        assert_eq!(config.backend.elevation, Elevation::Sudo);
        assert_eq!(config.backend.timeout_secs, 10);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.metrics.interval_secs, 15);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "backend:\n  dry_run: true\n  lock_wait_secs: 0\npresets_dir: /tmp/presets"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert!(config.backend.dry_run);
        assert_eq!(config.backend.lock_wait_secs, 0);
        assert_eq!(config.presets_dir, PathBuf::from("/tmp/presets"));
    }

    #[test]
    fn test_invalid_files_are_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend: [not, a, map]").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend:\n  binary: \"iptables -F\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            Config::load(Some(Path::new("/nonexistent/cocotap.yaml"))),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_unknown_elevation_is_rejected() {
        assert!(Config::from_yaml("backend:\n  elevation: doas\n").is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../cocotap.example.yaml");
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.backend.binary, "iptables");
        assert_eq!(config.metrics.interval_secs, 15);
    }
}
