//! Config - TOML 設定ファイル
//!
//! ```toml
//! [scheduler]
//! tick_interval_ms = 1000
//! max_projects = 3      # 0 = 無制限
//! max_per_stage = 2     # 0 = 無制限
//! max_attempts = 3
//! stale_after_secs = 300
//! stale_sweep_interval_secs = 60
//! output_root = "./output"
//!
//! [store]
//! path = "stagecraft.db"
//! busy_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! format = "pretty"     # pretty | compact | json
//! ```
//!
//! 各セクション・各キーは省略可能で、省略時は上の値になります。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::SchedulerSettings;
use crate::domain::ConcurrencyLimits;
use crate::impls::DatabaseConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagecraftConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StagecraftConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub max_projects: usize,
    pub max_per_stage: usize,
    pub max_attempts: u32,
    pub stale_after_secs: u64,
    pub stale_sweep_interval_secs: u64,
    pub output_root: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_projects: 3,
            max_per_stage: 2,
            max_attempts: 3,
            stale_after_secs: 300,
            stale_sweep_interval_secs: 60,
            output_root: PathBuf::from("./output"),
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_attempts: self.max_attempts.max(1),
            stale_after: Duration::from_secs(self.stale_after_secs),
            stale_sweep_interval: Duration::from_secs(self.stale_sweep_interval_secs),
            output_root: self.output_root.clone(),
        }
    }

    pub fn limits(&self) -> ConcurrencyLimits {
        ConcurrencyLimits::from_counts(self.max_projects, self.max_per_stage)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stagecraft.db"),
            busy_timeout_ms: 5000,
        }
    }
}

impl StoreConfig {
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            ..DatabaseConfig::with_path(self.path.clone())
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    pub file_line: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            file_line: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_is_all_defaults() {
        assert_eq!(StagecraftConfig::parse("").unwrap(), StagecraftConfig::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = StagecraftConfig::parse(
            r#"
            [scheduler]
            max_projects = 0
            max_per_stage = 1

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.limits(), ConcurrencyLimits {
            max_projects: None,
            max_per_stage: Some(1),
        });
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn settings_convert_units() {
        let config = SchedulerConfig {
            tick_interval_ms: 250,
            stale_after_secs: 30,
            max_attempts: 0,
            ..SchedulerConfig::default()
        };
        let settings = config.settings();
        assert_eq!(settings.tick_interval, Duration::from_millis(250));
        assert_eq!(settings.stale_after, Duration::from_secs(30));
        assert_eq!(settings.max_attempts, 1);
    }

    #[test]
    fn store_section_maps_to_database_config() {
        let store = StoreConfig {
            path: PathBuf::from("/var/lib/stagecraft/queue.db"),
            busy_timeout_ms: 750,
        };
        let db = store.database_config();
        assert_eq!(db.path, PathBuf::from("/var/lib/stagecraft/queue.db"));
        assert_eq!(db.busy_timeout, Duration::from_millis(750));
        assert!(db.wal_mode);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StagecraftConfig::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, StagecraftConfig::default());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[scheduler]\nmax_projects = \"many\"").unwrap();
        assert!(matches!(
            StagecraftConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
