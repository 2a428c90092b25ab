//! Configuration system for nettrace
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides
//! - Validation

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete tracer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Tracer settings
    pub tracer: TracerSettings,

    /// Conntrack settings
    pub conntrack: ConntrackSettings,

    /// Export settings
    pub export: ExportSettings,
}

/// Tracer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,

    /// Enable network tracing
    pub enabled: bool,

    /// Seconds between polls of the kernel tables
    pub interval_secs: u64,

    /// Seconds after which an unobserved connection is dropped
    pub connection_timeout_secs: u64,

    /// Upper bound on connections kept in tracker state
    pub max_tracked_connections: usize,

    /// Kernel versions ("X.Y.Z") on which tracing must not start
    pub excluded_linux_versions: Vec<String>,

    /// Path to the compiled probe object
    pub bpf_object_path: Option<String>,

    /// Emit addresses as octet arrays instead of text
    pub structured_addresses: bool,

    /// Read the IPv6 table
    pub collect_ipv6: bool,

    /// Unix socket serving the most recent connection set
    pub socket_path: Option<String>,
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enabled: true,
            interval_secs: 30,
            connection_timeout_secs: 120,
            max_tracked_connections: 65536,
            excluded_linux_versions: Vec::new(),
            bpf_object_path: None,
            structured_addresses: false,
            collect_ipv6: true,
            socket_path: None,
        }
    }
}

/// Conntrack settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConntrackSettings {
    /// Enable NAT enrichment
    pub enabled: bool,

    /// Per-connection lookup timeout
    pub lookup_timeout_ms: u64,

    /// Seconds between conntrack table dumps
    pub refresh_interval_secs: u64,

    /// Maximum cached translations
    pub max_entries: usize,

    /// Time one poll may spend on lookups in total
    pub poll_budget_ms: u64,
}

impl Default for ConntrackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lookup_timeout_ms: 50,
            refresh_interval_secs: 10,
            max_entries: 32768,
            poll_budget_ms: 2000,
        }
    }
}

/// Export settings container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// JSONL file output
    pub jsonl: JsonlExportConfig,

    /// Write an empty connection set as `[]` instead of `null`
    pub nil_slice_as_empty: bool,
}

/// JSONL export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlExportConfig {
    /// Enable JSONL export
    pub enabled: bool,

    /// Output file path
    pub path: String,

    /// Append to existing file
    pub append: bool,

    /// Flush after each payload
    pub flush_each: bool,

    /// Pretty print JSON
    pub pretty: bool,
}

impl Default for JsonlExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/var/lib/nettrace/connections.jsonl".to_string(),
            append: true,
            flush_each: true,
            pretty: false,
        }
    }
}

impl TracerConfig {
    /// Connection timeout in the nanosecond clock used by the tracker
    pub fn connection_timeout_ns(&self) -> u64 {
        self.tracer
            .connection_timeout_secs
            .saturating_mul(1_000_000_000)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. NETTRACE_CONFIG environment variable
    /// 3. ~/.config/nettrace/config.toml
    /// 4. /etc/nettrace/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<TracerConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            TracerConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("NETTRACE_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("NETTRACE_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        let path = PathBuf::from("/etc/nettrace/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<TracerConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: TracerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut TracerConfig) {
        if let Ok(val) = std::env::var("NETTRACE_LOG_LEVEL") {
            config.tracer.log_level = val;
        }
        if let Ok(val) = std::env::var("NETTRACE_ENABLED") {
            config.tracer.enabled = val.parse().unwrap_or(config.tracer.enabled);
        }
        if let Ok(val) = std::env::var("NETTRACE_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                config.tracer.interval_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("NETTRACE_CONNECTION_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.tracer.connection_timeout_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("NETTRACE_BPF_OBJECT") {
            config.tracer.bpf_object_path = Some(val);
        }
        if let Ok(val) = std::env::var("NETTRACE_EXCLUDED_LINUX_VERSIONS") {
            config.tracer.excluded_linux_versions = val
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("NETTRACE_SOCKET") {
            config.tracer.socket_path = Some(val);
        }

        if let Ok(val) = std::env::var("NETTRACE_CONNTRACK_ENABLED") {
            config.conntrack.enabled = val.parse().unwrap_or(config.conntrack.enabled);
        }

        if let Ok(val) = std::env::var("NETTRACE_JSONL_PATH") {
            config.export.jsonl.path = val;
        }
        if let Ok(val) = std::env::var("NETTRACE_JSONL_ENABLED") {
            config.export.jsonl.enabled = val.parse().unwrap_or(config.export.jsonl.enabled);
        }
    }

    /// Validate configuration
    fn validate(&self, config: &TracerConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.tracer.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.tracer.log_level, valid_levels
            )));
        }

        if config.tracer.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Poll interval cannot be 0".to_string(),
            ));
        }

        if config.tracer.max_tracked_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_tracked_connections cannot be 0".to_string(),
            ));
        }

        for version in &config.tracer.excluded_linux_versions {
            let well_formed = version.split('.').count() == 3
                && version.split('.').all(|p| p.parse::<u32>().is_ok());
            if !well_formed {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid excluded kernel version: {}. Expected X.Y.Z",
                    version
                )));
            }
        }

        if config.conntrack.enabled && config.conntrack.lookup_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Conntrack lookup timeout cannot be 0".to_string(),
            ));
        }

        if config.conntrack.enabled && config.conntrack.poll_budget_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Conntrack poll budget cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the default per-user config file path
    pub fn default_config_path() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
            .map(|d| d.join("nettrace").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracerConfig::default();
        assert_eq!(config.tracer.log_level, "info");
        assert!(config.tracer.enabled);
        assert_eq!(config.tracer.connection_timeout_secs, 120);
        assert_eq!(config.connection_timeout_ns(), 120_000_000_000);
        assert!(config.conntrack.enabled);
        assert_eq!(config.conntrack.poll_budget_ms, 2000);
        assert!(config.tracer.socket_path.is_none());
        assert!(!config.export.nil_slice_as_empty);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [tracer]
            log_level = "debug"
        "#;
        let config: TracerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tracer.log_level, "debug");
        assert_eq!(config.tracer.interval_secs, 30);
        assert!(config.conntrack.enabled);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [tracer]
            log_level = "trace"
            interval_secs = 5
            connection_timeout_secs = 60
            excluded_linux_versions = ["5.5.1", "6.3.2"]
            bpf_object_path = "/opt/nettrace/tracer.o"
            structured_addresses = true
            socket_path = "/run/nettrace.sock"

            [conntrack]
            enabled = false
            lookup_timeout_ms = 20
            poll_budget_ms = 500

            [export]
            nil_slice_as_empty = true

            [export.jsonl]
            path = "/tmp/conns.jsonl"
            append = false
        "#;

        let config: TracerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.tracer.log_level, "trace");
        assert_eq!(config.tracer.interval_secs, 5);
        assert_eq!(
            config.tracer.excluded_linux_versions,
            vec!["5.5.1", "6.3.2"]
        );
        assert_eq!(
            config.tracer.bpf_object_path.as_deref(),
            Some("/opt/nettrace/tracer.o")
        );
        assert!(config.tracer.structured_addresses);
        assert!(!config.conntrack.enabled);
        assert_eq!(config.conntrack.lookup_timeout_ms, 20);
        assert_eq!(config.conntrack.poll_budget_ms, 500);
        assert_eq!(
            config.tracer.socket_path.as_deref(),
            Some("/run/nettrace.sock")
        );
        assert!(config.export.nil_slice_as_empty);
        assert_eq!(config.export.jsonl.path, "/tmp/conns.jsonl");
        assert!(!config.export.jsonl.append);
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = TracerConfig {
            tracer: TracerSettings {
                log_level: "invalid".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let loader = ConfigLoader::new();
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_validation_bad_exclusion() {
        let config = TracerConfig {
            tracer: TracerSettings {
                excluded_linux_versions: vec!["5.5".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let loader = ConfigLoader::new();
        assert!(loader.validate(&config).is_err());
    }

    #[test]
    fn test_load_from_cli_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tracer]\ninterval_secs = 7\n").unwrap();

        let config = ConfigLoader::new()
            .with_cli_path(Some(path))
            .load()
            .unwrap();
        assert_eq!(config.tracer.interval_secs, 7);
    }
}
