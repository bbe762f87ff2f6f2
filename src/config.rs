//! Configuration management with YAML support

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,

    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

/// Per-source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Root directory the adapter scans. None = adapter default location.
    #[serde(default)]
    pub root_path: Option<String>,

    /// Re-scan interval for `watch` mode, in seconds. 0 disables auto-scan.
    #[serde(default)]
    pub auto_scan_interval_secs: u64,

    /// Skip units whose fingerprint is already recorded, without re-reading
    /// their full content.
    #[serde(default)]
    pub skip_indexed: bool,
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum sessions to keep; oldest are pruned after a scan. 0 = unlimited.
    #[serde(default)]
    pub max_sessions: u64,
}

// Default value functions
fn default_database_path() -> String {
    "~/.local/share/chatvault/chatvault.db".to_string()
}

fn default_enabled() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_path: None,
            auto_scan_interval_secs: 0,
            skip_indexed: false,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_sessions: 0 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            sources: HashMap::new(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    /// Searches in order:
    /// 1. Provided path
    /// 2. ./chatvault.yaml (current directory)
    /// 3. ~/.config/chatvault/chatvault.yaml
    pub fn load(path: &str) -> Result<Self> {
        let search_paths = vec![
            shellexpand::tilde(path).to_string(),
            "chatvault.yaml".to_string(),
            shellexpand::tilde("~/.config/chatvault/chatvault.yaml").to_string(),
        ];

        for search_path in &search_paths {
            if std::path::Path::new(search_path).exists() {
                let content = std::fs::read_to_string(search_path)?;
                let config: Config = serde_yaml::from_str(&content)?;
                return Ok(config);
            }
        }

        // No config file found, use defaults
        Ok(Config::default())
    }

    /// Get the database path, expanding ~ to home directory
    pub fn database_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.database.path).to_string();
        PathBuf::from(expanded)
    }

    /// Check if a source is enabled (sources absent from the config default on)
    pub fn is_source_enabled(&self, name: &str) -> bool {
        self.sources.get(name).map_or(true, |s| s.enabled)
    }

    /// Get the configured root path for a source, if any
    pub fn source_root(&self, name: &str) -> Option<PathBuf> {
        self.sources
            .get(name)
            .and_then(|s| s.root_path.as_ref())
            .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
    }

    /// Get the skip-if-already-indexed flag for a source
    pub fn skip_indexed(&self, name: &str) -> bool {
        self.sources.get(name).map_or(false, |s| s.skip_indexed)
    }

    /// Get the auto-scan interval for a source (None when disabled)
    pub fn auto_scan_interval(&self, name: &str) -> Option<std::time::Duration> {
        self.sources
            .get(name)
            .map(|s| s.auto_scan_interval_secs)
            .filter(|&secs| secs > 0)
            .map(std::time::Duration::from_secs)
    }
}
