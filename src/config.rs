use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::Schema;
use crate::network::Thresholds;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub resources: ResourcesConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// In-process map, lost on exit
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: BackendKind,
  /// Database file (defaults to $XDG_DATA_HOME/openings-cache/cache.db)
  pub path: Option<PathBuf>,
  pub schema_name: String,
  pub partitions: Vec<String>,
  /// Seconds between background sweeps; 0 disables the sweeper
  pub sweep_interval_secs: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      backend: BackendKind::Sqlite,
      path: None,
      schema_name: "openings".to_string(),
      partitions: ["plans", "regions", "stores", "approvals", "messages", "http"]
        .into_iter()
        .map(String::from)
        .collect(),
      sweep_interval_secs: 300,
    }
  }
}

impl StorageConfig {
  pub fn schema(&self) -> Schema {
    Schema::new(self.schema_name.clone(), self.partitions.iter().cloned())
  }

  pub fn sweep_interval(&self) -> Option<Duration> {
    (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Endpoint probed to decide connectivity
  pub probe_url: String,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
  /// Round trips slower than this count as Degraded
  pub degraded_rtt_ms: u64,
  pub min_downlink_mbps: Option<f64>,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: "https://www.gstatic.com/generate_204".to_string(),
      probe_interval_secs: 15,
      probe_timeout_ms: 3000,
      degraded_rtt_ms: 1500,
      min_downlink_mbps: None,
    }
  }
}

impl NetworkConfig {
  pub fn probe_url(&self) -> Result<Url> {
    Url::parse(&self.probe_url)
      .map_err(|e| eyre!("Invalid network.probe_url '{}': {}", self.probe_url, e))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }

  pub fn thresholds(&self) -> Thresholds {
    Thresholds {
      degraded_rtt: Duration::from_millis(self.degraded_rtt_ms),
      min_downlink_mbps: self.min_downlink_mbps,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
  /// TTL for fetched values; 0 stores them without expiry
  pub default_ttl_secs: u64,
}

impl Default for ResourcesConfig {
  fn default() -> Self {
    Self {
      default_ttl_secs: 300,
    }
  }
}

impl ResourcesConfig {
  pub fn default_ttl(&self) -> Option<Duration> {
    (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// `EnvFilter` directives; RUST_LOG takes precedence
  pub filter: String,
  /// Also write logs to this file
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      filter: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./openings-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/openings-cache/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("openings-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("openings-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.storage.partitions.is_empty() {
      return Err(eyre!("storage.partitions must list at least one partition"));
    }
    Ok(config)
  }
}
