use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub service: ServiceConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Base URL of the record service
  pub url: String,
  /// Author handle whose journal this client works on
  pub author: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Resident cache budget in bytes
  #[serde(default = "default_max_size")]
  pub max_size_bytes: usize,
  /// Fraction of the budget that triggers eviction
  #[serde(default = "default_pressure_threshold")]
  pub pressure_threshold: f64,
  /// Seconds before cached data is considered stale
  #[serde(default = "default_stale_secs")]
  pub stale_secs: u64,
  /// Whether to persist a snapshot across sessions
  #[serde(default)]
  pub persist: bool,
}

fn default_max_size() -> usize {
  4 * 1024 * 1024
}

fn default_pressure_threshold() -> f64 {
  0.8
}

fn default_stale_secs() -> u64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size_bytes: default_max_size(),
      pressure_threshold: default_pressure_threshold(),
      stale_secs: default_stale_secs(),
      persist: false,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./jotline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/jotline/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/jotline/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("jotline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("jotline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Get the service API token from environment variables.
  ///
  /// Checks JOTLINE_TOKEN first, then JOURNAL_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("JOTLINE_TOKEN")
      .or_else(|_| std::env::var("JOURNAL_API_TOKEN"))
      .map_err(|_| {
        eyre!("Service token not found. Set JOTLINE_TOKEN or JOURNAL_API_TOKEN environment variable.")
      })
  }
}
