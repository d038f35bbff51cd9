use crate::endpoint::DEFAULT_SOCKET_PATH;
use crate::monitor::memory::SampleOptions;
use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml::Value as TomlValue;

/// Known top-level config keys.
const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["daemon", "memory"];

/// Known keys within `[daemon]`.
const KNOWN_DAEMON_KEYS: &[&str] = &["socket_path"];

/// Known keys within `[memory]`.
const KNOWN_MEMORY_KEYS: &[&str] = &["interval_secs", "limit_bytes", "sample"];

/// Known keys within `[memory.sample]`.
const KNOWN_SAMPLE_KEYS: &[&str] = &["duration_secs", "timeout_secs"];

// Embed repository defaults
const DEFAULT_TOML: &str =
  include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/defaults/warden.toml"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
  #[serde(default)]
  pub socket_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleConfig {
  /// Seconds an offender samples before it is interrupted.
  pub duration_secs: f64,
  /// How long the monitor waits for the report. Defaults to the sample
  /// duration plus a grace period.
  #[serde(default)]
  pub timeout_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
  #[serde(default)]
  pub interval_secs: Option<f64>,
  /// Per-process resident limit in bytes. Unset disables the check.
  #[serde(default)]
  pub limit_bytes: Option<u64>,
  #[serde(default)]
  pub sample: Option<SampleConfig>,
}

impl MemoryConfig {
  #[must_use]
  pub fn interval(&self) -> Duration {
    Duration::from_secs_f64(self.interval_secs.unwrap_or(10.0))
  }

  #[must_use]
  pub fn sample_options(&self) -> Option<SampleOptions> {
    self.sample.as_ref().map(|sample| SampleOptions {
      duration: sample.duration_secs,
      timeout: Duration::from_secs_f64(
        sample.timeout_secs.unwrap_or(sample.duration_secs + 5.0),
      ),
    })
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WardenConfig {
  #[serde(default)]
  pub daemon: Option<DaemonConfig>,
  #[serde(default)]
  pub memory: Option<MemoryConfig>,
}

fn merge_values(base: &mut TomlValue, overlay: TomlValue) {
  match (base, overlay) {
    (TomlValue::Table(base_tbl), TomlValue::Table(overlay_tbl)) => {
      for (key, value) in overlay_tbl {
        match (base_tbl.get_mut(&key), value) {
          (Some(existing), new_value) => merge_values(existing, new_value),
          (None, new_value) => {
            base_tbl.insert(key, new_value);
          }
        }
      }
    }
    // Arrays and scalars: replace last-wins
    (base_slot, new_value) => *base_slot = new_value,
  }
}

/// Warn about unknown keys in a parsed TOML config file to catch typos.
fn warn_unknown_keys(val: &TomlValue, file_path: &Path) {
  let TomlValue::Table(table) = val else {
    return;
  };

  for key in table.keys() {
    if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
      warn!(
        "unknown config key '{}' in {} (known keys: {})",
        key,
        file_path.display(),
        KNOWN_TOP_LEVEL_KEYS.join(", ")
      );
    }
  }

  if let Some(TomlValue::Table(daemon)) = table.get("daemon") {
    for key in daemon.keys() {
      if !KNOWN_DAEMON_KEYS.contains(&key.as_str()) {
        warn!(
          "unknown config key 'daemon.{}' in {} (known keys: {})",
          key,
          file_path.display(),
          KNOWN_DAEMON_KEYS.join(", ")
        );
      }
    }
  }

  if let Some(TomlValue::Table(memory)) = table.get("memory") {
    for key in memory.keys() {
      if !KNOWN_MEMORY_KEYS.contains(&key.as_str()) {
        warn!(
          "unknown config key 'memory.{}' in {} (known keys: {})",
          key,
          file_path.display(),
          KNOWN_MEMORY_KEYS.join(", ")
        );
      }
    }
    if let Some(TomlValue::Table(sample)) = memory.get("sample") {
      for key in sample.keys() {
        if !KNOWN_SAMPLE_KEYS.contains(&key.as_str()) {
          warn!(
            "unknown config key 'memory.sample.{}' in {} (known keys: {})",
            key,
            file_path.display(),
            KNOWN_SAMPLE_KEYS.join(", ")
          );
        }
      }
    }
  }
}

/// Load and merge configuration from defaults, global, and project files.
///
/// # Errors
/// Returns an error if any of the config files cannot be read or parsed
/// as valid TOML, or if serialization of the merged config fails.
pub fn load_config(root: &Path) -> Result<WardenConfig> {
  // Start with embedded defaults
  let mut merged: TomlValue =
    toml::from_str(DEFAULT_TOML).context("invalid embedded default config")?;

  // Merge global XDG config if present
  let xdg = xdg::BaseDirectories::with_prefix("warden");
  if let Some(global_path) = xdg.find_config_file("warden.toml") {
    let data = fs::read_to_string(&global_path)
      .with_context(|| format!("failed to read {}", global_path.display()))?;
    let val: TomlValue = toml::from_str(&data)
      .with_context(|| format!("invalid TOML in {}", global_path.display()))?;
    warn_unknown_keys(&val, &global_path);
    merge_values(&mut merged, val);
  }

  // Merge project config if present
  let project_cfg = root.join("warden.toml");
  if project_cfg.exists() {
    let data = fs::read_to_string(&project_cfg)
      .with_context(|| format!("failed to read {}", project_cfg.display()))?;
    let val: TomlValue = toml::from_str(&data)
      .with_context(|| format!("invalid TOML in {}", project_cfg.display()))?;
    warn_unknown_keys(&val, &project_cfg);
    merge_values(&mut merged, val);
  }

  // Deserialize into strongly typed config
  let merged_str = toml::to_string(&merged).context("failed to serialize merged config")?;
  let cfg: WardenConfig = toml::from_str(&merged_str).context("failed to parse merged config")?;
  Ok(cfg)
}

/// Compute the supervisor socket path based on config and environment.
///
/// Precedence:
/// 1) `WARDEN_SOCKET_PATH` environment variable (local development override)
/// 2) `config.daemon.socket_path` if set
/// 3) Fallback to `./supervisor.ipc` relative to the service root
#[must_use]
pub fn compute_socket_path(cfg: &WardenConfig) -> PathBuf {
  if let Ok(env_path) = std::env::var("WARDEN_SOCKET_PATH") {
    return PathBuf::from(env_path);
  }
  if let Some(ref daemon) = cfg.daemon
    && let Some(ref path) = daemon.socket_path
  {
    return PathBuf::from(path);
  }
  PathBuf::from(DEFAULT_SOCKET_PATH)
}
