//! Binary configuration: which backend to open and how the engine behaves.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use anyhow::Context as _;
use rapport_core::config::GraphConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
  #[default]
  Sqlite,
  /// Process-local; state is gone when the command exits.
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  pub backend:    Backend,
  pub store_path: PathBuf,
  /// Deadline applied to each command; `0` disables it.
  pub timeout_ms: u64,
  pub graph:      GraphConfig,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      backend:    Backend::Sqlite,
      store_path: PathBuf::from("~/.local/share/rapport/rapport.db"),
      timeout_ms: 5_000,
      graph:      GraphConfig::default(),
    }
  }
}

impl AppConfig {
  /// Layer the optional config file under `RAPPORT__*` environment
  /// variables (`RAPPORT__GRAPH__RATE_LIMITS__FOLLOW__LIMIT=10`).
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("RAPPORT").separator("__"))
      .build()
      .context("failed to read config file")?;

    settings
      .try_deserialize()
      .context("failed to deserialise AppConfig")
  }

  pub fn timeout(&self) -> Option<Duration> {
    (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/") {
    if let Ok(home) = std::env::var("HOME") {
      return PathBuf::from(home).join(rest);
    }
  }
  path.to_path_buf()
}
