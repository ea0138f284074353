//! Run configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level configuration for a verification run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Subject source CSV
    pub input_csv: PathBuf,

    /// Output directory for screenshots, diffs, ledger and summary
    pub out_dir: PathBuf,

    /// Number of concurrent workers
    pub concurrency: usize,

    /// Run the browser without a window
    pub headless: bool,

    /// Prebuilt in-page refresh bundle
    pub refresh_script: PathBuf,

    /// Attempts per navigation before giving up
    pub navigation_attempts: u32,

    /// Per-pixel sensitivity for the image diff (0-1)
    pub diff_threshold: f64,

    pub viewport: ViewportConfig,
    pub timeouts: TimeoutConfig,
    pub settle: SettleConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input_csv: PathBuf::from("themes.csv"),
            out_dir: PathBuf::from("out"),
            concurrency: 3,
            headless: true,
            refresh_script: PathBuf::from("refresh_cart.js"),
            navigation_attempts: 4,
            diff_threshold: 0.1,
            viewport: ViewportConfig::default(),
            timeouts: TimeoutConfig::default(),
            settle: SettleConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self { width: 1280, height: 720 }
    }
}

/// Hard limits on browser operations, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub navigation_ms: u64,
    pub evaluate_ms: u64,
    pub trigger_wait_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation_ms: 60_000,
            evaluate_ms: 15_000,
            trigger_wait_ms: 8_000,
        }
    }
}

impl TimeoutConfig {
    pub fn navigation(&self) -> Duration {
        Duration::from_millis(self.navigation_ms)
    }

    pub fn evaluate(&self) -> Duration {
        Duration::from_millis(self.evaluate_ms)
    }

    pub fn trigger_wait(&self) -> Duration {
        Duration::from_millis(self.trigger_wait_ms)
    }
}

/// Fixed settle windows after interactions, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettleConfig {
    pub after_trigger_ms: u64,
    pub after_manual_ms: u64,
    pub after_refresh_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            after_trigger_ms: 5_000,
            after_manual_ms: 2_000,
            after_refresh_ms: 5_000,
        }
    }
}

impl SettleConfig {
    pub fn after_trigger(&self) -> Duration {
        Duration::from_millis(self.after_trigger_ms)
    }

    pub fn after_manual(&self) -> Duration {
        Duration::from_millis(self.after_manual_ms)
    }

    pub fn after_refresh(&self) -> Duration {
        Duration::from_millis(self.after_refresh_ms)
    }
}

impl RunConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".to_string()));
        }
        if self.navigation_attempts == 0 {
            return Err(Error::InvalidConfig(
                "navigation_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.diff_threshold) {
            return Err(Error::InvalidConfig(format!(
                "diff_threshold {} outside 0..=1",
                self.diff_threshold
            )));
        }
        Ok(())
    }

    /// Ledger location
    pub fn ledger_path(&self) -> PathBuf {
        self.out_dir.join("results.csv")
    }

    /// Run summary location
    pub fn summary_path(&self) -> PathBuf {
        self.out_dir.join("summary.json")
    }
}
