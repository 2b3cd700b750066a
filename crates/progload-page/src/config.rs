//! Page-side configuration
//!
//! Every recognized option is listed here with its default; unknown keys are
//! rejected when loading.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PageError;
use crate::Result;

/// Lazy loading, retry, hint and bridge settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PageConfig {
    /// Distance in pixels around the viewport that counts as visible
    pub root_margin_px: f64,
    /// Visible fraction (0.0 to 1.0) required to start loading
    pub threshold: f64,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    pub retry: RetryConfig,
    /// Scroll/resize poll period when no visibility observer exists
    pub poll_interval_ms: u64,
    /// Most critical resources announced ahead of observation
    pub early_hint_limit: usize,
    /// Asset swapped in when an element ends in `error`
    pub fallback_src: String,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub backoff: Backoff,
    pub max_delay_ms: u64,
}

/// Bounds and triggers of root-margin adaptation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub min_margin_px: f64,
    pub max_margin_px: f64,
    /// Size of one adjustment
    pub step_px: f64,
    /// Tasks at least this long count as long tasks
    pub long_task_threshold_ms: f64,
    /// Long tasks within the window that count as sustained
    pub sustained_long_tasks: usize,
    pub long_task_window_ms: u64,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            root_margin_px: 200.0,
            threshold: 0.0,
            max_retries: 3,
            retry: RetryConfig::default(),
            poll_interval_ms: 200,
            early_hint_limit: 3,
            fallback_src: "/images/fallback.svg".to_string(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            backoff: Backoff::Exponential,
            max_delay_ms: 8000,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            min_margin_px: 0.0,
            max_margin_px: 800.0,
            step_px: 100.0,
            long_task_threshold_ms: 50.0,
            sustained_long_tasks: 3,
            long_task_window_ms: 5000,
        }
    }
}

impl PageConfig {
    /// Load configuration from a YAML file, or defaults if it doesn't exist
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(PageError::Config {
                message: message.to_string(),
            })
        };

        if !(0.0..=1.0).contains(&self.threshold) {
            return invalid("threshold must be within [0, 1]");
        }
        if self.root_margin_px < 0.0 {
            return invalid("root_margin_px must not be negative");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return invalid("retry.max_delay_ms must be at least retry.initial_delay_ms");
        }
        let bridge = &self.bridge;
        if bridge.min_margin_px < 0.0 || bridge.min_margin_px > bridge.max_margin_px {
            return invalid("bridge margins must satisfy 0 <= min_margin_px <= max_margin_px");
        }
        if bridge.step_px <= 0.0 {
            return invalid("bridge.step_px must be positive");
        }
        if bridge.sustained_long_tasks == 0 {
            return invalid("bridge.sustained_long_tasks must be positive");
        }
        Ok(())
    }
}
