//! Runtime settings
//!
//! Settings are read from a YAML file; every key is optional.
//!
//! ```yaml
//! feed:
//!   poll_interval_ms: 1000
//!   namespaces: [blog.posts]
//! retry:
//!   attempts: 5
//!   delay_ms: 1000
//! search:
//!   page_size: 5
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub feed: FeedSettings,
    pub retry: RetrySettings,
    pub search: SearchSettings,
}

/// Change-feed tailing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Sleep between polls of an exhausted or failed cursor
    pub poll_interval_ms: u64,
    /// Namespaces to follow; empty follows everything
    pub namespaces: Vec<String>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            namespaces: Vec::new(),
        }
    }
}

impl FeedSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Bounded retry of search index writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    /// Default number of hits per result page
    pub page_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self { page_size: 5 }
    }
}

impl Settings {
    /// Load settings from a YAML file, falling back to defaults when the
    /// file does not exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("invalid settings in {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings = serde_yaml::from_str(content)?;
        for ns in &settings.feed.namespaces {
            crate::validation::validate_namespace(ns)?;
        }
        Ok(settings)
    }
}
