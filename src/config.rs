//! Throttle policy configuration.
//!
//! This module handles loading per-channel admission policies from YAML
//! configuration, mapping channel names to either a spacing or a window rule.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::admission::{Policy, DEFAULT_WINDOW};
use crate::error::{Result, TurnstileError};

/// A complete throttle configuration covering multiple channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Map of channel name to policy rule
    #[serde(default)]
    pub channels: HashMap<String, PolicyRule>,

    /// Rule applied to channels that are created lazily without an entry
    /// in `channels`
    #[serde(default)]
    pub default: Option<PolicyRule>,
}

/// A configured admission rule for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicyRule {
    /// Enforce a minimum spacing between grants.
    Spacing {
        /// Minimum milliseconds between consecutive grants
        interval_ms: u64,
    },
    /// Bound the number of grants over a trailing window.
    Window {
        /// Requested requests per window; the enforced budget is one less,
        /// clamped to a minimum of 1
        requests_per_window: f64,
        /// Window duration in milliseconds
        #[serde(default = "default_window_ms")]
        window_ms: u64,
    },
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW.as_millis() as u64
}

impl PolicyRule {
    /// Convert this rule to a runtime policy.
    pub fn to_policy(&self) -> Policy {
        match *self {
            PolicyRule::Spacing { interval_ms } => Policy::Spacing {
                interval: Duration::from_millis(interval_ms),
            },
            PolicyRule::Window {
                requests_per_window,
                window_ms,
            } => Policy::window_from_limit(requests_per_window, Duration::from_millis(window_ms)),
        }
    }
}

impl ThrottleConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse throttle config: {}", e)))
    }

    /// Get the rule for a specific channel.
    pub fn get_channel(&self, channel: &str) -> Option<&PolicyRule> {
        self.channels.get(channel)
    }
}
