//! Scheduler configuration.
//!
//! Every field has a default so an empty file (or no file) yields a working
//! setup. Keys are camelCase to match the gateway's JSON config format.
//! Reload works by loading again and re-applying the relevant sections to
//! the live components.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Hard ceiling on the coalesce window, applied at use.
pub const MAX_COALESCE_WINDOW_MS: u64 = 5_000;

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub agents: AgentSettings,
    pub cron: CronSettings,
    /// Per-provider auth configuration, keyed by provider name.
    pub providers: HashMap<String, ProviderSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentSettings {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentDefaults {
    /// Global cap on concurrently-active session lanes.
    pub max_concurrent_sessions: usize,
    /// Provider used when a message carries no override.
    pub provider: String,
    pub auth_cache: AuthCacheSettings,
    pub coalesce: CoalesceSettings,
    pub subagents: SubagentSettings,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 16,
            provider: "anthropic".to_string(),
            auth_cache: AuthCacheSettings::default(),
            coalesce: CoalesceSettings::default(),
            subagents: SubagentSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthCacheSettings {
    pub ttl_ms: u64,
    pub max_size: usize,
}

impl Default for AuthCacheSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            max_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoalesceSettings {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_messages: usize,
    /// Regex patterns for session keys that bypass coalescing. Keys
    /// containing `subagent:` always bypass, independent of this list.
    pub exclude_patterns: Vec<String>,
}

impl Default for CoalesceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 1_500,
            max_messages: 10,
            exclude_patterns: Vec::new(),
        }
    }
}

impl CoalesceSettings {
    /// Window duration with the 5 s ceiling applied.
    pub fn clamped_window_ms(&self) -> u64 {
        self.window_ms.min(MAX_COALESCE_WINDOW_MS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubagentSettings {
    /// Minutes after completion before a run's record and child session
    /// are removed.
    pub archive_after_minutes: u64,
    /// Abort a subagent worker that runs longer than this.
    pub run_timeout_seconds: Option<u64>,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            archive_after_minutes: 60,
            run_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronSettings {
    /// Concurrency of the `cron` lane.
    pub max_concurrent_runs: usize,
}

impl Default for CronSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Profile ids in resolution order.
    pub profiles: Vec<String>,
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields defaults; a
    /// malformed file is an error.
    pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(SettingsError::Io {
                    path: path.display().to_string(),
                    source: err,
                })
            }
        };
        let settings: Settings = serde_json::from_str(&raw)?;
        settings.validate()
    }

    /// Floor the ≥ 1 integers and reject nonsense.
    pub fn validate(mut self) -> Result<Self, SettingsError> {
        if self.agents.defaults.max_concurrent_sessions == 0 {
            return Err(SettingsError::Invalid(
                "agents.defaults.maxConcurrentSessions must be at least 1".to_string(),
            ));
        }
        if self.agents.defaults.subagents.archive_after_minutes == 0 {
            return Err(SettingsError::Invalid(
                "agents.defaults.subagents.archiveAfterMinutes must be at least 1".to_string(),
            ));
        }
        self.agents.defaults.auth_cache.max_size = self.agents.defaults.auth_cache.max_size.max(1);
        self.agents.defaults.coalesce.max_messages =
            self.agents.defaults.coalesce.max_messages.max(1);
        self.cron.max_concurrent_runs = self.cron.max_concurrent_runs.max(1);
        Ok(self)
    }

    /// Profile resolution order for a provider, empty when unconfigured.
    pub fn profile_order(&self, provider: &str) -> &[String] {
        self.providers
            .get(provider)
            .map(|p| p.profiles.as_slice())
            .unwrap_or(&[])
    }
}
