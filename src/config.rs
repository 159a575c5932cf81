use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::challenge::RequestType;
use crate::logging::LogLevel;

pub const DEFAULT_SECURITY_MARKER: &str = "CleanSpace";
pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How `analyzed_plugins` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PluginListType {
    #[default]
    Whitelist,
    Blacklist,
}

/// What happens when a client's plugins conflict with the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListMatchAction {
    None,
    Accept,
    #[default]
    Deny,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginListEntry {
    pub is_selected: bool,
    pub name: String,
    pub assembly_name: String,
    pub version: String,
    pub hash: String,
    pub last_hashed: i64,
    #[serde(default)]
    pub location: Option<String>,
}

impl PartialEq for PluginListEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.version == other.version
            && self.assembly_name == other.assembly_name
    }
}

impl Eq for PluginListEntry {}

/// Operator-controlled list policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub plugin_list_type: PluginListType,
    pub list_match_action: ListMatchAction,
    pub analyzed_plugins: Vec<PluginListEntry>,
}

impl PolicySettings {
    pub fn selected_hashes(&self) -> impl Iterator<Item = &str> {
        self.analyzed_plugins
            .iter()
            .filter(|p| p.is_selected)
            .map(|p| p.hash.as_str())
    }

    /// Hashes of entries that belong to the security module itself.
    pub fn security_hashes<'a>(&'a self, marker: &'a str) -> impl Iterator<Item = &'a str> {
        self.analyzed_plugins
            .iter()
            .filter(move |p| p.assembly_name.contains(marker))
            .map(|p| p.hash.as_str())
    }

    /// Adds `entry` unless an equal one is already listed.
    pub fn add_entry(&mut self, entry: PluginListEntry) -> bool {
        if self.analyzed_plugins.contains(&entry) {
            return false;
        }
        self.analyzed_plugins.push(entry);
        true
    }

    pub fn remove_hash(&mut self, hash: &str) -> Option<PluginListEntry> {
        let idx = self.analyzed_plugins.iter().position(|p| p.hash == hash)?;
        Some(self.analyzed_plugins.remove(idx))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub hello_retry_delay_ms: u64,
    pub hello_retries_max: u32,
    pub validation_deadline_ms: u64,
    pub disconnect_delay_ms: u64,
    pub noise_messages: u32,
    pub noise_delay_min_ms: u64,
    pub noise_delay_max_ms: u64,
    pub token_prune_interval_ms: u64,
    pub token_stale_after_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            hello_retry_delay_ms: 5_000,
            hello_retries_max: 2,
            validation_deadline_ms: 10_000,
            disconnect_delay_ms: 1_000,
            noise_messages: 3,
            noise_delay_min_ms: 150,
            noise_delay_max_ms: 900,
            token_prune_interval_ms: 15_000,
            token_stale_after_secs: 60,
        }
    }
}

impl TimingConfig {
    pub fn hello_retry_delay(&self) -> Duration {
        Duration::from_millis(self.hello_retry_delay_ms)
    }

    pub fn validation_deadline(&self) -> Duration {
        Duration::from_millis(self.validation_deadline_ms)
    }

    pub fn disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.disconnect_delay_ms)
    }

    pub fn noise_delay_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.noise_delay_min_ms),
            Duration::from_millis(self.noise_delay_max_ms),
        )
    }

    pub fn token_prune_interval(&self) -> Duration {
        Duration::from_millis(self.token_prune_interval_ms)
    }

    pub fn token_stale_after(&self) -> Duration {
        Duration::from_secs(self.token_stale_after_secs)
    }
}

/// Shape of the liveness challenges sent during Hello and Chatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    pub request_types: Vec<RequestType>,
    pub min_requests: usize,
    pub max_requests: usize,
    /// Types whose method bodies may be requested.
    pub critical_types: Vec<String>,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            request_types: vec![
                RequestType::MethodIl,
                RequestType::SaltEcho,
                RequestType::PeerIdHalves,
                RequestType::OriginEcho,
            ],
            min_requests: 2,
            max_requests: 4,
            critical_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub enabled: bool,
    /// Instance secret. Generated at startup when empty.
    pub secret: String,
    pub token_ttl_secs: u64,
    pub log_level: LogLevel,
    pub security_module_marker: String,
    pub policy: PolicySettings,
    pub timing: TimingConfig,
    pub challenge: ChallengeConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: String::new(),
            token_ttl_secs: 60,
            log_level: LogLevel::Info,
            security_module_marker: DEFAULT_SECURITY_MARKER.to_string(),
            policy: PolicySettings::default(),
            timing: TimingConfig::default(),
            challenge: ChallengeConfig::default(),
        }
    }
}

impl GateConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.secret.is_empty() && self.secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "secret must be at least {} characters",
                MIN_SECRET_LEN
            )));
        }
        if self.token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token_ttl_secs must be > 0".into()));
        }
        if self.security_module_marker.is_empty() {
            return Err(ConfigError::Invalid("security_module_marker must not be empty".into()));
        }
        let timing = &self.timing;
        if timing.noise_delay_min_ms == 0 || timing.noise_delay_max_ms < timing.noise_delay_min_ms {
            return Err(ConfigError::Invalid("noise delay bounds are inverted or zero".into()));
        }
        if timing.validation_deadline_ms == 0 {
            return Err(ConfigError::Invalid("validation_deadline_ms must be > 0".into()));
        }
        let challenge = &self.challenge;
        if challenge.request_types.is_empty() {
            return Err(ConfigError::Invalid("challenge.request_types must not be empty".into()));
        }
        if challenge.min_requests == 0 || challenge.max_requests < challenge.min_requests {
            return Err(ConfigError::Invalid("challenge request bounds are inverted or zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, assembly: &str, selected: bool) -> PluginListEntry {
        PluginListEntry {
            is_selected: selected,
            name: assembly.to_string(),
            assembly_name: assembly.to_string(),
            version: "1.0".to_string(),
            hash: hash.to_string(),
            last_hashed: 0,
            location: None,
        }
    }

    #[test]
    fn defaults_validate() {
        let config = GateConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timing.hello_retries_max, 2);
        assert_eq!(config.timing.validation_deadline(), Duration::from_secs(10));
        assert_eq!(config.policy.list_match_action, ListMatchAction::Deny);
    }

    #[test]
    fn parses_partial_toml() {
        let config = GateConfig::from_toml(
            r#"
            enabled = false
            token_ttl_secs = 30

            [policy]
            plugin_list_type = "Blacklist"
            list_match_action = "Accept"

            [[policy.analyzed_plugins]]
            is_selected = true
            name = "Cheat"
            assembly_name = "CheatPlugin"
            version = "0.1"
            hash = "abc="
            last_hashed = 1700000000

            [timing]
            hello_retries_max = 4
            "#,
        )
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.token_ttl_secs, 30);
        assert_eq!(config.policy.plugin_list_type, PluginListType::Blacklist);
        assert_eq!(config.policy.analyzed_plugins.len(), 1);
        assert_eq!(config.timing.hello_retries_max, 4);
        assert_eq!(config.timing.hello_retry_delay_ms, 5_000);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = GateConfig::default();
        config.secret = "a-sufficiently-long-secret".to_string();
        config.policy.add_entry(entry("h1", "Plugin", true));
        let back = GateConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = GateConfig::default();
        config.secret = "short".to_string();
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.timing.noise_delay_max_ms = 1;
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.token_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn entries_compare_by_hash_version_and_assembly() {
        let mut a = entry("h", "A", true);
        let b = entry("h", "A", false);
        assert_eq!(a, b);
        a.version = "2.0".to_string();
        assert_ne!(a, b);
    }

    #[test]
    fn policy_list_helpers() {
        let mut policy = PolicySettings::default();
        assert!(policy.add_entry(entry("h1", "CleanSpaceClient", true)));
        assert!(!policy.add_entry(entry("h1", "CleanSpaceClient", false)));
        policy.add_entry(entry("h2", "Other", false));
        assert_eq!(policy.selected_hashes().collect::<Vec<_>>(), vec!["h1"]);
        assert_eq!(policy.security_hashes("CleanSpace").collect::<Vec<_>>(), vec!["h1"]);
        assert!(policy.remove_hash("h2").is_some());
        assert!(policy.remove_hash("h2").is_none());
    }
}
