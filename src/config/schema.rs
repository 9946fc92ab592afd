//! Configuration schema for fretforge
//!
//! Configuration is stored at `~/.config/fretforge/config.toml`

use crate::cache::mb_to_bytes;
use crate::scheduler::DEFAULT_MAX_REISSUES;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Build scheduler settings
    pub scheduler: SchedulerConfig,

    /// Artifact cache settings
    pub cache: CacheConfig,

    /// Instrument defaults
    pub instrument: InstrumentConfig,
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Build scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Kernel worker threads (0 = one per available core)
    pub workers: usize,

    /// Times a request is reissued when parameters change mid-build
    pub max_reissues: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_reissues: DEFAULT_MAX_REISSUES,
        }
    }
}

/// Artifact cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Artifact weight budget in MB (0 = unbounded)
    pub budget_mb: u64,

    /// Drop unused artifacts idle this many seconds (0 = disabled)
    pub max_idle_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_mb: 512,
            max_idle_secs: 0,
        }
    }
}

impl CacheConfig {
    /// Budget in bytes, `None` when unbounded
    pub fn budget_bytes(&self) -> Option<u64> {
        match self.budget_mb {
            0 => None,
            mb => Some(mb_to_bytes(mb)),
        }
    }
}

/// Instrument defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Parameter file applied before every build
    pub parameters: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[scheduler]"));
        assert!(toml.contains("budget_mb = 512"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.budget_bytes(), Some(512 * 1024 * 1024));
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            budget_mb = 0

            [instrument]
            parameters = "strat.toml"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.budget_bytes(), None);
        assert_eq!(config.cache.max_idle_secs, 0); // default preserved
        assert_eq!(config.scheduler.max_reissues, 8);
        assert_eq!(config.general.log_format, "text");
        assert_eq!(
            config.instrument.parameters,
            Some(PathBuf::from("strat.toml"))
        );
    }
}
