use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub conference: ConferenceConfig,
    pub logging: LoggingConfig,
}

/// Everything the conference state machine can be tuned with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    pub p2p: P2pConfig,
    pub recovery: RecoveryConfig,
    pub session: SessionConfig,
    pub testing: TestingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Allow the direct peer-to-peer path for two-party calls
    pub enabled: bool,
    /// Delay before going back to P2P after the roster shrinks to two
    pub back_to_p2p_delay_ms: u64,
    /// Disables automatic switching; P2P is then started and stopped manually
    pub test_mode: bool,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            back_to_p2p_delay_ms: 5000,
            test_mode: false,
        }
    }
}

impl P2pConfig {
    #[must_use]
    pub const fn back_to_p2p_delay(&self) -> Duration {
        Duration::from_millis(self.back_to_p2p_delay_ms)
    }
}

/// Bridge ICE restart schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub ice_restart_min_delay_ms: u64,
    pub ice_restart_growth_factor: f32,
    /// Upper bound of the random fraction added on top of each delay
    pub ice_restart_jitter: f64,
    pub max_connection_retries: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            ice_restart_min_delay_ms: 500,
            ice_restart_growth_factor: 2.0,
            ice_restart_jitter: 0.3,
            max_connection_retries: 3,
        }
    }
}

impl RecoveryConfig {
    #[must_use]
    pub const fn ice_restart_min_delay(&self) -> Duration {
        Duration::from_millis(self.ice_restart_min_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long an initiator waits for session-accept
    pub answer_timeout_ms: u64,
    /// Upper bound for best-effort teardown when leaving
    pub terminate_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: 15_000,
            terminate_timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    #[must_use]
    pub const fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Permit more than one local track per (kind, video type)
    pub allow_multiple_local_tracks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Load config file if provided
        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (CONFAB_CONFERENCE__P2P__ENABLED, etc.)
        builder = builder.add_source(
            Environment::with_prefix("CONFAB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate().map_err(ConfigError::Message)?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Reject values the state machine cannot work with
    pub fn validate(&self) -> Result<(), String> {
        let recovery = &self.conference.recovery;
        if recovery.ice_restart_min_delay_ms == 0 {
            return Err("recovery.ice_restart_min_delay_ms must be positive".to_string());
        }
        if recovery.ice_restart_growth_factor < 1.0 {
            return Err("recovery.ice_restart_growth_factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&recovery.ice_restart_jitter) {
            return Err("recovery.ice_restart_jitter must be within [0, 1]".to_string());
        }
        if self.conference.session.answer_timeout_ms == 0 {
            return Err("session.answer_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}
