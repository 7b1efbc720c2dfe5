//! Shared configuration and logging for the confab crates

pub mod config;
pub mod logging;

pub use config::{
    Config, ConferenceConfig, LoggingConfig, P2pConfig, RecoveryConfig, SessionConfig,
    TestingConfig,
};
pub use logging::init_logging;
