// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Processor configuration.
//!
//! Supports both programmatic (builder) and file-based (TOML) configuration.
//!
//! ```toml
//! fully_qualified_namespace = "orders.broker.example.net"
//! entity_path = "orders"
//! max_concurrent_sessions = 4
//! max_concurrent_calls_per_session = 2
//! max_auto_lock_renew_secs = 300
//! session_idle_timeout_secs = 30
//! ```

use crate::message::ReceiveMode;
use crate::renewal::RenewalTiming;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings consumed by pumps and the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Broker namespace, used in logs and termination errors.
    #[serde(default)]
    pub fully_qualified_namespace: String,

    /// Queue or subscription path.
    #[serde(default)]
    pub entity_path: String,

    #[serde(default)]
    pub receive_mode: ReceiveMode,

    /// Handler concurrency for non-session entities.
    #[serde(default = "default_one")]
    pub max_concurrent_calls: usize,

    /// Number of session slots (rolling receivers).
    #[serde(default = "default_one")]
    pub max_concurrent_sessions: usize,

    /// Handler concurrency within one session slot.
    #[serde(default = "default_one")]
    pub max_concurrent_calls_per_session: usize,

    /// Messages to prefetch per link (0 = credit follows handler capacity).
    #[serde(default)]
    pub prefetch_count: u32,

    /// Lock renewal budget in seconds (0 disables renewal).
    #[serde(default = "default_max_auto_lock_renew")]
    pub max_auto_lock_renew_secs: u64,

    /// Settle messages automatically after the handler returns.
    #[serde(default = "default_true")]
    pub auto_complete: bool,

    /// Close a session after this many seconds without a message.
    #[serde(default)]
    pub session_idle_timeout_secs: Option<u64>,

    /// Connection health poll interval in seconds.
    #[serde(default = "default_connection_poll_interval")]
    pub connection_poll_interval_secs: u64,

    /// Delay before the processor builds a fresh pump after termination.
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff_secs: u64,

    /// Renew with no delay when less than this much lock validity remains.
    #[serde(default = "default_renew_immediately_threshold")]
    pub renew_immediately_threshold_ms: u64,

    /// Upper bound on how early before expiry a renewal is scheduled.
    #[serde(default = "default_renewal_buffer_cap")]
    pub renewal_buffer_cap_secs: u64,
}

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_auto_lock_renew() -> u64 {
    300
}

fn default_connection_poll_interval() -> u64 {
    20
}

fn default_restart_backoff() -> u64 {
    5
}

fn default_renew_immediately_threshold() -> u64 {
    400
}

fn default_renewal_buffer_cap() -> u64 {
    10
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            fully_qualified_namespace: String::new(),
            entity_path: String::new(),
            receive_mode: ReceiveMode::PeekLock,
            max_concurrent_calls: default_one(),
            max_concurrent_sessions: default_one(),
            max_concurrent_calls_per_session: default_one(),
            prefetch_count: 0,
            max_auto_lock_renew_secs: default_max_auto_lock_renew(),
            auto_complete: true,
            session_idle_timeout_secs: None,
            connection_poll_interval_secs: default_connection_poll_interval(),
            restart_backoff_secs: default_restart_backoff(),
            renew_immediately_threshold_ms: default_renew_immediately_threshold(),
            renewal_buffer_cap_secs: default_renewal_buffer_cap(),
        }
    }
}

impl ProcessorConfig {
    /// Create a new config builder.
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_calls must be at least 1".into(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.max_concurrent_calls_per_session == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_calls_per_session must be at least 1".into(),
            ));
        }
        if self.connection_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection_poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.session_idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "session_idle_timeout_secs must be omitted or at least 1".into(),
            ));
        }
        if self.receive_mode == ReceiveMode::ReceiveAndDelete && self.auto_complete {
            // Nothing to settle in destructive-read mode.
            return Err(ConfigError::Invalid(
                "auto_complete requires peek_lock receive mode".into(),
            ));
        }
        Ok(())
    }

    pub fn max_auto_lock_renew_duration(&self) -> Duration {
        Duration::from_secs(self.max_auto_lock_renew_secs)
    }

    pub fn session_idle_timeout(&self) -> Option<Duration> {
        self.session_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn connection_poll_interval(&self) -> Duration {
        Duration::from_secs(self.connection_poll_interval_secs)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff_secs)
    }

    /// Renewal timing constants.
    pub fn renewal_timing(&self) -> RenewalTiming {
        RenewalTiming {
            renew_immediately_threshold: Duration::from_millis(
                self.renew_immediately_threshold_ms,
            ),
            renewal_buffer_cap: Duration::from_secs(self.renewal_buffer_cap_secs),
        }
    }

    /// True when locks exist and renewal has a budget.
    pub fn renewal_enabled(&self) -> bool {
        self.receive_mode == ReceiveMode::PeekLock && self.max_auto_lock_renew_secs > 0
    }

    /// True when handlers' messages are settled automatically.
    pub fn auto_disposition(&self) -> bool {
        self.auto_complete && self.receive_mode == ReceiveMode::PeekLock
    }
}

/// Config builder for fluent API.
#[derive(Debug, Default)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.fully_qualified_namespace = namespace.into();
        self
    }

    pub fn entity_path(mut self, entity_path: impl Into<String>) -> Self {
        self.config.entity_path = entity_path.into();
        self
    }

    /// Switching to receive-and-delete also turns auto-complete off.
    pub fn receive_mode(mut self, mode: ReceiveMode) -> Self {
        self.config.receive_mode = mode;
        if mode == ReceiveMode::ReceiveAndDelete {
            self.config.auto_complete = false;
        }
        self
    }

    pub fn max_concurrent_calls(mut self, calls: usize) -> Self {
        self.config.max_concurrent_calls = calls;
        self
    }

    pub fn max_concurrent_sessions(mut self, sessions: usize) -> Self {
        self.config.max_concurrent_sessions = sessions;
        self
    }

    pub fn max_concurrent_calls_per_session(mut self, calls: usize) -> Self {
        self.config.max_concurrent_calls_per_session = calls;
        self
    }

    pub fn prefetch_count(mut self, count: u32) -> Self {
        self.config.prefetch_count = count;
        self
    }

    pub fn max_auto_lock_renew(mut self, duration: Duration) -> Self {
        self.config.max_auto_lock_renew_secs = duration.as_secs();
        self
    }

    pub fn auto_complete(mut self, enabled: bool) -> Self {
        self.config.auto_complete = enabled;
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn connection_poll_interval(mut self, interval: Duration) -> Self {
        self.config.connection_poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn restart_backoff(mut self, backoff: Duration) -> Self {
        self.config.restart_backoff_secs = backoff.as_secs();
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<ProcessorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
