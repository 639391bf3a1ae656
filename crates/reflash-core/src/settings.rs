//! Engine settings with YAML/TOML/JSON support

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Reflashing engine settings
///
/// Can be loaded from YAML, TOML, JSON, or constructed programmatically.
/// Every field has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReflashSettings {
    /// Timeout and keep-alive settings
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Retry bounds
    #[serde(default)]
    pub retries: RetrySettings,

    /// Block and chunk sizes
    #[serde(default)]
    pub transfer: TransferSettings,
}

/// Timeout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Per-request response timeout in milliseconds (default: 2s)
    #[serde(default = "default_request_timeout")]
    pub request_ms: u64,

    /// How long "response pending" may go on in milliseconds (default: 30s)
    #[serde(default = "default_pending_timeout")]
    pub response_pending_ms: u64,

    /// Keep-alive interval in milliseconds (default: 800ms, clamped below 1s)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_ms: u64,

    /// Wait for one compression job in milliseconds, 0 = unbounded (default: 10s)
    #[serde(default = "default_compression_timeout")]
    pub compression_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            request_ms: default_request_timeout(),
            response_pending_ms: default_pending_timeout(),
            heartbeat_ms: default_heartbeat_interval(),
            compression_ms: default_compression_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    2_000
}

fn default_pending_timeout() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    800
}

fn default_compression_timeout() -> u64 {
    10_000
}

/// Retry bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per read or raw-write block (default: 5)
    #[serde(default = "default_block_attempts")]
    pub block_attempts: u32,

    /// Attempts per compressed transfer, each restarting from frame one (default: 5)
    #[serde(default = "default_transfer_attempts")]
    pub transfer_attempts: u32,

    /// Attempts per loader upload chunk (default: 5)
    #[serde(default = "default_block_attempts")]
    pub loader_chunk_attempts: u32,

    /// Return-to-normal attempts during teardown (default: 10)
    #[serde(default = "default_teardown_attempts")]
    pub teardown_attempts: u32,

    /// Pause between teardown attempts in milliseconds (default: 250ms)
    #[serde(default = "default_teardown_backoff")]
    pub teardown_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            block_attempts: default_block_attempts(),
            transfer_attempts: default_transfer_attempts(),
            loader_chunk_attempts: default_block_attempts(),
            teardown_attempts: default_teardown_attempts(),
            teardown_backoff_ms: default_teardown_backoff(),
        }
    }
}

fn default_block_attempts() -> u32 {
    5
}

fn default_transfer_attempts() -> u32 {
    5
}

fn default_teardown_attempts() -> u32 {
    10
}

fn default_teardown_backoff() -> u64 {
    250
}

/// Block and chunk sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Bytes compressed and sent per transfer (default: 128 KiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bytes per uncompressed write block (default: 240)
    #[serde(default = "default_block_size")]
    pub raw_block_size: usize,

    /// Bytes per loader upload chunk (default: 240)
    #[serde(default = "default_block_size")]
    pub loader_chunk_size: usize,

    /// Bytes per flash read block (default: 240)
    #[serde(default = "default_block_size")]
    pub flash_read_block: usize,

    /// Reduced block size a failed flash read falls back to (default: 16)
    #[serde(default = "default_small_block")]
    pub flash_read_min_block: usize,

    /// Bytes per RAM read block (default: 16)
    #[serde(default = "default_small_block")]
    pub ram_read_block: usize,

    /// Use compressed writes when the loader supports them (default: true)
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Delay the loader inserts between response frames, in milliseconds (default: 0)
    #[serde(default)]
    pub inter_frame_delay_ms: u8,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            raw_block_size: default_block_size(),
            loader_chunk_size: default_block_size(),
            flash_read_block: default_block_size(),
            flash_read_min_block: default_small_block(),
            ram_read_block: default_small_block(),
            compression: default_compression(),
            inter_frame_delay_ms: 0,
        }
    }
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_block_size() -> usize {
    240
}

fn default_small_block() -> usize {
    16
}

fn default_compression() -> bool {
    true
}

impl ReflashSettings {
    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse settings from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Create a builder for programmatic configuration
    pub fn builder() -> ReflashSettingsBuilder {
        ReflashSettingsBuilder::default()
    }

    /// Reject sizes the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        let sizes = [
            ("chunk_size", t.chunk_size),
            ("raw_block_size", t.raw_block_size),
            ("loader_chunk_size", t.loader_chunk_size),
            ("flash_read_block", t.flash_read_block),
            ("flash_read_min_block", t.flash_read_min_block),
            ("ram_read_block", t.ram_read_block),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(ConfigError::Invalid(format!("{} must not be zero", name)));
        }
        if t.flash_read_min_block > t.flash_read_block {
            return Err(ConfigError::Invalid(
                "flash_read_min_block exceeds flash_read_block".to_string(),
            ));
        }
        // Read lengths travel in a 16-bit field
        if t.flash_read_block > usize::from(u16::MAX) || t.ram_read_block > usize::from(u16::MAX) {
            return Err(ConfigError::Invalid(
                "read block sizes must fit in 16 bits".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_ms)
    }

    pub fn response_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.response_pending_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.heartbeat_ms)
    }

    pub fn compression_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.compression_ms)
    }

    /// Retry policy for single read/write blocks
    pub fn block_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries.block_attempts, Duration::ZERO)
    }

    /// Retry policy for loader upload chunks
    pub fn loader_chunk_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries.loader_chunk_attempts, Duration::ZERO)
    }

    /// Retry policy for the return-to-normal request
    pub fn teardown_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries.teardown_attempts,
            Duration::from_millis(self.retries.teardown_backoff_ms),
        )
    }
}

/// Builder for ReflashSettings
#[derive(Debug, Default)]
pub struct ReflashSettingsBuilder {
    settings: ReflashSettings,
}

impl ReflashSettingsBuilder {
    /// Set the per-request timeout in milliseconds
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.settings.timeouts.request_ms = ms;
        self
    }

    /// Set the keep-alive interval in milliseconds
    pub fn heartbeat_ms(mut self, ms: u64) -> Self {
        self.settings.timeouts.heartbeat_ms = ms;
        self
    }

    /// Set the compression wait in milliseconds
    pub fn compression_timeout_ms(mut self, ms: u64) -> Self {
        self.settings.timeouts.compression_ms = ms;
        self
    }

    /// Set attempts per block
    pub fn block_attempts(mut self, attempts: u32) -> Self {
        self.settings.retries.block_attempts = attempts;
        self
    }

    /// Set attempts per compressed transfer
    pub fn transfer_attempts(mut self, attempts: u32) -> Self {
        self.settings.retries.transfer_attempts = attempts;
        self
    }

    /// Set teardown attempts and backoff
    pub fn teardown(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.settings.retries.teardown_attempts = attempts;
        self.settings.retries.teardown_backoff_ms = backoff_ms;
        self
    }

    /// Set the compressed chunk size
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.settings.transfer.chunk_size = bytes;
        self
    }

    /// Enable or disable compressed writes
    pub fn compression(mut self, enabled: bool) -> Self {
        self.settings.transfer.compression = enabled;
        self
    }

    /// Set the loader inter-frame delay
    pub fn inter_frame_delay_ms(mut self, ms: u8) -> Self {
        self.settings.transfer.inter_frame_delay_ms = ms;
        self
    }

    /// Build the settings
    pub fn build(self) -> ReflashSettings {
        self.settings
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid setting: {0}")]
    Invalid(String),
}
