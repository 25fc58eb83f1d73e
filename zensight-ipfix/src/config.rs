//! IPFIX core configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Complete configuration for an IPFIX exporting or collecting process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpfixConfig {
    /// Message buffer behavior.
    #[serde(default)]
    pub buffer: BufferOptions,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Message buffer options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOptions {
    /// Automatic mode: flush full messages on export and read the next
    /// message on collection without surfacing end-of-message signals.
    #[serde(default = "default_true")]
    pub automatic: bool,

    /// Largest message the buffer will build, in octets.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Number of transcoding plans kept per buffer.
    #[serde(default = "default_plan_cache_size")]
    pub plan_cache_size: usize,

    /// Register elements described by RFC 5610 element-type records.
    #[serde(default = "default_true")]
    pub auto_insert_elements: bool,

    /// Attach template names and descriptions from template-info records.
    #[serde(default = "default_true")]
    pub auto_insert_template_info: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_message_len() -> usize {
    65535
}

fn default_plan_cache_size() -> usize {
    16
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            automatic: true,
            max_message_len: default_max_message_len(),
            plan_cache_size: default_plan_cache_size(),
            auto_insert_elements: true,
            auto_insert_template_info: true,
        }
    }
}

impl BufferOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.max_message_len < 32 || self.max_message_len > 65535 {
            return Err(Error::config(format!(
                "max_message_len must be between 32 and 65535, got {}",
                self.max_message_len
            )));
        }

        if self.plan_cache_size == 0 {
            return Err(Error::config("plan_cache_size must be at least 1"));
        }

        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl IpfixConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = parse_config(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()
    }
}

/// Parse a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::config(format!("Failed to parse config: {}", e)))
}
