/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Configuration management with validation and defaults.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure for swiftfetch
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer tuning
    pub transfer: TransferConfig,

    /// TLS behavior
    pub tls: TlsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            tls: TlsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Transfer engine tuning knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum parallel connections per fetch
    pub max_connections: usize,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Minimum chunk size in bytes (rounded down to a power of two)
    pub min_chunk_bytes: u64,

    /// Maximum chunk size in bytes (rounded down to a power of two)
    pub max_chunk_bytes: u64,

    /// Resume interrupted transfers by default
    pub resume: bool,

    /// Proxy URL (http/https/socks5)
    pub proxy: Option<String>,

    /// User-Agent header
    pub user_agent: String,

    /// Attempt HTTP/3 when the server advertises it
    pub http3: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            timeout_secs: 30,
            connect_timeout_secs: 10,
            min_chunk_bytes: 256 * 1024,
            max_chunk_bytes: 16 * 1024 * 1024,
            resume: true,
            proxy: None,
            user_agent: format!("swiftfetch/{}", env!("CARGO_PKG_VERSION")),
            http3: false,
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Verify server certificates
    pub verify: bool,

    /// Pinned certificate fingerprints (hostname -> SHA-256 hex)
    pub pins: HashMap<String, String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            pins: HashMap::new(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/swiftfetch/config.toml (system-wide)
    /// 2. ~/.config/swiftfetch/config.toml (user)
    /// 3. Environment variables (SWIFTFETCH_*)
    pub fn load() -> Self {
        let mut config = Config::default();

        let system_config = Path::new("/etc/swiftfetch/config.toml");
        if system_config.exists() {
            if let Ok(content) = fs::read_to_string(system_config) {
                if let Ok(parsed) = toml::from_str::<Config>(&content) {
                    config = parsed;
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("swiftfetch").join("config.toml");
            if user_config.exists() {
                if let Ok(content) = fs::read_to_string(&user_config) {
                    if let Ok(parsed) = toml::from_str::<Config>(&content) {
                        config = parsed;
                    }
                }
            }
        }

        config.apply_env_overrides()
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SWIFTFETCH_MAX_CONNECTIONS") {
            if let Ok(n) = val.parse() {
                self.transfer.max_connections = n;
            }
        }

        if let Ok(val) = std::env::var("SWIFTFETCH_TIMEOUT") {
            if let Ok(n) = val.parse() {
                self.transfer.timeout_secs = n;
            }
        }

        if let Ok(val) = std::env::var("SWIFTFETCH_PROXY") {
            self.transfer.proxy = Some(val);
        }

        if let Ok(val) = std::env::var("SWIFTFETCH_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.transfer.max_connections == 0 {
            return Err("transfer.max_connections must be at least 1".to_string());
        }
        if self.transfer.max_connections > 32 {
            return Err("transfer.max_connections must be at most 32".to_string());
        }
        if self.transfer.min_chunk_bytes > self.transfer.max_chunk_bytes {
            return Err("transfer.min_chunk_bytes must not exceed max_chunk_bytes".to_string());
        }
        if self.transfer.timeout_secs == 0 {
            return Err("transfer.timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}
