//! Root configuration
//!
//! Provides library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env`)
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use stellator_runtime::config::RootConfig;
//!
//! let config = RootConfig::from_env()
//!     .port(0)
//!     .num_workers(2)
//!     .heartbeat_interval(Duration::from_millis(100));
//! ```

pub mod defaults;

use std::net::Ipv4Addr;
use std::time::Duration;
use stellator_core::env::{env_get, env_get_str};
use stellator_core::ConfigError;

/// Root scheduler and worker pool configuration.
#[derive(Debug, Clone)]
pub struct RootConfig {
    /// IPv4 listen address, empty means loopback
    pub address: String,
    /// Listen port, 0 picks an ephemeral port
    pub port: u16,
    /// Number of connection worker threads
    pub num_workers: usize,
    /// Root loop period
    pub heartbeat_interval: Duration,
    /// Per-read scratch size
    pub read_buffer_size: usize,
    /// Client slots per generation
    pub generation_capacity: usize,
    /// Unconsumed input a client may accumulate before it is released
    pub max_input_size: usize,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RootConfig {
    /// Create config from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `STELLATOR_ADDRESS` - IPv4 listen address
    /// - `STELLATOR_PORT` - listen port
    /// - `STELLATOR_WORKERS` - number of worker threads
    /// - `STELLATOR_HEARTBEAT_MS` - heartbeat period in milliseconds
    /// - `STELLATOR_READ_BUFFER` - read scratch size in bytes
    /// - `STELLATOR_GENERATION_CAPACITY` - client slots per generation
    /// - `STELLATOR_MAX_INPUT` - unconsumed input cap per client in bytes
    pub fn from_env() -> Self {
        Self {
            address: env_get_str("STELLATOR_ADDRESS", defaults::ADDRESS),
            port: env_get("STELLATOR_PORT", defaults::PORT),
            num_workers: env_get("STELLATOR_WORKERS", defaults::num_workers()),
            heartbeat_interval: Duration::from_millis(env_get(
                "STELLATOR_HEARTBEAT_MS",
                defaults::HEARTBEAT_MS,
            )),
            read_buffer_size: env_get("STELLATOR_READ_BUFFER", defaults::READ_BUFFER_SIZE),
            generation_capacity: env_get(
                "STELLATOR_GENERATION_CAPACITY",
                defaults::GENERATION_CAPACITY,
            ),
            max_input_size: env_get("STELLATOR_MAX_INPUT", defaults::MAX_INPUT_SIZE),
        }
    }

    /// Create config with library defaults only (no env override).
    pub fn new() -> Self {
        Self {
            address: defaults::ADDRESS.to_string(),
            port: defaults::PORT,
            num_workers: defaults::num_workers(),
            heartbeat_interval: Duration::from_millis(defaults::HEARTBEAT_MS),
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            generation_capacity: defaults::GENERATION_CAPACITY,
            max_input_size: defaults::MAX_INPUT_SIZE,
        }
    }

    // Builder methods

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = d;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn generation_capacity(mut self, cap: usize) -> Self {
        self.generation_capacity = cap;
        self
    }

    pub fn max_input_size(mut self, size: usize) -> Self {
        self.max_input_size = size;
        self
    }

    /// The address to bind, with an empty address meaning loopback.
    pub fn ipv4_address(&self) -> Result<Ipv4Addr, ConfigError> {
        let address = self.address.trim();
        if address.is_empty() {
            return Ok(Ipv4Addr::LOCALHOST);
        }
        address
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.address.clone()))
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::InvalidValue("num_workers must be > 0"));
        }
        if self.num_workers > defaults::MAX_WORKERS {
            return Err(ConfigError::InvalidValue("num_workers must be <= 256"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue("heartbeat_interval must be > 0"));
        }
        if self.read_buffer_size < 512 {
            return Err(ConfigError::InvalidValue("read_buffer_size must be >= 512"));
        }
        if self.generation_capacity == 0 {
            return Err(ConfigError::InvalidValue("generation_capacity must be > 0"));
        }
        if self.generation_capacity > u32::MAX as usize {
            return Err(ConfigError::InvalidValue(
                "generation_capacity must fit in 32 bits",
            ));
        }
        if self.max_input_size < self.read_buffer_size {
            return Err(ConfigError::InvalidValue(
                "max_input_size must be >= read_buffer_size",
            ));
        }
        self.ipv4_address()?;
        Ok(())
    }

    /// Log the effective configuration at info level.
    pub fn log_summary(&self) {
        tracing::info!(
            address = %self.address,
            port = self.port,
            num_workers = self.num_workers,
            heartbeat_ms = self.heartbeat_interval.as_millis() as u64,
            read_buffer_size = self.read_buffer_size,
            generation_capacity = self.generation_capacity,
            max_input_size = self.max_input_size,
            "stellator configuration"
        );
    }
}
