//! Relay configuration.
//!
//! Values are layered with figment:
//! 1. built-in defaults ([`RelayConfig::default`])
//! 2. an optional TOML file
//! 3. environment variables prefixed with `TSRELAY_`, nested keys split on `__`
//!
//! ```text
//! TSRELAY_CONSUMER__MAX_PROBE_SIZE=8000000
//! TSRELAY_LOGGING__LEVEL=debug
//! ```
//!
//! [`RelayConfig::sanitized`] raises values below their floors, mirroring
//! what a tuner stream needs to probe and stream without corruption.

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::*;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub upload: UploadConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProducerConfig {
    /// SO_RCVBUF requested for the datagram socket
    pub udp_receive_buffer: usize,
    /// Silence interval after which the watchdog rebuilds the socket
    pub watchdog_interval_ms: u64,
    /// Bounded wait for a replacement socket before re-polling the stop flag
    pub socket_wait_ms: u64,
    /// Receive timeout so the loop can notice stop and socket replacement
    pub read_timeout_ms: u64,
    /// Raise the receive thread's scheduling priority (off for channel scans)
    pub raise_priority: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            udp_receive_buffer: DEFAULT_UDP_RECEIVE_BUFFER,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            socket_wait_ms: DEFAULT_SOCKET_WAIT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            raise_priority: true,
        }
    }
}

impl ProducerConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn socket_wait(&self) -> Duration {
        Duration::from_millis(self.socket_wait_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsumerConfig {
    pub min_probe_size: u64,
    pub max_probe_size: u64,
    pub min_analyze_duration_us: u64,
    pub max_analyze_duration_us: u64,
    /// Write unit the staging buffer is sized to
    pub rw_buffer_size: usize,
    /// Staged bytes are only handed to the destination once this many accumulate
    pub min_transfer_size: usize,
    pub ring_buffer_size: usize,
    pub switch_poll_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            min_probe_size: DEFAULT_MIN_PROBE_SIZE,
            max_probe_size: DEFAULT_MAX_PROBE_SIZE,
            min_analyze_duration_us: DEFAULT_MIN_ANALYZE_US,
            max_analyze_duration_us: DEFAULT_MAX_ANALYZE_US,
            rw_buffer_size: DEFAULT_RW_BUFFER_SIZE,
            min_transfer_size: DEFAULT_MIN_TRANSFER_SIZE,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            switch_poll_ms: DEFAULT_SWITCH_POLL_MS,
        }
    }
}

impl ConsumerConfig {
    pub fn switch_poll(&self) -> Duration {
        Duration::from_millis(self.switch_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Write the upload filename locally when the server refuses or drops the session
    pub fallback_to_file: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_UPLOAD_PORT,
            connect_timeout_ms: DEFAULT_UPLOAD_CONNECT_TIMEOUT_MS,
            io_timeout_ms: DEFAULT_UPLOAD_IO_TIMEOUT_MS,
            fallback_to_file: true,
        }
    }
}

impl UploadConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error; RUST_LOG takes precedence
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load defaults, then `path` (if given), then `TSRELAY_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(RelayConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Invalid(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: RelayConfig = figment
            .merge(Env::prefixed("TSRELAY_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config.sanitized())
    }

    /// Reject combinations no floor can repair.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.consumer;
        if c.min_probe_size > c.max_probe_size {
            return Err(ConfigError::Invalid(format!(
                "consumer.min_probe_size ({}) exceeds consumer.max_probe_size ({})",
                c.min_probe_size, c.max_probe_size
            )));
        }
        if c.min_analyze_duration_us > c.max_analyze_duration_us {
            return Err(ConfigError::Invalid(format!(
                "consumer.min_analyze_duration_us ({}) exceeds consumer.max_analyze_duration_us ({})",
                c.min_analyze_duration_us, c.max_analyze_duration_us
            )));
        }
        if self.consumer.switch_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer.switch_poll_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Raise every value below its floor, logging each adjustment.
    pub fn sanitized(mut self) -> Self {
        let p = &mut self.producer;
        raise("producer.watchdog_interval_ms", &mut p.watchdog_interval_ms, MIN_WATCHDOG_INTERVAL_MS);
        raise("producer.read_timeout_ms", &mut p.read_timeout_ms, MIN_READ_TIMEOUT_MS);

        let c = &mut self.consumer;
        raise("consumer.min_probe_size", &mut c.min_probe_size, FLOOR_MIN_PROBE_SIZE);
        raise("consumer.max_probe_size", &mut c.max_probe_size, DEFAULT_MAX_PROBE_SIZE);
        raise("consumer.min_analyze_duration_us", &mut c.min_analyze_duration_us, FLOOR_MIN_ANALYZE_US);
        raise("consumer.max_analyze_duration_us", &mut c.max_analyze_duration_us, DEFAULT_MAX_ANALYZE_US);
        raise("consumer.rw_buffer_size", &mut c.rw_buffer_size, FLOOR_RW_BUFFER_SIZE);
        let rw = c.rw_buffer_size;
        raise("consumer.min_transfer_size", &mut c.min_transfer_size, rw);
        let ring_floor = c.max_probe_size as usize + RING_BUFFER_SLACK;
        raise("consumer.ring_buffer_size", &mut c.ring_buffer_size, ring_floor);
        self
    }
}

fn raise<T: PartialOrd + Copy + std::fmt::Display>(key: &str, value: &mut T, floor: T) {
    if *value < floor {
        warn!("{key} = {} is below the minimum; using {floor}", *value);
        *value = floor;
    }
}
