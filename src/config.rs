//! File-backed settings for the sonar reader.

use crate::sens::CommunicatorConfig;
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Serial device path, e.g. `/dev/ttyUSB0` or `COM4`.
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound for reading one line.
    pub timeout_ms: u64,
    /// Delay between successive reads; 16 ms is roughly 60 Hz.
    pub poll_interval_ms: u64,
    /// Readings buffered between the worker and the console printer.
    pub channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let communicator = CommunicatorConfig::new(DEFAULT_PORT);
        Self {
            timeout_ms: millis(communicator.timeout),
            poll_interval_ms: millis(communicator.poll_interval),
            baud_rate: communicator.baud_rate,
            port: communicator.port,
            channel_capacity: 64,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.port.trim().is_empty(), "port must not be empty");
        ensure!(self.baud_rate > 0, "baud_rate must be positive");
        ensure!(self.timeout_ms > 0, "timeout_ms must be positive");
        ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        ensure!(self.channel_capacity > 0, "channel_capacity must be positive");
        Ok(())
    }

    pub fn communicator(&self) -> CommunicatorConfig {
        CommunicatorConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}
