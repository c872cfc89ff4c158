//! Timing and capacity configuration for drivers, the router and simulations

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Default interval between outgoing flushes of a driver (1 second)
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Default interval between router dispatch ticks (3 seconds)
pub const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 3_000;

/// Default number of envelopes delivered per dispatch tick
pub const DEFAULT_MAX_DISPATCH_PER_TICK: usize = 1;

/// Party driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Interval between flushes of the pending outgoing queue, in milliseconds
    pub flush_interval_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

impl DriverConfig {
    /// Set the flush interval
    pub fn with_flush_interval(mut self, ms: u64) -> Self {
        self.flush_interval_ms = ms;
        self
    }

    /// Flush interval as a duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "flush_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Simulated network configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interval between dispatch ticks, in milliseconds
    pub dispatch_interval_ms: u64,
    /// Envelopes popped from the delivery buffer per tick
    pub max_dispatch_per_tick: usize,
    /// Capacity of each per-party channel; defaults to the number of parties
    pub channel_capacity: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: DEFAULT_DISPATCH_INTERVAL_MS,
            max_dispatch_per_tick: DEFAULT_MAX_DISPATCH_PER_TICK,
            channel_capacity: None,
        }
    }
}

impl NetworkConfig {
    /// Set the dispatch interval
    pub fn with_dispatch_interval(mut self, ms: u64) -> Self {
        self.dispatch_interval_ms = ms;
        self
    }

    /// Set how many envelopes are delivered per tick
    pub fn with_max_dispatch_per_tick(mut self, count: usize) -> Self {
        self.max_dispatch_per_tick = count;
        self
    }

    /// Set a fixed channel capacity
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    /// Dispatch interval as a duration
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// Channel capacity for a network of `parties`
    pub fn capacity_for(&self, parties: usize) -> usize {
        self.channel_capacity.unwrap_or(parties).max(1)
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "dispatch_interval_ms must be positive".into(),
            ));
        }
        if self.max_dispatch_per_tick == 0 {
            return Err(Error::InvalidConfig(
                "max_dispatch_per_tick must be at least 1".into(),
            ));
        }
        if self.channel_capacity == Some(0) {
            return Err(Error::InvalidConfig(
                "channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// End-to-end simulation configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Driver settings shared by every party
    pub driver: DriverConfig,
    /// Router settings
    pub network: NetworkConfig,
    /// Deadline for a whole stage, in milliseconds (none by default)
    pub stage_timeout_ms: Option<u64>,
}

impl SimulationConfig {
    /// Parse a JSON configuration and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the driver configuration
    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    /// Set the network configuration
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Set the stage deadline
    pub fn with_stage_timeout(mut self, ms: u64) -> Self {
        self.stage_timeout_ms = Some(ms);
        self
    }

    /// Stage deadline as a duration
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        self.network.validate()?;
        if self.stage_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig(
                "stage_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
