//! Bus configuration.
//!
//! Every field has a default, so a YAML document only needs the keys it changes:
//!
//! ```yaml
//! announce_interval_ms: 499
//! refresh:
//!   retry_delays_ms: [20, 50]
//!   timeout_ms: 150
//! role_manager:
//!   debounce_ms: 200
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::packet::DeviceId;
use crate::{BusError, Result};

/// Register refresh retry schedule.
///
/// The first get goes out immediately; each entry of `retry_delays_ms` is the wait
/// before the next resend. The whole operation fails after `timeout_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    pub retry_delays_ms: Vec<u64>,
    pub timeout_ms: u64,
}

impl RefreshPolicy {
    /// Upper bound on get requests one refresh sends.
    pub fn max_attempts(&self) -> usize {
        self.retry_delays_ms.len() + 1
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self { retry_delays_ms: vec![20, 50], timeout_ms: 150 }
    }
}

/// Acknowledged send schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self { attempts: 4, interval_ms: 40 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleManagerOptions {
    pub debounce_ms: u64,
    /// Minimum time between refresh attempts triggered by self-announce.
    pub poll_interval_ms: u64,
}

impl Default for RoleManagerOptions {
    fn default() -> Self {
        Self { debounce_ms: 200, poll_interval_ms: 1500 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Identifier of the host's own device; random when absent.
    pub self_device_id: Option<DeviceId>,
    /// Announce as a client rather than a server device.
    pub client: bool,
    pub announce_interval_ms: u64,
    pub device_lost_delay_ms: u64,
    pub device_disconnect_delay_ms: u64,
    pub refresh: RefreshPolicy,
    pub auto_refresh_delay_ms: u64,
    pub ack: AckPolicy,
    pub pipe_timeout_ms: u64,
    pub role_manager: RoleManagerOptions,
    /// Capacity of the bus event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            self_device_id: None,
            client: true,
            announce_interval_ms: 499,
            device_lost_delay_ms: 1500,
            device_disconnect_delay_ms: 3000,
            refresh: RefreshPolicy::default(),
            auto_refresh_delay_ms: 50,
            ack: AckPolicy::default(),
            pipe_timeout_ms: 1000,
            role_manager: RoleManagerOptions::default(),
            event_capacity: 1024,
        }
    }
}

impl BusOptions {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let options: BusOptions = serde_yaml_ng::from_str(yaml)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| BusError::File { path: path.to_path_buf(), source })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.announce_interval_ms == 0 {
            return Err(BusError::config("announce_interval_ms must be positive"));
        }
        if self.device_lost_delay_ms > self.device_disconnect_delay_ms {
            return Err(BusError::config(
                "device_lost_delay_ms must not exceed device_disconnect_delay_ms",
            ));
        }
        if self.refresh.timeout_ms == 0 {
            return Err(BusError::config("refresh.timeout_ms must be positive"));
        }
        if self.ack.attempts == 0 {
            return Err(BusError::config("ack.attempts must be at least 1"));
        }
        if self.event_capacity == 0 {
            return Err(BusError::config("event_capacity must be positive"));
        }
        Ok(())
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn pipe_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_timeout_ms)
    }
}
