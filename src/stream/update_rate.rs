//! Update rate control for register value streams

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often a value stream may yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every change, as reported by the device.
    #[default]
    Native,

    /// At most this many updates per second. `Max(0)` behaves like `Native`.
    Max(u32),
}

impl UpdateRate {
    /// Throttle interval, or `None` when every update passes through.
    pub fn interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_micros(1_000_000 / u64::from(hz))),
        }
    }
}
