//! Device graph: arena nodes owned by the bus and the handles that address them.
//!
//! Nodes live in [`BusState`](crate::bus::BusState) keyed by stable ids. Handles hold a
//! bus reference and a path and resolve the node on every call, so a handle to a device
//! that left the bus simply stops resolving.

mod device;
mod event;
mod refresh;
mod register;
mod service;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::packet::DeviceId;

pub use device::{AnnounceInfo, DeviceHandle, DeviceNode};
pub use event::{EventHandle, EventNode};
pub use refresh::{RefreshAction, RefreshOp, RefreshState};
pub use register::{RegisterHandle, RegisterNode};
pub use service::{ServiceFilter, ServiceHandle, ServiceNode};

/// Address of a service: device id and service index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePath {
    pub device: DeviceId,
    pub index: u8,
}

impl ServicePath {
    pub fn register(self, code: u16) -> RegisterPath {
        RegisterPath { device: self.device, index: self.index, code }
    }

    pub fn event(self, code: u8) -> EventPath {
        EventPath { device: self.device, index: self.index, code }
    }
}

/// Address of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisterPath {
    pub device: DeviceId,
    pub index: u8,
    pub code: u16,
}

impl RegisterPath {
    pub fn service(self) -> ServicePath {
        ServicePath { device: self.device, index: self.index }
    }
}

/// Address of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPath {
    pub device: DeviceId,
    pub index: u8,
    pub code: u8,
}

impl EventPath {
    pub fn service(self) -> ServicePath {
        ServicePath { device: self.device, index: self.index }
    }
}

impl fmt::Display for ServicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.device.short_id(), self.index)
    }
}

impl fmt::Display for RegisterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}].reg{:#05x}", self.device.short_id(), self.index, self.code)
    }
}

impl fmt::Display for EventPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}].evt{:#04x}", self.device.short_id(), self.index, self.code)
    }
}
