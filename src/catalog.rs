//! Service specification catalog.
//!
//! Register classification is resolved once, when a service attaches to a device,
//! and cached on the service node. Registers the catalog does not know fall back to the
//! code range convention of [`RegisterKind::from_code`].
//!
//! Extra specifications load from YAML:
//!
//! ```yaml
//! services:
//!   - class: 343122531
//!     name: button
//!     registers:
//!       - { code: 257, name: pressure, kind: read_only, reading: true }
//!     events:
//!       - { code: 1, name: down }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::*;
use crate::{BusError, Result};

/// Access class of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Set once by the device; never re-read once known.
    Const,
    ReadWrite,
    ReadOnly,
}

impl RegisterKind {
    /// Classification implied by the register code range.
    pub fn from_code(code: u16) -> Self {
        match code {
            0x001..=0x0ff => RegisterKind::ReadWrite,
            0x180..=0x1ff => RegisterKind::Const,
            _ => RegisterKind::ReadOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub code: u16,
    pub name: String,
    pub kind: RegisterKind,
    /// Streaming sensor reading.
    #[serde(default)]
    pub reading: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    pub code: u8,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub class: u32,
    pub name: String,
    /// Excluded from role assignment.
    #[serde(default)]
    pub infrastructure: bool,
    #[serde(default)]
    pub registers: Vec<RegisterSpec>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

impl ServiceSpec {
    pub fn register(&self, code: u16) -> Option<&RegisterSpec> {
        self.registers.iter().find(|r| r.code == code)
    }

    pub fn event(&self, code: u8) -> Option<&EventSpec> {
        self.events.iter().find(|e| e.code == code)
    }

    pub fn register_kind(&self, code: u16) -> RegisterKind {
        self.register(code).map_or_else(|| RegisterKind::from_code(code), |r| r.kind)
    }

    pub fn is_reading(&self, code: u16) -> bool {
        self.register(code).map_or(code == REG_READING, |r| r.reading)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    services: Vec<ServiceSpec>,
}

/// Lookup table from service class to specification.
#[derive(Debug, Clone, Default)]
pub struct SpecificationCatalog {
    services: BTreeMap<u32, Arc<ServiceSpec>>,
}

impl SpecificationCatalog {
    /// Empty catalog; every register falls back to code range classification.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog with the infrastructure services and a few common sensors and actuators.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for spec in builtin_specs() {
            catalog.insert(spec);
        }
        catalog
    }

    pub fn insert(&mut self, spec: ServiceSpec) {
        self.services.insert(spec.class, Arc::new(spec));
    }

    pub fn lookup(&self, service_class: u32) -> Option<Arc<ServiceSpec>> {
        self.services.get(&service_class).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Whether services of this class are excluded from role assignment.
    pub fn is_infrastructure(&self, service_class: u32) -> bool {
        match self.services.get(&service_class) {
            Some(spec) => spec.infrastructure,
            None => INFRASTRUCTURE_CLASSES.contains(&service_class),
        }
    }

    /// Merge specifications from a YAML document, replacing same-class entries.
    ///
    /// Returns the number of specifications loaded.
    pub fn extend_from_yaml(&mut self, yaml: &str) -> Result<usize> {
        let file: CatalogFile = serde_yaml_ng::from_str(yaml).map_err(|e| {
            BusError::parse("specification catalog", format!("YAML parsing failed: {e}"))
        })?;

        let count = file.services.len();
        for spec in file.services {
            if spec.name.trim().is_empty() {
                return Err(BusError::parse(
                    "specification catalog",
                    format!("service class {:#010x} has no name", spec.class),
                ));
            }
            debug!(class = spec.class, name = %spec.name, "loaded service specification");
            self.insert(spec);
        }
        Ok(count)
    }
}

const INFRASTRUCTURE_CLASSES: [u32; 8] = [
    SRV_CONTROL,
    SRV_LOGGER,
    SRV_ROLE_MANAGER,
    SRV_SETTINGS,
    SRV_PROXY,
    SRV_UNIQUE_BRAIN,
    SRV_DASHBOARD,
    SRV_BRIDGE,
];

fn reg(code: u16, name: &str, kind: RegisterKind, reading: bool) -> RegisterSpec {
    RegisterSpec { code, name: name.to_string(), kind, reading }
}

fn evt(code: u8, name: &str) -> EventSpec {
    EventSpec { code, name: name.to_string() }
}

fn service(class: u32, name: &str, infrastructure: bool) -> ServiceSpec {
    ServiceSpec {
        class,
        name: name.to_string(),
        infrastructure,
        registers: Vec::new(),
        events: Vec::new(),
    }
}

fn builtin_specs() -> Vec<ServiceSpec> {
    use RegisterKind::*;

    let control = ServiceSpec {
        registers: vec![
            reg(REG_CTRL_RESET_IN, "reset_in", ReadWrite, false),
            reg(REG_CTRL_DEVICE_DESCRIPTION, "device_description", Const, false),
            reg(REG_CTRL_PRODUCT_IDENTIFIER, "product_identifier", Const, false),
            reg(REG_CTRL_FIRMWARE_VERSION, "firmware_version", Const, false),
            reg(REG_CTRL_UPTIME, "uptime", ReadOnly, false),
        ],
        ..service(SRV_CONTROL, "control", true)
    };
    let logger = ServiceSpec {
        registers: vec![reg(0x080, "min_priority", ReadWrite, false)],
        ..service(SRV_LOGGER, "logger", true)
    };
    let role_manager = ServiceSpec {
        registers: vec![
            reg(REG_ROLE_MANAGER_AUTO_BIND, "auto_bind", ReadWrite, false),
            reg(REG_ROLE_MANAGER_ALL_ROLES_ALLOCATED, "all_roles_allocated", ReadOnly, false),
        ],
        events: vec![evt(EVT_CHANGE, "change")],
        ..service(SRV_ROLE_MANAGER, "role_manager", true)
    };
    let button = ServiceSpec {
        registers: vec![reg(REG_READING, "pressure", ReadOnly, true)],
        events: vec![
            evt(EVT_BUTTON_DOWN, "down"),
            evt(EVT_BUTTON_UP, "up"),
            evt(EVT_BUTTON_HOLD, "hold"),
        ],
        ..service(SRV_BUTTON, "button", false)
    };
    let potentiometer = ServiceSpec {
        registers: vec![
            reg(REG_READING, "position", ReadOnly, true),
            reg(REG_STREAMING_SAMPLES, "streaming_samples", ReadWrite, false),
            reg(REG_STREAMING_INTERVAL, "streaming_interval", ReadWrite, false),
        ],
        ..service(SRV_POTENTIOMETER, "potentiometer", false)
    };
    let led = ServiceSpec {
        registers: vec![
            reg(REG_INTENSITY, "intensity", ReadWrite, false),
            reg(REG_VALUE, "color", ReadWrite, false),
        ],
        ..service(SRV_LED, "led", false)
    };

    vec![
        control,
        logger,
        role_manager,
        service(SRV_SETTINGS, "settings", true),
        service(SRV_PROXY, "proxy", true),
        service(SRV_UNIQUE_BRAIN, "unique_brain", true),
        service(SRV_DASHBOARD, "dashboard", true),
        service(SRV_BRIDGE, "bridge", true),
        button,
        potentiometer,
        led,
    ]
}
