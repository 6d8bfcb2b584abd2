//! Human device names keyed by device identifier.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::packet::DeviceId;

/// Storage for user-assigned device names.
///
/// The bus only reads and writes through this trait; hosts that persist settings
/// provide their own implementation.
pub trait DeviceNames: Send + Sync {
    fn name(&self, device: DeviceId) -> Option<String>;

    /// Set or, with `None`, forget the name of `device`.
    fn set_name(&self, device: DeviceId, name: Option<String>);
}

/// Process-local [`DeviceNames`].
#[derive(Debug, Default)]
pub struct MemoryDeviceNames {
    names: RwLock<HashMap<DeviceId, String>>,
}

impl MemoryDeviceNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}

impl DeviceNames for MemoryDeviceNames {
    fn name(&self, device: DeviceId) -> Option<String> {
        self.names.read().get(&device).cloned()
    }

    fn set_name(&self, device: DeviceId, name: Option<String>) {
        let mut names = self.names.write();
        match name.filter(|n| !n.is_empty()) {
            Some(name) => {
                names.insert(device, name);
            }
            None => {
                names.remove(&device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_forgets_device() {
        let names = MemoryDeviceNames::new();
        let id = DeviceId::new([7; 8]);
        names.set_name(id, Some("kitchen".into()));
        assert_eq!(names.name(id).as_deref(), Some("kitchen"));
        names.set_name(id, Some(String::new()));
        assert_eq!(names.name(id), None);
        assert!(names.is_empty());
    }
}
