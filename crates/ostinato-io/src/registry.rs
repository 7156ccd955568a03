//! Discovered devices per subsystem, with hot-plug request flags.
//!
//! The watchdog refreshes the registry from the drivers' enumerations and
//! consumes hot-plug requests; anything else may raise them.

use ostinato_core::AtomicFlag;
use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Audio,
    Event,
}

impl Subsystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Subsystem::Audio => "audio",
            Subsystem::Event => "event",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub subsystem: Subsystem,
    /// Position in the driver's last enumeration.
    pub index: usize,
    pub name: String,
}

#[derive(Debug)]
struct DeviceEntry {
    info: DeviceInfo,
    hotplug: AtomicFlag,
}

/// Result of a refresh: names that appeared and vanished since the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChange {
    pub appeared: Vec<String>,
    pub vanished: Vec<String>,
}

impl RegistryChange {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.vanished.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the device list of `subsystem` with a fresh enumeration.
    ///
    /// Devices still present keep their pending hot-plug flags.
    pub fn refresh(&self, subsystem: Subsystem, names: &[String]) -> RegistryChange {
        let mut devices = self.devices.write();
        let mut change = RegistryChange::default();

        devices.retain(|entry| {
            let keep = entry.info.subsystem != subsystem || names.contains(&entry.info.name);
            if !keep {
                change.vanished.push(entry.info.name.clone());
            }
            keep
        });

        for (index, name) in names.iter().enumerate() {
            match devices
                .iter_mut()
                .find(|entry| entry.info.subsystem == subsystem && &entry.info.name == name)
            {
                Some(entry) => entry.info.index = index,
                None => {
                    change.appeared.push(name.clone());
                    devices.push(DeviceEntry {
                        info: DeviceInfo {
                            subsystem,
                            index,
                            name: name.clone(),
                        },
                        hotplug: AtomicFlag::new(false),
                    });
                }
            }
        }
        change
    }

    pub fn devices(&self, subsystem: Subsystem) -> Vec<DeviceInfo> {
        let mut found: Vec<DeviceInfo> = self
            .devices
            .read()
            .iter()
            .filter(|entry| entry.info.subsystem == subsystem)
            .map(|entry| entry.info.clone())
            .collect();
        found.sort_by_key(|info| info.index);
        found
    }

    pub fn contains(&self, subsystem: Subsystem, name: &str) -> bool {
        self.devices
            .read()
            .iter()
            .any(|entry| entry.info.subsystem == subsystem && entry.info.name == name)
    }

    /// Ask the watchdog to switch `subsystem` to the device called `name`.
    ///
    /// Returns `false` if no such device has been discovered.
    pub fn request_hotplug(&self, subsystem: Subsystem, name: &str) -> bool {
        let devices = self.devices.read();
        match devices
            .iter()
            .find(|entry| entry.info.subsystem == subsystem && entry.info.name == name)
        {
            Some(entry) => {
                entry.hotplug.set(true);
                true
            }
            None => false,
        }
    }

    /// Consume one pending hot-plug request for `subsystem`.
    pub fn take_hotplug(&self, subsystem: Subsystem) -> Option<DeviceInfo> {
        self.devices
            .read()
            .iter()
            .filter(|entry| entry.info.subsystem == subsystem)
            .find(|entry| entry.hotplug.take())
            .map(|entry| entry.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_refresh_reports_changes() {
        let registry = DeviceRegistry::new();
        let change = registry.refresh(Subsystem::Audio, &names(&["a", "b"]));
        assert_eq!(change.appeared, names(&["a", "b"]));

        let change = registry.refresh(Subsystem::Audio, &names(&["b", "c"]));
        assert_eq!(change.appeared, names(&["c"]));
        assert_eq!(change.vanished, names(&["a"]));

        let devices = registry.devices(Subsystem::Audio);
        assert_eq!(devices[0].name, "b");
        assert_eq!(devices[1].index, 1);
    }

    #[test]
    fn test_subsystems_are_independent() {
        let registry = DeviceRegistry::new();
        registry.refresh(Subsystem::Audio, &names(&["out"]));
        registry.refresh(Subsystem::Event, &names(&["keys"]));
        assert!(registry.refresh(Subsystem::Event, &names(&["keys"])).is_empty());
        assert!(registry.contains(Subsystem::Audio, "out"));
        assert!(!registry.contains(Subsystem::Event, "out"));
    }

    #[test]
    fn test_hotplug_flag_survives_refresh_and_is_taken_once() {
        let registry = DeviceRegistry::new();
        registry.refresh(Subsystem::Event, &names(&["keys", "pads"]));
        assert!(!registry.request_hotplug(Subsystem::Event, "missing"));
        assert!(registry.request_hotplug(Subsystem::Event, "pads"));

        registry.refresh(Subsystem::Event, &names(&["pads", "keys"]));
        let taken = registry.take_hotplug(Subsystem::Event).unwrap();
        assert_eq!(taken.name, "pads");
        assert_eq!(taken.index, 0);
        assert_eq!(registry.take_hotplug(Subsystem::Event), None);
    }
}
