//! Read-only view of the node's physical devices.
//!
//! Device I/O adapters live outside the broker core; the agents only ever
//! ask three questions, captured by [`DeviceIndex`]. Devices are treated
//! as capability sets — a device exposes named signals, and queries test
//! for signal presence by type name rather than type identity.

use {
    dgi_core::{CoreError, Result},
    serde::Deserialize,
    std::collections::BTreeMap,
    std::path::Path,
};

/// The queries the agents run against the device manager.
pub trait DeviceIndex {
    /// Sum of `signal` across every device of `device_type`.
    fn net_value(&self, device_type: &str, signal: &str) -> f64;
    /// Number of devices of `device_type`.
    fn count_of_type(&self, device_type: &str) -> usize;
    /// Total number of attached devices.
    fn device_count(&self) -> usize;
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceSpec {
    name: String,
    kind: String,
    #[serde(default)]
    signals: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceFile {
    #[serde(default, rename = "device")]
    devices: Vec<DeviceSpec>,
}

/// In-memory device table, loadable from a TOML fixture:
///
/// ```toml
/// [[device]]
/// name = "sst1"
/// kind = "Sst"
/// signals = { gateway = 1.0 }
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    devices: Vec<DeviceSpec>,
}

impl DeviceTable {
    /// An empty table (a node with no attached devices).
    pub fn new() -> Self {
        DeviceTable::default()
    }

    /// Load the table from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read device file {}: {e}", path.display()))
        })?;
        let file: DeviceFile =
            toml::from_str(&raw).map_err(|e| CoreError::Config(format!("device file: {e}")))?;
        Ok(DeviceTable {
            devices: file.devices,
        })
    }

    /// Add a device with one signal (test fixtures).
    pub fn add(&mut self, name: &str, kind: &str, signal: &str, value: f64) {
        if let Some(dev) = self.devices.iter_mut().find(|d| d.name == name) {
            dev.signals.insert(signal.to_string(), value);
            return;
        }
        let mut signals = BTreeMap::new();
        signals.insert(signal.to_string(), value);
        self.devices.push(DeviceSpec {
            name: name.to_string(),
            kind: kind.to_string(),
            signals,
        });
    }

    /// Overwrite a signal on an existing device.
    pub fn set_signal(&mut self, name: &str, signal: &str, value: f64) {
        if let Some(dev) = self.devices.iter_mut().find(|d| d.name == name) {
            dev.signals.insert(signal.to_string(), value);
        }
    }
}

impl DeviceIndex for DeviceTable {
    fn net_value(&self, device_type: &str, signal: &str) -> f64 {
        self.devices
            .iter()
            .filter(|d| d.kind == device_type)
            .filter_map(|d| d.signals.get(signal))
            .sum()
    }

    fn count_of_type(&self, device_type: &str) -> usize {
        self.devices.iter().filter(|d| d.kind == device_type).count()
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_value_sums_by_type() {
        let mut t = DeviceTable::new();
        t.add("sst1", "Sst", "gateway", 1.5);
        t.add("sst2", "Sst", "gateway", 2.5);
        t.add("load1", "Load", "drain", 3.0);
        assert_eq!(t.net_value("Sst", "gateway"), 4.0);
        assert_eq!(t.net_value("Load", "drain"), 3.0);
        assert_eq!(t.net_value("Fid", "state"), 0.0);
        assert_eq!(t.count_of_type("Sst"), 2);
        assert_eq!(t.device_count(), 3);
    }

    #[test]
    fn test_set_signal() {
        let mut t = DeviceTable::new();
        t.add("fid1", "Fid", "state", 1.0);
        t.set_signal("fid1", "state", 0.0);
        assert_eq!(t.net_value("Fid", "state"), 0.0);
    }

    #[test]
    fn test_load_from_toml() {
        let raw = r#"
            [[device]]
            name = "sst1"
            kind = "Sst"
            signals = { gateway = 1.0 }

            [[device]]
            name = "drer1"
            kind = "Drer"
            signals = { generation = 2.0 }
        "#;
        let file: DeviceFile = toml::from_str(raw).unwrap();
        let table = DeviceTable {
            devices: file.devices,
        };
        assert_eq!(table.net_value("Sst", "gateway"), 1.0);
        assert_eq!(table.net_value("Drer", "generation"), 2.0);
    }
}
