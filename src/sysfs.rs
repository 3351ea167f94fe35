//! Read-only views of `/sys` and `/dev` used for discovery.
//!
//! Everything goes through [`SysRoot`] so tests can point the crate at a
//! scratch directory laid out like the real trees.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Adapter names that never lead to a monitor.
const IGNORABLE_ADAPTER_PREFIXES: &[&str] = &["SMBus", "soc:i2cdsi", "smu", "mac-io", "u4"];

/// Root directories for sysfs and devtmpfs lookups.
#[derive(Debug, Clone)]
pub struct SysRoot {
    sys: PathBuf,
    dev: PathBuf,
}

impl Default for SysRoot {
    fn default() -> Self {
        SysRoot {
            sys: PathBuf::from("/sys"),
            dev: PathBuf::from("/dev"),
        }
    }
}

impl SysRoot {
    /// A view rooted at arbitrary directories, for tests.
    pub fn at(sys: impl Into<PathBuf>, dev: impl Into<PathBuf>) -> Self {
        SysRoot {
            sys: sys.into(),
            dev: dev.into(),
        }
    }

    /// Path of the device node for a bus.
    pub fn i2c_devnode(&self, busno: u32) -> PathBuf {
        self.dev.join(format!("i2c-{}", busno))
    }

    /// Whether `/dev/i2c-N` currently exists.
    pub fn i2c_device_exists(&self, busno: u32) -> bool {
        self.i2c_devnode(busno).exists()
    }

    /// Bus numbers of every `/dev/i2c-N` node, ascending.
    pub fn list_i2c_devnodes(&self) -> io::Result<Vec<u32>> {
        let mut busnos = Vec::new();
        for entry in fs::read_dir(&self.dev)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(n) = name.strip_prefix("i2c-").and_then(|n| n.parse().ok()) {
                busnos.push(n);
            }
        }
        busnos.sort_unstable();
        Ok(busnos)
    }

    fn i2c_sysfs_dir(&self, busno: u32) -> PathBuf {
        self.sys.join(format!("bus/i2c/devices/i2c-{}", busno))
    }

    /// The kernel adapter name for a bus, e.g. `AUX B/DDI B/PHY B`.
    pub fn adapter_name(&self, busno: u32) -> Option<String> {
        read_trimmed(&self.i2c_sysfs_dir(busno).join("name"))
    }

    /// Adapters that are known never to reach a monitor (SMBus
    /// controllers and similar).
    pub fn is_ignorable_adapter(name: &str) -> bool {
        IGNORABLE_ADAPTER_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    /// Whether the bus belongs to a DisplayPort MST branch device.
    pub fn is_mst_adapter(&self, busno: u32) -> bool {
        self.adapter_name(busno).as_deref() == Some("DPMST")
    }

    /// The driver bound to the bus's parent device, if resolvable.
    pub fn bus_driver(&self, busno: u32) -> Option<String> {
        let link = self.i2c_sysfs_dir(busno).join("device/driver");
        let target = fs::read_link(&link).ok()?;
        target.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    /// Names of all DRM connectors, e.g. `card0-DP-1`.
    pub fn connector_names(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.sys.join("class/drm");
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // connectors are cardN-<type>-<index>; skip the bare devices
            if name.starts_with("card") && name.contains('-') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn connector_dir(&self, connector: &str) -> PathBuf {
        self.sys.join("class/drm").join(connector)
    }

    /// A text attribute of a connector (`status`, `enabled`, `dpms`, ...).
    pub fn connector_attr(&self, connector: &str, attr: &str) -> Option<String> {
        read_trimmed(&self.connector_dir(connector).join(attr))
    }

    /// The connector's EDID attribute; `None` when absent or empty.
    pub fn connector_edid(&self, connector: &str) -> Option<Vec<u8>> {
        let bytes = fs::read(self.connector_dir(connector).join("edid")).ok()?;
        if bytes.is_empty() {
            None
        } else {
            Some(bytes)
        }
    }

    /// Finds the connector owning a bus by number.
    ///
    /// The kernel exposes the bus under the connector either as an
    /// `i2c-N` subdirectory or as a `ddc` symlink resolving to it.
    pub fn connector_for_busno(&self, busno: u32) -> Option<String> {
        let needle = format!("i2c-{}", busno);
        for connector in self.connector_names().ok()? {
            let dir = self.connector_dir(&connector);
            if dir.join(&needle).is_dir() {
                return Some(connector);
            }
            if let Ok(target) = fs::canonicalize(dir.join("ddc")) {
                if target.file_name().map(|n| n == needle.as_str()).unwrap_or(false) {
                    return Some(connector);
                }
            }
        }
        None
    }

    /// Finds a connector whose EDID attribute matches byte for byte.
    pub fn connector_for_edid(&self, edid: &[u8]) -> Option<String> {
        for connector in self.connector_names().ok()? {
            if let Some(bytes) = self.connector_edid(&connector) {
                if bytes.len() >= edid.len() && &bytes[..edid.len()] == edid {
                    return Some(connector);
                }
            }
        }
        None
    }

    /// The three negative signals that mark a phantom connector:
    /// disconnected, disabled, and no EDID.
    pub fn connector_looks_phantom(&self, connector: &str) -> bool {
        self.connector_attr(connector, "status").as_deref() == Some("disconnected")
            && self.connector_attr(connector, "enabled").as_deref() == Some("disabled")
            && self.connector_edid(connector).is_none()
    }

    /// DRM-reported DPMS state; anything but `On` counts as asleep.
    pub fn connector_dpms_asleep(&self, connector: &str) -> Option<bool> {
        self.connector_attr(connector, "dpms").map(|v| v != "On")
    }

    /// The sysfs EDID for a bus, read through its connector.
    pub fn edid_by_busno(&self, busno: u32) -> Option<Vec<u8>> {
        let connector = self.connector_for_busno(busno)?;
        self.connector_edid(&connector)
    }

    pub fn sys_path(&self) -> &Path {
        &self.sys
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}
