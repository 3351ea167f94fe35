//! udev-based enumeration of I2C devices with a reachable monitor.

use std::io;
use std::path::PathBuf;

use crate::io::from_i2c_device;
use crate::sysfs::SysRoot;

/// Enumerate the I2C device paths of all currently attached displays.
///
/// Detection only checks that a monitor's EDID EEPROM answers on the bus.
/// DDC/CI communication may still be unavailable if the display does not
/// support it or another host drives the active input; use the display
/// registry's initial checks for that distinction.
///
/// # Example
///
/// ```rust,no_run
/// use ddcmon::{commands, Enumerator};
///
/// for path in Enumerator::new().unwrap() {
///     let mut channel = ddcmon::from_i2c_device(path).unwrap();
///     let version = channel.execute(commands::GetVcpFeature::new(0xdf)).unwrap();
///     println!("MCCS version: {:04x}", version.value());
/// }
/// ```
pub struct Enumerator {
    inner: std::vec::IntoIter<PathBuf>,
}

impl Enumerator {
    /// Create a new enumerator for available displays.
    pub fn new() -> io::Result<Self> {
        let mut en = udev::Enumerator::new()?;
        en.match_subsystem("i2c-dev")?;

        let mut paths = Vec::new();
        for dev in en.scan_devices()? {
            let (devnode, name) = match dev
                .devnode()
                .and_then(|devnode| dev.attribute_value("name").map(|name| (devnode, name)))
            {
                Some(v) => v,
                None => continue,
            };

            if SysRoot::is_ignorable_adapter(&name.to_string_lossy()) {
                continue;
            }

            let reachable = from_i2c_device(devnode)
                .map_err(crate::Error::Transport)
                .and_then(|mut channel| channel.read_edid(0, &mut [0u8]))
                .is_ok();
            if reachable {
                paths.push(devnode.to_path_buf());
            }
        }

        Ok(Enumerator {
            inner: paths.into_iter(),
        })
    }
}

impl Iterator for Enumerator {
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}
