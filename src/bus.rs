//! I2C bus discovery and the ordered bus registry.

use std::fmt;

use bitflags::bitflags;

use crate::edid::ParsedEdid;
use crate::sysfs::SysRoot;

/// Kernel `I2C_FUNC_I2C`: the adapter does plain I2C messaging, not just
/// SMBus emulation.
pub const FUNC_I2C: u64 = 0x0000_0001;

bitflags! {
    /// Discovered facts about one bus.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct BusFlags: u16 {
        /// Device node exists.
        const EXISTS = 0x08;
        /// Device node could be opened.
        const ACCESSIBLE = 0x04;
        /// EDID EEPROM answered at 0x50.
        const ADDR_0X50 = 0x02;
        /// DDC endpoint answered at 0x37.
        const ADDR_0X37 = 0x01;
        /// Write-only EDID block-select register answered at 0x30.
        const ADDR_0X30 = 0x80;
        /// Bus has been probed.
        const PROBED = 0x10;
        /// EDID was read from the sysfs connector attribute.
        const SYSFS_EDID = 0x0100;
        /// DRM connector resolution has run.
        const DRM_CONNECTOR_CHECKED = 0x8000;
    }
}

/// How the DRM connector for a bus was identified.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ConnectorFoundBy {
    #[default]
    NotChecked,
    NotFound,
    ByBusno,
    ByEdid,
}

impl fmt::Display for ConnectorFoundBy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ConnectorFoundBy::NotChecked => "not checked",
            ConnectorFoundBy::NotFound => "not found",
            ConnectorFoundBy::ByBusno => "by bus number",
            ConnectorFoundBy::ByEdid => "by EDID",
        };
        f.write_str(s)
    }
}

/// Everything known about one `/dev/i2c-N` bus.
///
/// Created at enumeration, refreshed in place when the kernel-visible EDID
/// state changes, destroyed only when the device node disappears.
#[derive(Debug, Clone, Default)]
pub struct BusInfo {
    pub busno: u32,
    /// Kernel functionality bitmap.
    pub functionality: u64,
    pub edid: Option<ParsedEdid>,
    pub flags: BusFlags,
    /// Kernel adapter name, e.g. `AUX B/DDI B/PHY B` or `DPMST`.
    pub adapter_name: Option<String>,
    pub driver: Option<String>,
    pub drm_connector: Option<String>,
    pub drm_connector_found_by: ConnectorFoundBy,
    /// errno when opening the device node failed.
    pub open_errno: Option<i32>,
}

impl BusInfo {
    pub fn new(busno: u32) -> Self {
        BusInfo {
            busno,
            ..Default::default()
        }
    }

    /// Whether the adapter does plain I2C messaging.
    pub fn supports_full_i2c(&self) -> bool {
        self.functionality & FUNC_I2C != 0
    }

    pub fn has_edid(&self) -> bool {
        self.edid.is_some()
    }

    /// Resolves the DRM connector, preferring the bus-number match and
    /// falling back to a byte-for-byte EDID match. Records which
    /// mechanism decided, for diagnostics.
    pub fn resolve_drm_connector(&mut self, sysfs: &SysRoot) {
        self.flags |= BusFlags::DRM_CONNECTOR_CHECKED;
        if let Some(connector) = sysfs.connector_for_busno(self.busno) {
            self.drm_connector = Some(connector);
            self.drm_connector_found_by = ConnectorFoundBy::ByBusno;
            return;
        }
        if let Some(edid) = &self.edid {
            if let Some(connector) = sysfs.connector_for_edid(edid.bytes()) {
                self.drm_connector = Some(connector);
                self.drm_connector_found_by = ConnectorFoundBy::ByEdid;
                return;
            }
        }
        self.drm_connector = None;
        self.drm_connector_found_by = ConnectorFoundBy::NotFound;
    }
}

/// Ordered set of known buses, keyed by bus number.
#[derive(Debug, Default)]
pub struct BusRegistry {
    buses: Vec<BusInfo>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces in place, keeping ascending bus order.
    pub fn upsert(&mut self, info: BusInfo) {
        match self.buses.binary_search_by_key(&info.busno, |b| b.busno) {
            Ok(i) => self.buses[i] = info,
            Err(i) => self.buses.insert(i, info),
        }
    }

    /// Drops a bus whose device node disappeared.
    pub fn remove(&mut self, busno: u32) -> Option<BusInfo> {
        match self.buses.binary_search_by_key(&busno, |b| b.busno) {
            Ok(i) => Some(self.buses.remove(i)),
            Err(_) => None,
        }
    }

    pub fn find(&self, busno: u32) -> Option<&BusInfo> {
        self.buses
            .binary_search_by_key(&busno, |b| b.busno)
            .ok()
            .map(|i| &self.buses[i])
    }

    pub fn find_mut(&mut self, busno: u32) -> Option<&mut BusInfo> {
        match self.buses.binary_search_by_key(&busno, |b| b.busno) {
            Ok(i) => Some(&mut self.buses[i]),
            Err(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BusInfo> {
        self.buses.iter()
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Bit set of every registered bus.
    pub fn attached_set(&self) -> BusSet {
        self.buses.iter().map(|b| b.busno).collect()
    }

    /// Bit set of the registered buses carrying an EDID.
    pub fn with_edid_set(&self) -> BusSet {
        self.buses
            .iter()
            .filter(|b| b.has_edid())
            .map(|b| b.busno)
            .collect()
    }
}

/// A set of bus numbers in `0..256`.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct BusSet {
    words: [u64; 4],
}

impl BusSet {
    pub const EMPTY: BusSet = BusSet { words: [0; 4] };

    pub fn insert(&mut self, busno: u32) {
        assert!(busno < 256);
        self.words[(busno / 64) as usize] |= 1 << (busno % 64);
    }

    pub fn remove(&mut self, busno: u32) {
        assert!(busno < 256);
        self.words[(busno / 64) as usize] &= !(1 << (busno % 64));
    }

    pub fn contains(&self, busno: u32) -> bool {
        busno < 256 && self.words[(busno / 64) as usize] & (1 << (busno % 64)) != 0
    }

    pub fn count(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words == [0; 4]
    }

    /// Members of `self` not in `other`.
    pub fn and_not(&self, other: &BusSet) -> BusSet {
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[i] & !other.words[i];
        }
        BusSet { words }
    }

    pub fn intersect(&self, other: &BusSet) -> BusSet {
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[i] & other.words[i];
        }
        BusSet { words }
    }

    pub fn union(&self, other: &BusSet) -> BusSet {
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.words[i] | other.words[i];
        }
        BusSet { words }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0u32..256).filter(move |&n| self.contains(n))
    }
}

impl FromIterator<u32> for BusSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        let mut set = BusSet::EMPTY;
        for n in iter {
            set.insert(n);
        }
        set
    }
}

impl fmt::Display for BusSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, n) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", n)?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for BusSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(feature = "i2c-linux")]
mod probe {
    use super::*;
    use crate::edid::EDID_SIZE;
    use crate::io::DdcChannel;
    use crate::{I2C_ADDRESS_DDC_CI, I2C_ADDRESS_EDID_SEGMENT};
    use i2c::{Address, ReadWrite};

    /// Probes one bus: open, functionality, EDID, slave addresses, DRM
    /// connector.
    pub fn probe_bus(busno: u32, sysfs: &SysRoot) -> BusInfo {
        let mut info = BusInfo::new(busno);
        info.flags |= BusFlags::EXISTS | BusFlags::PROBED;
        info.adapter_name = sysfs.adapter_name(busno);
        info.driver = sysfs.bus_driver(busno);

        let mut i2c = match i2c_linux::I2c::from_path(sysfs.i2c_devnode(busno)) {
            Ok(i2c) => i2c,
            Err(e) => {
                info.open_errno = e.raw_os_error();
                tracing::debug!(busno, errno = ?info.open_errno, "cannot open bus");
                return info;
            }
        };
        info.flags |= BusFlags::ACCESSIBLE;

        if let Ok(funcs) = i2c.i2c_functionality() {
            info.functionality = funcs.bits() as u64;
        }

        // EDID avenues, in preference order: the sysfs DRM attribute,
        // then a direct read at 0x50.
        let mut raw = sysfs.edid_by_busno(busno);
        if raw.is_some() {
            info.flags |= BusFlags::SYSFS_EDID;
        } else {
            let mut buf = [0u8; EDID_SIZE];
            let mut channel = DdcChannel::new(i2c);
            if matches!(channel.read_edid(0, &mut buf), Ok(n) if n == EDID_SIZE) {
                raw = Some(buf.to_vec());
                info.flags |= BusFlags::ADDR_0X50;
            }
            i2c = channel.into_inner();
        }
        if let Some(raw) = raw {
            match ParsedEdid::parse(&raw[..EDID_SIZE.min(raw.len())]) {
                Ok(edid) => info.edid = Some(edid),
                Err(e) => tracing::debug!(busno, error = %e, "unusable EDID"),
            }
        }

        // presence probes for the DDC endpoint and the E-DDC block-select
        // register; a one-byte exchange is enough to see an ACK
        if i2c
            .set_slave_address(I2C_ADDRESS_DDC_CI, false)
            .and_then(|()| i2c.i2c_read(&mut [0u8; 1]))
            .is_ok()
        {
            info.flags |= BusFlags::ADDR_0X37;
        }
        if i2c
            .set_slave_address(I2C_ADDRESS_EDID_SEGMENT, false)
            .and_then(|()| i2c.i2c_write(&[0u8]).map(|_| ()))
            .is_ok()
        {
            info.flags |= BusFlags::ADDR_0X30;
        }

        if info.edid.is_some() {
            info.resolve_drm_connector(sysfs);
        }
        info
    }

    /// Enumerates `/dev/i2c-N`, skipping adapters that never lead to a
    /// monitor, and probes the rest.
    pub fn detect_buses(sysfs: &SysRoot) -> std::io::Result<BusRegistry> {
        let mut registry = BusRegistry::new();
        for busno in sysfs.list_i2c_devnodes()? {
            if let Some(name) = sysfs.adapter_name(busno) {
                if SysRoot::is_ignorable_adapter(&name) {
                    tracing::trace!(busno, name, "skipping ignorable adapter");
                    continue;
                }
            }
            registry.upsert(probe_bus(busno, sysfs));
        }
        tracing::debug!(buses = registry.len(), "bus detection complete");
        Ok(registry)
    }
}

#[cfg(feature = "i2c-linux")]
pub use probe::{detect_buses, probe_bus};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edid::tests::test_edid;

    fn bus_with_edid(busno: u32) -> BusInfo {
        let mut info = BusInfo::new(busno);
        let block = test_edid([0x10, 0xAC], [0x27, 0xA0], [1, 0, 0, 0], "U2720Q", "ABC123");
        info.edid = Some(ParsedEdid::parse(&block).unwrap());
        info
    }

    #[test]
    fn busset_basic_operations() {
        let mut set = BusSet::EMPTY;
        set.insert(5);
        set.insert(6);
        set.insert(200);
        assert!(set.contains(5));
        assert!(set.contains(200));
        assert!(!set.contains(7));
        assert_eq!(set.count(), 3);

        set.remove(5);
        assert!(!set.contains(5));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn busset_deltas() {
        let old: BusSet = [5u32, 6].into_iter().collect();
        let new: BusSet = [5u32, 9].into_iter().collect();
        let added = new.and_not(&old);
        let removed = old.and_not(&new);
        assert_eq!(added.iter().collect::<Vec<_>>(), vec![9]);
        assert_eq!(removed.iter().collect::<Vec<_>>(), vec![6]);
        assert_eq!(old.intersect(&new).iter().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn busset_formats_as_decimal_list() {
        let set: BusSet = [1u32, 5, 6].into_iter().collect();
        assert_eq!(format!("{}", set), "{1,5,6}");
    }

    #[test]
    fn registry_keeps_bus_order() {
        let mut reg = BusRegistry::new();
        reg.upsert(BusInfo::new(9));
        reg.upsert(bus_with_edid(4));
        reg.upsert(BusInfo::new(6));
        let order: Vec<u32> = reg.iter().map(|b| b.busno).collect();
        assert_eq!(order, vec![4, 6, 9]);

        assert_eq!(reg.attached_set().iter().collect::<Vec<_>>(), vec![4, 6, 9]);
        assert_eq!(reg.with_edid_set().iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn registry_refreshes_in_place() {
        let mut reg = BusRegistry::new();
        reg.upsert(BusInfo::new(6));
        assert!(!reg.find(6).unwrap().has_edid());
        reg.upsert(bus_with_edid(6));
        assert_eq!(reg.len(), 1);
        assert!(reg.find(6).unwrap().has_edid());

        assert!(reg.remove(6).is_some());
        assert!(reg.find(6).is_none());
    }

    #[test]
    fn connector_resolution_records_mechanism() {
        use crate::sysfs::tests::FakeTree;
        let tree = FakeTree::new();
        tree.add_connector("card0-DP-1", Some(6));
        tree.add_connector("card0-HDMI-A-1", None);

        let mut by_busno = bus_with_edid(6);
        by_busno.resolve_drm_connector(&tree.root());
        assert_eq!(by_busno.drm_connector.as_deref(), Some("card0-DP-1"));
        assert_eq!(by_busno.drm_connector_found_by, ConnectorFoundBy::ByBusno);

        let mut by_edid = bus_with_edid(7);
        tree.set_connector_edid("card0-HDMI-A-1", by_edid.edid.as_ref().unwrap().bytes());
        by_edid.resolve_drm_connector(&tree.root());
        assert_eq!(by_edid.drm_connector.as_deref(), Some("card0-HDMI-A-1"));
        assert_eq!(by_edid.drm_connector_found_by, ConnectorFoundBy::ByEdid);

        let mut neither = bus_with_edid(8);
        if let Some(e) = neither.edid.as_mut() {
            // distinct EDID bytes so the fallback cannot match
            let block = test_edid([0x10, 0xAC], [0x01, 0x01], [9, 9, 9, 9], "OTHER", "ZZZ");
            *e = ParsedEdid::parse(&block).unwrap();
        }
        neither.resolve_drm_connector(&tree.root());
        assert_eq!(neither.drm_connector, None);
        assert_eq!(neither.drm_connector_found_by, ConnectorFoundBy::NotFound);
    }
}
