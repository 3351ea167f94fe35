//! The `Core` value owning all long-lived state: settings, the bus
//! registry, the display registry, retry statistics, and the persistence
//! interfaces. Every operation receives it; there are no hidden
//! singletons.

use std::io;
use std::sync::{Arc, Mutex};

use crate::bus::{BusInfo, BusRegistry, BusSet};
use crate::dref::{filter_phantom_displays, DisplayRegistry, DrefFlags, DrefId};
use crate::edid::ParsedEdid;
use crate::error::Result;
use crate::persist::{
    hex_decode, hex_encode, CapabilityStore, DisplaySnapshot, IoPathSnapshot, RegistrySnapshot,
    SNAPSHOT_VERSION,
};
use crate::settings::Settings;
use crate::sleep::SleepStore;
use crate::stats::RetryStats;
use crate::sysfs::SysRoot;

pub struct Core {
    settings: Settings,
    sysfs: SysRoot,
    buses: Mutex<BusRegistry>,
    displays: DisplayRegistry,
    stats: Arc<RetryStats>,
    sleep_store: Option<Box<dyn SleepStore>>,
    capability_store: Option<Box<dyn CapabilityStore>>,
}

impl Core {
    pub fn new(settings: Settings) -> Self {
        Core {
            settings,
            sysfs: SysRoot::default(),
            buses: Mutex::new(BusRegistry::new()),
            displays: DisplayRegistry::new(),
            stats: Arc::new(RetryStats::new()),
            sleep_store: None,
            capability_store: None,
        }
    }

    /// Points discovery at alternative `/sys` and `/dev` roots.
    pub fn with_sysfs(mut self, sysfs: SysRoot) -> Self {
        self.sysfs = sysfs;
        self
    }

    /// Installs the tuned-sleep persistence boundary.
    pub fn with_sleep_store(mut self, store: Box<dyn SleepStore>) -> Self {
        self.sleep_store = Some(store);
        self
    }

    /// Installs the capabilities-cache persistence boundary.
    pub fn with_capability_store(mut self, store: Box<dyn CapabilityStore>) -> Self {
        self.capability_store = Some(store);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn sysfs(&self) -> &SysRoot {
        &self.sysfs
    }

    pub fn displays(&self) -> &DisplayRegistry {
        &self.displays
    }

    pub fn stats(&self) -> &Arc<RetryStats> {
        &self.stats
    }

    /// Runs `f` with the bus registry locked.
    pub fn with_buses<T>(&self, f: impl FnOnce(&mut BusRegistry) -> T) -> T {
        f(&mut self.buses.lock().unwrap())
    }

    /// Bus numbers whose device node currently exists.
    pub fn scan_attached(&self) -> BusSet {
        self.sysfs
            .list_i2c_devnodes()
            .map(|v| v.into_iter().filter(|&n| n < 256).collect())
            .unwrap_or(BusSet::EMPTY)
    }

    /// Attached buses whose connector currently exposes an EDID.
    pub fn scan_with_edid(&self) -> BusSet {
        self.scan_attached()
            .iter()
            .filter(|&n| self.sysfs.edid_by_busno(n).is_some())
            .collect()
    }

    /// Records a probed bus and, when it carries an EDID, creates the
    /// candidate dref for it. Returns the dref id.
    pub fn attach_bus(&self, info: BusInfo) -> Option<DrefId> {
        let id = info.edid.as_ref().map(|edid| {
            let mst = info.adapter_name.as_deref() == Some("DPMST");
            self.displays
                .add(info.busno, edid.clone(), info.drm_connector.clone(), mst)
        });
        self.buses.lock().unwrap().upsert(info);
        id
    }

    /// Handles a bus losing its EDID: marks the dref removed and refreshes
    /// or drops the bus record. Returns the removed dref and its
    /// connector for event construction.
    pub fn detach_bus(&self, busno: u32) -> Option<(DrefId, Option<String>)> {
        let dref_id = self.displays.find_by_busno(busno, true);
        let connector = dref_id.and_then(|id| {
            self.displays
                .get(id)
                .and_then(|d| d.lock().unwrap().drm_connector.clone())
        });
        if let Some(id) = dref_id {
            self.displays.mark_removed(id);
        }

        let mut buses = self.buses.lock().unwrap();
        if self.sysfs.i2c_device_exists(busno) {
            if let Some(info) = buses.find_mut(busno) {
                info.edid = None;
            }
        } else {
            buses.remove(busno);
        }
        dref_id.map(|id| (id, connector))
    }

    /// Applies the phantom filter when enabled.
    pub fn run_phantom_filter(&self) -> usize {
        if !self.settings.detect_phantoms {
            return 0;
        }
        filter_phantom_displays(&self.displays, &self.sysfs)
    }

    /// Serializes the display registry for fast restart.
    pub fn save_snapshot(&self, path: impl AsRef<std::path::Path>) -> io::Result<()> {
        let mut all_displays = Vec::new();
        for dref in self.displays.all() {
            let d = dref.lock().unwrap();
            let actual_display_busno = d.actual.and_then(|id| {
                self.displays
                    .get(id)
                    .map(|a| a.lock().unwrap().busno)
            });
            all_displays.push(DisplaySnapshot {
                io_path: IoPathSnapshot {
                    io: "i2c".into(),
                    busno: d.busno,
                },
                dispno: d.dispno,
                flags: d.flags.bits(),
                edid: hex_encode(d.edid.bytes()),
                mfg_id: d.edid.mfg_id().to_owned(),
                model_name: d.edid.model_name().to_owned(),
                product_code: d.edid.product_code(),
                serial_ascii: d.edid.serial_ascii().to_owned(),
                mccs_version: d.mccs_version,
                capabilities: d.capabilities.clone(),
                drm_connector: d.drm_connector.clone(),
                actual_display_busno,
            });
        }
        let snapshot = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            all_displays,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, bytes)
    }

    /// Rebuilds the display registry from a snapshot. Returns the number
    /// of displays restored.
    pub fn load_snapshot(&self, path: impl AsRef<std::path::Path>) -> io::Result<u32> {
        let bytes = std::fs::read(path)?;
        let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported snapshot version {}", snapshot.version),
            ));
        }

        let mut restored = 0;
        let mut busno_to_id = Vec::new();
        for entry in &snapshot.all_displays {
            let raw = match hex_decode(&entry.edid) {
                Some(raw) => raw,
                None => {
                    tracing::warn!(busno = entry.io_path.busno, "snapshot EDID not hex, skipping");
                    continue;
                }
            };
            let edid = match ParsedEdid::parse(&raw) {
                Ok(edid) => edid,
                Err(e) => {
                    tracing::warn!(busno = entry.io_path.busno, error = %e, "snapshot EDID unusable, skipping");
                    continue;
                }
            };
            let id = self.displays.add(
                entry.io_path.busno,
                edid,
                entry.drm_connector.clone(),
                false,
            );
            if let Some(dref) = self.displays.get(id) {
                let mut d = dref.lock().unwrap();
                d.dispno = entry.dispno;
                d.flags = DrefFlags::from_bits_truncate(entry.flags) & !DrefFlags::OPEN;
                d.mccs_version = entry.mccs_version;
                d.capabilities = entry.capabilities.clone();
            }
            busno_to_id.push((entry.io_path.busno, id, entry.actual_display_busno));
            restored += 1;
        }

        // second pass to restore phantom back-links by bus number
        for (_, id, actual_busno) in &busno_to_id {
            if let Some(actual_busno) = actual_busno {
                let actual = busno_to_id
                    .iter()
                    .find(|(busno, _, _)| busno == actual_busno)
                    .map(|(_, id, _)| *id);
                if let Some(dref) = self.displays.get(*id) {
                    dref.lock().unwrap().actual = actual;
                }
            }
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("buses", &self.buses.lock().unwrap().len())
            .field("displays", &self.displays.len())
            .finish()
    }
}

#[cfg(feature = "i2c-linux")]
mod hw {
    use super::*;
    use crate::commands::{Command, FeatureCode, GetVcpFeature, SetVcpFeature, VcpValue};
    use crate::edid::EdidId;
    use crate::error::{Error, SemanticError};
    use crate::io::{from_i2c_device, I2cDeviceChannel};
    use crate::sleep::{DynamicSleep, SleepTable};

    /// MCCS version feature, probed during initial checks.
    const FEATURE_VCP_VERSION: FeatureCode = 0xDF;
    /// Brightness: the mandatory feature used for the liveness probe.
    const FEATURE_BRIGHTNESS: FeatureCode = 0x10;

    fn surface_disconnect(e: Error) -> Error {
        if e.is_disconnect() {
            Error::Disconnected
        } else {
            e
        }
    }

    impl Core {
        /// Full detection pass: enumerate and probe buses, create drefs,
        /// run the initial-checks probe and the phantom filter, and
        /// assign display numbers. Returns the user-visible display
        /// count.
        pub fn detect(&self) -> Result<u32> {
            let registry = crate::bus::detect_buses(&self.sysfs).map_err(Error::Transport)?;
            let mut candidates = Vec::new();
            {
                let mut buses = self.buses.lock().unwrap();
                *buses = registry;
                for info in buses.iter() {
                    if let Some(edid) = &info.edid {
                        let mst = info.adapter_name.as_deref() == Some("DPMST");
                        let id = self.displays.add(
                            info.busno,
                            edid.clone(),
                            info.drm_connector.clone(),
                            mst,
                        );
                        candidates.push(id);
                    }
                }
            }

            for id in candidates {
                self.initial_probe(id);
            }
            self.run_phantom_filter();
            Ok(self.displays.assign_display_numbers())
        }

        /// The initial-checks probe: a small VCP Get of a mandatory
        /// feature decides whether DDC communication works right now.
        /// Retry exhaustion becomes dref state, not an error.
        pub fn initial_probe(&self, id: DrefId) {
            let working = match self.probe_dref(id) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "initial DDC probe failed");
                    false
                }
            };
            if let Some(dref) = self.displays.get(id) {
                let mut d = dref.lock().unwrap();
                d.flags |= DrefFlags::DDC_CHECKED;
                if working {
                    d.flags |= DrefFlags::DDC_WORKING;
                }
                tracing::debug!(dref = %d.repr(), working, "initial checks complete");
            }
        }

        /// Retests DDC communication on a dref. `Ok` means the monitor
        /// answered; an unsupported-feature reply still proves the
        /// channel works. [`Error::Disconnected`] means the monitor is
        /// gone.
        pub fn probe_dref(&self, id: DrefId) -> Result<()> {
            let busno = {
                let dref = self
                    .displays
                    .get(id)
                    .ok_or_else(|| Error::Internal(format!("unknown dref {:?}", id)))?;
                let d = dref.lock().unwrap();
                if d.is_removed() {
                    return Err(Error::Disconnected);
                }
                d.busno
            };
            let mut channel = self.open_channel(busno, None)?;
            match channel.execute(GetVcpFeature::new(FEATURE_BRIGHTNESS)) {
                Ok(_) => Ok(()),
                Err(Error::Semantics(SemanticError::UnsupportedVcpCode(_))) => Ok(()),
                Err(e) => Err(surface_disconnect(e)),
            }
        }

        /// Probes a newly appeared bus and registers it. Returns the new
        /// dref (when the bus carries an EDID) and whether DDC already
        /// works on it.
        pub fn add_bus_by_number(&self, busno: u32) -> Option<(DrefId, bool)> {
            let info = crate::bus::probe_bus(busno, &self.sysfs);
            let id = self.attach_bus(info)?;
            self.initial_probe(id);
            let working = self
                .displays
                .get(id)
                .map(|d| d.lock().unwrap().ddc_working())
                .unwrap_or(false);
            if working {
                let dispno = self.displays.next_dispno();
                if let Some(dref) = self.displays.get(id) {
                    dref.lock().unwrap().dispno = dispno;
                }
            }
            Some((id, working))
        }

        fn open_channel(&self, busno: u32, edid_id: Option<&EdidId>) -> Result<I2cDeviceChannel> {
            let mut channel = from_i2c_device(self.sysfs.i2c_devnode(busno))
                .map_err(Error::Transport)?
                .with_retry_policy(self.settings.retry.clone())
                .with_stats(Arc::clone(&self.stats));
            channel.require_full_i2c()?;
            if let (Some(store), Some(edid_id)) = (self.sleep_store.as_deref(), edid_id) {
                if let Ok(Some(multiplier)) = store.load(edid_id) {
                    channel = channel
                        .with_tuning(DynamicSleep::with_multiplier(SleepTable::default(), multiplier));
                }
            }
            Ok(channel)
        }

        /// Opens a display handle for VCP I/O.
        ///
        /// Phantom drefs transparently open the display they shadow. At
        /// most one handle may be open per dref; a second open fails
        /// until the first is closed.
        pub fn open_display(&self, id: DrefId) -> Result<DisplayHandle<'_>> {
            let dref = self
                .displays
                .get(id)
                .ok_or_else(|| Error::Internal(format!("unknown dref {:?}", id)))?;

            let (id, busno, edid_id) = {
                let d = dref.lock().unwrap();
                if d.is_removed() {
                    return Err(Error::Disconnected);
                }
                match d.actual {
                    Some(actual) if d.is_phantom() => {
                        drop(d);
                        return self.open_display(actual);
                    }
                    _ => (d.id, d.busno, d.edid.id()),
                }
            };

            {
                let mut d = dref.lock().unwrap();
                if d.flags.contains(DrefFlags::OPEN) {
                    return Err(Error::Internal("display is already open".into()));
                }
                d.flags |= DrefFlags::OPEN;
            }

            match self.open_channel(busno, Some(&edid_id)) {
                Ok(channel) => Ok(DisplayHandle {
                    core: self,
                    id,
                    edid_id,
                    channel: Some(channel),
                }),
                Err(e) => {
                    dref.lock().unwrap().flags -= DrefFlags::OPEN;
                    Err(e)
                }
            }
        }
    }

    /// A short-lived open binding for one dref; required for VCP I/O.
    ///
    /// Closing is idempotent; dropping the handle closes it.
    pub struct DisplayHandle<'a> {
        core: &'a Core,
        id: DrefId,
        edid_id: EdidId,
        channel: Option<I2cDeviceChannel>,
    }

    impl<'a> DisplayHandle<'a> {
        pub fn dref(&self) -> DrefId {
            self.id
        }

        /// Executes an arbitrary DDC/CI command on this display.
        pub fn execute<C: Command>(&mut self, command: C) -> Result<C::Ok> {
            let channel = self
                .channel
                .as_mut()
                .ok_or_else(|| Error::Internal("display handle is closed".into()))?;
            channel.execute(command).map_err(surface_disconnect)
        }

        pub fn get_vcp(&mut self, code: FeatureCode) -> Result<VcpValue> {
            self.execute(GetVcpFeature::new(code))
        }

        pub fn set_vcp(&mut self, code: FeatureCode, value: u16) -> Result<()> {
            self.execute(SetVcpFeature::new(code, value))
        }

        /// The monitor's MCCS version, cached on the dref after the first
        /// read.
        pub fn mccs_version(&mut self) -> Result<(u8, u8)> {
            if let Some(dref) = self.core.displays.get(self.id) {
                if let Some(version) = dref.lock().unwrap().mccs_version {
                    return Ok(version);
                }
            }
            let value = self.get_vcp(FEATURE_VCP_VERSION)?;
            let version = (value.sh, value.sl);
            if let Some(dref) = self.core.displays.get(self.id) {
                dref.lock().unwrap().mccs_version = Some(version);
            }
            Ok(version)
        }

        /// The raw capabilities string, from the dref cache, then the
        /// persistent cache, then the wire.
        pub fn capabilities(&mut self) -> Result<String> {
            if let Some(dref) = self.core.displays.get(self.id) {
                if let Some(caps) = dref.lock().unwrap().capabilities.clone() {
                    return Ok(caps);
                }
            }
            if let Some(store) = self.core.capability_store.as_deref() {
                if let Ok(Some(caps)) = store.load(&self.edid_id) {
                    self.cache_capabilities(&caps);
                    return Ok(caps);
                }
            }

            let channel = self
                .channel
                .as_mut()
                .ok_or_else(|| Error::Internal("display handle is closed".into()))?;
            let raw = channel.capabilities_string().map_err(surface_disconnect)?;
            let caps = String::from_utf8_lossy(&raw).into_owned();
            self.cache_capabilities(&caps);
            if let Some(store) = self.core.capability_store.as_deref() {
                if let Err(e) = store.save(&self.edid_id, &caps) {
                    tracing::warn!(error = %e, "cannot persist capabilities cache");
                }
            }
            Ok(caps)
        }

        fn cache_capabilities(&self, caps: &str) {
            if let Some(dref) = self.core.displays.get(self.id) {
                dref.lock().unwrap().capabilities = Some(caps.to_owned());
            }
        }

        /// Closes the handle, persisting the adapted sleep multiplier.
        pub fn close(mut self) {
            self.release();
        }

        fn release(&mut self) {
            let channel = match self.channel.take() {
                Some(channel) => channel,
                None => return,
            };
            if let Some(store) = self.core.sleep_store.as_deref() {
                if let Err(e) = store.save(&self.edid_id, channel.tuning().multiplier()) {
                    tracing::warn!(error = %e, "cannot persist sleep multiplier");
                }
            }
            if let Some(dref) = self.core.displays.get(self.id) {
                dref.lock().unwrap().flags -= DrefFlags::OPEN;
            }
        }
    }

    impl<'a> Drop for DisplayHandle<'a> {
        fn drop(&mut self) {
            self.release();
        }
    }
}

#[cfg(feature = "i2c-linux")]
pub use hw::DisplayHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dref::{DISPNO_PHANTOM, DISPNO_REMOVED};
    use crate::edid::tests::test_edid;
    use crate::sysfs::tests::FakeTree;

    fn edid(serial: &str) -> ParsedEdid {
        let block = test_edid([0x10, 0xAC], [0x27, 0xA0], [1, 0, 0, 0], "U2720Q", serial);
        ParsedEdid::parse(&block).unwrap()
    }

    fn bus_with_edid(busno: u32, serial: &str) -> BusInfo {
        let mut info = BusInfo::new(busno);
        info.edid = Some(edid(serial));
        info.drm_connector = Some(format!("card0-DP-{}", busno));
        info
    }

    fn core_with_tree() -> (Core, FakeTree) {
        let tree = FakeTree::new();
        let core = Core::new(Settings::default()).with_sysfs(tree.root());
        (core, tree)
    }

    #[test]
    fn scan_sets_follow_the_fake_tree() {
        let (core, tree) = core_with_tree();
        tree.add_devnode(5);
        tree.add_devnode(6);
        tree.add_connector("card0-DP-1", Some(6));
        tree.set_connector_edid("card0-DP-1", &[1, 2, 3]);

        assert_eq!(core.scan_attached().iter().collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(core.scan_with_edid().iter().collect::<Vec<_>>(), vec![6]);
    }

    #[test]
    fn attach_and_detach_bus_lifecycle() {
        let (core, tree) = core_with_tree();
        tree.add_devnode(6);

        let id = core.attach_bus(bus_with_edid(6, "ABC123")).unwrap();
        assert_eq!(core.displays.find_by_busno(6, true), Some(id));

        // devnode still present: bus record stays, EDID cleared
        let (removed, connector) = core.detach_bus(6).unwrap();
        assert_eq!(removed, id);
        assert_eq!(connector.as_deref(), Some("card0-DP-6"));
        assert!(core.with_buses(|b| b.find(6).map(|i| !i.has_edid()).unwrap()));
        let dref = core.displays.get(id).unwrap();
        assert_eq!(dref.lock().unwrap().dispno, DISPNO_REMOVED);

        // devnode gone: bus record dropped entirely
        let id2 = core.attach_bus(bus_with_edid(6, "ABC123")).unwrap();
        tree.remove_devnode(6);
        core.detach_bus(6).unwrap();
        assert!(core.with_buses(|b| b.find(6).is_none()));
        assert!(core.displays.get(id2).unwrap().lock().unwrap().is_removed());
    }

    #[test]
    fn detach_of_unknown_bus_is_none() {
        let (core, _tree) = core_with_tree();
        assert!(core.detach_bus(42).is_none());
    }

    #[test]
    fn snapshot_round_trip_preserves_identity_and_links() {
        let (core, tree) = core_with_tree();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("displays.json");

        let a = core.attach_bus(bus_with_edid(6, "ABC123")).unwrap();
        let b = core.attach_bus(bus_with_edid(9, "ABC123")).unwrap();
        {
            let dref = core.displays.get(a).unwrap();
            let mut d = dref.lock().unwrap();
            d.flags |= DrefFlags::DDC_WORKING | DrefFlags::DDC_CHECKED;
            d.dispno = 1;
            d.mccs_version = Some((2, 1));
        }
        {
            let dref = core.displays.get(b).unwrap();
            let mut d = dref.lock().unwrap();
            d.dispno = DISPNO_PHANTOM;
            d.actual = Some(a);
        }
        core.save_snapshot(&path).unwrap();

        let restored = Core::new(Settings::default()).with_sysfs(tree.root());
        assert_eq!(restored.load_snapshot(&path).unwrap(), 2);
        assert_eq!(restored.displays.len(), 2);

        let ra = restored.displays.find_by_busno(6, true).unwrap();
        let rb = restored.displays.find_by_busno(9, true).unwrap();
        let da = restored.displays.get(ra).unwrap();
        let da = da.lock().unwrap();
        assert_eq!(da.dispno, 1);
        assert!(da.ddc_working());
        assert_eq!(da.mccs_version, Some((2, 1)));
        assert_eq!(da.edid.id(), edid("ABC123").id());
        drop(da);

        let db = restored.displays.get(rb).unwrap();
        let db = db.lock().unwrap();
        assert_eq!(db.dispno, DISPNO_PHANTOM);
        assert_eq!(db.actual, Some(ra));
    }

    #[test]
    fn snapshot_rejects_unknown_version() {
        let (core, _tree) = core_with_tree();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("displays.json");
        std::fs::write(&path, r#"{"version": 99, "all_displays": []}"#).unwrap();
        assert!(core.load_snapshot(&path).is_err());
    }
}
