//! Display references: the durable identity of every monitor known to the
//! process.
//!
//! Drefs live in an arena and are never deleted, only flagged removed, so
//! a published [`DrefId`] stays resolvable for the life of the process.
//! Consumers holding one across watcher events observe a disconnect event
//! before any subsequent use fails.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::edid::ParsedEdid;
use crate::sysfs::SysRoot;

/// DDC communication was probed and did not work.
pub const DISPNO_INVALID: i32 = -1;
/// The dref shadows a working dref for the same monitor.
pub const DISPNO_PHANTOM: i32 = -2;
/// The monitor is gone.
pub const DISPNO_REMOVED: i32 = -3;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct DrefFlags: u16 {
        /// The initial-checks probe succeeded.
        const DDC_WORKING = 0x01;
        /// The initial-checks probe has run.
        const DDC_CHECKED = 0x02;
        /// Not to be published (mid-creation or mid-teardown).
        const TRANSIENT = 0x04;
        /// The monitor is gone; the dref persists as a tombstone.
        const REMOVED = 0x08;
        /// A display handle is currently open on this dref.
        const OPEN = 0x10;
    }
}

/// Stable arena id of a display reference; the published handle consumers
/// retain across watcher events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrefId(pub(crate) u32);

impl DrefId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The durable record for one detected monitor.
#[derive(Debug, Clone)]
pub struct DisplayRef {
    pub id: DrefId,
    pub busno: u32,
    pub edid: ParsedEdid,
    /// Positive for user-visible displays; see the `DISPNO_` constants.
    pub dispno: i32,
    pub flags: DrefFlags,
    pub drm_connector: Option<String>,
    /// The bus's adapter is a DisplayPort MST branch.
    pub mst: bool,
    /// Cached MCCS version from feature 0xDF, once read.
    pub mccs_version: Option<(u8, u8)>,
    /// Raw capabilities string, fetched lazily and cached.
    pub capabilities: Option<String>,
    /// For phantoms, the working dref this one shadows.
    pub actual: Option<DrefId>,
}

impl DisplayRef {
    pub fn is_phantom(&self) -> bool {
        self.dispno == DISPNO_PHANTOM
    }

    pub fn is_removed(&self) -> bool {
        self.flags.contains(DrefFlags::REMOVED)
    }

    pub fn ddc_working(&self) -> bool {
        self.flags.contains(DrefFlags::DDC_WORKING)
    }

    /// Short diagnostic form, e.g. `dref(disp=1, bus=6, DEL/U2720Q)`.
    pub fn repr(&self) -> String {
        format!(
            "dref(disp={}, bus={}, {}/{})",
            self.dispno,
            self.busno,
            self.edid.mfg_id(),
            self.edid.model_name()
        )
    }
}

/// The arena of drefs, guarded by one registry lock; each dref carries its
/// own lock for field mutation.
#[derive(Debug, Default)]
pub struct DisplayRegistry {
    drefs: Mutex<Vec<Arc<Mutex<DisplayRef>>>>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a candidate dref and returns its published id.
    pub fn add(
        &self,
        busno: u32,
        edid: ParsedEdid,
        drm_connector: Option<String>,
        mst: bool,
    ) -> DrefId {
        let mut drefs = self.drefs.lock().unwrap();
        let id = DrefId(drefs.len() as u32);
        drefs.push(Arc::new(Mutex::new(DisplayRef {
            id,
            busno,
            edid,
            dispno: DISPNO_INVALID,
            flags: DrefFlags::empty(),
            drm_connector,
            mst,
            mccs_version: None,
            capabilities: None,
            actual: None,
        })));
        id
    }

    /// Resolves a published id. Always succeeds for ids this registry
    /// handed out; the dref may be flagged removed.
    pub fn get(&self, id: DrefId) -> Option<Arc<Mutex<DisplayRef>>> {
        self.drefs.lock().unwrap().get(id.index()).cloned()
    }

    /// Copies out handles to every dref.
    pub fn all(&self) -> Vec<Arc<Mutex<DisplayRef>>> {
        self.drefs.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.drefs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.drefs.lock().unwrap().is_empty()
    }

    /// The live (non-removed) dref for a bus, if any.
    pub fn find_by_busno(&self, busno: u32, include_invalid: bool) -> Option<DrefId> {
        for dref in self.all() {
            let d = dref.lock().unwrap();
            if d.busno == busno && !d.is_removed() && (include_invalid || d.dispno > 0) {
                return Some(d.id);
            }
        }
        None
    }

    /// Assigns positive display numbers, in bus order, to drefs that
    /// survived the probe and the phantom filter.
    pub fn assign_display_numbers(&self) -> u32 {
        let mut survivors: Vec<Arc<Mutex<DisplayRef>>> = self
            .all()
            .into_iter()
            .filter(|d| {
                let d = d.lock().unwrap();
                d.ddc_working() && !d.is_phantom() && !d.is_removed()
            })
            .collect();
        survivors.sort_by_key(|d| d.lock().unwrap().busno);

        let mut next = 0;
        for dref in survivors {
            next += 1;
            dref.lock().unwrap().dispno = next as i32;
        }
        next
    }

    /// The next unassigned positive display number.
    pub fn next_dispno(&self) -> i32 {
        let max = self
            .all()
            .iter()
            .map(|d| d.lock().unwrap().dispno)
            .max()
            .unwrap_or(0);
        max.max(0) + 1
    }

    /// Flags a dref removed; the arena entry persists as a tombstone.
    pub fn mark_removed(&self, id: DrefId) {
        if let Some(dref) = self.get(id) {
            let mut d = dref.lock().unwrap();
            d.dispno = DISPNO_REMOVED;
            d.flags |= DrefFlags::REMOVED;
            tracing::info!(dref = %d.repr(), "display removed");
        }
    }
}

#[derive(Clone)]
struct PhantomCandidate {
    id: DrefId,
    busno: u32,
    edid: ParsedEdid,
    connector: Option<String>,
    mst: bool,
}

/// Marks phantom displays.
///
/// The kernel sometimes exposes one monitor twice, once on a working bus
/// and once on a parallel bus whose connector reports
/// `status=disconnected, enabled=disabled` with no EDID. The filter pairs
/// every non-working dref against every working dref with matching EDID
/// identity fields and marks the non-working one phantom. A second pass
/// resolves an MST and a non-MST connector reporting byte-identical
/// EDIDs in favor of the MST one.
///
/// Running the filter twice in succession produces no additional
/// mutations.
pub fn filter_phantom_displays(registry: &DisplayRegistry, sysfs: &SysRoot) -> usize {
    let all = registry.all();
    if all.len() < 2 {
        return 0;
    }

    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for dref in &all {
        let d = dref.lock().unwrap();
        if d.is_removed() || d.is_phantom() {
            continue;
        }
        let candidate = PhantomCandidate {
            id: d.id,
            busno: d.busno,
            edid: d.edid.clone(),
            connector: d.drm_connector.clone(),
            mst: d.mst,
        };
        if d.ddc_working() {
            valid.push(candidate);
        } else {
            invalid.push(candidate);
        }
    }

    let mut marked: Vec<(DrefId, DrefId)> = Vec::new();

    for inv in &invalid {
        for val in &valid {
            if inv.edid.id() != val.edid.id() {
                continue;
            }
            let connector = inv
                .connector
                .clone()
                .or_else(|| sysfs.connector_for_busno(inv.busno));
            let looks_phantom = connector
                .map(|c| sysfs.connector_looks_phantom(&c))
                .unwrap_or(false);
            if looks_phantom {
                tracing::info!(
                    phantom_bus = inv.busno,
                    actual_bus = val.busno,
                    "phantom display detected"
                );
                marked.push((inv.id, val.id));
            }
        }
    }

    // Second pass: one MST and one non-MST connector with byte-identical
    // EDIDs. Guarded against duplicate EDIDs on either side, since two
    // physical monitors with identical EDIDs would make the pairing
    // ambiguous.
    let (mst, non_mst): (Vec<_>, Vec<_>) = valid.iter().cloned().partition(|c| c.mst);
    if !mst.is_empty() && !non_mst.is_empty() {
        let dup_non_mst = has_duplicate_edids(&non_mst);
        let dup_mst = has_duplicate_edids(&mst);
        if dup_non_mst || dup_mst {
            tracing::warn!(
                duplicate_non_mst = dup_non_mst,
                duplicate_mst = dup_mst,
                "identical EDIDs among connectors of one kind, skipping MST phantom pass"
            );
        } else {
            for m in &mst {
                for n in &non_mst {
                    if m.edid.same_bytes(&n.edid) {
                        tracing::warn!(
                            mst_bus = m.busno,
                            non_mst_bus = n.busno,
                            "MST and non-MST connectors report the same EDID, \
                             treating the non-MST one as phantom"
                        );
                        marked.push((n.id, m.id));
                    }
                }
            }
        }
    }

    let count = marked.len();
    for (phantom, actual) in marked {
        if let Some(dref) = registry.get(phantom) {
            let mut d = dref.lock().unwrap();
            d.dispno = DISPNO_PHANTOM;
            d.actual = Some(actual);
        }
    }
    count
}

fn has_duplicate_edids(candidates: &[PhantomCandidate]) -> bool {
    for (i, a) in candidates.iter().enumerate() {
        for b in &candidates[i + 1..] {
            if a.edid.same_bytes(&b.edid) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edid::tests::test_edid;
    use crate::edid::ParsedEdid;
    use crate::sysfs::tests::FakeTree;

    fn edid_x() -> ParsedEdid {
        let block = test_edid([0x10, 0xAC], [0x27, 0xA0], [1, 0, 0, 0], "U2720Q", "ABC123");
        ParsedEdid::parse(&block).unwrap()
    }

    fn edid_y() -> ParsedEdid {
        let block = test_edid([0x1E, 0x6D], [0x01, 0x5B], [7, 0, 0, 0], "LG HDR 4K", "707NT");
        ParsedEdid::parse(&block).unwrap()
    }

    fn set_working(registry: &DisplayRegistry, id: DrefId) {
        let dref = registry.get(id).unwrap();
        let mut d = dref.lock().unwrap();
        d.flags |= DrefFlags::DDC_WORKING | DrefFlags::DDC_CHECKED;
    }

    fn set_checked(registry: &DisplayRegistry, id: DrefId) {
        let dref = registry.get(id).unwrap();
        dref.lock().unwrap().flags |= DrefFlags::DDC_CHECKED;
    }

    fn dispno(registry: &DisplayRegistry, id: DrefId) -> i32 {
        registry.get(id).unwrap().lock().unwrap().dispno
    }

    #[test]
    fn published_ids_stay_resolvable() {
        let registry = DisplayRegistry::new();
        let a = registry.add(6, edid_x(), Some("card0-DP-1".into()), false);
        set_working(&registry, a);
        registry.assign_display_numbers();
        assert_eq!(dispno(&registry, a), 1);

        registry.mark_removed(a);
        let dref = registry.get(a).unwrap();
        let d = dref.lock().unwrap();
        assert!(d.is_removed());
        assert_eq!(d.dispno, DISPNO_REMOVED);
        // identity survives removal
        assert_eq!(d.edid.id(), edid_x().id());
    }

    #[test]
    fn numbering_follows_bus_order() {
        let registry = DisplayRegistry::new();
        let high = registry.add(9, edid_y(), None, false);
        let low = registry.add(4, edid_x(), None, false);
        set_working(&registry, high);
        set_working(&registry, low);
        assert_eq!(registry.assign_display_numbers(), 2);
        assert_eq!(dispno(&registry, low), 1);
        assert_eq!(dispno(&registry, high), 2);
        assert_eq!(registry.next_dispno(), 3);
    }

    #[test]
    fn phantom_filter_marks_and_backlinks() {
        // dref A: bus 6, DDC working. dref B: bus 9, not working, same
        // identity, connector reporting the negative triple.
        let tree = FakeTree::new();
        tree.add_connector("card0-DP-1", Some(6));
        tree.add_connector("card0-DP-2", Some(9));
        tree.set_connector_attr("card0-DP-2", "status", "disconnected");
        tree.set_connector_attr("card0-DP-2", "enabled", "disabled");

        let registry = DisplayRegistry::new();
        let a = registry.add(6, edid_x(), Some("card0-DP-1".into()), false);
        let b = registry.add(9, edid_x(), Some("card0-DP-2".into()), false);
        set_working(&registry, a);
        set_checked(&registry, b);

        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 1);
        registry.assign_display_numbers();

        assert_eq!(dispno(&registry, a), 1);
        assert_eq!(dispno(&registry, b), DISPNO_PHANTOM);
        let dref_b = registry.get(b).unwrap();
        assert_eq!(dref_b.lock().unwrap().actual, Some(a));
    }

    #[test]
    fn phantom_filter_requires_negative_triple() {
        let tree = FakeTree::new();
        tree.add_connector("card0-DP-2", Some(9));
        tree.set_connector_attr("card0-DP-2", "status", "connected");
        tree.set_connector_attr("card0-DP-2", "enabled", "disabled");

        let registry = DisplayRegistry::new();
        let a = registry.add(6, edid_x(), None, false);
        let b = registry.add(9, edid_x(), Some("card0-DP-2".into()), false);
        set_working(&registry, a);
        set_checked(&registry, b);

        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 0);
        assert_eq!(dispno(&registry, b), DISPNO_INVALID);
    }

    #[test]
    fn phantom_filter_requires_identity_match() {
        let tree = FakeTree::new();
        tree.add_connector("card0-DP-2", Some(9));
        tree.set_connector_attr("card0-DP-2", "status", "disconnected");
        tree.set_connector_attr("card0-DP-2", "enabled", "disabled");

        let registry = DisplayRegistry::new();
        let a = registry.add(6, edid_x(), None, false);
        let b = registry.add(9, edid_y(), Some("card0-DP-2".into()), false);
        set_working(&registry, a);
        set_checked(&registry, b);

        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 0);
    }

    #[test]
    fn phantom_filter_is_idempotent() {
        let tree = FakeTree::new();
        tree.add_connector("card0-DP-2", Some(9));
        tree.set_connector_attr("card0-DP-2", "status", "disconnected");
        tree.set_connector_attr("card0-DP-2", "enabled", "disabled");

        let registry = DisplayRegistry::new();
        let a = registry.add(6, edid_x(), None, false);
        let b = registry.add(9, edid_x(), Some("card0-DP-2".into()), false);
        set_working(&registry, a);
        set_checked(&registry, b);

        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 1);
        // a second run finds nothing left to mark
        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 0);
        assert_eq!(dispno(&registry, b), DISPNO_PHANTOM);
    }

    #[test]
    fn mst_pass_prefers_the_mst_connector() {
        let tree = FakeTree::new();
        let registry = DisplayRegistry::new();
        let mst = registry.add(10, edid_x(), Some("card0-DP-3".into()), true);
        let plain = registry.add(6, edid_x(), Some("card0-DP-1".into()), false);
        set_working(&registry, mst);
        set_working(&registry, plain);

        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 1);
        registry.assign_display_numbers();

        assert_eq!(dispno(&registry, plain), DISPNO_PHANTOM);
        assert!(dispno(&registry, mst) > 0);
        let dref = registry.get(plain).unwrap();
        assert_eq!(dref.lock().unwrap().actual, Some(mst));
    }

    #[test]
    fn mst_pass_guards_against_duplicate_edids() {
        let tree = FakeTree::new();
        let registry = DisplayRegistry::new();
        // two physical non-MST monitors with identical EDIDs plus one MST
        let m = registry.add(10, edid_x(), None, true);
        let p1 = registry.add(6, edid_x(), None, false);
        let p2 = registry.add(7, edid_x(), None, false);
        for id in [m, p1, p2] {
            set_working(&registry, id);
        }

        assert_eq!(filter_phantom_displays(&registry, &tree.root()), 0);
        assert_eq!(registry.assign_display_numbers(), 3);
    }
}
