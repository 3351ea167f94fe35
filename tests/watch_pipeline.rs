//! End-to-end exercises of the discovery and event pipeline against a
//! fake sysfs tree: hot-plug, recheck, DPMS, and the per-display event
//! grammar.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddcmon::bus::{BusInfo, BusSet};
use ddcmon::dref::DrefFlags;
use ddcmon::edid::ParsedEdid;
use ddcmon::sysfs::SysRoot;
use ddcmon::watch::{check_bus_asleep, recheck_displays, stabilized_buses, RecheckOutcome};
use ddcmon::{Core, Dispatcher, EventType, Settings, StatusEvent};

/// Builds a valid 128-byte EDID block for tests.
fn edid_block(serial: &str) -> [u8; 128] {
    let mut b = [0u8; 128];
    b[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
    b[8] = 0x10;
    b[9] = 0xAC;
    b[10] = 0x27;
    b[11] = 0xA0;
    b[12] = 1;

    write_descriptor(&mut b, 54, 0xFF, serial);
    write_descriptor(&mut b, 72, 0xFC, "U2720Q");

    let sum = b[..127].iter().fold(0u8, |a, &x| a.wrapping_add(x));
    b[127] = 0u8.wrapping_sub(sum);
    b
}

fn write_descriptor(b: &mut [u8; 128], offset: usize, tag: u8, text: &str) {
    b[offset + 3] = tag;
    let bytes = text.as_bytes();
    b[offset + 5..offset + 5 + bytes.len()].copy_from_slice(bytes);
    b[offset + 5 + bytes.len()] = 0x0A;
    for i in offset + 5 + bytes.len() + 1..offset + 18 {
        b[i] = 0x20;
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    sysfs: SysRoot,
    sys: std::path::PathBuf,
    dev: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sys = dir.path().join("sys");
        let dev = dir.path().join("dev");
        fs::create_dir_all(sys.join("class/drm")).unwrap();
        fs::create_dir_all(&dev).unwrap();
        let sysfs = SysRoot::at(&sys, &dev);
        Fixture {
            _dir: dir,
            sysfs,
            sys,
            dev,
        }
    }

    fn add_connector(&self, name: &str, busno: u32) {
        let dir = self.sys.join("class/drm").join(name);
        fs::create_dir_all(dir.join(format!("i2c-{}", busno))).unwrap();
        fs::write(self.dev.join(format!("i2c-{}", busno)), b"").unwrap();
    }

    fn set_attr(&self, name: &str, attr: &str, value: &str) {
        fs::write(
            self.sys.join("class/drm").join(name).join(attr),
            format!("{}\n", value),
        )
        .unwrap();
    }

    fn bus_with_edid(&self, busno: u32, serial: &str) -> BusInfo {
        let mut info = BusInfo::new(busno);
        info.edid = Some(ParsedEdid::parse(&edid_block(serial)).unwrap());
        info.drm_connector = self.sysfs.connector_for_busno(busno);
        info
    }
}

fn collector(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<StatusEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher.register(move |e: &StatusEvent| sink.lock().unwrap().push(e.clone()));
    seen
}

/// Checks that a per-display event stream is a prefix of
/// `(CONNECTED (DDC_ENABLED? (ASLEEP AWAKE)*)? DISCONNECTED)*`.
fn assert_causal(events: &[EventType]) {
    #[derive(PartialEq)]
    enum S {
        Down,
        Up,
        Asleep,
    }
    let mut state = S::Down;
    let mut ddc_enabled_since_connect = false;
    for (i, event) in events.iter().enumerate() {
        state = match (state, event) {
            (S::Down, EventType::Connected) => {
                ddc_enabled_since_connect = false;
                S::Up
            }
            (S::Up, EventType::DdcEnabled) if !ddc_enabled_since_connect => {
                ddc_enabled_since_connect = true;
                S::Up
            }
            (S::Up, EventType::DpmsAsleep) => S::Asleep,
            (S::Asleep, EventType::DpmsAwake) => S::Up,
            (S::Up, EventType::Disconnected) => S::Down,
            (_, event) => panic!("event {:?} at position {} violates causality", event, i),
        };
    }
}

#[test]
fn hotplug_with_slow_ddc_produces_causal_stream() {
    let fixture = Fixture::new();
    fixture.add_connector("card0-DP-1", 6);

    let core = Core::new(Settings::default()).with_sysfs(fixture.sysfs.clone());
    let dispatcher = Dispatcher::new();
    let seen = collector(&dispatcher);

    // hot-plug: the bus appears with an EDID but DDC does not answer yet
    let id = core.attach_bus(fixture.bus_with_edid(6, "ABC123")).unwrap();
    for worker in dispatcher.deliver_cycle(vec![dispatcher.make_event(
        EventType::Connected,
        6,
        Some("card0-DP-1".into()),
        Some(id),
    )]) {
        worker.join().unwrap();
    }

    // the recheck worker retests it; the monitor answers on the second try
    let cancel = AtomicBool::new(false);
    let mut attempts = 0;
    recheck_displays(
        vec![id],
        Duration::from_millis(1),
        &cancel,
        |_| {
            attempts += 1;
            if attempts < 2 {
                Err(ddcmon::Error::RetryExhausted {
                    tries: 3,
                    last: Box::new(ddcmon::Error::Disconnected),
                })
            } else {
                Ok(())
            }
        },
        |outcome| match outcome {
            RecheckOutcome::Enabled { id, .. } => {
                let dref = core.displays().get(id).unwrap();
                let next_dispno = core.displays().next_dispno();
                let (busno, connector) = {
                    let mut d = dref.lock().unwrap();
                    d.flags |= DrefFlags::DDC_WORKING;
                    d.dispno = next_dispno;
                    (d.busno, d.drm_connector.clone())
                };
                for worker in dispatcher.deliver_cycle(vec![dispatcher.make_event(
                    EventType::DdcEnabled,
                    busno,
                    connector,
                    Some(id),
                )]) {
                    worker.join().unwrap();
                }
            }
            other => panic!("unexpected outcome {:?}", other),
        },
    );

    // DPMS sleep and wake
    fixture.set_attr("card0-DP-1", "dpms", "Off");
    let active: BusSet = [6u32].into_iter().collect();
    let mut events = Vec::new();
    let sleepy = check_bus_asleep(
        &fixture.sysfs,
        core.displays(),
        &dispatcher,
        &active,
        BusSet::EMPTY,
        &mut events,
    );
    fixture.set_attr("card0-DP-1", "dpms", "On");
    check_bus_asleep(
        &fixture.sysfs,
        core.displays(),
        &dispatcher,
        &active,
        sleepy,
        &mut events,
    );
    for worker in dispatcher.deliver_cycle(events) {
        worker.join().unwrap();
    }

    // unplug
    let (removed, connector) = core.detach_bus(6).unwrap();
    assert_eq!(removed, id);
    for worker in dispatcher.deliver_cycle(vec![dispatcher.make_event(
        EventType::Disconnected,
        6,
        connector,
        Some(removed),
    )]) {
        worker.join().unwrap();
    }

    let events: Vec<EventType> = seen.lock().unwrap().iter().map(|e| e.event_type).collect();
    assert_eq!(
        events,
        vec![
            EventType::Connected,
            EventType::DdcEnabled,
            EventType::DpmsAsleep,
            EventType::DpmsAwake,
            EventType::Disconnected,
        ]
    );
    assert_causal(&events);

    // the published id resolves to the same identity even after removal
    let dref = core.displays().get(id).unwrap();
    let d = dref.lock().unwrap();
    assert!(d.is_removed());
    assert_eq!(d.edid.serial_ascii(), "ABC123");
}

#[test]
fn transient_flap_emits_no_events() {
    // watcher stabilization scenario: snapshot {5,6} flaps to {5} and
    // back; after stabilization the delta is empty
    let settings = Settings {
        initial_stabilization: Duration::from_millis(3),
        stabilization_poll: Duration::from_millis(1),
        ..Default::default()
    };
    let cancel = AtomicBool::new(false);

    let initial: BusSet = [5u32, 6].into_iter().collect();
    let trigger: BusSet = [5u32].into_iter().collect();
    let samples = Mutex::new(vec![initial, initial]);

    let (stable, _) = stabilized_buses(
        || samples.lock().unwrap().pop().unwrap(),
        trigger,
        &settings,
        &cancel,
        true,
    );

    let removed = initial.and_not(&stable);
    let added = stable.and_not(&initial);
    assert!(removed.is_empty());
    assert!(added.is_empty());
}

#[test]
fn interleaved_displays_each_stay_causal() {
    let fixture = Fixture::new();
    fixture.add_connector("card0-DP-1", 6);
    fixture.add_connector("card0-DP-2", 9);

    let core = Core::new(Settings::default()).with_sysfs(fixture.sysfs.clone());
    let dispatcher = Dispatcher::new();
    let seen = collector(&dispatcher);

    let a = core.attach_bus(fixture.bus_with_edid(6, "AAA111")).unwrap();
    let b = core.attach_bus(fixture.bus_with_edid(9, "BBB222")).unwrap();

    for worker in dispatcher.deliver_cycle(vec![
        dispatcher.make_event(EventType::Connected, 6, None, Some(a)),
        dispatcher.make_event(EventType::Connected, 9, None, Some(b)),
    ]) {
        worker.join().unwrap();
    }
    core.detach_bus(6).unwrap();
    for worker in dispatcher.deliver_cycle(vec![dispatcher.make_event(
        EventType::Disconnected,
        6,
        None,
        Some(a),
    )]) {
        worker.join().unwrap();
    }

    let events = seen.lock().unwrap();
    let mut per_dref: HashMap<_, Vec<EventType>> = HashMap::new();
    for event in events.iter() {
        per_dref
            .entry(event.dref.unwrap())
            .or_default()
            .push(event.event_type);
    }
    for stream in per_dref.values() {
        assert_causal(stream);
    }
    assert_eq!(per_dref[&a], vec![EventType::Connected, EventType::Disconnected]);
    assert_eq!(per_dref[&b], vec![EventType::Connected]);
}

#[test]
fn registry_snapshot_survives_restart() {
    let fixture = Fixture::new();
    fixture.add_connector("card0-DP-1", 6);
    let snapshot_path = fixture.dev.join("../displays.json");

    let core = Core::new(Settings::default()).with_sysfs(fixture.sysfs.clone());
    let id = core.attach_bus(fixture.bus_with_edid(6, "ABC123")).unwrap();
    {
        let dref = core.displays().get(id).unwrap();
        let mut d = dref.lock().unwrap();
        d.flags |= DrefFlags::DDC_WORKING | DrefFlags::DDC_CHECKED;
        d.dispno = 1;
    }
    core.save_snapshot(&snapshot_path).unwrap();

    let restarted = Core::new(Settings::default()).with_sysfs(fixture.sysfs.clone());
    assert_eq!(restarted.load_snapshot(&snapshot_path).unwrap(), 1);
    let restored = restarted.displays().find_by_busno(6, true).unwrap();
    let dref = restarted.displays().get(restored).unwrap();
    let d = dref.lock().unwrap();
    assert_eq!(d.dispno, 1);
    assert_eq!(d.edid.mfg_id(), "DEL");
}
