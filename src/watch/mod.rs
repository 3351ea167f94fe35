//! The display watcher: a long-lived worker observing bus and connector
//! transitions and turning them into status events.
//!
//! All watch modes share one state machine: sample the attached and
//! EDID-carrying bus sets, stabilize when something was removed, translate
//! the deltas into dref changes, emit events, and hand non-working
//! displays to the recheck worker.

mod recheck;
#[cfg(feature = "udev")]
mod udev;
#[cfg(feature = "xevent")]
mod xevent;

pub use recheck::{recheck_displays, RecheckOutcome};
#[cfg(feature = "udev")]
pub use udev::UdevMonitor;
#[cfg(feature = "xevent")]
pub use xevent::XEventSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::BusSet;
use crate::dref::{DisplayRegistry, DrefId};
use crate::events::{Dispatcher, EventType};
use crate::settings::{Settings, WatchMode};
use crate::sysfs::SysRoot;

/// Upper bound of one uninterruptible sleep segment: the cancellation
/// flag is observed at least this often.
pub const SPLIT_SLEEP_STEP: Duration = Duration::from_millis(200);

/// Sleeps `total` in segments, watching the cancellation flag.
///
/// Returns the time actually slept; an early return means cancellation
/// was observed.
pub fn split_sleep(total: Duration, cancel: &AtomicBool) -> Duration {
    let started = Instant::now();
    let mut remaining = total;
    while !remaining.is_zero() && !cancel.load(Ordering::Relaxed) {
        let step = remaining.min(SPLIT_SLEEP_STEP);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    started.elapsed()
}

/// Waits out transient bus flaps after a removal was observed.
///
/// First absorbs `initial_stabilization` (some panels emit a false
/// disconnect/connect pair a few seconds apart), then samples the
/// EDID-carrying bus set every `stabilization_poll` until two consecutive
/// reads agree. Returns the stabilized set and the number of extra polls
/// needed beyond the first confirming pair.
pub fn stabilized_buses<F>(
    mut sample: F,
    prior: BusSet,
    settings: &Settings,
    cancel: &AtomicBool,
    some_removed: bool,
) -> (BusSet, u32)
where
    F: FnMut() -> BusSet,
{
    if some_removed && !settings.initial_stabilization.is_zero() {
        tracing::debug!(
            delay_ms = settings.initial_stabilization.as_millis() as u64,
            "delaying to absorb a false disconnect/connect sequence"
        );
        split_sleep(settings.initial_stabilization, cancel);
    }

    let mut prior = prior;
    let mut polls = 0u32;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return (prior, polls.saturating_sub(2));
        }
        split_sleep(settings.stabilization_poll, cancel);
        let latest = sample();
        polls += 1;
        if latest == prior {
            break;
        }
        prior = latest;
    }
    let extra = polls.saturating_sub(2);
    if extra > 0 {
        tracing::info!(extra_polls = extra, "bus set took extra polls to stabilize");
    }
    (prior, extra)
}

/// Picks the mode `dynamic` resolves to from the session environment.
///
/// An `x11` or `wayland` session prefers RandR notifications; otherwise
/// the presence of `DISPLAY` is taken as a secondary signal (an ssh
/// session with X forwarding), and a bare tty polls.
pub(crate) fn dynamic_mode_preference(
    session_type: Option<&str>,
    display: Option<&str>,
) -> WatchMode {
    match session_type {
        Some("x11") | Some("wayland") => WatchMode::Xevent,
        _ => {
            if display.is_some() {
                WatchMode::Xevent
            } else {
                WatchMode::Poll
            }
        }
    }
}

/// Per-cycle DPMS scan over the EDID-carrying buses.
///
/// Compares DRM-reported power state against the previous sleepy set and
/// pushes ASLEEP/AWAKE transition events. Buses that lost their EDID are
/// dropped from the sleepy set first so a later arrival is not born
/// asleep.
pub fn check_bus_asleep(
    sysfs: &SysRoot,
    displays: &DisplayRegistry,
    dispatcher: &Dispatcher,
    active: &BusSet,
    sleepy: BusSet,
    events: &mut Vec<crate::events::StatusEvent>,
) -> BusSet {
    let mut sleepy = sleepy.intersect(active);
    for busno in active.iter() {
        let dref_id = displays.find_by_busno(busno, true);
        let connector = dref_id
            .and_then(|id| displays.get(id))
            .and_then(|d| d.lock().unwrap().drm_connector.clone())
            .or_else(|| sysfs.connector_for_busno(busno));
        let connector = match connector {
            Some(connector) => connector,
            None => {
                tracing::warn!(busno, "no connector known for bus, skipping DPMS check");
                continue;
            }
        };
        let asleep = match sysfs.connector_dpms_asleep(&connector) {
            Some(asleep) => asleep,
            None => continue,
        };
        let was_asleep = sleepy.contains(busno);
        if asleep != was_asleep {
            let event_type = if asleep {
                sleepy.insert(busno);
                EventType::DpmsAsleep
            } else {
                sleepy.remove(busno);
                EventType::DpmsAwake
            };
            events.push(dispatcher.make_event(event_type, busno, Some(connector), dref_id));
        }
    }
    sleepy
}

/// A running watcher. Stop it with [`Watcher::stop`]; dropping it
/// signals cancellation without waiting for the worker to wind down.
pub struct Watcher {
    cancel: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watcher {
    /// The cancellation flag shared with the worker, sampled at
    /// [`SPLIT_SLEEP_STEP`] granularity.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Signals the worker to stop. `blocking` joins it; otherwise the
    /// worker is detached and winds down on its own.
    pub fn stop(mut self, blocking: bool) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if blocking {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(feature = "i2c-linux")]
mod run {
    use super::*;
    use crate::core::Core;
    use crate::error::{Error, Result};
    use crate::events::EventClass;

    enum ModeSource {
        Poll,
        #[cfg(feature = "udev")]
        Udev(UdevMonitor),
        #[cfg(feature = "xevent")]
        Xevent(XEventSource),
    }

    impl ModeSource {
        fn mode(&self) -> WatchMode {
            match self {
                ModeSource::Poll => WatchMode::Poll,
                #[cfg(feature = "udev")]
                ModeSource::Udev(_) => WatchMode::Udev,
                #[cfg(feature = "xevent")]
                ModeSource::Xevent(_) => WatchMode::Xevent,
            }
        }

        /// Whether anything happened since the last wake that warrants a
        /// re-scan. Poll mode always scans.
        fn woke(&mut self) -> bool {
            match self {
                ModeSource::Poll => true,
                #[cfg(feature = "udev")]
                ModeSource::Udev(monitor) => monitor.drain_drm_events(),
                #[cfg(feature = "xevent")]
                ModeSource::Xevent(source) => source.drain_screen_changes(),
            }
        }
    }

    /// Resolves the requested watch mode against compiled features and
    /// the runtime environment.
    fn resolve_mode_source(settings: &Settings) -> ModeSource {
        let mut mode = settings.watch_mode;
        if mode == WatchMode::Dynamic {
            mode = dynamic_mode_preference(
                std::env::var("XDG_SESSION_TYPE").ok().as_deref(),
                std::env::var("DISPLAY").ok().as_deref(),
            );
            tracing::debug!(resolved = ?mode, "dynamic watch mode resolved");
        }

        if mode == WatchMode::Udev {
            #[cfg(feature = "udev")]
            match UdevMonitor::new() {
                Ok(monitor) => return ModeSource::Udev(monitor),
                Err(e) => {
                    tracing::warn!(error = %e, "udev monitor unavailable, falling back to poll");
                }
            }
            mode = WatchMode::Poll;
        }

        if mode == WatchMode::Xevent {
            #[cfg(feature = "xevent")]
            match XEventSource::new() {
                Ok(source) => return ModeSource::Xevent(source),
                Err(e) => {
                    tracing::warn!(error = %e, "X11 RandR unavailable, falling back to poll");
                }
            }
            #[cfg(not(feature = "xevent"))]
            tracing::warn!("built without xevent support, falling back to poll");
        }

        ModeSource::Poll
    }

    struct WatchState {
        attached: BusSet,
        with_edid: BusSet,
        sleepy: BusSet,
    }

    /// Starts the watcher worker for the given event classes.
    pub fn start_watch(
        core: Arc<Core>,
        dispatcher: Arc<Dispatcher>,
        classes: EventClass,
    ) -> Result<Watcher> {
        if classes.is_empty() {
            return Err(Error::Internal("no event classes requested".into()));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let worker_cancel = Arc::clone(&cancel);
        dispatcher.set_deferred(core.settings().deferred_events);

        let thread = thread::Builder::new()
            .name("display-watch".into())
            .spawn(move || watch_loop(core, dispatcher, classes, worker_cancel))
            .map_err(Error::Transport)?;

        Ok(Watcher {
            cancel,
            thread: Some(thread),
        })
    }

    fn watch_loop(
        core: Arc<Core>,
        dispatcher: Arc<Dispatcher>,
        classes: EventClass,
        cancel: Arc<AtomicBool>,
    ) {
        let mut source = resolve_mode_source(core.settings());
        let loop_interval = core.settings().watch_loop_for(source.mode());
        tracing::info!(
            mode = ?source.mode(),
            interval_ms = loop_interval.as_millis() as u64,
            "watching for display changes"
        );

        let mut state = WatchState {
            attached: core.scan_attached(),
            with_edid: core.scan_with_edid(),
            sleepy: BusSet::EMPTY,
        };
        tracing::debug!(with_edid = %state.with_edid, "initial bus snapshot");

        while !cancel.load(Ordering::Relaxed) {
            if dispatcher.deferred_len() > 0 {
                dispatcher.flush_deferred();
            } else {
                split_sleep(loop_interval, &cancel);
            }
            if cancel.load(Ordering::Relaxed) {
                break;
            }
            if !source.woke() {
                continue;
            }

            let to_recheck = process_cycle(&core, &dispatcher, classes, &cancel, &mut state);
            if !to_recheck.is_empty() {
                spawn_recheck(Arc::clone(&core), Arc::clone(&dispatcher), Arc::clone(&cancel), to_recheck);
            }
        }
        tracing::debug!("watch worker terminating");
    }

    fn process_cycle(
        core: &Core,
        dispatcher: &Dispatcher,
        classes: EventClass,
        cancel: &AtomicBool,
        state: &mut WatchState,
    ) -> Vec<DrefId> {
        let settings = core.settings();
        let new_attached = core.scan_attached();
        let mut new_with_edid = core.scan_with_edid();

        let removed = state.with_edid.and_not(&new_with_edid);
        let added = new_with_edid.and_not(&state.with_edid);
        if !removed.is_empty() || (settings.stabilize_added_buses && !added.is_empty()) {
            let (stable, _extra) = stabilized_buses(
                || core.scan_with_edid(),
                new_with_edid,
                settings,
                cancel,
                !removed.is_empty(),
            );
            new_with_edid = stable;
        }
        let removed = state.with_edid.and_not(&new_with_edid);
        let added = new_with_edid.and_not(&state.with_edid);

        let mut events = Vec::new();
        let mut to_recheck = Vec::new();

        if classes.contains(EventClass::CONNECTION) {
            for busno in removed.iter() {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if let Some((id, connector)) = core.detach_bus(busno) {
                    events.push(dispatcher.make_event(
                        EventType::Disconnected,
                        busno,
                        connector,
                        Some(id),
                    ));
                }
            }
            for busno in added.iter() {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                if let Some((id, working)) = core.add_bus_by_number(busno) {
                    tracing::info!(busno, working, "connected display detected");
                    if !working {
                        to_recheck.push(id);
                    }
                    let connector = core
                        .displays()
                        .get(id)
                        .and_then(|d| d.lock().unwrap().drm_connector.clone());
                    events.push(dispatcher.make_event(
                        EventType::Connected,
                        busno,
                        connector,
                        Some(id),
                    ));
                }
            }
        }

        if classes.contains(EventClass::DPMS) && !cancel.load(Ordering::Relaxed) {
            state.sleepy = check_bus_asleep(
                core.sysfs(),
                core.displays(),
                dispatcher,
                &new_with_edid,
                state.sleepy,
                &mut events,
            );
        }

        state.attached = new_attached;
        state.with_edid = new_with_edid;
        dispatcher.deliver_cycle(events);
        to_recheck
    }

    /// Hands newly connected but not-yet-talking displays to a recheck
    /// worker that retests them with exponential backoff.
    fn spawn_recheck(
        core: Arc<Core>,
        dispatcher: Arc<Dispatcher>,
        cancel: Arc<AtomicBool>,
        drefs: Vec<DrefId>,
    ) {
        let base = core.settings().recheck_base;
        let _ = thread::Builder::new()
            .name("display-recheck".into())
            .spawn(move || {
                recheck_displays(
                    drefs,
                    base,
                    &cancel,
                    |id| core.probe_dref(id),
                    |outcome| match outcome {
                        RecheckOutcome::Enabled { id, elapsed } => {
                            let dispno = core.displays().next_dispno();
                            let (busno, connector) = match core.displays().get(id) {
                                Some(dref) => {
                                    let mut d = dref.lock().unwrap();
                                    d.flags |= crate::dref::DrefFlags::DDC_WORKING;
                                    d.dispno = dispno;
                                    (d.busno, d.drm_connector.clone())
                                }
                                None => return,
                            };
                            tracing::info!(
                                busno,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "ddc became enabled"
                            );
                            dispatcher.emit_or_queue(dispatcher.make_event(
                                EventType::DdcEnabled,
                                busno,
                                connector,
                                Some(id),
                            ));
                        }
                        RecheckOutcome::Disconnected { id, elapsed } => {
                            let (busno, connector) = match core.displays().get(id) {
                                Some(dref) => {
                                    let d = dref.lock().unwrap();
                                    (d.busno, d.drm_connector.clone())
                                }
                                None => return,
                            };
                            core.displays().mark_removed(id);
                            tracing::info!(
                                busno,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "display no longer detected during recheck"
                            );
                            dispatcher.emit_or_queue(dispatcher.make_event(
                                EventType::Disconnected,
                                busno,
                                connector,
                                Some(id),
                            ));
                        }
                        RecheckOutcome::GaveUp { id, elapsed } => {
                            tracing::warn!(
                                ?id,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "ddc communication did not become enabled"
                            );
                        }
                    },
                );
            });
    }
}

#[cfg(feature = "i2c-linux")]
pub use run::start_watch;
