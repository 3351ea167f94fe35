//! Display status events and their delivery to registered consumers.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use bitflags::bitflags;

use crate::dref::DrefId;

/// The closed set of display status transitions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Connected,
    Disconnected,
    DpmsAsleep,
    DpmsAwake,
    /// DDC communication became enabled on a display that was connected
    /// without it.
    DdcEnabled,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::DpmsAsleep => "dpms-asleep",
            EventType::DpmsAwake => "dpms-awake",
            EventType::DdcEnabled => "ddc-enabled",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Classes of events a watcher can be asked to produce.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct EventClass: u8 {
        const CONNECTION = 0x01;
        const DPMS = 0x02;
    }
}

impl EventType {
    pub fn class(self) -> EventClass {
        match self {
            EventType::Connected | EventType::Disconnected | EventType::DdcEnabled => {
                EventClass::CONNECTION
            }
            EventType::DpmsAsleep | EventType::DpmsAwake => EventClass::DPMS,
        }
    }
}

/// One display status event. Events are values: they are copied onto
/// queues and into consumer threads.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Monotonic nanoseconds since the dispatcher was created.
    pub timestamp_ns: u64,
    pub event_type: EventType,
    /// The I2C bus the event was observed on.
    pub busno: u32,
    pub connector: Option<String>,
    /// Published dref handle, when one exists for the bus.
    pub dref: Option<DrefId>,
    /// Reserved.
    pub flags: u16,
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} bus={} connector={}",
            self.event_type,
            self.busno,
            self.connector.as_deref().unwrap_or("?")
        )
    }
}

/// Identity of a registered callback, for unregistering.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallbackId(u64);

type CallbackFn = Arc<dyn Fn(&StatusEvent) + Send + Sync + 'static>;

/// Delivers events to registered callbacks.
///
/// Each observation cycle's events go to every callback in generation
/// order, on a worker thread per callback, so a slow or blocking consumer
/// cannot stall discovery. When deferred mode is enabled events accumulate
/// on a queue until [`Dispatcher::flush_deferred`].
pub struct Dispatcher {
    callbacks: Mutex<Vec<(CallbackId, CallbackFn)>>,
    next_id: AtomicU64,
    deferred: Mutex<Vec<StatusEvent>>,
    defer: AtomicBool,
    /// Covers the emit-directly-vs-enqueue decision so ordering within a
    /// cycle is preserved.
    emit_gate: Mutex<()>,
    epoch: Instant,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            callbacks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            deferred: Mutex::new(Vec::new()),
            defer: AtomicBool::new(false),
            emit_gate: Mutex::new(()),
            epoch: Instant::now(),
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches between direct dispatch and the deferred queue.
    pub fn set_deferred(&self, defer: bool) {
        self.defer.store(defer, Ordering::Relaxed);
    }

    /// Registers a callback; events reach it on its own worker thread.
    pub fn register<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&StatusEvent) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().unwrap().push((id, Arc::new(callback)));
        id
    }

    /// Removes a callback. Returns false when the id was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    /// Builds an event stamped with the dispatcher's monotonic clock.
    pub fn make_event(
        &self,
        event_type: EventType,
        busno: u32,
        connector: Option<String>,
        dref: Option<DrefId>,
    ) -> StatusEvent {
        StatusEvent {
            timestamp_ns: self.epoch.elapsed().as_nanos() as u64,
            event_type,
            busno,
            connector,
            dref,
            flags: 0,
        }
    }

    /// Emits one event, or queues it when deferred mode is on.
    pub fn emit_or_queue(&self, event: StatusEvent) {
        self.deliver_cycle(vec![event]);
    }

    /// Delivers one observation cycle's events.
    ///
    /// The returned join handles belong to the per-callback workers;
    /// dropping them detaches the workers.
    pub fn deliver_cycle(&self, events: Vec<StatusEvent>) -> Vec<thread::JoinHandle<()>> {
        if events.is_empty() {
            return Vec::new();
        }
        let _gate = self.emit_gate.lock().unwrap();
        if self.defer.load(Ordering::Relaxed) {
            self.deferred.lock().unwrap().extend(events);
            return Vec::new();
        }
        self.dispatch_now(events)
    }

    /// Drains and delivers the deferred queue.
    pub fn flush_deferred(&self) -> Vec<thread::JoinHandle<()>> {
        let _gate = self.emit_gate.lock().unwrap();
        let events: Vec<StatusEvent> = std::mem::take(&mut *self.deferred.lock().unwrap());
        if events.is_empty() {
            return Vec::new();
        }
        tracing::debug!(count = events.len(), "flushing deferred events");
        self.dispatch_now(events)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().unwrap().len()
    }

    fn dispatch_now(&self, events: Vec<StatusEvent>) -> Vec<thread::JoinHandle<()>> {
        let callbacks = self.callbacks.lock().unwrap().clone();
        let events = Arc::new(events);
        let mut workers = Vec::with_capacity(callbacks.len());
        for (_, callback) in callbacks {
            let events = Arc::clone(&events);
            workers.push(thread::spawn(move || {
                for event in events.iter() {
                    callback(event);
                }
            }));
        }
        workers
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks", &self.callback_count())
            .field("deferred", &self.deferred_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_events(dispatcher: &Dispatcher) -> (CallbackId, Arc<Mutex<Vec<EventType>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = dispatcher.register(move |e| sink.lock().unwrap().push(e.event_type));
        (id, seen)
    }

    #[test]
    fn cycle_events_arrive_in_generation_order() {
        let dispatcher = Dispatcher::new();
        let (_, seen_a) = collect_events(&dispatcher);
        let (_, seen_b) = collect_events(&dispatcher);

        let events = vec![
            dispatcher.make_event(EventType::Disconnected, 5, None, None),
            dispatcher.make_event(EventType::Connected, 6, None, None),
            dispatcher.make_event(EventType::DdcEnabled, 6, None, None),
        ];
        for worker in dispatcher.deliver_cycle(events) {
            worker.join().unwrap();
        }

        let expected = vec![EventType::Disconnected, EventType::Connected, EventType::DdcEnabled];
        assert_eq!(*seen_a.lock().unwrap(), expected);
        assert_eq!(*seen_b.lock().unwrap(), expected);
    }

    #[test]
    fn deferred_events_wait_for_flush() {
        let dispatcher = Dispatcher::new();
        let (_, seen) = collect_events(&dispatcher);
        dispatcher.set_deferred(true);

        dispatcher.emit_or_queue(dispatcher.make_event(EventType::Connected, 6, None, None));
        dispatcher.emit_or_queue(dispatcher.make_event(EventType::DpmsAsleep, 6, None, None));
        assert_eq!(dispatcher.deferred_len(), 2);
        assert!(seen.lock().unwrap().is_empty());

        for worker in dispatcher.flush_deferred() {
            worker.join().unwrap();
        }
        assert_eq!(dispatcher.deferred_len(), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventType::Connected, EventType::DpmsAsleep]
        );
    }

    #[test]
    fn unregister_stops_delivery() {
        let dispatcher = Dispatcher::new();
        let (id, seen) = collect_events(&dispatcher);
        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));

        for worker in
            dispatcher.deliver_cycle(vec![dispatcher.make_event(EventType::Connected, 6, None, None)])
        {
            worker.join().unwrap();
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn timestamps_are_monotonic() {
        let dispatcher = Dispatcher::new();
        let a = dispatcher.make_event(EventType::Connected, 1, None, None);
        let b = dispatcher.make_event(EventType::Connected, 1, None, None);
        assert!(b.timestamp_ns >= a.timestamp_ns);
    }

    #[test]
    fn event_classes_partition_the_types() {
        assert_eq!(EventType::Connected.class(), EventClass::CONNECTION);
        assert_eq!(EventType::Disconnected.class(), EventClass::CONNECTION);
        assert_eq!(EventType::DdcEnabled.class(), EventClass::CONNECTION);
        assert_eq!(EventType::DpmsAsleep.class(), EventClass::DPMS);
        assert_eq!(EventType::DpmsAwake.class(), EventClass::DPMS);
    }
}
