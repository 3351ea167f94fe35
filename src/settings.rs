//! Tunables, collected into one explicit record.

use std::time::Duration;

use crate::stats::{OpClass, MAX_MAX_TRIES};

/// Maximum try count per operation class, each in `[1..15]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub write_only: u8,
    pub read_only: u8,
    pub write_read: u8,
    pub multi_part: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            write_only: 4,
            read_only: 4,
            write_read: 10,
            multi_part: 8,
        }
    }
}

impl RetryPolicy {
    pub fn tries_for(&self, class: OpClass) -> u8 {
        let n = match class {
            OpClass::WriteOnly => self.write_only,
            OpClass::ReadOnly => self.read_only,
            OpClass::WriteRead => self.write_read,
            OpClass::MultiPart => self.multi_part,
        };
        n.clamp(1, MAX_MAX_TRIES)
    }
}

/// How the watcher observes display changes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Kernel udev events on the `drm` subsystem.
    Udev,
    /// X11 RandR screen-change notifications.
    Xevent,
    /// Re-enumerate buses on a timer.
    Poll,
    /// Xevent when an X11/Wayland session is detected and RandR
    /// initializes, poll otherwise.
    #[default]
    Dynamic,
}

/// All tunables of the core, with the documented defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Delay absorbed before stabilization polling when a removal is seen.
    /// Absorbs the false disconnect/connect sequence some panels emit
    /// (observed on the Samsung U32H750).
    pub initial_stabilization: Duration,
    /// Interval between stabilization polls.
    pub stabilization_poll: Duration,
    /// Watch loop interval in udev mode.
    pub udev_watch_loop: Duration,
    /// Watch loop interval in poll mode.
    pub poll_watch_loop: Duration,
    /// Watch loop interval in xevent mode.
    pub xevent_watch_loop: Duration,
    /// Base interval of the recheck worker's exponential backoff.
    pub recheck_base: Duration,
    /// Also stabilize when buses are added, not only removed.
    pub stabilize_added_buses: bool,
    /// Run the phantom-display filter during detection.
    pub detect_phantoms: bool,
    /// Queue events for a deferred flush instead of dispatching each
    /// observation cycle directly.
    pub deferred_events: bool,
    /// Requested watch mode; resolved at watcher start.
    pub watch_mode: WatchMode,
    /// Per-class retry limits.
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            initial_stabilization: Duration::from_millis(1500),
            stabilization_poll: Duration::from_millis(250),
            udev_watch_loop: Duration::from_millis(2000),
            poll_watch_loop: Duration::from_millis(2000),
            xevent_watch_loop: Duration::from_millis(2000),
            recheck_base: Duration::from_millis(500),
            stabilize_added_buses: false,
            detect_phantoms: true,
            deferred_events: false,
            watch_mode: WatchMode::Dynamic,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// The loop interval for a resolved (non-dynamic) watch mode.
    pub fn watch_loop_for(&self, mode: WatchMode) -> Duration {
        match mode {
            WatchMode::Udev => self.udev_watch_loop,
            WatchMode::Xevent => self.xevent_watch_loop,
            WatchMode::Poll => self.poll_watch_loop,
            WatchMode::Dynamic => {
                debug_assert!(false, "watch mode must be resolved first");
                self.poll_watch_loop
            }
        }
    }
}
