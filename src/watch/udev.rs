//! udev-driven wake source for the watcher.

use std::io;

/// Non-blocking consumer of kernel udev events on the `drm` subsystem.
pub struct UdevMonitor {
    socket: udev::MonitorSocket,
}

impl UdevMonitor {
    pub fn new() -> io::Result<Self> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem("drm")?
            .listen()?;
        Ok(UdevMonitor { socket })
    }

    /// Drains pending events; true when any drm change arrived since the
    /// last call.
    pub fn drain_drm_events(&mut self) -> bool {
        let mut seen = false;
        for event in self.socket.iter() {
            tracing::trace!(
                event_type = ?event.event_type(),
                sysname = ?event.sysname(),
                "udev drm event"
            );
            seen = true;
        }
        seen
    }
}
