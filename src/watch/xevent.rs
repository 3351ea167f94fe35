//! X11 RandR wake source for the watcher.

use x11rb::connection::Connection;
use x11rb::protocol::randr::{self, ConnectionExt as _};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

/// Subscribes to RandR screen-change notifications.
pub struct XEventSource {
    conn: RustConnection,
}

impl XEventSource {
    /// Connects to the display and selects screen-change input. Fails
    /// when no X server is reachable or RandR is too old, in which case
    /// the watcher falls back to polling.
    pub fn new() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (conn, screen_num) = x11rb::connect(None)?;
        let root = conn.setup().roots[screen_num].root;

        let version = conn.randr_query_version(1, 2)?.reply()?;
        tracing::debug!(
            major = version.major_version,
            minor = version.minor_version,
            "RandR initialized"
        );
        conn.randr_select_input(root, randr::NotifyMask::SCREEN_CHANGE)?
            .check()?;
        conn.flush()?;
        Ok(XEventSource { conn })
    }

    /// Drains pending X events; true when a screen change arrived since
    /// the last call.
    pub fn drain_screen_changes(&mut self) -> bool {
        let mut seen = false;
        while let Ok(Some(event)) = self.conn.poll_for_event() {
            match event {
                Event::RandrScreenChangeNotify(_) | Event::RandrNotify(_) => {
                    tracing::trace!("RandR screen change event");
                    seen = true;
                }
                _ => (),
            }
        }
        seen
    }
}
