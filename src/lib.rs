//! Discover and control monitors over the DDC/CI protocol, and watch them
//! come and go.
//!
//! The crate layers four pieces: wire-level DDC/CI packet I/O over I2C
//! ([`DdcChannel`]), EDID parsing and display identity ([`edid`]), bus and
//! display registries owned by an explicit [`Core`] value, and a
//! long-running [`watch`] worker that emits [`events::StatusEvent`]s on
//! hot-plug, DPMS, and delayed DDC-readiness transitions.
//!
//! # Example
//!
//! ```rust,no_run
//! use ddcmon::commands;
//!
//! # #[cfg(feature = "i2c-linux")] fn ddc() {
//! let mut channel = ddcmon::from_i2c_device("/dev/i2c-4").unwrap();
//! let version = channel.execute(commands::GetVcpFeature::new(0xdf)).unwrap();
//! println!("MCCS version: {:04x}", version.value());
//! # }
//! ```
//!
//! # Watching for changes
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ddcmon::{Core, Dispatcher, EventClass, Settings};
//!
//! # #[cfg(feature = "i2c-linux")] fn watch() {
//! let core = Arc::new(Core::new(Settings::default()));
//! core.detect().unwrap();
//!
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher.register(|event| println!("{}", event));
//!
//! let watcher = ddcmon::watch::start_watch(core, dispatcher, EventClass::CONNECTION).unwrap();
//! // ... later:
//! watcher.stop(true);
//! # }
//! ```

/// EDID EEPROM I2C address.
pub const I2C_ADDRESS_EDID: u16 = 0x50;

/// E-DDC EDID segment register I2C address.
pub const I2C_ADDRESS_EDID_SEGMENT: u16 = 0x30;

/// DDC/CI command and control I2C address.
pub const I2C_ADDRESS_DDC_CI: u16 = 0x37;

/// DDC sub-address command prefix (the host's source address).
pub const SUB_ADDRESS_DDC_CI: u8 = 0x51;

pub mod bus;
pub mod commands;
mod core;
pub mod dref;
pub mod edid;
#[cfg(all(feature = "udev", feature = "i2c-linux"))]
mod enumerate;
mod error;
pub mod events;
mod io;
pub mod persist;
pub mod settings;
pub mod sleep;
pub mod stats;
pub mod sysfs;
pub mod watch;

pub use crate::core::Core;
#[cfg(feature = "i2c-linux")]
pub use crate::core::DisplayHandle;
pub use crate::io::DdcChannel;
#[cfg(feature = "i2c-linux")]
pub use crate::io::{from_i2c_device, I2cDeviceChannel};
pub use commands::{Command, CommandResult, VcpValue};
pub use dref::{DisplayRef, DrefId};
pub use edid::{EdidId, ParsedEdid};
#[cfg(all(feature = "udev", feature = "i2c-linux"))]
pub use enumerate::Enumerator;
pub use error::{Error, FramingError, Result, SemanticError};
pub use events::{Dispatcher, EventClass, EventType, StatusEvent};
pub use settings::{RetryPolicy, Settings, WatchMode};
