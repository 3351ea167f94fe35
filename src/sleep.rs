//! Sleep management between DDC operations.
//!
//! Two layers: [`Delay`] tracks the specification-mandated interval between
//! two subsequent commands so that callers only ever wait out the time
//! remaining, and [`DynamicSleep`] adapts a per-display multiplier over the
//! nominal delays based on the observed error rate, so that a monitor that
//! corrupts reads when polled at the spec-minimum delay is tolerated
//! without user configuration.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::edid::EdidId;

/// A type that can help with implementing the DDC specified delays.
#[derive(Clone, Debug)]
pub struct Delay {
    time: Option<Instant>,
    delay: Duration,
}

impl Delay {
    /// Creates a new delay starting now.
    pub fn new(delay: Duration) -> Self {
        Delay {
            time: Some(Instant::now()),
            delay,
        }
    }

    /// The time remaining in this delay.
    pub fn remaining(&self) -> Duration {
        self.time
            .as_ref()
            .and_then(|time| self.delay.checked_sub(time.elapsed()))
            .unwrap_or_default()
    }

    /// Waits out the remaining time in this delay.
    pub fn sleep(&mut self) {
        if let Some(delay) = self.time.take().and_then(|time| self.delay.checked_sub(time.elapsed())) {
            sleep(delay);
        }
    }
}

impl Default for Delay {
    fn default() -> Self {
        Delay {
            time: None,
            delay: Duration::default(),
        }
    }
}

/// The delay slots the multiplier applies to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SleepEvent {
    /// After a request with no reply.
    PostWrite,
    /// Between request and reply of a write-read exchange.
    PostRead,
    /// Between fragments of a multi-part exchange.
    PostFragment,
    /// Extra settling time after a retryable failure.
    RetryRecovery,
}

/// Nominal (unadjusted) delays for each [`SleepEvent`].
#[derive(Debug, Clone)]
pub struct SleepTable {
    pub post_write: Duration,
    pub post_read: Duration,
    pub post_fragment: Duration,
    pub retry_recovery: Duration,
}

impl Default for SleepTable {
    fn default() -> Self {
        SleepTable {
            post_write: Duration::from_millis(50),
            post_read: Duration::from_millis(40),
            post_fragment: Duration::from_millis(50),
            retry_recovery: Duration::from_millis(40),
        }
    }
}

impl SleepTable {
    fn nominal(&self, event: SleepEvent) -> Duration {
        match event {
            SleepEvent::PostWrite => self.post_write,
            SleepEvent::PostRead => self.post_read,
            SleepEvent::PostFragment => self.post_fragment,
            SleepEvent::RetryRecovery => self.retry_recovery,
        }
    }
}

const MULTIPLIER_FLOOR: f64 = 0.5;
const MULTIPLIER_CEILING: f64 = 8.0;
const BUMP_FACTOR: f64 = 1.5;
const DECAY_FACTOR: f64 = 0.9;
/// Consecutive successes required before the multiplier decays one step.
const DECAY_THRESHOLD: u32 = 10;

/// Per-display adaptive sleep state.
#[derive(Debug, Clone)]
pub struct DynamicSleep {
    table: SleepTable,
    multiplier: f64,
    run_of_successes: u32,
}

impl Default for DynamicSleep {
    fn default() -> Self {
        DynamicSleep::new(SleepTable::default())
    }
}

impl DynamicSleep {
    pub fn new(table: SleepTable) -> Self {
        DynamicSleep {
            table,
            multiplier: 1.0,
            run_of_successes: 0,
        }
    }

    /// Restores a multiplier previously saved for this display.
    pub fn with_multiplier(table: SleepTable, multiplier: f64) -> Self {
        DynamicSleep {
            table,
            multiplier: multiplier.clamp(MULTIPLIER_FLOOR, MULTIPLIER_CEILING),
            run_of_successes: 0,
        }
    }

    /// The current multiplier, clamped to `[0.5, 8.0]`.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// The adjusted delay for the given event.
    pub fn duration(&self, event: SleepEvent) -> Duration {
        self.table.nominal(event).mul_f64(self.multiplier)
    }

    /// Applies the multiplier to an arbitrary nominal delay.
    pub fn scaled(&self, nominal: Duration) -> Duration {
        nominal.mul_f64(self.multiplier)
    }

    /// Sleeps for the adjusted delay.
    pub fn sleep(&self, event: SleepEvent) {
        sleep(self.duration(event));
    }

    /// Called by the packet layer on any retryable DDC error.
    pub fn note_retryable_failure(&mut self) {
        self.run_of_successes = 0;
        self.multiplier = (self.multiplier * BUMP_FACTOR).min(MULTIPLIER_CEILING);
    }

    /// Called by the packet layer when an operation completes.
    ///
    /// Sustained success slowly decays the multiplier back down.
    pub fn note_success(&mut self) {
        self.run_of_successes += 1;
        if self.run_of_successes >= DECAY_THRESHOLD {
            self.run_of_successes = 0;
            self.multiplier = (self.multiplier * DECAY_FACTOR).max(MULTIPLIER_FLOOR);
        }
    }
}

/// Persistence boundary for tuned-sleep multipliers.
///
/// The core only consumes this interface; where and how the values are
/// stored is up to the embedding application.
pub trait SleepStore: Send + Sync {
    /// Loads the saved multiplier for a monitor identity, if any.
    fn load(&self, id: &EdidId) -> io::Result<Option<f64>>;
    /// Saves the multiplier for a monitor identity.
    fn save(&self, id: &EdidId, multiplier: f64) -> io::Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SleepFile {
    version: u32,
    multipliers: HashMap<String, f64>,
}

/// [`SleepStore`] backed by a single JSON file.
#[derive(Debug)]
pub struct JsonSleepStore {
    path: PathBuf,
}

impl JsonSleepStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonSleepStore { path: path.into() }
    }

    fn read_file(&self) -> io::Result<SleepFile> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SleepFile {
                version: 1,
                multipliers: HashMap::new(),
            }),
            Err(e) => Err(e),
        }
    }
}

impl SleepStore for JsonSleepStore {
    fn load(&self, id: &EdidId) -> io::Result<Option<f64>> {
        Ok(self.read_file()?.multipliers.get(&id.to_string()).copied())
    }

    fn save(&self, id: &EdidId, multiplier: f64) -> io::Result<()> {
        let mut file = self.read_file()?;
        file.version = 1;
        file.multipliers.insert(id.to_string(), multiplier);
        let bytes = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&self.path, bytes)
    }
}
