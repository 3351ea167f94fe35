//! Rechecking displays whose initial DDC probe failed.
//!
//! Some monitors need several seconds after hot-plug before their DDC
//! endpoint answers. The recheck worker retests them at increasing
//! intervals and reports what became of each.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::dref::DrefId;
use crate::error::{Error, Result};

use super::split_sleep;

/// Number of backoff intervals before giving up.
const RECHECK_ROUNDS: u32 = 4;

/// What became of one rechecked display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecheckOutcome {
    /// The probe succeeded; DDC communication is now working.
    Enabled { id: DrefId, elapsed: Duration },
    /// The probe discovered the monitor is gone.
    Disconnected { id: DrefId, elapsed: Duration },
    /// All rounds exhausted without success; the dref stays registered
    /// as DDC-non-working.
    GaveUp { id: DrefId, elapsed: Duration },
}

/// The backoff schedule: `base * 2^i` for each round.
pub(crate) fn backoff_intervals(base: Duration) -> impl Iterator<Item = Duration> {
    (0..RECHECK_ROUNDS).map(move |i| base * (1 << i))
}

/// Retests each dref until it answers, disappears, or the rounds run out.
///
/// `probe` performs one DDC liveness check. Outcomes are reported through
/// `report` as they are decided; `Enabled` and `Disconnected` remove the
/// dref from further rounds. Cancellation returns early without reporting
/// the undecided remainder.
pub fn recheck_displays<P, R>(
    drefs: Vec<DrefId>,
    base: Duration,
    cancel: &AtomicBool,
    mut probe: P,
    mut report: R,
) where
    P: FnMut(DrefId) -> Result<()>,
    R: FnMut(RecheckOutcome),
{
    let started = Instant::now();
    let mut remaining = drefs;
    tracing::debug!(count = remaining.len(), "recheck worker starting");

    for interval in backoff_intervals(base) {
        if remaining.is_empty() {
            break;
        }
        split_sleep(interval, cancel);
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        let mut ndx = 0;
        while ndx < remaining.len() {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            let id = remaining[ndx];
            match probe(id) {
                Ok(()) => {
                    report(RecheckOutcome::Enabled {
                        id,
                        elapsed: started.elapsed(),
                    });
                    remaining.remove(ndx);
                }
                Err(Error::Disconnected) => {
                    report(RecheckOutcome::Disconnected {
                        id,
                        elapsed: started.elapsed(),
                    });
                    remaining.remove(ndx);
                }
                Err(e) => {
                    tracing::debug!(?id, error = %e, "ddc still not enabled");
                    ndx += 1;
                }
            }
        }
    }

    for id in remaining {
        report(RecheckOutcome::GaveUp {
            id,
            elapsed: started.elapsed(),
        });
    }
}
