//! Retry statistics, maintained per operation class, plus counts of the
//! individual error kinds observed on failed tries.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// The operation classes with independently configured retry limits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// Request with no reply (e.g. Set VCP Feature, Save Settings).
    WriteOnly,
    /// Reply with no preceding request payload.
    ReadOnly,
    /// Request followed by a reply (e.g. Get VCP Feature).
    WriteRead,
    /// Fragmented exchange (capabilities, table read/write).
    MultiPart,
}

impl OpClass {
    pub const ALL: [OpClass; 4] = [
        OpClass::WriteOnly,
        OpClass::ReadOnly,
        OpClass::WriteRead,
        OpClass::MultiPart,
    ];

    fn name(self) -> &'static str {
        match self {
            OpClass::WriteOnly => "write-only exchange",
            OpClass::ReadOnly => "read-only exchange",
            OpClass::WriteRead => "write-read exchange",
            OpClass::MultiPart => "multi-part exchange",
        }
    }

    fn index(self) -> usize {
        match self {
            OpClass::WriteOnly => 0,
            OpClass::ReadOnly => 1,
            OpClass::WriteRead => 2,
            OpClass::MultiPart => 3,
        }
    }
}

/// Hard ceiling on any configured try count.
pub const MAX_MAX_TRIES: u8 = 15;

/// Counters for one operation class.
///
/// `successes[k]` counts operations that succeeded on try `k+1`, so an
/// operation that eventually succeeds on try `k` records exactly `k-1`
/// retryable errors and one success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TryData {
    successes: [u32; MAX_MAX_TRIES as usize],
    failed_max_tries: u32,
    failed_fatally: u32,
}

impl TryData {
    pub fn record_success(&mut self, try_no: u8) {
        debug_assert!(try_no >= 1 && try_no <= MAX_MAX_TRIES);
        self.successes[(try_no - 1) as usize] += 1;
    }

    pub fn record_failed_max_tries(&mut self) {
        self.failed_max_tries += 1;
    }

    pub fn record_failed_fatally(&mut self) {
        self.failed_fatally += 1;
    }

    /// Successes that completed on the given try number (1-based).
    pub fn successes_at(&self, try_no: u8) -> u32 {
        self.successes[(try_no - 1) as usize]
    }

    pub fn failed_max_tries(&self) -> u32 {
        self.failed_max_tries
    }

    pub fn failed_fatally(&self) -> u32 {
        self.failed_fatally
    }

    pub fn total_operations(&self) -> u32 {
        self.successes.iter().sum::<u32>() + self.failed_max_tries + self.failed_fatally
    }
}

/// Shared retry statistics for all four operation classes.
#[derive(Debug, Default)]
pub struct RetryStats {
    classes: Mutex<[TryData; 4]>,
    errors: Mutex<BTreeMap<&'static str, u32>>,
}

impl RetryStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, class: OpClass, try_no: u8) {
        self.classes.lock().unwrap()[class.index()].record_success(try_no);
    }

    pub fn record_failed_max_tries(&self, class: OpClass) {
        self.classes.lock().unwrap()[class.index()].record_failed_max_tries();
    }

    pub fn record_failed_fatally(&self, class: OpClass) {
        self.classes.lock().unwrap()[class.index()].record_failed_fatally();
    }

    /// Counts one occurrence of an error kind on a failed try.
    pub fn record_error_kind(&self, kind: &'static str) {
        *self.errors.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    /// How many times the given error kind was observed.
    pub fn error_count(&self, kind: &str) -> u32 {
        self.errors.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    /// Copies out the counters for one class.
    pub fn snapshot(&self, class: OpClass) -> TryData {
        self.classes.lock().unwrap()[class.index()].clone()
    }

    pub fn reset(&self) {
        *self.classes.lock().unwrap() = Default::default();
        self.errors.lock().unwrap().clear();
    }

    /// Multi-line human-readable report of all classes with activity.
    pub fn report(&self) -> String {
        let classes = self.classes.lock().unwrap();
        let mut out = String::new();
        for class in OpClass::ALL {
            let data = &classes[class.index()];
            out.push_str(&format!("Retry statistics for {}\n", class.name()));
            if data.total_operations() == 0 {
                out.push_str("   No tries attempted\n");
                continue;
            }
            out.push_str("   Successful attempts by number of tries required:\n");
            for try_no in 1..=MAX_MAX_TRIES {
                let n = data.successes_at(try_no);
                if n > 0 {
                    out.push_str(&format!("     {:2}:  {:3}\n", try_no, n));
                }
            }
            out.push_str(&format!(
                "   Failed due to max tries exceeded: {:3}\n",
                data.failed_max_tries
            ));
            out.push_str(&format!(
                "   Failed due to fatal error:        {:3}\n",
                data.failed_fatally
            ));
        }
        let errors = self.errors.lock().unwrap();
        if !errors.is_empty() {
            out.push_str("Errors observed on failed tries:\n");
            for (kind, count) in errors.iter() {
                out.push_str(&format!("   {}: {}\n", kind, count));
            }
        }
        out
    }
}

impl fmt::Display for RetryStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.report())
    }
}
