//! Timer key type and the wall-clock helper every timer computation needs.
//! Grounded on `handy::event_base.cc`'s `(at, seq)` map key and negative-
//! deadline repeating-timer convention.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds. Not monotonic (mirrors the
/// original's `util::timeMilli`, which is also wall-clock based) - a clock
/// step backwards could in principle delay a timer, which is an accepted
/// limitation inherited from the source design.
pub fn time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Ordering key for the timer map: earliest deadline first, ties broken by
/// insertion order (`seq`). `BTreeMap<TimerKey, _>` gives this ordering for
/// free via derived `Ord`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey {
    pub deadline_ms: i64,
    pub seq: u64,
}

/// A handle returned by `EventBase::run_at`/`run_after`.
///
/// `deadline_ms < 0` marks a repeating timer (the negation of the next
/// scheduled deadline); cancelling looks it up in the repeatable map instead
/// of the one-shot map. This mirrors the original's use of the sign bit on
/// the same map key space rather than a separate "kind" field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub TimerKey);

impl TimerId {
    pub fn is_repeating(&self) -> bool {
        self.0.deadline_ms < 0
    }
}
