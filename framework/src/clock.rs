//! ISR-shared timing primitives.
//!
//! The hardware counter itself lives in the firmware (`esp_timer_get_time`);
//! this module only defines how its readings are shared between execution
//! contexts. The one rule: an ISR may capture a timestamp into a cell, and
//! tasks may read or clear it, but nobody ever sees a torn 64-bit value.
//!
//! `TimingCell` is an atomic u64 with sequentially-consistent ordering. On
//! the 32-bit gate hardware (no native 64-bit atomics) the accesses lower to
//! the platform critical section, which matches the discipline the shared
//! timestamp protocol requires on that silicon.

use portable_atomic::{AtomicU64, Ordering};

/// A 64-bit microsecond timestamp cell shared between an ISR and tasks.
///
/// Protocol: plain `load`/`store`/`clear`, plus [`capture_if_clear`] for the
/// latch-first-edge idiom. No other read-modify-write cycles are allowed;
/// a value of 0 means "not captured".
///
/// [`capture_if_clear`]: TimingCell::capture_if_clear
pub struct TimingCell(AtomicU64);

impl TimingCell {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn store(&self, value_us: u64) {
        self.0.store(value_us, Ordering::SeqCst);
    }

    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Latch `now_us` if the cell is still empty. Returns true when this
    /// call captured the value. ISR-safe: a single compare-exchange.
    ///
    /// Beam sensors capture on the falling edge only; a second edge while
    /// the cell holds a value is ignored until a task clears it.
    #[inline]
    pub fn capture_if_clear(&self, now_us: u64) -> bool {
        self.0
            .compare_exchange(0, now_us, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for TimingCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot trigger latch for a beam-break ISR.
///
/// The ISR calls [`fire`]; the main loop polls [`pending`] and clears the
/// latch on every transition back to IDLE or ARMED. Boot-time reading of the
/// microsecond counter is never 0, so "empty" and "never fired" coincide.
///
/// [`fire`]: TriggerLatch::fire
/// [`pending`]: TriggerLatch::pending
pub struct TriggerLatch(TimingCell);

impl TriggerLatch {
    pub const fn new() -> Self {
        Self(TimingCell::new())
    }

    /// ISR side: latch the first trigger timestamp. Later edges are ignored.
    #[inline]
    pub fn fire(&self, now_us: u64) -> bool {
        self.0.capture_if_clear(now_us)
    }

    /// Task side: the latched timestamp, if the beam has fired.
    pub fn pending(&self) -> Option<u64> {
        match self.0.load() {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

impl Default for TriggerLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline helper for the non-blocking main loop.
///
/// Every periodic activity (beacons, pings, sync requests) is expressed as
/// "due when `now - last > interval`"; nothing in the engine sleeps.
#[derive(Debug, Default)]
pub struct Cadence {
    last_ms: u64,
    forced: bool,
}

impl Cadence {
    pub const fn new() -> Self {
        Self {
            last_ms: 0,
            forced: false,
        }
    }

    /// True once per interval; marks the cadence as fired when it returns
    /// true.
    pub fn due(&mut self, now_ms: u64, interval_ms: u64) -> bool {
        if self.forced || now_ms.saturating_sub(self.last_ms) > interval_ms {
            self.forced = false;
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }

    /// Force the next [`due`] check to fire regardless of elapsed time.
    ///
    /// [`due`]: Cadence::due
    pub fn expire(&mut self) {
        self.forced = true;
    }
}
