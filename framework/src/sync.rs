//! Clock-offset estimation between the start and finish gates.
//!
//! The two gates free-run independent microsecond counters; race math only
//! works once the finish gate knows the offset between them. The finish
//! gate owns the estimate: it sends `SYNC_REQ`, the start gate answers
//! `OFFSET(ts = its clock at send)`, and the finish computes
//! `offset = ts_start − ts_receive_local` from a single sample. Radio
//! latency at track scale is sub-millisecond and symmetric enough that the
//! one-way delay folds into the offset; drift between samples is logged so
//! asymmetry would be visible, but no filtering is applied.
//!
//! The offset cell is written by the radio callback and read by the main
//! loop — a single relaxed atomic word.

use log::info;
use portable_atomic::{AtomicBool, AtomicI64, Ordering};

use crate::clock::Cadence;
use crate::wire::{ControlFrame, Identity, MsgType};

/// Resync cadence while the paired start gate is reachable.
pub const CLOCK_SYNC_INTERVAL_MS: u64 = 30_000;

/// Drift beyond this between consecutive samples gets logged.
const DRIFT_LOG_THRESHOLD_US: i64 = 500;

/// The finish gate's running clock offset: `clock_start − clock_finish`.
pub struct ClockSync {
    offset_us: AtomicI64,
    have_sync: AtomicBool,
    cadence: Cadence,
}

impl ClockSync {
    pub const fn new() -> Self {
        Self {
            offset_us: AtomicI64::new(0),
            have_sync: AtomicBool::new(false),
            cadence: Cadence::new(),
        }
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us.load(Ordering::Relaxed)
    }

    pub fn have_sync(&self) -> bool {
        self.have_sync.load(Ordering::Relaxed)
    }

    /// Ingest an `OFFSET` reply. `remote_ts` is the start gate's clock at
    /// send; `rx_local_us` is our clock at frame arrival (captured by the
    /// radio callback before dispatch). Returns the drift against the
    /// previous estimate. Callable from the radio callback.
    pub fn on_offset_frame(&self, remote_ts: u64, rx_local_us: u64) -> i64 {
        let new_offset = remote_ts as i64 - rx_local_us as i64;
        let drift = new_offset - self.offset_us.swap(new_offset, Ordering::Relaxed);
        let first = !self.have_sync.swap(true, Ordering::Relaxed);

        if first || drift.abs() > DRIFT_LOG_THRESHOLD_US {
            info!(
                "[SYNC] Clock offset {} us ({:.1} ms), drift {} us",
                new_offset,
                new_offset as f64 / 1000.0,
                drift
            );
        }
        drift
    }

    /// Express a start-gate timestamp in our timebase.
    pub fn translate_to_local(&self, remote_ts: u64) -> u64 {
        (remote_ts as i64 - self.offset_us()) as u64
    }

    /// Periodic scheduling: returns the `SYNC_REQ` to send when a resync is
    /// due. Only syncs while the peer is reachable — no point interrogating
    /// a gate that is not there.
    pub fn poll(
        &mut self,
        ident: &Identity,
        peer_online: bool,
        now_ms: u64,
        now_us: u64,
    ) -> Option<ControlFrame> {
        if !peer_online {
            return None;
        }
        self.cadence
            .due(now_ms, CLOCK_SYNC_INTERVAL_MS)
            .then(|| ident.frame(MsgType::SyncReq, now_us, 0))
    }

    /// Make the next poll fire immediately — used on ARM so a race never
    /// runs on a stale estimate.
    pub fn force_resync(&mut self) {
        self.cadence.expire();
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;

    fn ident() -> Identity {
        Identity {
            device_id: 2,
            role: Role::Finish,
            hostname: "finish-gate".into(),
        }
    }

    #[test]
    fn offset_from_single_sample() {
        let sync = ClockSync::new();
        // Start clock reads 10_000_500 when our clock reads 10_000_000.
        sync.on_offset_frame(10_000_500, 10_000_000);
        assert_eq!(sync.offset_us(), 500);
        assert!(sync.have_sync());
    }

    #[test]
    fn negative_offset_when_remote_is_behind() {
        let sync = ClockSync::new();
        sync.on_offset_frame(9_000_000, 9_000_750);
        assert_eq!(sync.offset_us(), -750);
    }

    #[test]
    fn translation_is_an_involution() {
        let sync = ClockSync::new();
        sync.on_offset_frame(10_000_500, 10_000_000);

        let ts = 10_000_000u64;
        let local = sync.translate_to_local(ts);
        assert_eq!(local, 9_999_500);
        assert_eq!((local as i64 + sync.offset_us()) as u64, ts);
    }

    #[test]
    fn drift_is_reported_against_previous_sample() {
        let sync = ClockSync::new();
        assert_eq!(sync.on_offset_frame(1_000_500, 1_000_000), 500);
        assert_eq!(sync.on_offset_frame(2_000_560, 2_000_000), 60);
        assert_eq!(sync.offset_us(), 560);
    }

    #[test]
    fn resync_cadence_and_forced_resync() {
        let mut sync = ClockSync::new();
        let id = ident();

        // Peer offline: never syncs.
        assert!(sync.poll(&id, false, 40_000, 0).is_none());

        // Peer online: fires on the 30 s cadence.
        let req = sync.poll(&id, true, 40_000, 123).unwrap();
        assert_eq!(req.msg_type, MsgType::SyncReq);
        assert!(sync.poll(&id, true, 50_000, 0).is_none());

        // ARM forces an immediate resync.
        sync.force_resync();
        assert!(sync.poll(&id, true, 50_001, 0).is_some());
    }
}
