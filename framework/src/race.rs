//! Race state shared across roles: the four-state machine, the ISR-shared
//! timing cells, the action vocabulary controllers emit, and the physics of
//! a finished run.

use portable_atomic::{AtomicU8, Ordering};

use crate::clock::TimingCell;
use crate::peers::Mac;
use crate::role::Role;
use crate::snapshot::Cue;
use crate::wire::ControlFrame;

/// Race duration sanity window: anything non-positive or beyond a minute is
/// a timing error, never a valid run.
pub const MAX_RACE_DURATION_US: i64 = 60_000_000;

/// Start gate gives up on a race after this long without a CONFIRM.
pub const RACE_TIMEOUT_MS: u64 = 30_000;
/// Start gate returns to IDLE this long after FINISHED.
pub const START_RESET_DELAY_MS: u64 = 2_000;
/// Finish gate returns to IDLE this long after FINISHED, leaving the result
/// on the dashboard meanwhile.
pub const FINISH_RESET_DELAY_MS: u64 = 5_000;

/// Ping cadence towards the paired peer while it is reachable.
pub const PING_INTERVAL_MS: u64 = 2_000;
/// Backed-off ping cadence while the peer is unreachable.
pub const PING_BACKOFF_MS: u64 = 10_000;

pub const MPS_TO_MPH: f64 = 2.236_94;

/// The per-node race state. Two bits of truth shared by the ISR, the radio
/// callback and the main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RaceState {
    Idle = 0,
    Armed = 1,
    Racing = 2,
    Finished = 3,
}

impl RaceState {
    pub fn from_u8(v: u8) -> RaceState {
        match v {
            1 => RaceState::Armed,
            2 => RaceState::Racing,
            3 => RaceState::Finished,
            _ => RaceState::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RaceState::Idle => "IDLE",
            RaceState::Armed => "ARMED",
            RaceState::Racing => "RACING",
            RaceState::Finished => "FINISHED",
        }
    }
}

/// Atomic holder for the race state, writable from any context.
pub struct SharedRaceState(AtomicU8);

impl SharedRaceState {
    pub const fn new(initial: RaceState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    #[inline]
    pub fn load(&self) -> RaceState {
        RaceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, state: RaceState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Atomically move `from → to`; returns false if some other context got
    /// there first. ISR-safe.
    #[inline]
    pub fn transition(&self, from: RaceState, to: RaceState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for SharedRaceState {
    fn default() -> Self {
        Self::new(RaceState::Idle)
    }
}

/// The cells a finish node shares between its beam ISR, the radio callback
/// and the main loop. `start_time_us` holds the translated start timestamp
/// (already in the local timebase); `finish_time_us` is latched by the beam
/// ISR.
pub struct TimingShared {
    pub state: SharedRaceState,
    pub start_time_us: TimingCell,
    pub finish_time_us: TimingCell,
}

impl TimingShared {
    pub const fn new() -> Self {
        Self {
            state: SharedRaceState::new(RaceState::Idle),
            start_time_us: TimingCell::new(),
            finish_time_us: TimingCell::new(),
        }
    }

    /// Zero both timing vars. Runs on every transition into IDLE and on arm.
    pub fn clear_times(&self) {
        self.start_time_us.clear();
        self.finish_time_us.clear();
    }

    /// The finish-beam ISR path: latch t_f and flip RACING → FINISHED.
    /// Touches nothing but the two atomics; safe in interrupt context.
    #[inline]
    pub fn finish_trigger(&self, now_us: u64) -> bool {
        if self.state.load() == RaceState::Racing && self.finish_time_us.capture_if_clear(now_us) {
            self.state.store(RaceState::Finished);
            true
        } else {
            false
        }
    }
}

impl Default for TimingShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a role controller can ask the firmware to do. Controllers
/// never touch the radio, the filesystem or the speaker themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum GateAction {
    /// Send to the first paired peer with this role (resolved through the
    /// registry at execution time).
    SendToRole(Role, ControlFrame),
    /// Reply directly to a specific MAC.
    SendToMac(Mac, ControlFrame),
    /// Attach the beam-break interrupt — every transition into ARMED.
    AttachTrigger,
    /// Detach the beam-break interrupt — every transition out of ARMED.
    DetachTrigger,
    PlayCue(Cue),
    /// Push a fresh state snapshot to the dashboard sink.
    BroadcastState,
    /// Append one finished run to `runs.csv`.
    LogRun(RunRecord),
}

/// One row of the append-only race log.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run: u32,
    pub car: String,
    pub weight_g: f32,
    pub time_s: f64,
    pub speed_mph: f64,
    pub scale_mph: f64,
    pub momentum: f64,
    pub ke_j: f64,
}

impl RunRecord {
    pub const CSV_HEADER: &'static str =
        "Run,Car,Weight(g),Time(s),Speed(mph),Scale(mph),Momentum,KE(J)";

    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{:.1},{:.4},{:.2},{:.1},{:.4},{:.4}",
            self.run,
            self.car,
            self.weight_g,
            self.time_s,
            self.speed_mph,
            self.scale_mph,
            self.momentum,
            self.ke_j
        )
    }
}

/// Outcome of a finished race after the sanity window, with derived physics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaceResult {
    pub elapsed_us: i64,
    pub time_s: f64,
    pub speed_mps: f64,
    pub speed_mph: f64,
    pub scale_mph: f64,
    pub momentum: f64,
    pub ke_j: f64,
    /// Set when the elapsed time failed the sanity window; all derived
    /// values are zero and the run is published but never logged.
    pub timing_error: bool,
}

impl RaceResult {
    /// Derive a result from raw timestamps. `elapsed = t_f − t_s_local`,
    /// computed signed so underflow shows up as an error instead of
    /// wrapping into a huge bogus time.
    pub fn compute(
        start_us: u64,
        finish_us: u64,
        track_length_m: f64,
        weight_g: f32,
        scale_factor: i32,
    ) -> RaceResult {
        let elapsed_us = finish_us as i64 - start_us as i64;

        if elapsed_us <= 0 || elapsed_us > MAX_RACE_DURATION_US {
            return RaceResult {
                elapsed_us,
                time_s: 0.0,
                speed_mps: 0.0,
                speed_mph: 0.0,
                scale_mph: 0.0,
                momentum: 0.0,
                ke_j: 0.0,
                timing_error: true,
            };
        }

        let time_s = elapsed_us as f64 / 1_000_000.0;
        let speed_mps = track_length_m / time_s;
        let mass_kg = weight_g as f64 / 1_000.0;
        RaceResult {
            elapsed_us,
            time_s,
            speed_mps,
            speed_mph: speed_mps * MPS_TO_MPH,
            scale_mph: speed_mps * MPS_TO_MPH * scale_factor as f64,
            momentum: mass_kg * speed_mps,
            ke_j: 0.5 * mass_kg * speed_mps * speed_mps,
            timing_error: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for s in [
            RaceState::Idle,
            RaceState::Armed,
            RaceState::Racing,
            RaceState::Finished,
        ] {
            assert_eq!(RaceState::from_u8(s as u8), s);
        }
        assert_eq!(RaceState::from_u8(0xFF), RaceState::Idle);
    }

    #[test]
    fn transition_is_single_winner() {
        let state = SharedRaceState::new(RaceState::Racing);
        assert!(state.transition(RaceState::Racing, RaceState::Finished));
        assert!(!state.transition(RaceState::Racing, RaceState::Finished));
        assert_eq!(state.load(), RaceState::Finished);
    }

    #[test]
    fn finish_trigger_only_fires_while_racing() {
        let shared = TimingShared::new();

        // Not racing: the beam break is ignored.
        assert!(!shared.finish_trigger(1_000));
        assert_eq!(shared.finish_time_us.load(), 0);

        shared.state.store(RaceState::Racing);
        assert!(shared.finish_trigger(10_532_500));
        assert_eq!(shared.state.load(), RaceState::Finished);
        assert_eq!(shared.finish_time_us.load(), 10_532_500);

        // A second bounce of the beam changes nothing.
        assert!(!shared.finish_trigger(10_600_000));
        assert_eq!(shared.finish_time_us.load(), 10_532_500);
    }

    #[test]
    fn happy_race_physics() {
        // Offset +500 µs, start ISR at 10 000 000 on the start clock →
        // translated 9 999 500 local; finish beam at 10 532 500.
        let r = RaceResult::compute(9_999_500, 10_532_500, 2.0, 35.0, 64);
        assert!(!r.timing_error);
        assert_eq!(r.elapsed_us, 533_000);
        assert!((r.time_s - 0.533).abs() < 1e-9);
        assert!((r.speed_mps - 3.7523).abs() < 1e-4);
        assert!((r.speed_mph - 8.39).abs() < 0.01);
        assert!((r.momentum - 0.1313).abs() < 1e-4);
        assert!((r.ke_j - 0.2464).abs() < 1e-4);
    }

    #[test]
    fn sanity_window_boundaries() {
        // Exactly 60 s is still a valid race.
        let ok = RaceResult::compute(0, 60_000_000, 2.0, 35.0, 64);
        assert!(!ok.timing_error);

        // One microsecond past is not.
        let too_long = RaceResult::compute(0, 60_000_001, 2.0, 35.0, 64);
        assert!(too_long.timing_error);
        assert_eq!(too_long.time_s, 0.0);
        assert_eq!(too_long.speed_mph, 0.0);

        // Negative elapsed (finish before translated start) is an error,
        // not a wrapped huge number.
        let backwards = RaceResult::compute(10_000_000, 9_000_000, 2.0, 35.0, 64);
        assert!(backwards.timing_error);
        assert_eq!(backwards.elapsed_us, -1_000_000);

        // Zero elapsed is an error too.
        assert!(RaceResult::compute(5, 5, 2.0, 35.0, 64).timing_error);
    }

    #[test]
    fn csv_row_format() {
        let rec = RunRecord {
            run: 3,
            car: "Redline".into(),
            weight_g: 35.0,
            time_s: 0.533,
            speed_mph: 8.39,
            scale_mph: 537.1,
            momentum: 0.1313,
            ke_j: 0.2464,
        };
        assert_eq!(rec.csv_row(), "3,Redline,35.0,0.5330,8.39,537.1,0.1313,0.2464");
    }
}
