//! Speed trap role controller.
//!
//! Two beam sensors a fixed distance apart, each with its own ISR. The
//! first beam latches `t1`; the second only latches once `t1` exists, so
//! the pair always orders correctly. When both are set the main loop
//! computes `v = d / Δt`, sends it to the finish gate as fixed-point
//! `SPEED_DATA`, and re-arms for the next car. The trap has no explicit
//! arm state — its sensors are always live; an `ARM_CMD` just clears any
//! stale half-capture.

use log::{info, warn};

use crate::clock::{Cadence, TimingCell};
use crate::peers::Mac;
use crate::race::{GateAction, MPS_TO_MPH, PING_BACKOFF_MS, PING_INTERVAL_MS};
use crate::role::Role;
use crate::wire::{ControlFrame, Identity, MsgType};

/// Δt must be positive and under ten seconds to count as one car.
pub const TRAP_MAX_INTERVAL_US: i64 = 10_000_000;
/// A lone first-beam hit expires after five seconds.
pub const TRAP_CAPTURE_TIMEOUT_US: u64 = 5_000_000;

/// The two capture cells shared with the beam ISRs.
pub struct TrapCells {
    t1: TimingCell,
    t2: TimingCell,
}

impl TrapCells {
    pub const fn new() -> Self {
        Self {
            t1: TimingCell::new(),
            t2: TimingCell::new(),
        }
    }

    /// First-beam ISR: latch the entry timestamp.
    #[inline]
    pub fn sensor1(&self, now_us: u64) {
        self.t1.capture_if_clear(now_us);
    }

    /// Second-beam ISR: latch only when the first beam already fired, so a
    /// car clipping the far sensor alone never produces a measurement.
    #[inline]
    pub fn sensor2(&self, now_us: u64) {
        if self.t1.load() > 0 {
            self.t2.capture_if_clear(now_us);
        }
    }

    pub fn clear(&self) {
        self.t1.clear();
        self.t2.clear();
    }

    pub fn times(&self) -> (u64, u64) {
        (self.t1.load(), self.t2.load())
    }
}

impl Default for TrapCells {
    fn default() -> Self {
        Self::new()
    }
}

/// A completed mid-track measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedMeasurement {
    pub t1_us: u64,
    pub delta_us: i64,
    pub speed_mps: f64,
}

pub struct SpeedTrap {
    sensor_spacing_m: f64,
    ping: Cadence,
    last_speed_mps: f64,
}

impl SpeedTrap {
    pub fn new(sensor_spacing_m: f64) -> Self {
        Self {
            sensor_spacing_m,
            ping: Cadence::new(),
            last_speed_mps: 0.0,
        }
    }

    pub fn last_speed_mps(&self) -> f64 {
        self.last_speed_mps
    }

    /// Main-loop tick: ping cadence, completed captures, stale-capture
    /// timeout.
    pub fn poll(
        &mut self,
        cells: &TrapCells,
        peer_online: bool,
        ident: &Identity,
        now_ms: u64,
        now_us: u64,
    ) -> Vec<GateAction> {
        let mut actions = Vec::new();

        let ping_interval = if peer_online {
            PING_INTERVAL_MS
        } else {
            PING_BACKOFF_MS
        };
        if self.ping.due(now_ms, ping_interval) {
            actions.push(GateAction::SendToRole(
                Role::Finish,
                ident.frame(MsgType::Ping, now_us, 0),
            ));
        }

        let (t1, t2) = cells.times();

        if t1 > 0 && t2 > 0 {
            match self.measure(t1, t2) {
                Some(m) => {
                    info!(
                        "[TRAP] {:.3} m/s ({:.1} mph) over {} us",
                        m.speed_mps,
                        m.speed_mps * MPS_TO_MPH,
                        m.delta_us
                    );
                    self.last_speed_mps = m.speed_mps;
                    actions.push(GateAction::SendToRole(
                        Role::Finish,
                        ident.frame(
                            MsgType::SpeedData,
                            m.t1_us,
                            ControlFrame::encode_speed(m.speed_mps),
                        ),
                    ));
                    actions.push(GateAction::BroadcastState);
                }
                None => {
                    warn!("[TRAP] Bad timing: t1={t1} t2={t2}");
                }
            }
            cells.clear();
        } else if t1 > 0 && now_us.saturating_sub(t1) > TRAP_CAPTURE_TIMEOUT_US {
            // The car never reached the second beam (or was lifted off).
            info!("[TRAP] Capture timeout, resetting");
            cells.clear();
        }

        actions
    }

    fn measure(&self, t1: u64, t2: u64) -> Option<SpeedMeasurement> {
        let delta_us = t2 as i64 - t1 as i64;
        if delta_us <= 0 || delta_us >= TRAP_MAX_INTERVAL_US {
            return None;
        }
        Some(SpeedMeasurement {
            t1_us: t1,
            delta_us,
            speed_mps: self.sensor_spacing_m / (delta_us as f64 / 1_000_000.0),
        })
    }

    /// A frame addressed to us.
    pub fn handle_frame(
        &mut self,
        cells: &TrapCells,
        src: Mac,
        frame: &ControlFrame,
        ident: &Identity,
        now_us: u64,
    ) -> Vec<GateAction> {
        match frame.msg_type {
            MsgType::Ping => vec![GateAction::SendToMac(
                src,
                ident.frame(MsgType::Pong, now_us, 0),
            )],
            MsgType::SpeedAck => {
                info!("[TRAP] Finish gate acknowledged speed data");
                Vec::new()
            }
            MsgType::ArmCmd => {
                // New race coming: drop any stale half-capture.
                cells.clear();
                self.last_speed_mps = 0.0;
                info!("[TRAP] Armed, sensors reset");
                Vec::new()
            }
            MsgType::DisarmCmd => {
                cells.clear();
                info!("[TRAP] Disarmed");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}
