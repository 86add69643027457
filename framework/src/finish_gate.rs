//! Finish gate role controller.
//!
//! The finish gate owns everything the start gate does not: the clock
//! offset, the translated start timestamp, the elapsed-time computation
//! with its sanity window, the physics, the CSV log and the dashboard
//! snapshot. Its beam interrupt stays attached permanently and is gated by
//! the race state instead of attach/detach.
//!
//! IDLE → ARMED (user arm; ARM_CMD goes downstream) → RACING (START
//! received, start timestamp translated into our timebase) → FINISHED
//! (beam ISR latches t_f) → IDLE after 5 s, results left on the dashboard
//! meanwhile.

use log::{info, warn};

use crate::arming::LidarStaging;
use crate::clock::Cadence;
use crate::peers::{Mac, PeerRegistry, PeerStatus};
use crate::race::{
    GateAction, RaceResult, RaceState, RunRecord, TimingShared, FINISH_RESET_DELAY_MS,
    MPS_TO_MPH, PING_BACKOFF_MS, PING_INTERVAL_MS,
};
use crate::role::Role;
use crate::snapshot::{Cue, LidarSnapshot, MidTrackSnapshot, ResultSnapshot, StateSnapshot};
use crate::sync::ClockSync;
use crate::wire::{ControlFrame, Identity, MsgType, Payload};

pub struct FinishGate {
    ping: Cadence,
    auto_reset_at: Option<u64>,
    total_runs: u32,
    current_car: String,
    current_weight_g: f32,
    mid_track_mps: f64,
    dry_run: bool,
    track_length_m: f64,
    scale_factor: i32,
    last_result: Option<RaceResult>,
}

impl FinishGate {
    pub fn new(track_length_m: f64, scale_factor: i32) -> Self {
        Self {
            ping: Cadence::new(),
            auto_reset_at: None,
            total_runs: 0,
            current_car: "Unknown".into(),
            current_weight_g: 35.0,
            mid_track_mps: 0.0,
            dry_run: false,
            track_length_m,
            scale_factor,
            last_result: None,
        }
    }

    /// Car metadata from the dashboard, used for the physics columns.
    pub fn set_car(&mut self, name: &str, weight_g: f32) {
        self.current_car = name.to_owned();
        self.current_weight_g = weight_g;
    }

    /// Dry-run suppresses the CSV log only; the race flow is unchanged.
    pub fn set_dry_run(&mut self, on: bool) {
        self.dry_run = on;
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn last_result(&self) -> Option<&RaceResult> {
        self.last_result.as_ref()
    }

    /// Main-loop tick.
    pub fn poll(
        &mut self,
        shared: &TimingShared,
        sync: &mut ClockSync,
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
                Role::Start,
                ident.frame(MsgType::Ping, now_us, 0),
            ));
        }

        // We own clock sync; the start gate only ever answers.
        if let Some(req) = sync.poll(ident, peer_online, now_ms, now_us) {
            actions.push(GateAction::SendToRole(Role::Start, req));
        }

        if let Some(deadline) = self.auto_reset_at {
            if now_ms > deadline {
                info!("[FINISH] Auto-reset to IDLE");
                actions.extend(self.to_idle(shared));
            }
        }

        // Race finish handling — runs once per race, when the beam ISR has
        // latched t_f and before the reset timer is armed.
        let finish_us = shared.finish_time_us.load();
        if shared.state.load() == RaceState::Finished
            && finish_us > 0
            && self.auto_reset_at.is_none()
        {
            actions.extend(self.complete_race(shared, finish_us, ident, now_ms, now_us));
        }

        actions
    }

    fn complete_race(
        &mut self,
        shared: &TimingShared,
        finish_us: u64,
        ident: &Identity,
        now_ms: u64,
        now_us: u64,
    ) -> Vec<GateAction> {
        let start_us = shared.start_time_us.load();
        let result = RaceResult::compute(
            start_us,
            finish_us,
            self.track_length_m,
            self.current_weight_g,
            self.scale_factor,
        );

        info!("[FINISH] ===== RACE RESULT =====");
        info!("[FINISH] start_us={start_us} finish_us={finish_us}");

        let mut actions = Vec::new();
        if result.timing_error {
            // Published as zeros with the error flag; never logged to CSV.
            warn!("[FINISH] Bad timing, elapsed={} us", result.elapsed_us);
            actions.push(GateAction::PlayCue(Cue::Error));
        } else {
            info!(
                "[FINISH] Time {:.4} s, speed {:.1} mph",
                result.time_s, result.speed_mph
            );
            self.total_runs += 1;
            if self.dry_run {
                info!("[FINISH] Dry-run mode, CSV logging skipped");
            } else {
                actions.push(GateAction::LogRun(RunRecord {
                    run: self.total_runs,
                    car: self.current_car.clone(),
                    weight_g: self.current_weight_g,
                    time_s: result.time_s,
                    speed_mph: result.speed_mph,
                    scale_mph: result.scale_mph,
                    momentum: result.momentum,
                    ke_j: result.ke_j,
                }));
            }
            actions.push(GateAction::PlayCue(Cue::Finish));
        }

        self.last_result = Some(result);

        // CONFIRM either way so the start gate resets promptly instead of
        // waiting out its 30 s timeout.
        actions.push(GateAction::SendToRole(
            Role::Start,
            ident.frame(MsgType::Confirm, now_us, 0),
        ));
        actions.push(GateAction::BroadcastState);

        self.auto_reset_at = Some(now_ms + FINISH_RESET_DELAY_MS);
        actions
    }

    /// A frame addressed to us. `rx_time_us` is the local clock at frame
    /// arrival, captured by the radio callback before dispatch — the offset
    /// estimate depends on it.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_frame(
        &mut self,
        shared: &TimingShared,
        sync: &ClockSync,
        src: Mac,
        frame: &ControlFrame,
        ident: &Identity,
        now_us: u64,
        rx_time_us: u64,
    ) -> Vec<GateAction> {
        match frame.msg_type {
            MsgType::Ping => vec![GateAction::SendToMac(
                src,
                ident.frame(MsgType::Pong, now_us, 0),
            )],
            MsgType::Start => {
                // Only an armed gate accepts a race start; a duplicate
                // START mid-race must not disturb the latched time.
                if shared.state.load() != RaceState::Armed {
                    return Vec::new();
                }
                // The start gate's trigger timestamp, translated into our
                // timebase through the running offset. Write the time first,
                // then flip the state: the beam ISR only latches while
                // RACING, so RACING always implies a non-zero start time.
                let t_local = sync.translate_to_local(frame.timestamp_us);
                shared.start_time_us.store(t_local);
                if shared
                    .state
                    .transition(RaceState::Armed, RaceState::Racing)
                {
                    info!(
                        "[FINISH] START received: raw={} offset={} local={}",
                        frame.timestamp_us,
                        sync.offset_us(),
                        t_local
                    );
                    vec![GateAction::BroadcastState]
                } else {
                    // Not armed — a START we never asked for. Undo the
                    // speculative store.
                    shared.start_time_us.clear();
                    Vec::new()
                }
            }
            MsgType::Offset => {
                sync.on_offset_frame(frame.timestamp_us, rx_time_us);
                Vec::new()
            }
            // We initiate sync; stray requests are not ours to answer.
            MsgType::SyncReq => Vec::new(),
            MsgType::SpeedData => {
                if let Payload::SpeedMps(v) = frame.payload() {
                    self.mid_track_mps = v;
                    info!(
                        "[FINISH] Speed trap: {:.3} m/s ({:.1} mph)",
                        v,
                        v * MPS_TO_MPH
                    );
                    vec![
                        GateAction::SendToMac(src, ident.frame(MsgType::SpeedAck, now_us, 0)),
                        GateAction::PlayCue(Cue::SpeedTrap),
                        GateAction::BroadcastState,
                    ]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// User arm from the dashboard: zero the timing vars, force a fresh
    /// clock sync, and arm the whole installation downstream.
    pub fn arm(
        &mut self,
        shared: &TimingShared,
        sync: &mut ClockSync,
        ident: &Identity,
        now_us: u64,
    ) -> Vec<GateAction> {
        if !shared
            .state
            .transition(RaceState::Idle, RaceState::Armed)
        {
            return Vec::new();
        }
        shared.clear_times();
        sync.force_resync();
        self.last_result = None;
        info!("[FINISH] ARMED");

        vec![
            GateAction::SendToRole(Role::Start, ident.frame(MsgType::ArmCmd, now_us, 0)),
            GateAction::SendToRole(Role::SpeedTrap, ident.frame(MsgType::ArmCmd, now_us, 0)),
            GateAction::PlayCue(Cue::Armed),
            GateAction::BroadcastState,
        ]
    }

    /// User disarm/reset: back to IDLE here and downstream.
    pub fn disarm(&mut self, shared: &TimingShared, ident: &Identity, now_us: u64) -> Vec<GateAction> {
        let mut actions = vec![
            GateAction::SendToRole(Role::Start, ident.frame(MsgType::DisarmCmd, now_us, 0)),
            GateAction::SendToRole(Role::SpeedTrap, ident.frame(MsgType::DisarmCmd, now_us, 0)),
        ];
        actions.extend(self.to_idle(shared));
        actions
    }

    fn to_idle(&mut self, shared: &TimingShared) -> Vec<GateAction> {
        shared.state.store(RaceState::Idle);
        shared.clear_times();
        self.auto_reset_at = None;
        self.last_result = None;
        self.mid_track_mps = 0.0;
        vec![GateAction::BroadcastState]
    }

    /// Build the dashboard snapshot from current state.
    pub fn snapshot(
        &self,
        shared: &TimingShared,
        registry: &PeerRegistry,
        lidar: Option<&LidarStaging>,
        now_ms: u64,
    ) -> StateSnapshot {
        let online_peers = registry
            .iter()
            .filter(|p| p.paired && p.status(now_ms) == PeerStatus::Online)
            .count();

        StateSnapshot {
            state: shared.state.load().as_str(),
            connected: registry.has_online_peer(now_ms),
            role: Role::Finish.as_str(),
            car: self.current_car.clone(),
            weight: self.current_weight_g,
            track_length: self.track_length_m,
            scale_factor: self.scale_factor,
            total_runs: self.total_runs,
            dry_run: self.dry_run,
            peer_count: registry.len(),
            online_peers,
            mid_track: (self.mid_track_mps > 0.0).then(|| MidTrackSnapshot {
                mps: self.mid_track_mps,
                mph: self.mid_track_mps * MPS_TO_MPH,
                scale_mph: self.mid_track_mps * MPS_TO_MPH * self.scale_factor as f64,
            }),
            lidar: lidar.map(|l| LidarSnapshot {
                state: l.state().as_str(),
                distance_mm: l.distance_mm(),
            }),
            result: self.last_result.as_ref().map(ResultSnapshot::from_result),
        }
    }
}
