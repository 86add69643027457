//! Start gate role controller.
//!
//! The start gate waits IDLE until something arms it (the finish gate, the
//! LiDAR, or the proximity pad), then latches the beam-break timestamp in
//! an ISR and sends it to the finish gate as the race start. It never does
//! timing math itself — its one job is a precise local timestamp and a
//! clean state cycle:
//!
//! IDLE → ARMED (arm source) → RACING (beam ISR) → FINISHED (CONFIRM)
//! → IDLE (2 s), with a 30 s timeout back to IDLE when the CONFIRM never
//! comes (dropped START or dropped CONFIRM — the radio is best-effort and
//! nothing is retried).

use log::{info, warn};

use crate::arming::{ArmRequest, ArmingPipeline};
use crate::clock::{Cadence, TriggerLatch};
use crate::race::{
    GateAction, RaceState, SharedRaceState, PING_BACKOFF_MS, PING_INTERVAL_MS, RACE_TIMEOUT_MS,
    START_RESET_DELAY_MS,
};
use crate::role::Role;
use crate::snapshot::Cue;
use crate::wire::{ControlFrame, Identity, MsgType};

pub struct StartGate {
    pub pipeline: ArmingPipeline,
    ping: Cadence,
    race_started_ms: u64,
    auto_reset_at: Option<u64>,
}

impl StartGate {
    pub fn new(pipeline: ArmingPipeline) -> Self {
        Self {
            pipeline,
            ping: Cadence::new(),
            race_started_ms: 0,
            auto_reset_at: None,
        }
    }

    /// Main-loop tick. `prox_level` is the raw proximity sensor level when
    /// fitted (true = car present).
    #[allow(clippy::too_many_arguments)]
    pub fn poll(
        &mut self,
        state: &SharedRaceState,
        trigger: &TriggerLatch,
        prox_level: Option<bool>,
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

        if let Some(deadline) = self.auto_reset_at {
            if now_ms > deadline {
                info!("[START] Auto-reset to IDLE");
                actions.extend(self.to_idle(state, trigger));
            }
        }

        match state.load() {
            RaceState::Idle => {
                if let Some(req) = self.pipeline.poll(prox_level, now_ms) {
                    let source = match req {
                        ArmRequest::Proximity => "proximity sensor",
                        ArmRequest::Lidar => "LiDAR",
                        ArmRequest::Explicit => "command",
                    };
                    info!("[START] AUTO-ARMED via {source}");
                    actions.extend(self.arm(state, trigger, ident, now_us, true));
                }
            }
            RaceState::Armed => {
                if let Some(trigger_us) = trigger.pending() {
                    // Beam broken — the race starts on OUR clock. The finish
                    // gate translates this into its own timebase.
                    state.store(RaceState::Racing);
                    self.race_started_ms = now_ms;
                    info!("[START] Triggered at {trigger_us} us");
                    actions.push(GateAction::SendToRole(
                        Role::Finish,
                        ident.frame(MsgType::Start, trigger_us, 0),
                    ));
                    actions.push(GateAction::DetachTrigger);
                    actions.push(GateAction::PlayCue(Cue::Go));
                    actions.push(GateAction::BroadcastState);
                }
            }
            RaceState::Racing => {
                if now_ms.saturating_sub(self.race_started_ms) > RACE_TIMEOUT_MS {
                    warn!("[START] Race timeout, no finish confirmation");
                    actions.extend(self.to_idle(state, trigger));
                }
            }
            RaceState::Finished => {
                if self.auto_reset_at.is_none() {
                    self.auto_reset_at = Some(now_ms + START_RESET_DELAY_MS);
                }
            }
        }

        actions
    }

    /// A frame addressed to us, already past the discovery layer.
    pub fn handle_frame(
        &mut self,
        state: &SharedRaceState,
        trigger: &TriggerLatch,
        src: crate::peers::Mac,
        frame: &ControlFrame,
        ident: &Identity,
        now_us: u64,
    ) -> Vec<GateAction> {
        match frame.msg_type {
            MsgType::Ping => vec![GateAction::SendToMac(
                src,
                ident.frame(MsgType::Pong, now_us, 0),
            )],
            MsgType::Confirm => {
                if state.transition(RaceState::Racing, RaceState::Finished) {
                    info!("[START] Race confirmed complete");
                    vec![GateAction::BroadcastState]
                } else {
                    Vec::new()
                }
            }
            MsgType::SyncReq => {
                // The finish gate owns the offset; we just hand over our
                // clock reading as close to the send as possible.
                vec![GateAction::SendToMac(
                    src,
                    ident.frame(MsgType::Offset, now_us, 0),
                )]
            }
            MsgType::ArmCmd => {
                if state.load() == RaceState::Idle {
                    info!("[START] ARMED, waiting for trigger");
                    // No ARM_CMD re-broadcast: the command came from upstream.
                    self.arm(state, trigger, ident, now_us, false)
                } else {
                    Vec::new()
                }
            }
            MsgType::DisarmCmd => {
                info!("[START] DISARMED");
                self.to_idle(state, trigger)
            }
            _ => Vec::new(),
        }
    }

    /// Arm the gate: clear the latch, attach the beam interrupt, announce.
    /// `broadcast_arm` propagates ARM_CMD when a local source armed us.
    pub fn arm(
        &mut self,
        state: &SharedRaceState,
        trigger: &TriggerLatch,
        ident: &Identity,
        now_us: u64,
        broadcast_arm: bool,
    ) -> Vec<GateAction> {
        if !state.transition(RaceState::Idle, RaceState::Armed) {
            return Vec::new();
        }
        trigger.clear();
        self.pipeline.reset_interlock();
        self.auto_reset_at = None;

        let mut actions = vec![GateAction::AttachTrigger];
        if broadcast_arm {
            actions.push(GateAction::SendToRole(
                Role::Finish,
                ident.frame(MsgType::ArmCmd, now_us, 0),
            ));
        }
        actions.push(GateAction::PlayCue(Cue::Armed));
        actions.push(GateAction::BroadcastState);
        actions
    }

    /// Drop back to IDLE from any state: clear the latch, re-lock the
    /// interlock, detach the interrupt if it was live.
    pub fn to_idle(&mut self, state: &SharedRaceState, trigger: &TriggerLatch) -> Vec<GateAction> {
        let was_armed = state.load() == RaceState::Armed;
        state.store(RaceState::Idle);
        trigger.clear();
        self.pipeline.reset_interlock();
        self.auto_reset_at = None;

        let mut actions = Vec::new();
        if was_armed {
            actions.push(GateAction::DetachTrigger);
        }
        actions.push(GateAction::BroadcastState);
        actions
    }
}
