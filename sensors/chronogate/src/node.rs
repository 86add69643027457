//! Shared node context: the pieces every role carries, the radio receive
//! dispatch, and the executor that turns controller actions into radio
//! sends, cues and file writes.
//!
//! Concurrency layout, matching the engine's contract:
//!
//! - `TimingShared` / `TriggerLatch` / `TrapCells` are atomics, shared with
//!   the GPIO ISRs and never locked;
//! - everything else (registry, discovery, sync, the role controller) lives
//!   in one `Mutex<Core>` touched by the main loop and the radio RX
//!   callback — never by ISRs;
//! - persistence (peers.json, runs.csv, telemetry CSV) happens only on the
//!   main loop; the RX path defers completed work through `Core`.

use std::sync::Mutex;

use esp_idf_svc::sys;
use log::{info, warn};

use race_timing::arming::LidarStaging;
use race_timing::config::{DeviceConfig, FIRMWARE_MAJOR, FIRMWARE_MINOR};
use race_timing::discovery::{Discovery, Effect};
use race_timing::finish_gate::FinishGate;
use race_timing::peers::format_mac;
use race_timing::race::{GateAction, RaceState};
use race_timing::snapshot::StateSnapshot;
use race_timing::speed_trap::{SpeedTrap, TrapCells};
use race_timing::start_gate::StartGate;
use race_timing::sync::ClockSync;
use race_timing::telemetry::{CompletedRun, Reassembler};
use race_timing::wire::{
    BeaconDiag, ControlFrame, Frame, Identity, MsgType, RemoteCmd, RemoteCommand, WifiConfig,
};
use race_timing::{EventSink, Mac, PeerRegistry, Role, TimingShared, TriggerLatch};

use crate::events::DashboardSink;
use crate::radio::Radio;
use crate::storage::Storage;

/// Monotonic microseconds since boot. ISR-safe.
#[inline]
pub fn now_us() -> u64 {
    unsafe { sys::esp_timer_get_time() as u64 }
}

#[inline]
pub fn now_ms() -> u64 {
    now_us() / 1_000
}

/// The role-specific controller plus whatever extra machinery that role
/// carries.
pub enum RoleCore {
    Start(StartGate),
    Finish {
        gate: FinishGate,
        telemetry: Reassembler,
        /// A reassembled run handed from the RX path to the main loop for
        /// the CSV write and the ACK.
        completed_run: Option<CompletedRun>,
    },
    Trap(SpeedTrap),
}

/// Task-shared mutable state. Locked by the main loop and the RX callback.
pub struct Core {
    pub registry: PeerRegistry,
    pub discovery: Discovery,
    pub sync: ClockSync,
    pub role: RoleCore,
}

/// Everything one node shares between its execution contexts.
pub struct GateNode {
    pub cfg: DeviceConfig,
    pub ident: Identity,
    pub shared: TimingShared,
    pub trigger: TriggerLatch,
    pub trap_cells: TrapCells,
    pub core: Mutex<Core>,
}

impl GateNode {
    pub fn new(cfg: DeviceConfig, core: Core) -> Self {
        let ident = Identity {
            device_id: cfg.device_id,
            role: cfg.role,
            hostname: cfg.hostname.clone(),
        };
        Self {
            cfg,
            ident,
            shared: TimingShared::new(),
            trigger: TriggerLatch::new(),
            trap_cells: TrapCells::new(),
            core: Mutex::new(core),
        }
    }

    /// Live diagnostics for the beacon payload.
    pub fn diag(&self) -> BeaconDiag {
        let free_heap_kb = (unsafe { sys::esp_get_free_heap_size() } / 1024).min(u16::MAX as u32);
        let mut rssi: i32 = 0;
        let rssi_dbm = if unsafe { sys::esp_wifi_sta_get_rssi(&mut rssi) } == sys::ESP_OK {
            rssi.clamp(-128, 127) as i8
        } else {
            -128
        };
        BeaconDiag {
            uptime_min: (now_ms() / 60_000).min(u16::MAX as u64) as u16,
            free_heap_kb: free_heap_kb as u16,
            rssi_dbm,
            race_state: self.shared.state.load() as u8,
            fw_major: FIRMWARE_MAJOR,
            fw_minor: FIRMWARE_MINOR,
        }
    }

    /// Radio RX entry point. Runs on the Wi-Fi task: decode, update the
    /// registry, dispatch by role, execute the resulting actions. The
    /// arrival timestamp is captured before any locking so the clock
    /// offset never includes our own queueing.
    pub fn on_receive(&self, src: Mac, data: &[u8], radio: &Radio, sink: &Mutex<DashboardSink>) {
        let rx_time_us = now_us();
        let Some(frame) = Frame::decode(data) else {
            return; // wrong size or unknown type: silently dropped
        };

        match frame {
            Frame::Control(frame) => self.on_control(src, frame, rx_time_us, radio, sink),
            Frame::TelemHeader(h) => {
                if let RoleCore::Finish { telemetry, .. } = &mut self.core.lock().unwrap().role {
                    telemetry.on_header(src, &h);
                }
            }
            Frame::TelemChunk(c) => {
                if let RoleCore::Finish { telemetry, .. } = &mut self.core.lock().unwrap().role {
                    telemetry.on_chunk(&c);
                }
            }
            Frame::TelemEnd(e) => {
                if let RoleCore::Finish {
                    telemetry,
                    completed_run,
                    ..
                } = &mut self.core.lock().unwrap().role
                {
                    // The CSV write and the ACK belong to the main loop.
                    *completed_run = telemetry.on_end(&e);
                }
            }
            Frame::WifiConfig(w) => self.on_wifi_config(src, w),
            Frame::RemoteCmd(c) => self.on_remote_cmd(src, c, radio, sink),
        }
    }

    fn on_control(
        &self,
        src: Mac,
        frame: ControlFrame,
        rx_time_us: u64,
        radio: &Radio,
        sink: &Mutex<DashboardSink>,
    ) {
        let now_ms = now_ms();
        let now_us = now_us();

        let (effects, actions) = {
            let mut core = self.core.lock().unwrap();
            match frame.msg_type {
                MsgType::Beacon | MsgType::BeaconAck | MsgType::PairReq | MsgType::PairAck => {
                    let diag = self.diag();
                    let core = &mut *core;
                    let effects = core.discovery.handle_frame(
                        &mut core.registry,
                        &self.ident,
                        diag,
                        src,
                        &frame,
                        now_ms,
                        now_us,
                    );
                    (effects, Vec::new())
                }
                _ => {
                    core.registry.note_heard(&src, now_ms);
                    let core = &mut *core;
                    let actions = match &mut core.role {
                        RoleCore::Start(gate) => gate.handle_frame(
                            &self.shared.state,
                            &self.trigger,
                            src,
                            &frame,
                            &self.ident,
                            now_us,
                        ),
                        RoleCore::Finish { gate, .. } => gate.handle_frame(
                            &self.shared,
                            &core.sync,
                            src,
                            &frame,
                            &self.ident,
                            now_us,
                            rx_time_us,
                        ),
                        RoleCore::Trap(trap) => {
                            trap.handle_frame(&self.trap_cells, src, &frame, &self.ident, now_us)
                        }
                    };
                    (Vec::new(), actions)
                }
            }
        };

        self.execute_effects(effects, radio, None);
        self.execute_actions(actions, radio, sink, None);
    }

    /// Wi-Fi credentials pushed from the finish gate. The core validates
    /// the sender and surfaces the credentials; applying them is the setup
    /// layer's job (it reboots into the new network).
    fn on_wifi_config(&self, src: Mac, wifi: WifiConfig) {
        let authorized = self.core.lock().unwrap().registry.is_authorized_controller(&src);
        if !authorized || wifi.sender_role != Role::Finish {
            warn!(
                "[NODE] Unauthorised WIFI_CONFIG from {}, dropped",
                format_mac(&src)
            );
            return;
        }
        info!("[NODE] Wi-Fi credentials received for SSID '{}'", wifi.ssid);
    }

    fn on_remote_cmd(&self, src: Mac, cmd: RemoteCmd, radio: &Radio, sink: &Mutex<DashboardSink>) {
        let authorized = self.core.lock().unwrap().registry.is_authorized_controller(&src);
        if !authorized || cmd.sender_role != Role::Finish {
            warn!(
                "[NODE] Unauthorised REMOTE_CMD from {}, dropped",
                format_mac(&src)
            );
            return;
        }

        info!("[NODE] Remote command {:?} (param {})", cmd.command, cmd.param);
        let now_us = now_us();
        let (effects, actions) = {
            let mut core = self.core.lock().unwrap();
            let core = &mut *core;
            match cmd.command {
                RemoteCommand::Arm => {
                    let actions = match &mut core.role {
                        RoleCore::Start(gate) => {
                            gate.arm(&self.shared.state, &self.trigger, &self.ident, now_us, false)
                        }
                        RoleCore::Finish { gate, .. } => {
                            gate.arm(&self.shared, &mut core.sync, &self.ident, now_us)
                        }
                        RoleCore::Trap(_) => {
                            self.trap_cells.clear();
                            Vec::new()
                        }
                    };
                    (Vec::new(), actions)
                }
                RemoteCommand::Disarm | RemoteCommand::Reset => {
                    let actions = match &mut core.role {
                        RoleCore::Start(gate) => gate.to_idle(&self.shared.state, &self.trigger),
                        RoleCore::Finish { gate, .. } => gate.disarm(&self.shared, &self.ident, now_us),
                        RoleCore::Trap(_) => {
                            self.trap_cells.clear();
                            Vec::new()
                        }
                    };
                    (Vec::new(), actions)
                }
                RemoteCommand::SetDryRun => {
                    if let RoleCore::Finish { gate, .. } = &mut core.role {
                        gate.set_dry_run(cmd.param != 0);
                    }
                    (Vec::new(), Vec::new())
                }
                RemoteCommand::ForgetPeers => {
                    let effects = core.discovery.forget_all(&mut core.registry);
                    (effects, Vec::new())
                }
                RemoteCommand::Reboot => {
                    warn!("[NODE] Reboot commanded");
                    unsafe { sys::esp_restart() };
                    (Vec::new(), Vec::new())
                }
            }
        };

        self.execute_effects(effects, radio, None);
        self.execute_actions(actions, radio, sink, None);
    }

    /// Execute discovery effects. `storage` is `Some` only on the main
    /// loop — the RX path never persists, so a save requested there rides
    /// the debounce until the next main-loop poll.
    pub fn execute_effects(&self, effects: Vec<Effect>, radio: &Radio, storage: Option<&Storage>) {
        for effect in effects {
            match effect {
                Effect::SendTo(mac, frame) => {
                    radio.ensure_peer(&mac);
                    radio.send(&mac, &frame.encode());
                }
                Effect::Broadcast(frame) => radio.broadcast(&frame.encode()),
                Effect::RegisterPeer(mac) => radio.ensure_peer(&mac),
                Effect::UnregisterPeer(mac) => radio.remove_peer(&mac),
                Effect::SavePeers => match storage {
                    Some(storage) => {
                        let persisted = self.core.lock().unwrap().registry.persisted();
                        if let Err(e) = storage.save_peers(&persisted) {
                            warn!("[NODE] peers.json write failed: {e}"); // retried next debounce
                        }
                    }
                    None => {
                        // Persistence is main-loop-only; re-queue through
                        // the debounce so the next poll writes it.
                        self.core.lock().unwrap().discovery.request_save(now_ms());
                    }
                },
            }
        }
    }

    /// Execute role controller actions.
    pub fn execute_actions(
        &self,
        actions: Vec<GateAction>,
        radio: &Radio,
        sink: &Mutex<DashboardSink>,
        storage: Option<&Storage>,
    ) {
        for action in actions {
            match action {
                GateAction::SendToRole(role, frame) => {
                    let dest = {
                        let core = self.core.lock().unwrap();
                        core.registry
                            .find_by_role_online(role, now_ms())
                            .map(|p| p.mac)
                    };
                    match dest {
                        Some(mac) => {
                            radio.ensure_peer(&mac);
                            radio.send(&mac, &frame.encode());
                        }
                        None => {
                            // No paired peer with that role yet; the frame
                            // is simply not sent. Beacons will find one.
                        }
                    }
                }
                GateAction::SendToMac(mac, frame) => {
                    radio.ensure_peer(&mac);
                    radio.send(&mac, &frame.encode());
                }
                // The beam interrupt is state-driven: the main loop enables
                // the GPIO interrupt whenever `beam_interrupt_wanted` says
                // so, which tracks exactly the ARMED transitions these
                // actions mark.
                GateAction::AttachTrigger | GateAction::DetachTrigger => {}
                GateAction::PlayCue(cue) => sink.lock().unwrap().play_cue(cue),
                GateAction::BroadcastState => {
                    let snapshot = self.snapshot();
                    sink.lock().unwrap().broadcast_state(&snapshot);
                }
                GateAction::LogRun(record) => {
                    let Some(storage) = storage else {
                        warn!("[NODE] Run record dropped: no storage in this context");
                        continue;
                    };
                    if let Err(e) = storage.append_run(&record) {
                        warn!("[NODE] runs.csv append failed: {e}");
                    }
                }
            }
        }
    }

    /// Current dashboard snapshot for this node's role.
    pub fn snapshot(&self) -> StateSnapshot {
        let core = self.core.lock().unwrap();
        let now = now_ms();
        match &core.role {
            RoleCore::Finish { gate, .. } => {
                gate.snapshot(&self.shared, &core.registry, None, now)
            }
            RoleCore::Start(gate) => {
                self.basic_snapshot(&core.registry, gate.pipeline.lidar.as_ref(), now)
            }
            RoleCore::Trap(_) => self.basic_snapshot(&core.registry, None, now),
        }
    }

    /// Snapshot for the roles without timing results of their own.
    fn basic_snapshot(
        &self,
        registry: &PeerRegistry,
        lidar: Option<&LidarStaging>,
        now: u64,
    ) -> StateSnapshot {
        let online = registry
            .iter()
            .filter(|p| p.paired && p.status(now) == race_timing::PeerStatus::Online)
            .count();
        StateSnapshot {
            state: self.shared.state.load().as_str(),
            connected: registry.has_online_peer(now),
            role: self.ident.role.as_str(),
            car: String::new(),
            weight: 0.0,
            track_length: self.cfg.track_length_m,
            scale_factor: self.cfg.scale_factor,
            total_runs: 0,
            dry_run: false,
            peer_count: registry.len(),
            online_peers: online,
            mid_track: None,
            lidar: lidar.map(|l| race_timing::snapshot::LidarSnapshot {
                state: l.state().as_str(),
                distance_mm: l.distance_mm(),
            }),
            result: None,
        }
    }

    /// True while the start-beam interrupt should be live.
    pub fn beam_interrupt_wanted(&self) -> bool {
        self.shared.state.load() == RaceState::Armed
    }

    /// Handle a reassembled telemetry run on the main loop: CSV to flash,
    /// then the ACK with the received sample count.
    pub fn service_telemetry(&self, radio: &Radio, storage: &Storage) {
        let run = {
            match &mut self.core.lock().unwrap().role {
                RoleCore::Finish { completed_run, .. } => completed_run.take(),
                _ => None,
            }
        };
        let Some(run) = run else { return };

        if let Err(e) = storage.write_telemetry_csv(&run) {
            warn!("[NODE] telemetry CSV write failed: {e}");
        }

        let ack = self
            .ident
            .frame(MsgType::TelemAck, now_us(), run.received_samples as i64);
        radio.ensure_peer(&run.src);
        radio.send(&run.src, &ack.encode());
        info!(
            "[TELEM] Run {} archived ({} samples, verified={})",
            run.run_id, run.received_samples, run.verified
        );
    }
}
