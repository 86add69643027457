//! End-to-end races over a simulated radio.
//!
//! Two (sometimes three) nodes run their real controllers — discovery,
//! clock sync, role state machines — against a loopback radio that routes
//! frames by MAC and can drop them on demand. Each node keeps its own
//! monotonic clock with a fixed skew against "true" time, so the clock
//! offset machinery is exercised for real.

use race_timing::arming::ArmingPipeline;
use race_timing::discovery::{Discovery, Effect};
use race_timing::finish_gate::FinishGate;
use race_timing::race::{GateAction, RaceState, SharedRaceState, TimingShared};
use race_timing::speed_trap::{SpeedTrap, TrapCells};
use race_timing::start_gate::StartGate;
use race_timing::sync::ClockSync;
use race_timing::wire::{BeaconDiag, Identity, MsgType};
use race_timing::{Cue, Mac, PeerRegistry, Role, TriggerLatch};

const START_MAC: Mac = [0xA0, 0, 0, 0, 0, 1];
const FINISH_MAC: Mac = [0xA0, 0, 0, 0, 0, 2];
const TRAP_MAC: Mac = [0xA0, 0, 0, 0, 0, 3];

/// One node's role machinery.
enum RoleCtl {
    Start {
        gate: StartGate,
        state: SharedRaceState,
        trigger: TriggerLatch,
    },
    Finish {
        gate: FinishGate,
        shared: TimingShared,
        sync: ClockSync,
    },
    Trap {
        trap: SpeedTrap,
        cells: TrapCells,
    },
}

struct Node {
    mac: Mac,
    ident: Identity,
    /// This node's clock minus true time, microseconds.
    clock_skew_us: i64,
    disc: Discovery,
    reg: PeerRegistry,
    ctl: RoleCtl,
    cues: Vec<Cue>,
    csv_rows: u32,
}

impl Node {
    fn now_us(&self, true_us: u64) -> u64 {
        (true_us as i64 + self.clock_skew_us) as u64
    }

    fn now_ms(&self, true_us: u64) -> u64 {
        self.now_us(true_us) / 1_000
    }
}

/// Frames in flight: (src, dest or None for broadcast, bytes).
type Packet = (Mac, Option<Mac>, Vec<u8>);

struct Track {
    nodes: Vec<Node>,
    /// Message types the radio silently eats (lossy-link simulation).
    drop_types: Vec<MsgType>,
}

impl Track {
    fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            drop_types: Vec::new(),
        }
    }

    fn node(&self, mac: Mac) -> &Node {
        self.nodes.iter().find(|n| n.mac == mac).unwrap()
    }

    fn node_mut(&mut self, mac: Mac) -> &mut Node {
        self.nodes.iter_mut().find(|n| n.mac == mac).unwrap()
    }

    fn diag(state: &RoleCtl) -> BeaconDiag {
        let race_state = match state {
            RoleCtl::Start { state, .. } => state.load() as u8,
            RoleCtl::Finish { shared, .. } => shared.state.load() as u8,
            RoleCtl::Trap { .. } => 0,
        };
        BeaconDiag {
            uptime_min: 1,
            free_heap_kb: 180,
            rssi_dbm: -50,
            race_state,
            fw_major: 2,
            fw_minor: 3,
        }
    }

    /// Advance the whole installation to `true_us`: run every node's main
    /// loop once and deliver all queued frames (repeatedly, until quiet).
    fn tick(&mut self, true_us: u64) {
        let mut outbox: Vec<Packet> = Vec::new();

        for i in 0..self.nodes.len() {
            let node = &mut self.nodes[i];
            let now_ms = node.now_ms(true_us);
            let now_us = node.now_us(true_us);

            let effects = node
                .disc
                .poll(&node.ident, Self::diag(&node.ctl), now_ms, now_us);
            collect_effects(node.mac, effects, &mut outbox);

            let peer_online = node.reg.has_online_peer(now_ms);
            let actions = match &mut node.ctl {
                RoleCtl::Start {
                    gate,
                    state,
                    trigger,
                } => gate.poll(state, trigger, None, peer_online, &node.ident, now_ms, now_us),
                RoleCtl::Finish { gate, shared, sync } => {
                    gate.poll(shared, sync, peer_online, &node.ident, now_ms, now_us)
                }
                RoleCtl::Trap { trap, cells } => {
                    trap.poll(cells, peer_online, &node.ident, now_ms, now_us)
                }
            };
            self.execute_actions(i, actions, now_ms, &mut outbox);
        }

        // Drain the air until nothing new is queued.
        while !outbox.is_empty() {
            let mut next: Vec<Packet> = Vec::new();
            for (src, dest, bytes) in outbox {
                for i in 0..self.nodes.len() {
                    let mac = self.nodes[i].mac;
                    if mac == src || dest.is_some_and(|d| d != mac) {
                        continue;
                    }
                    self.receive(i, src, &bytes, true_us, &mut next);
                }
            }
            outbox = next;
        }
    }

    fn receive(
        &mut self,
        idx: usize,
        src: Mac,
        bytes: &[u8],
        true_us: u64,
        outbox: &mut Vec<Packet>,
    ) {
        let Some(race_timing::Frame::Control(frame)) = race_timing::Frame::decode(bytes) else {
            return;
        };
        if self.drop_types.contains(&frame.msg_type) {
            return;
        }

        let node = &mut self.nodes[idx];
        let now_ms = node.now_ms(true_us);
        let now_us = node.now_us(true_us);
        let rx_time_us = now_us;

        match frame.msg_type {
            MsgType::Beacon | MsgType::BeaconAck | MsgType::PairReq | MsgType::PairAck => {
                let effects = node.disc.handle_frame(
                    &mut node.reg,
                    &node.ident,
                    Self::diag(&node.ctl),
                    src,
                    &frame,
                    now_ms,
                    now_us,
                );
                collect_effects(node.mac, effects, outbox);
            }
            _ => {
                node.reg.note_heard(&src, now_ms);
                let actions = match &mut node.ctl {
                    RoleCtl::Start {
                        gate,
                        state,
                        trigger,
                    } => gate.handle_frame(state, trigger, src, &frame, &node.ident, now_us),
                    RoleCtl::Finish { gate, shared, sync } => gate.handle_frame(
                        shared,
                        sync,
                        src,
                        &frame,
                        &node.ident,
                        now_us,
                        rx_time_us,
                    ),
                    RoleCtl::Trap { trap, cells } => {
                        trap.handle_frame(cells, src, &frame, &node.ident, now_us)
                    }
                };
                self.execute_actions(idx, actions, now_ms, outbox);
            }
        }
    }

    fn execute_actions(
        &mut self,
        idx: usize,
        actions: Vec<GateAction>,
        now_ms: u64,
        outbox: &mut Vec<Packet>,
    ) {
        let mac = self.nodes[idx].mac;
        for action in actions {
            match action {
                GateAction::SendToRole(role, frame) => {
                    let dest = self.nodes[idx]
                        .reg
                        .find_by_role_online(role, now_ms)
                        .map(|p| p.mac);
                    if let Some(dest) = dest {
                        outbox.push((mac, Some(dest), frame.encode().to_vec()));
                    }
                }
                GateAction::SendToMac(dest, frame) => {
                    outbox.push((mac, Some(dest), frame.encode().to_vec()));
                }
                GateAction::PlayCue(cue) => self.nodes[idx].cues.push(cue),
                GateAction::LogRun(_) => self.nodes[idx].csv_rows += 1,
                GateAction::AttachTrigger
                | GateAction::DetachTrigger
                | GateAction::BroadcastState => {}
            }
        }
    }

    /// Run loops every millisecond of true time over `[from, to)`.
    fn run(&mut self, from_ms: u64, to_ms: u64) {
        for t in from_ms..to_ms {
            self.tick(t * 1_000);
        }
    }
}

fn collect_effects(src: Mac, effects: Vec<Effect>, outbox: &mut Vec<Packet>) {
    for e in effects {
        match e {
            Effect::SendTo(dest, frame) => outbox.push((src, Some(dest), frame.encode().to_vec())),
            Effect::Broadcast(frame) => outbox.push((src, None, frame.encode().to_vec())),
            Effect::RegisterPeer(_) | Effect::UnregisterPeer(_) | Effect::SavePeers => {}
        }
    }
}

fn start_node(clock_skew_us: i64) -> Node {
    Node {
        mac: START_MAC,
        ident: Identity {
            device_id: 1,
            role: Role::Start,
            hostname: "start-gate".into(),
        },
        clock_skew_us,
        disc: Discovery::new(),
        reg: PeerRegistry::new(),
        ctl: RoleCtl::Start {
            gate: StartGate::new(ArmingPipeline::new(false, None)),
            state: SharedRaceState::new(RaceState::Idle),
            trigger: TriggerLatch::new(),
        },
        cues: Vec::new(),
        csv_rows: 0,
    }
}

fn finish_node() -> Node {
    Node {
        mac: FINISH_MAC,
        ident: Identity {
            device_id: 2,
            role: Role::Finish,
            hostname: "finish-gate".into(),
        },
        clock_skew_us: 0,
        disc: Discovery::new(),
        reg: PeerRegistry::new(),
        ctl: RoleCtl::Finish {
            gate: FinishGate::new(2.0, 64),
            shared: TimingShared::new(),
            sync: ClockSync::new(),
        },
        cues: Vec::new(),
        csv_rows: 0,
    }
}

fn trap_node() -> Node {
    Node {
        mac: TRAP_MAC,
        ident: Identity {
            device_id: 3,
            role: Role::SpeedTrap,
            hostname: "speed-trap".into(),
        },
        clock_skew_us: 1_234,
        disc: Discovery::new(),
        reg: PeerRegistry::new(),
        ctl: RoleCtl::Trap {
            trap: SpeedTrap::new(0.10),
            cells: TrapCells::new(),
        },
        cues: Vec::new(),
        csv_rows: 0,
    }
}

fn paired(track: &Track, a: Mac, b: Mac) -> bool {
    let reg = &track.node(a).reg;
    reg.find_by_mac(&b)
        .and_then(|i| reg.get(i))
        .is_some_and(|p| p.paired)
}

#[test]
fn cold_boot_pairs_within_one_beacon_cycle() {
    let mut track = Track::new(vec![start_node(500), finish_node()]);
    track.run(0, 3_200);

    assert!(paired(&track, START_MAC, FINISH_MAC));
    assert!(paired(&track, FINISH_MAC, START_MAC));
    assert_eq!(track.node(START_MAC).reg.persisted().len(), 1);
    assert_eq!(track.node(FINISH_MAC).reg.persisted().len(), 1);
}

#[test]
fn happy_race_with_offset_clocks() {
    // Start gate's clock runs 500 µs ahead of the finish gate's.
    let mut track = Track::new(vec![start_node(500), finish_node()]);

    // Pair up and let a sync round complete (first sync fires once the
    // 30 s cadence elapses, but arming forces one immediately).
    track.run(0, 4_000);

    // Dashboard arms the installation at t = 4 s.
    {
        let true_us = 4_000 * 1_000;
        let node = track.node_mut(FINISH_MAC);
        let now_us = node.now_us(true_us);
        let actions = match &mut node.ctl {
            RoleCtl::Finish { gate, shared, sync } => gate.arm(shared, sync, &node.ident.clone(), now_us),
            _ => unreachable!(),
        };
        let mut outbox = Vec::new();
        let idx = track.nodes.iter().position(|n| n.mac == FINISH_MAC).unwrap();
        track.execute_actions(idx, actions, 4_000, &mut outbox);
        while !outbox.is_empty() {
            let mut next = Vec::new();
            for (src, dest, bytes) in outbox {
                for i in 0..track.nodes.len() {
                    let mac = track.nodes[i].mac;
                    if mac == src || dest.is_some_and(|d| d != mac) {
                        continue;
                    }
                    track.receive(i, src, &bytes, true_us, &mut next);
                }
            }
            outbox = next;
        }
    }
    // One loop pass so the forced resync request goes out and returns.
    track.run(4_001, 4_010);

    match &track.node(FINISH_MAC).ctl {
        RoleCtl::Finish { shared, sync, .. } => {
            assert_eq!(shared.state.load(), RaceState::Armed);
            assert_eq!(sync.offset_us(), 500, "offset settled from the sync round");
        }
        _ => unreachable!(),
    }
    match &track.node(START_MAC).ctl {
        RoleCtl::Start { state, .. } => assert_eq!(state.load(), RaceState::Armed),
        _ => unreachable!(),
    }

    // Beam breaks at the start gate at true t = 10 s (start clock reads
    // 10_000_500).
    {
        let node = track.node_mut(START_MAC);
        let ts = node.now_us(10_000_000);
        match &node.ctl {
            RoleCtl::Start { trigger, .. } => assert!(trigger.fire(ts)),
            _ => unreachable!(),
        }
    }
    track.run(10_001, 10_020);

    match &track.node(FINISH_MAC).ctl {
        RoleCtl::Finish { shared, .. } => {
            assert_eq!(shared.state.load(), RaceState::Racing);
            // 10_000_500 on the start clock − offset 500 = 10_000_000 local.
            assert_eq!(shared.start_time_us.load(), 10_000_000);
        }
        _ => unreachable!(),
    }

    // Car crosses the finish beam 533 ms later.
    {
        let node = track.node_mut(FINISH_MAC);
        let tf = node.now_us(10_533_000);
        match &node.ctl {
            RoleCtl::Finish { shared, .. } => assert!(shared.finish_trigger(tf)),
            _ => unreachable!(),
        }
    }
    track.run(10_534, 10_560);

    // Finish computed the race, logged CSV, confirmed to the start gate.
    let finish = track.node(FINISH_MAC);
    assert_eq!(finish.csv_rows, 1);
    assert!(finish.cues.contains(&Cue::Finish));
    match &finish.ctl {
        RoleCtl::Finish { gate, .. } => {
            let r = gate.last_result().unwrap();
            assert!(!r.timing_error);
            assert_eq!(r.elapsed_us, 533_000);
            assert!((r.speed_mph - 8.39).abs() < 0.01);
        }
        _ => unreachable!(),
    }
    match &track.node(START_MAC).ctl {
        RoleCtl::Start { state, .. } => assert_eq!(state.load(), RaceState::Finished),
        _ => unreachable!(),
    }

    // Start auto-resets after 2 s, finish after 5 s.
    track.run(10_560, 16_200);
    match &track.node(START_MAC).ctl {
        RoleCtl::Start { state, .. } => assert_eq!(state.load(), RaceState::Idle),
        _ => unreachable!(),
    }
    match &track.node(FINISH_MAC).ctl {
        RoleCtl::Finish { shared, .. } => {
            assert_eq!(shared.state.load(), RaceState::Idle);
            assert_eq!(shared.start_time_us.load(), 0);
            assert_eq!(shared.finish_time_us.load(), 0);
        }
        _ => unreachable!(),
    }
}

#[test]
fn lost_start_frame_times_out_both_sides() {
    let mut track = Track::new(vec![start_node(500), finish_node()]);
    track.run(0, 4_000);

    // Arm the start gate directly (keeps the test focused on the loss).
    {
        let node = track.node_mut(START_MAC);
        let ident = node.ident.clone();
        match &mut node.ctl {
            RoleCtl::Start {
                gate,
                state,
                trigger,
            } => {
                gate.arm(state, trigger, &ident, 0, false);
            }
            _ => unreachable!(),
        }
    }

    // The START frame evaporates on the air.
    track.drop_types = vec![MsgType::Start];

    {
        let node = track.node_mut(START_MAC);
        let ts = node.now_us(10_000_000);
        match &node.ctl {
            RoleCtl::Start { trigger, .. } => assert!(trigger.fire(ts)),
            _ => unreachable!(),
        }
    }
    track.run(10_001, 10_050);

    match &track.node(START_MAC).ctl {
        RoleCtl::Start { state, .. } => assert_eq!(state.load(), RaceState::Racing),
        _ => unreachable!(),
    }

    // 30 s later the start gate gives up; no CSV was ever written.
    track.run(10_050, 41_000);
    match &track.node(START_MAC).ctl {
        RoleCtl::Start { state, .. } => assert_eq!(state.load(), RaceState::Idle),
        _ => unreachable!(),
    }
    assert_eq!(track.node(FINISH_MAC).csv_rows, 0);
}

#[test]
fn speed_trap_measurement_reaches_finish_dashboard() {
    let mut track = Track::new(vec![finish_node(), trap_node()]);
    track.run(0, 3_500);
    assert!(paired(&track, TRAP_MAC, FINISH_MAC));

    // Car crosses both trap beams 20 ms apart (0.10 m spacing → 5 m/s).
    {
        let node = track.node_mut(TRAP_MAC);
        let t1 = node.now_us(5_000_000);
        let t2 = node.now_us(5_020_000);
        match &node.ctl {
            RoleCtl::Trap { cells, .. } => {
                cells.sensor1(t1);
                cells.sensor2(t2);
            }
            _ => unreachable!(),
        }
    }
    track.run(5_021, 5_060);

    let finish = track.node(FINISH_MAC);
    assert!(finish.cues.contains(&Cue::SpeedTrap));
    match &finish.ctl {
        RoleCtl::Finish { gate, .. } => {
            let reg = PeerRegistry::new();
            let shared = TimingShared::new();
            let snap = gate.snapshot(&shared, &reg, None, 0);
            let mid = snap.mid_track.expect("mid-track speed surfaced");
            assert!((mid.mps - 5.0).abs() < 1e-6);
        }
        _ => unreachable!(),
    }

    // The trap got its ACK and is ready for the next car.
    match &track.node(TRAP_MAC).ctl {
        RoleCtl::Trap { cells, .. } => assert_eq!(cells.times(), (0, 0)),
        _ => unreachable!(),
    }
}
