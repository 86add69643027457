//! Brother's Six — continuous peer discovery and role-aware pairing.
//!
//! Every node broadcasts a beacon every three seconds, forever. Hearing a
//! beacon means: remember the sender, answer it directly, and — if our roles
//! belong together and we aren't paired yet — ask to pair. Pairing is
//! mutual: PAIR_REQ from a compatible role flips `paired` on the receiving
//! side and is answered with PAIR_ACK, which flips it on the requester.
//! Paired rows are persisted (debounced) so a reboot reconnects within one
//! beacon cycle.
//!
//! The engine is pure: frame handling and the periodic poll return
//! [`Effect`]s — radio sends, radio peer-table changes, persistence
//! requests — that the firmware executes. Beacons run forever by design:
//! devices power on in any order, a node that reboots mid-session re-pairs
//! in ~3 s, and the overhead is a 66-byte broadcast every 3 s.

use log::info;

use crate::clock::Cadence;
use crate::peers::{Mac, PeerRegistry, PEER_SAVE_DEBOUNCE_MS};
use crate::wire::{BeaconDiag, ControlFrame, Identity, MsgType, Payload};

/// Broadcast cadence for presence beacons.
pub const BEACON_INTERVAL_MS: u64 = 3_000;

/// Side effects requested by the discovery engine, executed by the firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Unicast a control frame to a specific MAC.
    SendTo(Mac, ControlFrame),
    /// Broadcast a control frame to everyone in range.
    Broadcast(ControlFrame),
    /// Tell the radio layer to accept unicast traffic from this MAC.
    RegisterPeer(Mac),
    /// Drop the radio registration for this MAC.
    UnregisterPeer(Mac),
    /// Write the paired subset of the registry to flash now.
    SavePeers,
}

/// The discovery/pairing protocol driver for one node.
#[derive(Debug, Default)]
pub struct Discovery {
    beacon: Cadence,
    save_due_ms: Option<u64>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for a deferred registry save; coalesced over the debounce window
    /// to limit flash wear when several pairings land together.
    pub fn request_save(&mut self, now_ms: u64) {
        self.save_due_ms = Some(now_ms + PEER_SAVE_DEBOUNCE_MS);
    }

    /// Periodic work: beacon broadcast and the deferred save. Call every
    /// main-loop iteration.
    pub fn poll(
        &mut self,
        ident: &Identity,
        diag: BeaconDiag,
        now_ms: u64,
        now_us: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.beacon.due(now_ms, BEACON_INTERVAL_MS) {
            effects.push(Effect::Broadcast(ident.frame(
                MsgType::Beacon,
                now_us,
                diag.pack() as i64,
            )));
        }

        if let Some(due) = self.save_due_ms {
            if now_ms > due {
                self.save_due_ms = None;
                effects.push(Effect::SavePeers);
            }
        }

        effects
    }

    /// Handle one received pairing-layer frame (BEACON, BEACON_ACK,
    /// PAIR_REQ, PAIR_ACK). Frames of any other type belong to the role
    /// handlers; route those through [`PeerRegistry::note_heard`] instead.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_frame(
        &mut self,
        registry: &mut PeerRegistry,
        ident: &Identity,
        diag: BeaconDiag,
        src: Mac,
        frame: &ControlFrame,
        now_ms: u64,
        now_us: u64,
    ) -> Vec<Effect> {
        match frame.msg_type {
            MsgType::Beacon => {
                let mut effects = self.absorb_sighting(registry, ident, src, frame, now_ms, now_us);
                // Answer directly so the sender learns we exist even when
                // its own beacon cadence is slow.
                effects.insert(
                    0,
                    Effect::SendTo(
                        src,
                        ident.frame(MsgType::BeaconAck, now_us, diag.pack() as i64),
                    ),
                );
                effects
            }
            MsgType::BeaconAck => self.absorb_sighting(registry, ident, src, frame, now_ms, now_us),
            MsgType::PairReq => {
                if !ident.role.compatible_with(frame.role) {
                    info!(
                        "[PEERS] Rejected pair: incompatible {} ({})",
                        frame.hostname,
                        frame.role.as_str()
                    );
                    return Vec::new();
                }

                let Ok(idx) =
                    registry.upsert(src, frame.role, &frame.hostname, frame.sender_id, now_ms)
                else {
                    return Vec::new();
                };

                let mut effects = Vec::new();
                let peer = registry.get_mut(idx).expect("row just upserted");
                if !peer.registered {
                    peer.registered = true;
                    effects.push(Effect::RegisterPeer(src));
                }
                if !peer.paired {
                    peer.paired = true;
                    info!(
                        "[PEERS] Paired with {} ({})",
                        frame.hostname,
                        frame.role.as_str()
                    );
                }
                effects.push(Effect::SendTo(src, ident.frame(MsgType::PairAck, now_us, 0)));
                self.request_save(now_ms);
                effects
            }
            MsgType::PairAck => {
                let Ok(idx) =
                    registry.upsert(src, frame.role, &frame.hostname, frame.sender_id, now_ms)
                else {
                    return Vec::new();
                };
                let mut effects = Vec::new();
                let peer = registry.get_mut(idx).expect("row just upserted");
                if !peer.registered {
                    peer.registered = true;
                    effects.push(Effect::RegisterPeer(src));
                }
                if !peer.paired {
                    peer.paired = true;
                    info!(
                        "[PEERS] Pair confirmed: {} ({})",
                        frame.hostname,
                        frame.role.as_str()
                    );
                    self.request_save(now_ms);
                }
                effects
            }
            _ => Vec::new(),
        }
    }

    /// Common path for BEACON/BEACON_ACK: refresh the row, capture the
    /// diagnostics payload, make sure the radio will talk to them, and
    /// initiate pairing if our roles belong together.
    fn absorb_sighting(
        &mut self,
        registry: &mut PeerRegistry,
        ident: &Identity,
        src: Mac,
        frame: &ControlFrame,
        now_ms: u64,
        now_us: u64,
    ) -> Vec<Effect> {
        let Ok(idx) = registry.upsert(src, frame.role, &frame.hostname, frame.sender_id, now_ms)
        else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        let peer = registry.get_mut(idx).expect("row just upserted");
        if let Payload::Diagnostics(d) = frame.payload() {
            peer.diag = Some(d);
        }
        if !peer.registered {
            peer.registered = true;
            effects.push(Effect::RegisterPeer(src));
        }
        if !peer.paired && ident.role.compatible_with(frame.role) {
            info!(
                "[PEERS] Compatible: {} ({}) — requesting pair",
                frame.hostname,
                frame.role.as_str()
            );
            effects.push(Effect::SendTo(src, ident.frame(MsgType::PairReq, now_us, 0)));
        }
        effects
    }

    /// Explicitly drop one peer: remove the row, the radio registration, and
    /// persist immediately (a forget is a deliberate act, not churn).
    pub fn forget_peer(&mut self, registry: &mut PeerRegistry, mac: &Mac) -> Vec<Effect> {
        match registry.forget(mac) {
            Some(_) => vec![Effect::UnregisterPeer(*mac), Effect::SavePeers],
            None => Vec::new(),
        }
    }

    /// Factory-reset the pairing table.
    pub fn forget_all(&mut self, registry: &mut PeerRegistry) -> Vec<Effect> {
        let removed = registry.forget_all();
        let mut effects: Vec<Effect> = removed
            .iter()
            .map(|p| Effect::UnregisterPeer(p.mac))
            .collect();
        effects.push(Effect::SavePeers);
        self.save_due_ms = None;
        effects
    }
}
