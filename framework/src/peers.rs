//! Registry of known peer devices.
//!
//! One row per MAC address, capped at [`MAX_PEERS`]. Rows are created when a
//! beacon or pairing frame is first heard from an unknown MAC, survive
//! reboots iff mutual pairing was confirmed, and leave only by explicit
//! forget or eviction when the table is full.
//!
//! The registry is task-only state: the radio RX callback and the main loop
//! mutate it, ISRs never touch it. Persistence is an array in `peers.json`
//! holding just the paired rows; restored rows report OFFLINE until the peer
//! is heard again this session.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::role::Role;
use crate::wire::BeaconDiag;

/// Hardware MAC address — the immutable primary key for a peer.
pub type Mac = [u8; 6];

/// Registry capacity. A timing installation is a handful of devices; eight
/// leaves room for spares and a telemetry car on the same table.
pub const MAX_PEERS: usize = 8;

/// Heard within this window → ONLINE.
pub const PEER_ONLINE_THRESH_MS: u64 = 15_000;
/// Heard within this window → STALE; beyond it → OFFLINE.
pub const PEER_STALE_THRESH_MS: u64 = 60_000;
/// Deferred-save debounce, limiting flash wear under pairing churn.
pub const PEER_SAVE_DEBOUNCE_MS: u64 = 2_000;

/// Derived liveness of a peer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Online,
    Stale,
    Offline,
}

impl PeerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Online => "online",
            PeerStatus::Stale => "stale",
            PeerStatus::Offline => "offline",
        }
    }
}

/// One known peer device.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub mac: Mac,
    pub role: Role,
    pub hostname: String,
    pub device_id: u8,
    /// Local uptime at last reception; 0 = never heard this session.
    pub last_seen_ms: u64,
    /// The radio layer has been told to accept unicast frames from this MAC.
    /// Once set it stays set until the row is evicted.
    pub registered: bool,
    /// Mutual pairing confirmed; only paired rows are persisted.
    pub paired: bool,
    /// Last-heard packed diagnostics from this peer's beacon.
    pub diag: Option<BeaconDiag>,
}

impl PeerRecord {
    /// Liveness from the age of the last reception.
    pub fn status(&self, now_ms: u64) -> PeerStatus {
        if self.last_seen_ms == 0 {
            return PeerStatus::Offline; // Restored from flash, never heard yet
        }
        let age = now_ms.saturating_sub(self.last_seen_ms);
        if age < PEER_ONLINE_THRESH_MS {
            PeerStatus::Online
        } else if age < PEER_STALE_THRESH_MS {
            PeerStatus::Stale
        } else {
            PeerStatus::Offline
        }
    }
}

/// The persisted shape of a paired row in `peers.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPeer {
    pub mac: String,
    pub role: Role,
    pub hostname: String,
    pub id: u8,
    pub paired: bool,
}

/// Why an upsert could not insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// Table full and every row is paired and not OFFLINE.
    Full,
}

/// The in-memory peer table.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self { peers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.iter()
    }

    pub fn find_by_mac(&self, mac: &Mac) -> Option<usize> {
        self.peers.iter().position(|p| &p.mac == mac)
    }

    pub fn get(&self, idx: usize) -> Option<&PeerRecord> {
        self.peers.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut PeerRecord> {
        self.peers.get_mut(idx)
    }

    /// First paired peer with the given role, preferring rows that are
    /// reachable (ONLINE or STALE) and falling back to any paired row so
    /// that boot-time sends still have a destination.
    pub fn find_by_role_online(&self, role: Role, now_ms: u64) -> Option<&PeerRecord> {
        self.peers
            .iter()
            .find(|p| {
                p.paired
                    && p.role == role
                    && matches!(p.status(now_ms), PeerStatus::Online | PeerStatus::Stale)
            })
            .or_else(|| self.peers.iter().find(|p| p.paired && p.role == role))
    }

    /// True when at least one paired peer is ONLINE.
    pub fn has_online_peer(&self, now_ms: u64) -> bool {
        self.peers
            .iter()
            .any(|p| p.paired && p.status(now_ms) == PeerStatus::Online)
    }

    /// Add or refresh a peer row. On an existing MAC the mutable identity
    /// fields are overwritten and `last_seen_ms` refreshed. On an unknown
    /// MAC with a full table, evict the oldest unpaired row, else the oldest
    /// OFFLINE row, else refuse.
    pub fn upsert(
        &mut self,
        mac: Mac,
        role: Role,
        hostname: &str,
        device_id: u8,
        now_ms: u64,
    ) -> Result<usize, RegistryError> {
        if let Some(idx) = self.find_by_mac(&mac) {
            let peer = &mut self.peers[idx];
            peer.role = role;
            peer.hostname = hostname.to_owned();
            peer.device_id = device_id;
            peer.last_seen_ms = now_ms;
            return Ok(idx);
        }

        if self.peers.len() >= MAX_PEERS {
            let evict = self
                .oldest_matching(|p| !p.paired)
                .or_else(|| self.oldest_matching(|p| p.status(now_ms) == PeerStatus::Offline));
            match evict {
                Some(idx) => {
                    let old = self.peers.remove(idx);
                    info!(
                        "[PEERS] Evicting {} ({}) to make room",
                        old.hostname,
                        old.role.as_str()
                    );
                }
                None => {
                    warn!("[PEERS] Registry full, cannot add peer");
                    return Err(RegistryError::Full);
                }
            }
        }

        self.peers.push(PeerRecord {
            mac,
            role,
            hostname: hostname.to_owned(),
            device_id,
            last_seen_ms: now_ms,
            registered: false,
            paired: false,
            diag: None,
        });
        info!(
            "[PEERS] New device: {} ({}) @ {}",
            hostname,
            role.as_str(),
            format_mac(&mac)
        );
        Ok(self.peers.len() - 1)
    }

    fn oldest_matching(&self, pred: impl Fn(&PeerRecord) -> bool) -> Option<usize> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, p)| pred(p))
            .min_by_key(|(_, p)| p.last_seen_ms)
            .map(|(idx, _)| idx)
    }

    /// Refresh liveness for any frame from a known MAC (pings, race
    /// traffic — anything implicitly marks the peer reachable).
    pub fn note_heard(&mut self, mac: &Mac, now_ms: u64) {
        if let Some(idx) = self.find_by_mac(mac) {
            self.peers[idx].last_seen_ms = now_ms;
        }
    }

    /// True when this MAC belongs to a paired `finish` peer — the only
    /// sender allowed to push remote commands or Wi-Fi credentials.
    pub fn is_authorized_controller(&self, mac: &Mac) -> bool {
        self.find_by_mac(mac)
            .map(|idx| {
                let p = &self.peers[idx];
                p.paired && p.role == Role::Finish
            })
            .unwrap_or(false)
    }

    /// Remove one peer. Returns the removed row so the caller can drop the
    /// radio registration.
    pub fn forget(&mut self, mac: &Mac) -> Option<PeerRecord> {
        let idx = self.find_by_mac(mac)?;
        let old = self.peers.remove(idx);
        info!(
            "[PEERS] Forgetting {} ({})",
            old.hostname,
            old.role.as_str()
        );
        Some(old)
    }

    /// Drop every row (factory reset of the pairing table).
    pub fn forget_all(&mut self) -> Vec<PeerRecord> {
        info!("[PEERS] Forgetting all {} peer(s)", self.peers.len());
        core::mem::take(&mut self.peers)
    }

    /// The subset written to `peers.json`: paired rows only.
    pub fn persisted(&self) -> Vec<PersistedPeer> {
        self.peers
            .iter()
            .filter(|p| p.paired)
            .map(|p| PersistedPeer {
                mac: format_mac(&p.mac),
                role: p.role,
                hostname: p.hostname.clone(),
                id: p.device_id,
                paired: true,
            })
            .collect()
    }

    /// Restore rows loaded from `peers.json`. Restored rows have never been
    /// heard this session, so they report OFFLINE and are not yet registered
    /// with the radio.
    pub fn restore(&mut self, saved: &[PersistedPeer]) {
        for entry in saved {
            if self.peers.len() >= MAX_PEERS {
                break;
            }
            let Some(mac) = parse_mac(&entry.mac) else {
                warn!("[PEERS] Skipping saved peer with bad MAC: {}", entry.mac);
                continue;
            };
            if self.find_by_mac(&mac).is_some() {
                continue;
            }
            self.peers.push(PeerRecord {
                mac,
                role: entry.role,
                hostname: entry.hostname.clone(),
                device_id: entry.id,
                last_seen_ms: 0,
                registered: false,
                paired: entry.paired,
                diag: None,
            });
            info!(
                "[PEERS] Restored: {} ({}) paired={}",
                entry.hostname,
                entry.role.as_str(),
                entry.paired
            );
        }
    }

    /// Honour a manually configured peer MAC from old configs: make sure a
    /// paired row exists for it. Compatibility shim, retirable once
    /// persistence is proven.
    pub fn adopt_manual_peer(&mut self, mac: Mac) -> Option<usize> {
        if mac == [0u8; 6] {
            return None;
        }
        let idx = match self.find_by_mac(&mac) {
            Some(idx) => idx,
            None => self.upsert(mac, Role::Unknown, "manual-peer", 0, 0).ok()?,
        };
        self.peers[idx].paired = true;
        info!("[PEERS] Legacy manual peer: {}", format_mac(&mac));
        Some(idx)
    }

    /// Status export for the dashboard: every row with derived status and
    /// last-seen age in whole seconds (-1 = never heard this session).
    pub fn status_json(&self, now_ms: u64) -> serde_json::Value {
        serde_json::Value::Array(
            self.peers
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "mac": format_mac(&p.mac),
                        "role": p.role.as_str(),
                        "hostname": p.hostname,
                        "id": p.device_id,
                        "paired": p.paired,
                        "status": p.status(now_ms).as_str(),
                        "lastSeen": if p.last_seen_ms > 0 {
                            (now_ms.saturating_sub(p.last_seen_ms) / 1000) as i64
                        } else {
                            -1
                        },
                    })
                })
                .collect(),
        )
    }
}

/// Format a MAC as `AA:BB:CC:DD:EE:FF`.
pub fn format_mac(mac: &Mac) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Parse `AA:BB:CC:DD:EE:FF` (case-insensitive) back into bytes.
pub fn parse_mac(s: &str) -> Option<Mac> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}
