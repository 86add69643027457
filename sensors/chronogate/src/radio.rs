//! ESP-NOW radio wrapper.
//!
//! The link layer: lossy ≤250-byte datagrams, broadcast for beacons and
//! unicast for everything else. Why ESP-NOW and not BLE? It shares the
//! Wi-Fi radio with zero extra stack, carries a whole control frame in one
//! datagram, needs no connection ceremony, and delivers in well under a
//! millisecond — on a track timed in microseconds, that is the whole
//! argument.
//!
//! Send failures are logged and forgotten: the protocol layer treats every
//! frame as droppable and the peer-status timeouts absorb the losses.

use esp_idf_svc::espnow::{EspNow, PeerInfo, BROADCAST};
use log::{info, warn};
use race_timing::peers::format_mac;
use race_timing::Mac;

pub struct Radio {
    espnow: EspNow<'static>,
}

impl Radio {
    /// Take the ESP-NOW driver and register the broadcast peer. Wi-Fi must
    /// already be started in station mode.
    pub fn new() -> Result<Self, esp_idf_svc::sys::EspError> {
        let espnow = EspNow::take()?;
        espnow.add_peer(PeerInfo {
            peer_addr: BROADCAST,
            channel: 0,
            encrypt: false,
            ..Default::default()
        })?;
        info!("[RADIO] ESP-NOW up, broadcast peer registered");
        Ok(Self { espnow })
    }

    /// Register the receive callback. Runs on the Wi-Fi task; keep it
    /// lean — it decodes, updates the registry and dispatches, nothing
    /// blocking.
    pub fn set_receiver<F>(&mut self, mut callback: F) -> Result<(), esp_idf_svc::sys::EspError>
    where
        F: FnMut(Mac, &[u8]) + Send + 'static,
    {
        self.espnow.register_recv_cb(move |mac, data| {
            let mut src: Mac = [0; 6];
            if mac.len() == 6 {
                src.copy_from_slice(mac);
                callback(src, data);
            }
        })
    }

    /// Make sure a MAC is in the ESP-NOW peer table. Idempotent.
    pub fn ensure_peer(&self, mac: &Mac) {
        if self.espnow.peer_exists(*mac).unwrap_or(false) {
            return;
        }
        let result = self.espnow.add_peer(PeerInfo {
            peer_addr: *mac,
            channel: 0,
            encrypt: false,
            ..Default::default()
        });
        if let Err(e) = result {
            warn!("[RADIO] add_peer {} failed: {e}", format_mac(mac));
        }
    }

    pub fn remove_peer(&self, mac: &Mac) {
        if let Err(e) = self.espnow.del_peer(*mac) {
            warn!("[RADIO] del_peer {} failed: {e}", format_mac(mac));
        }
    }

    /// Unicast. Best-effort: a failure is logged and the frame is gone.
    pub fn send(&self, mac: &Mac, data: &[u8]) {
        if let Err(e) = self.espnow.send(*mac, data) {
            warn!("[RADIO] send to {} failed: {e}", format_mac(mac));
        }
    }

    /// Broadcast to everyone in range.
    pub fn broadcast(&self, data: &[u8]) {
        if let Err(e) = self.espnow.send(BROADCAST, data) {
            warn!("[RADIO] broadcast failed: {e}");
        }
    }
}
