//! Cue playback and the dashboard event sink.
//!
//! Cues go to a DY-SV5W-style UART audio module when one is wired; state
//! snapshots go to the log, where the (out-of-core) dashboard layer picks
//! them up. Both are fire-and-forget: a missing speaker or an unreadable
//! WAV must never stall a race.

use esp_idf_hal::uart::UartDriver;
use log::{info, warn};

use race_timing::{Cue, EventSink, StateSnapshot};

/// DY-SV5W "play track by number" command: `AA 07 02 HH LL SM`, where SM
/// is the low byte of the sum of the preceding bytes.
fn play_track_cmd(track: u16) -> [u8; 6] {
    let mut cmd = [0xAA, 0x07, 0x02, (track >> 8) as u8, track as u8, 0];
    cmd[5] = cmd[..5].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    cmd
}

/// Track numbers on the SD card, one per cue name.
fn track_for(cue: Cue) -> u16 {
    match cue {
        Cue::Armed => 1,
        Cue::Go => 2,
        Cue::Finish => 3,
        Cue::SpeedTrap => 4,
        Cue::Record => 5,
        Cue::Reset => 6,
        Cue::Sync => 7,
        Cue::Error => 8,
    }
}

/// UART audio player.
pub struct CuePlayer {
    uart: UartDriver<'static>,
}

impl CuePlayer {
    pub fn new(uart: UartDriver<'static>) -> Self {
        Self { uart }
    }

    pub fn play(&mut self, cue: Cue) {
        let cmd = play_track_cmd(track_for(cue));
        if let Err(e) = self.uart.write(&cmd) {
            warn!("[AUDIO] cue '{}' failed: {e}", cue.as_str());
        }
    }
}

/// The node's event sink: snapshots to the dashboard layer, cues to the
/// speaker.
pub struct DashboardSink {
    audio: Option<CuePlayer>,
}

impl DashboardSink {
    pub fn new(audio: Option<CuePlayer>) -> Self {
        Self { audio }
    }
}

impl EventSink for DashboardSink {
    fn broadcast_state(&mut self, snapshot: &StateSnapshot) {
        match serde_json::to_string(snapshot) {
            Ok(json) => info!("[STATE] {json}"),
            Err(e) => warn!("[STATE] snapshot serialise failed: {e}"),
        }
    }

    fn play_cue(&mut self, cue: Cue) {
        info!("[CUE] {}", cue.as_str());
        if let Some(audio) = self.audio.as_mut() {
            audio.play(cue);
        }
    }
}
