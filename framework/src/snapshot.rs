//! Dashboard state snapshot and the external sink interface.
//!
//! The core publishes its world through one JSON snapshot and a handful of
//! named audio/LED cues; the HTTP/WebSocket dashboard, lighting and audio
//! back-ends live outside the core and consume these.

use serde::Serialize;

use crate::race::RaceResult;

/// Named cue played on state changes. The audio/LED back-end maps names to
/// whatever it has (WAV files, light shows); the core only names moments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Armed,
    Go,
    Finish,
    SpeedTrap,
    Record,
    Reset,
    Sync,
    Error,
}

impl Cue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cue::Armed => "armed",
            Cue::Go => "go",
            Cue::Finish => "finish",
            Cue::SpeedTrap => "speed_trap",
            Cue::Record => "record",
            Cue::Reset => "reset",
            Cue::Sync => "sync",
            Cue::Error => "error",
        }
    }
}

/// Where snapshots and cues go. The firmware wires this to the dashboard
/// broadcast and the audio player; tests capture them.
pub trait EventSink {
    fn broadcast_state(&mut self, snapshot: &StateSnapshot);
    fn play_cue(&mut self, cue: Cue);
}

/// LiDAR staging info included when the sensor is fitted.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LidarSnapshot {
    pub state: &'static str,
    pub distance_mm: u16,
}

/// Speed-trap info included once a mid-track measurement arrived.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct MidTrackSnapshot {
    #[serde(rename = "midTrack_mps")]
    pub mps: f64,
    #[serde(rename = "midTrack_mph")]
    pub mph: f64,
    #[serde(rename = "midTrack_scale_mph")]
    pub scale_mph: f64,
}

/// Timing result block, present only in FINISHED.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ResultSnapshot {
    pub time: f64,
    pub speed_mps: f64,
    pub speed_mph: f64,
    pub scale_mph: f64,
    pub momentum: f64,
    pub ke_j: f64,
    pub timing_error: bool,
}

impl ResultSnapshot {
    pub fn from_result(r: &RaceResult) -> Self {
        Self {
            time: r.time_s,
            speed_mps: r.speed_mps,
            speed_mph: r.speed_mph,
            scale_mph: r.scale_mph,
            momentum: r.momentum,
            ke_j: r.ke_j,
            timing_error: r.timing_error,
        }
    }
}

/// The full state snapshot pushed to the dashboard on every change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateSnapshot {
    pub state: &'static str,
    pub connected: bool,
    pub role: &'static str,
    pub car: String,
    pub weight: f32,
    #[serde(rename = "trackLength")]
    pub track_length: f64,
    #[serde(rename = "scaleFactor")]
    pub scale_factor: i32,
    #[serde(rename = "totalRuns")]
    pub total_runs: u32,
    #[serde(rename = "dryRun")]
    pub dry_run: bool,
    #[serde(rename = "peerCount")]
    pub peer_count: usize,
    #[serde(rename = "onlinePeers")]
    pub online_peers: usize,
    #[serde(flatten)]
    pub mid_track: Option<MidTrackSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lidar: Option<LidarSnapshot>,
    #[serde(flatten)]
    pub result: Option<ResultSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_serialises_dashboard_keys() {
        let snap = StateSnapshot {
            state: "FINISHED",
            connected: true,
            role: "finish",
            car: "Redline".into(),
            weight: 35.0,
            track_length: 2.0,
            scale_factor: 64,
            total_runs: 3,
            dry_run: false,
            peer_count: 2,
            online_peers: 1,
            mid_track: Some(MidTrackSnapshot {
                mps: 5.0,
                mph: 11.18,
                scale_mph: 715.8,
            }),
            lidar: None,
            result: Some(ResultSnapshot {
                time: 0.533,
                speed_mps: 3.7523,
                speed_mph: 8.39,
                scale_mph: 537.1,
                momentum: 0.1313,
                ke_j: 0.2464,
                timing_error: false,
            }),
        };

        let v: serde_json::Value = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["state"], "FINISHED");
        assert_eq!(v["trackLength"], 2.0);
        assert_eq!(v["midTrack_mps"], 5.0);
        assert_eq!(v["time"], 0.533);
        assert_eq!(v["timing_error"], false);
        assert!(v.get("lidar").is_none());
    }

    #[test]
    fn cue_names_match_sink_contract() {
        assert_eq!(Cue::Armed.as_str(), "armed");
        assert_eq!(Cue::SpeedTrap.as_str(), "speed_trap");
        assert_eq!(Cue::Error.as_str(), "error");
    }
}
