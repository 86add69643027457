//! Chronogate Race-Timing Framework
//!
//! The real-time coordination engine behind a distributed race-timing
//! installation for die-cast car tracks: a start gate, a finish gate and an
//! optional speed trap, each a role-specialised build of the same firmware,
//! cooperating over a lossy 2.4 GHz datagram link.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Role controllers (start / finish / trap)   │
//! ├─────────────────────────────────────────────┤
//! │  Discovery & pairing · Clock sync · Peers   │
//! ├─────────────────────────────────────────────┤
//! │  Wire codec · Timing cells · Arm sources    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Everything in this crate is pure with respect to time and I/O: ISRs write
//! into [`clock::TimingCell`]s, the radio receive path calls the
//! `handle_frame` methods, and the cooperative main loop calls the `poll`
//! methods — both return lists of actions (frames to send, cues to play,
//! rows to log) that the firmware executes. No module reads a clock or
//! touches a socket; timestamps are always passed in. That is what makes the
//! whole engine testable on the host.
//!
//! ## Concurrency contract
//!
//! Three execution contexts share state:
//!
//! - hardware ISRs touch only [`clock::TimingCell`] / [`race::SharedRaceState`]
//!   atomics (no allocation, no logging, no radio),
//! - the radio RX callback runs `handle_frame` to completion,
//! - the main loop runs `poll` and owns persistence.
//!
//! 64-bit timestamp cells use sequentially-consistent atomics; on 32-bit
//! targets without native 64-bit atomics these lower to the platform
//! critical section, which is exactly the discipline the torn-read hazard
//! requires.
//!
//! ## Modules
//!
//! - [`wire`] — frame codec for the datagram link
//! - [`peers`] — bounded registry of known peers with status and persistence
//! - [`discovery`] — the Brother's Six beacon/pairing protocol
//! - [`sync`] — two-way clock-offset estimation between gates
//! - [`start_gate`], [`finish_gate`], [`speed_trap`] — role state machines
//! - [`arming`] — beam / LiDAR / reflectance arm sources with the re-arm
//!   interlock
//! - [`telemetry`] — chunked IMU run reassembly
//! - [`snapshot`] — dashboard state snapshot and cue sink interface
//! - [`config`] — persisted device configuration

pub mod arming;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod finish_gate;
pub mod peers;
pub mod race;
pub mod role;
pub mod snapshot;
pub mod speed_trap;
pub mod start_gate;
pub mod sync;
pub mod telemetry;
pub mod wire;

pub use clock::{Cadence, TimingCell, TriggerLatch};
pub use peers::{Mac, PeerRegistry, PeerStatus};
pub use race::{GateAction, RaceState, SharedRaceState, TimingShared};
pub use role::Role;
pub use snapshot::{Cue, EventSink, StateSnapshot};
pub use wire::{ControlFrame, Frame, Identity, MsgType};
