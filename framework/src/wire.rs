//! Wire frame codec for the gate-to-gate datagram link.
//!
//! The link layer is a vendor broadcast/unicast radio with ≤250-byte lossy
//! datagrams; everything here is plain little-endian packing with no
//! allocation on the encode path. The codec is pure: it never touches global
//! state and never logs — malformed or mis-sized frames simply decode to
//! `None` and are dropped by the caller.
//!
//! Control frames share one 66-byte record. The 8-byte `value` field is
//! historically overloaded (clock offset, fixed-point speed, packed
//! diagnostics, sample count); the overload stays on the wire for
//! compactness but is only ever read through [`ControlFrame::payload`],
//! which tags the meaning by message type.

use crate::role::Role;

/// Fixed-point scale for speeds carried in the `value` field.
pub const SPEED_FIXED_POINT_SCALE: f64 = 10_000.0;

/// IMU samples packed into one telemetry chunk.
pub const TELEM_SAMPLES_PER_CHUNK: usize = 14;

pub const CONTROL_FRAME_LEN: usize = 66;
pub const TELEM_HEADER_LEN: usize = 23;
pub const TELEM_CHUNK_LEN: usize = 8 + TELEM_SAMPLES_PER_CHUNK * IMU_SAMPLE_LEN;
pub const TELEM_END_LEN: usize = 9;
pub const WIFI_CONFIG_LEN: usize = 116;
pub const REMOTE_CMD_LEN: usize = 24;
pub const IMU_SAMPLE_LEN: usize = 16;

const ROLE_FIELD_LEN: usize = 16;
const HOSTNAME_FIELD_LEN: usize = 32;

/// Message types, one byte on the wire. Unknown values are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Ping = 0,
    Start = 1,
    Confirm = 2,
    Pong = 3,
    SyncReq = 4,
    Offset = 5,
    ArmCmd = 6,
    DisarmCmd = 7,
    Beacon = 8,
    BeaconAck = 9,
    SpeedData = 10,
    SpeedAck = 11,
    PairReq = 12,
    PairAck = 13,
    TelemHeader = 14,
    TelemChunk = 15,
    TelemEnd = 16,
    TelemAck = 17,
    WifiConfig = 18,
    RemoteCmd = 19,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<MsgType> {
        Some(match v {
            0 => MsgType::Ping,
            1 => MsgType::Start,
            2 => MsgType::Confirm,
            3 => MsgType::Pong,
            4 => MsgType::SyncReq,
            5 => MsgType::Offset,
            6 => MsgType::ArmCmd,
            7 => MsgType::DisarmCmd,
            8 => MsgType::Beacon,
            9 => MsgType::BeaconAck,
            10 => MsgType::SpeedData,
            11 => MsgType::SpeedAck,
            12 => MsgType::PairReq,
            13 => MsgType::PairAck,
            14 => MsgType::TelemHeader,
            15 => MsgType::TelemChunk,
            16 => MsgType::TelemEnd,
            17 => MsgType::TelemAck,
            18 => MsgType::WifiConfig,
            19 => MsgType::RemoteCmd,
            _ => return None,
        })
    }
}

/// Our own identity, stamped into every frame we originate.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: u8,
    pub role: Role,
    pub hostname: String,
}

impl Identity {
    /// Build a control frame carrying this identity.
    pub fn frame(&self, msg_type: MsgType, timestamp_us: u64, value: i64) -> ControlFrame {
        ControlFrame {
            msg_type,
            sender_id: self.device_id,
            timestamp_us,
            value,
            role: self.role,
            hostname: self.hostname.clone(),
        }
    }
}

/// The decoded meaning of the overloaded `value` field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Empty,
    /// Beacons carry packed live diagnostics.
    Diagnostics(BeaconDiag),
    /// Speed trap measurements, fixed-point decoded to m/s.
    SpeedMps(f64),
    /// Telemetry acknowledgements carry the received sample count.
    SampleCount(u16),
}

/// The common 66-byte control record.
///
/// `timestamp_us` is always the sender's own monotonic clock; the two clocks
/// are only comparable through the finish gate's running offset.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFrame {
    pub msg_type: MsgType,
    pub sender_id: u8,
    pub timestamp_us: u64,
    pub value: i64,
    pub role: Role,
    pub hostname: String,
}

impl ControlFrame {
    pub fn encode(&self) -> [u8; CONTROL_FRAME_LEN] {
        let mut buf = [0u8; CONTROL_FRAME_LEN];
        buf[0] = self.msg_type as u8;
        buf[1] = self.sender_id;
        buf[2..10].copy_from_slice(&self.timestamp_us.to_le_bytes());
        buf[10..18].copy_from_slice(&self.value.to_le_bytes());
        put_str(&mut buf[18..18 + ROLE_FIELD_LEN], self.role.as_str());
        put_str(&mut buf[34..34 + HOSTNAME_FIELD_LEN], &self.hostname);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<ControlFrame> {
        if buf.len() != CONTROL_FRAME_LEN {
            return None;
        }
        let msg_type = MsgType::from_u8(buf[0])?;
        Some(ControlFrame {
            msg_type,
            sender_id: buf[1],
            timestamp_us: u64::from_le_bytes(buf[2..10].try_into().ok()?),
            value: i64::from_le_bytes(buf[10..18].try_into().ok()?),
            role: Role::parse(&read_str(&buf[18..18 + ROLE_FIELD_LEN])),
            hostname: read_str(&buf[34..34 + HOSTNAME_FIELD_LEN]),
        })
    }

    /// Decode the overloaded `value` field by message type.
    pub fn payload(&self) -> Payload {
        match self.msg_type {
            MsgType::Beacon | MsgType::BeaconAck => {
                Payload::Diagnostics(BeaconDiag::unpack(self.value as u64))
            }
            MsgType::SpeedData => Payload::SpeedMps(self.value as f64 / SPEED_FIXED_POINT_SCALE),
            MsgType::TelemAck => Payload::SampleCount(self.value as u16),
            _ => Payload::Empty,
        }
    }

    /// Encode a speed measurement for a `SPEED_DATA` frame.
    pub fn encode_speed(speed_mps: f64) -> i64 {
        (speed_mps * SPEED_FIXED_POINT_SCALE).round() as i64
    }
}

/// Live diagnostics packed into the beacon `value` field.
///
/// Layout, from the most significant bit:
/// `[uptime_min:16 | free_heap_kb:16 | rssi+128:8 | race_state:8 | fw_major:8 | fw_minor:8]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeaconDiag {
    pub uptime_min: u16,
    pub free_heap_kb: u16,
    /// Signed dBm; mapped into an unsigned byte on the wire.
    pub rssi_dbm: i8,
    pub race_state: u8,
    pub fw_major: u8,
    pub fw_minor: u8,
}

impl BeaconDiag {
    pub fn pack(&self) -> u64 {
        ((self.uptime_min as u64) << 48)
            | ((self.free_heap_kb as u64) << 32)
            | ((((self.rssi_dbm as i16) + 128) as u64 & 0xFF) << 24)
            | ((self.race_state as u64) << 16)
            | ((self.fw_major as u64) << 8)
            | (self.fw_minor as u64)
    }

    pub fn unpack(v: u64) -> BeaconDiag {
        BeaconDiag {
            uptime_min: (v >> 48) as u16,
            free_heap_kb: (v >> 32) as u16,
            rssi_dbm: (((v >> 24) & 0xFF) as i16 - 128) as i8,
            race_state: (v >> 16) as u8,
            fw_major: (v >> 8) as u8,
            fw_minor: v as u8,
        }
    }
}

/// One IMU sample inside a telemetry chunk: timestamp plus raw accel/gyro
/// counts. Unit conversion happens at CSV export, not on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImuSample {
    pub t_us: u32,
    pub ax: i16,
    pub ay: i16,
    pub az: i16,
    pub gx: i16,
    pub gy: i16,
    pub gz: i16,
}

impl ImuSample {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.t_us.to_le_bytes());
        buf[4..6].copy_from_slice(&self.ax.to_le_bytes());
        buf[6..8].copy_from_slice(&self.ay.to_le_bytes());
        buf[8..10].copy_from_slice(&self.az.to_le_bytes());
        buf[10..12].copy_from_slice(&self.gx.to_le_bytes());
        buf[12..14].copy_from_slice(&self.gy.to_le_bytes());
        buf[14..16].copy_from_slice(&self.gz.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> ImuSample {
        ImuSample {
            t_us: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            ax: i16::from_le_bytes(buf[4..6].try_into().unwrap()),
            ay: i16::from_le_bytes(buf[6..8].try_into().unwrap()),
            az: i16::from_le_bytes(buf[8..10].try_into().unwrap()),
            gx: i16::from_le_bytes(buf[10..12].try_into().unwrap()),
            gy: i16::from_le_bytes(buf[12..14].try_into().unwrap()),
            gz: i16::from_le_bytes(buf[14..16].try_into().unwrap()),
        }
    }

    /// Raw bytes as they sit in the receive buffer; the end-marker CRC runs
    /// over this representation.
    pub fn to_bytes(&self) -> [u8; IMU_SAMPLE_LEN] {
        let mut b = [0u8; IMU_SAMPLE_LEN];
        self.encode_into(&mut b);
        b
    }
}

/// Telemetry run header: announces a run and sizes the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemHeader {
    pub run_id: u32,
    pub sample_count: u16,
    pub sample_rate: u16,
    pub accel_range: u8,
    pub gyro_range_div100: u8,
    pub duration_ms: u32,
    pub start_ts: u64,
}

impl TelemHeader {
    pub fn encode(&self) -> [u8; TELEM_HEADER_LEN] {
        let mut buf = [0u8; TELEM_HEADER_LEN];
        buf[0] = MsgType::TelemHeader as u8;
        buf[1..5].copy_from_slice(&self.run_id.to_le_bytes());
        buf[5..7].copy_from_slice(&self.sample_count.to_le_bytes());
        buf[7..9].copy_from_slice(&self.sample_rate.to_le_bytes());
        buf[9] = self.accel_range;
        buf[10] = self.gyro_range_div100;
        buf[11..15].copy_from_slice(&self.duration_ms.to_le_bytes());
        buf[15..23].copy_from_slice(&self.start_ts.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> TelemHeader {
        TelemHeader {
            run_id: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
            sample_count: u16::from_le_bytes(buf[5..7].try_into().unwrap()),
            sample_rate: u16::from_le_bytes(buf[7..9].try_into().unwrap()),
            accel_range: buf[9],
            gyro_range_div100: buf[10],
            duration_ms: u32::from_le_bytes(buf[11..15].try_into().unwrap()),
            start_ts: u64::from_le_bytes(buf[15..23].try_into().unwrap()),
        }
    }
}

/// One chunk of up to 14 IMU samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemChunk {
    pub chunk_index: u8,
    pub total_chunks: u8,
    pub samples_in_chunk: u8,
    pub run_id: u32,
    pub samples: [ImuSample; TELEM_SAMPLES_PER_CHUNK],
}

impl TelemChunk {
    pub fn encode(&self) -> [u8; TELEM_CHUNK_LEN] {
        let mut buf = [0u8; TELEM_CHUNK_LEN];
        buf[0] = MsgType::TelemChunk as u8;
        buf[1] = self.chunk_index;
        buf[2] = self.total_chunks;
        buf[3] = self.samples_in_chunk;
        buf[4..8].copy_from_slice(&self.run_id.to_le_bytes());
        for (i, s) in self.samples.iter().enumerate() {
            let at = 8 + i * IMU_SAMPLE_LEN;
            s.encode_into(&mut buf[at..at + IMU_SAMPLE_LEN]);
        }
        buf
    }

    fn decode(buf: &[u8]) -> TelemChunk {
        let mut samples = [ImuSample::default(); TELEM_SAMPLES_PER_CHUNK];
        for (i, s) in samples.iter_mut().enumerate() {
            let at = 8 + i * IMU_SAMPLE_LEN;
            *s = ImuSample::decode(&buf[at..at + IMU_SAMPLE_LEN]);
        }
        TelemChunk {
            chunk_index: buf[1],
            total_chunks: buf[2],
            samples_in_chunk: buf[3],
            run_id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            samples,
        }
    }
}

/// Telemetry end marker: declared sample count plus a CRC-16 over the
/// reassembled sample bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemEnd {
    pub run_id: u32,
    pub sample_count: u16,
    pub checksum: u16,
}

impl TelemEnd {
    pub fn encode(&self) -> [u8; TELEM_END_LEN] {
        let mut buf = [0u8; TELEM_END_LEN];
        buf[0] = MsgType::TelemEnd as u8;
        buf[1..5].copy_from_slice(&self.run_id.to_le_bytes());
        buf[5..7].copy_from_slice(&self.sample_count.to_le_bytes());
        buf[7..9].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> TelemEnd {
        TelemEnd {
            run_id: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
            sample_count: u16::from_le_bytes(buf[5..7].try_into().unwrap()),
            checksum: u16::from_le_bytes(buf[7..9].try_into().unwrap()),
        }
    }
}

/// Wi-Fi provisioning pushed from the finish gate. The core only validates
/// and surfaces it; applying credentials belongs to the setup layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiConfig {
    pub ssid: String,
    pub pass: String,
    pub sender_role: Role,
}

impl WifiConfig {
    pub fn encode(&self) -> [u8; WIFI_CONFIG_LEN] {
        let mut buf = [0u8; WIFI_CONFIG_LEN];
        buf[0] = MsgType::WifiConfig as u8;
        put_str(&mut buf[1..34], &self.ssid);
        put_str(&mut buf[34..99], &self.pass);
        put_str(&mut buf[99..115], self.sender_role.as_str());
        buf
    }

    fn decode(buf: &[u8]) -> WifiConfig {
        WifiConfig {
            ssid: read_str(&buf[1..34]),
            pass: read_str(&buf[34..99]),
            sender_role: Role::parse(&read_str(&buf[99..115])),
        }
    }
}

/// Remote commands pushed from the finish gate's dashboard to downstream
/// nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Arm,
    Disarm,
    Reset,
    SetDryRun,
    ForgetPeers,
    Reboot,
}

impl RemoteCommand {
    pub fn as_u8(&self) -> u8 {
        match self {
            RemoteCommand::Arm => 1,
            RemoteCommand::Disarm => 2,
            RemoteCommand::Reset => 3,
            RemoteCommand::SetDryRun => 4,
            RemoteCommand::ForgetPeers => 5,
            RemoteCommand::Reboot => 6,
        }
    }

    pub fn from_u8(v: u8) -> Option<RemoteCommand> {
        Some(match v {
            1 => RemoteCommand::Arm,
            2 => RemoteCommand::Disarm,
            3 => RemoteCommand::Reset,
            4 => RemoteCommand::SetDryRun,
            5 => RemoteCommand::ForgetPeers,
            6 => RemoteCommand::Reboot,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCmd {
    pub command: RemoteCommand,
    pub param: u32,
    pub sender_role: Role,
}

impl RemoteCmd {
    pub fn encode(&self) -> [u8; REMOTE_CMD_LEN] {
        let mut buf = [0u8; REMOTE_CMD_LEN];
        buf[0] = MsgType::RemoteCmd as u8;
        buf[1] = self.command.as_u8();
        buf[2..6].copy_from_slice(&self.param.to_le_bytes());
        put_str(&mut buf[6..22], self.sender_role.as_str());
        buf
    }

    fn decode(buf: &[u8]) -> Option<RemoteCmd> {
        Some(RemoteCmd {
            command: RemoteCommand::from_u8(buf[1])?,
            param: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            sender_role: Role::parse(&read_str(&buf[6..22])),
        })
    }
}

/// Any decodable frame, dispatched by the first byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    TelemHeader(TelemHeader),
    TelemChunk(Box<TelemChunk>),
    TelemEnd(TelemEnd),
    WifiConfig(WifiConfig),
    RemoteCmd(RemoteCmd),
}

impl Frame {
    /// Decode a received datagram. Unknown types and size mismatches yield
    /// `None` — dropped silently, per the failure contract.
    pub fn decode(buf: &[u8]) -> Option<Frame> {
        let msg_type = MsgType::from_u8(*buf.first()?)?;
        match msg_type {
            MsgType::TelemHeader => {
                (buf.len() == TELEM_HEADER_LEN).then(|| Frame::TelemHeader(TelemHeader::decode(buf)))
            }
            MsgType::TelemChunk => (buf.len() == TELEM_CHUNK_LEN)
                .then(|| Frame::TelemChunk(Box::new(TelemChunk::decode(buf)))),
            MsgType::TelemEnd => {
                (buf.len() == TELEM_END_LEN).then(|| Frame::TelemEnd(TelemEnd::decode(buf)))
            }
            MsgType::WifiConfig => {
                (buf.len() == WIFI_CONFIG_LEN).then(|| Frame::WifiConfig(WifiConfig::decode(buf)))
            }
            MsgType::RemoteCmd => {
                if buf.len() != REMOTE_CMD_LEN {
                    return None;
                }
                Some(Frame::RemoteCmd(RemoteCmd::decode(buf)?))
            }
            _ => ControlFrame::decode(buf).map(Frame::Control),
        }
    }
}

/// CRC-16 over telemetry sample bytes: polynomial 0xA001 (reflected),
/// initial value 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Copy a string into a NUL-padded fixed field, truncating to fit and
/// always leaving a terminating NUL.
fn put_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
}

/// Read a NUL-padded fixed field back into a string, dropping anything that
/// is not valid UTF-8.
fn read_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}
