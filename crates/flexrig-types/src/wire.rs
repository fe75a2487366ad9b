//! Vendor wire protocol: command frames and streaming packets.
//!
//! All multi-byte fields are little-endian. Command frames travel on the
//! Command characteristic (write out, notification back); streaming
//! packets arrive as notifications on the Data characteristic.
//!
//! # Command frame
//!
//! ```text
//! [cmd_id: u8][length: u8][payload: length bytes]
//! ```
//!
//! Responses echo the originating `cmd_id`, which combined with the
//! single-outstanding-command discipline makes correlation unambiguous.
//!
//! # Streaming packets
//!
//! ```text
//! header (8 B): [kind: u8][flags: u8][seq: u16][timestamp_ms: u32]
//! quaternion (16 B): header + [qw: i16][qx: i16][qy: i16][qz: i16]
//! accelerometer (14 B): header + [ax: i16][ay: i16][az: i16]
//! ```

use crate::error::{ParseError, ParseResult};
use crate::quat::Quaternion;
use crate::types::FirmwareState;

/// Fixed-point scale for quaternion components (Q14: 1.0 == 16384).
pub const QUATERNION_SCALE: f64 = 1.0 / 16384.0;

/// Accelerometer scale at the ±4 g full-scale setting: 0.122 mg/LSB.
pub const ACCEL_SCALE_4G: f64 = 0.000122;

/// Streaming packet header length.
pub const PACKET_HEADER_LEN: usize = 8;

/// Total quaternion packet length.
pub const QUATERNION_PACKET_LEN: usize = PACKET_HEADER_LEN + 8;

/// Total accelerometer packet length.
pub const ACCEL_PACKET_LEN: usize = PACKET_HEADER_LEN + 6;

/// Packet kind byte for quaternion packets.
pub const PACKET_KIND_QUATERNION: u8 = 0x01;

/// Packet kind byte for accelerometer packets.
pub const PACKET_KIND_ACCEL: u8 = 0x02;

/// Stream mode selector carried in `SET_STATE` payloads.
pub const STREAM_MODE_QUATERNION: u8 = 0x01;

/// Commands understood by the sensor firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    /// Query the firmware operating state.
    GetState = 0x01,
    /// Transition the firmware state, optionally with mode and rate.
    SetState = 0x02,
    /// Force the firmware back to idle regardless of current state.
    ResetToIdle = 0x03,
    /// Query the battery percentage.
    GetBattery = 0x04,
    /// Read the device-clock millisecond counter.
    TimesyncReadClock = 0x05,
    /// Switch to the accelerometer stream (locate feature).
    AccelStream = 0x06,
}

impl CommandId {
    /// Decode a raw command id byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(CommandId::GetState),
            0x02 => Some(CommandId::SetState),
            0x03 => Some(CommandId::ResetToIdle),
            0x04 => Some(CommandId::GetBattery),
            0x05 => Some(CommandId::TimesyncReadClock),
            0x06 => Some(CommandId::AccelStream),
            _ => None,
        }
    }
}

/// A decoded command frame (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// The command this frame belongs to.
    pub command: CommandId,
    /// Frame payload.
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Build a frame with a payload.
    pub fn new(command: CommandId, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Build a payload-less frame.
    pub fn bare(command: CommandId) -> Self {
        Self::new(command, Vec::new())
    }

    /// Build the `SET_STATE` frame for a plain state change.
    pub fn set_state(state: FirmwareState) -> Self {
        Self::new(CommandId::SetState, vec![state as u8])
    }

    /// Build the `SET_STATE` frame that starts a stream.
    ///
    /// `mode` selects the stream payload (quaternion for capture) and
    /// `freq_hz` the sample rate, 100 Hz for the capture pipeline.
    pub fn set_state_streaming(state: FirmwareState, mode: u8, freq_hz: u8) -> Self {
        Self::new(CommandId::SetState, vec![state as u8, mode, freq_hz])
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.payload.len());
        out.push(self.command as u8);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a frame from wire bytes.
    pub fn decode(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() < 2 {
            return Err(ParseError::insufficient(2, bytes.len()));
        }
        let command =
            CommandId::from_u8(bytes[0]).ok_or(ParseError::UnknownCommand(bytes[0]))?;
        let length = bytes[1] as usize;
        if bytes.len() < 2 + length {
            return Err(ParseError::insufficient(2 + length, bytes.len()));
        }
        Ok(Self {
            command,
            payload: bytes[2..2 + length].to_vec(),
        })
    }

    /// Interpret the payload as a `GET_STATE` response.
    pub fn as_firmware_state(&self) -> ParseResult<FirmwareState> {
        let byte = *self
            .payload
            .first()
            .ok_or(ParseError::insufficient(1, 0))?;
        FirmwareState::from_u8(byte)
            .ok_or_else(|| ParseError::InvalidValue(format!("firmware state 0x{byte:02X}")))
    }

    /// Interpret the payload as a `GET_BATTERY` response.
    pub fn as_battery_pct(&self) -> ParseResult<u8> {
        let pct = *self
            .payload
            .first()
            .ok_or(ParseError::insufficient(1, 0))?;
        if pct > 100 {
            return Err(ParseError::InvalidValue(format!("battery {pct}%")));
        }
        Ok(pct)
    }

    /// Interpret the payload as a `TIMESYNC_READ_CLOCK` response.
    pub fn as_device_clock_ms(&self) -> ParseResult<u64> {
        let bytes: [u8; 8] = self
            .payload
            .get(..8)
            .ok_or(ParseError::insufficient(8, self.payload.len()))?
            .try_into()
            .expect("slice length checked");
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Decoded streaming packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet kind byte.
    pub kind: u8,
    /// Vendor flags, currently unused by the host.
    pub flags: u8,
    /// Monotonic per-stream sequence counter.
    pub seq: u16,
    /// Device-clock timestamp in milliseconds.
    pub timestamp_ms: u32,
}

impl PacketHeader {
    /// Decode the 8-byte header.
    pub fn decode(bytes: &[u8]) -> ParseResult<Self> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(ParseError::insufficient(PACKET_HEADER_LEN, bytes.len()));
        }
        Ok(Self {
            kind: bytes[0],
            flags: bytes[1],
            seq: u16::from_le_bytes([bytes[2], bytes[3]]),
            timestamp_ms: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Encode to 8 bytes (used by the mock transport and tests).
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0] = self.kind;
        out[1] = self.flags;
        out[2..4].copy_from_slice(&self.seq.to_le_bytes());
        out[4..8].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out
    }
}

/// A decoded streaming packet body.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPacket {
    /// Orientation sample.
    Quaternion {
        /// Packet header.
        header: PacketHeader,
        /// Decoded unit quaternion.
        quaternion: Quaternion,
    },
    /// Accelerometer sample in g.
    Accel {
        /// Packet header.
        header: PacketHeader,
        /// Acceleration components.
        x: f64,
        /// Acceleration components.
        y: f64,
        /// Acceleration components.
        z: f64,
    },
}

impl StreamPacket {
    /// Decode a notification payload from the Data characteristic.
    ///
    /// Length is validated against the kind byte; short or oversized
    /// packets are an [`ParseError::InsufficientBytes`] /
    /// [`ParseError::InvalidValue`] respectively, which the session
    /// drops and logs rather than killing the stream.
    pub fn decode(bytes: &[u8]) -> ParseResult<Self> {
        let header = PacketHeader::decode(bytes)?;
        match header.kind {
            PACKET_KIND_QUATERNION => {
                if bytes.len() < QUATERNION_PACKET_LEN {
                    return Err(ParseError::insufficient(QUATERNION_PACKET_LEN, bytes.len()));
                }
                if bytes.len() > QUATERNION_PACKET_LEN {
                    return Err(ParseError::InvalidValue(format!(
                        "quaternion packet of {} bytes",
                        bytes.len()
                    )));
                }
                let c = |i: usize| {
                    i16::from_le_bytes([bytes[i], bytes[i + 1]]) as f64 * QUATERNION_SCALE
                };
                let quaternion =
                    Quaternion::new(c(8), c(10), c(12), c(14)).normalize();
                Ok(StreamPacket::Quaternion { header, quaternion })
            }
            PACKET_KIND_ACCEL => {
                if bytes.len() < ACCEL_PACKET_LEN {
                    return Err(ParseError::insufficient(ACCEL_PACKET_LEN, bytes.len()));
                }
                if bytes.len() > ACCEL_PACKET_LEN {
                    return Err(ParseError::InvalidValue(format!(
                        "accelerometer packet of {} bytes",
                        bytes.len()
                    )));
                }
                let c = |i: usize| {
                    i16::from_le_bytes([bytes[i], bytes[i + 1]]) as f64 * ACCEL_SCALE_4G
                };
                Ok(StreamPacket::Accel {
                    header,
                    x: c(8),
                    y: c(10),
                    z: c(12),
                })
            }
            other => Err(ParseError::UnknownPacketKind(other)),
        }
    }

    /// The packet header.
    pub fn header(&self) -> &PacketHeader {
        match self {
            StreamPacket::Quaternion { header, .. } => header,
            StreamPacket::Accel { header, .. } => header,
        }
    }
}

/// Encode a quaternion packet (mock transport and tests).
pub fn encode_quaternion_packet(header: PacketHeader, q: &Quaternion) -> Vec<u8> {
    let mut out = Vec::with_capacity(QUATERNION_PACKET_LEN);
    out.extend_from_slice(&header.encode());
    for component in [q.w, q.x, q.y, q.z] {
        let raw = (component / QUATERNION_SCALE).round() as i16;
        out.extend_from_slice(&raw.to_le_bytes());
    }
    out
}

/// Encode an accelerometer packet (mock transport and tests).
pub fn encode_accel_packet(header: PacketHeader, x: f64, y: f64, z: f64) -> Vec<u8> {
    let mut out = Vec::with_capacity(ACCEL_PACKET_LEN);
    out.extend_from_slice(&header.encode());
    for component in [x, y, z] {
        let raw = (component / ACCEL_SCALE_4G).round() as i16;
        out.extend_from_slice(&raw.to_le_bytes());
    }
    out
}
