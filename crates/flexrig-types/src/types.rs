//! Core data types for the capture rig.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;
use crate::quat::Quaternion;

/// Identity of a body-worn sensor.
///
/// The encoding carries anatomy: the high nibble is the side (1 = left,
/// 2 = right) and the low nibble is the segment (1 = shin, 2 = thigh).
/// The thigh sensor is proximal, the shin sensor distal; knee flexion is
/// the angle between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceId {
    /// Left shin (distal), 0x11.
    LeftShin = 0x11,
    /// Left thigh (proximal), 0x12.
    LeftThigh = 0x12,
    /// Right shin (distal), 0x21.
    RightShin = 0x21,
    /// Right thigh (proximal), 0x22.
    RightThigh = 0x22,
}

impl DeviceId {
    /// All four sensor positions.
    pub const ALL: [DeviceId; 4] = [
        DeviceId::LeftShin,
        DeviceId::LeftThigh,
        DeviceId::RightShin,
        DeviceId::RightThigh,
    ];

    /// Decode a raw id byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x11 => Some(DeviceId::LeftShin),
            0x12 => Some(DeviceId::LeftThigh),
            0x21 => Some(DeviceId::RightShin),
            0x22 => Some(DeviceId::RightThigh),
            _ => None,
        }
    }

    /// Resolve an advertised name to a sensor position.
    ///
    /// Sensors advertise as `<product>-<id>` where `<id>` is the hex
    /// device id (e.g. `FLEXRIG-12` for the left thigh). Names that do
    /// not carry a known id suffix are a rejection, never a guess: a
    /// swapped or mislabeled sensor produces plausible but wrong angles.
    pub fn from_advertised_name(name: &str) -> Result<Self, ParseError> {
        let suffix = name
            .rsplit('-')
            .next()
            .ok_or_else(|| ParseError::UnknownDevicePattern(name.to_string()))?;
        u8::from_str_radix(suffix, 16)
            .ok()
            .and_then(Self::from_u8)
            .ok_or_else(|| ParseError::UnknownDevicePattern(name.to_string()))
    }

    /// Whether this sensor is proximal (thigh; low nibble 2).
    pub fn is_proximal(self) -> bool {
        (self as u8) & 0x0F == 0x02
    }

    /// Whether this sensor is distal (shin; low nibble 1).
    pub fn is_distal(self) -> bool {
        (self as u8) & 0x0F == 0x01
    }

    /// Short human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            DeviceId::LeftShin => "left shin",
            DeviceId::LeftThigh => "left thigh",
            DeviceId::RightShin => "right shin",
            DeviceId::RightThigh => "right thigh",
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.label(), *self as u8)
    }
}

/// Host-side lifecycle state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Seen during a scan, not yet connected.
    Discovered,
    /// Connection attempt in flight.
    Connecting,
    /// Scheduled or in-flight reconnection after a drop.
    Reconnecting,
    /// Link established, GATT wired up.
    Connected,
    /// Time synchronization in progress.
    Syncing,
    /// Clock offset established.
    Synced,
    /// Quaternion stream active.
    Streaming,
    /// Link lost or closed.
    Disconnected,
    /// Terminal failure; recovered only by rediscovery.
    Error,
}

impl DeviceState {
    /// Whether the lifecycle graph allows moving from `self` to `to`.
    ///
    /// Denied edges fail the calling operation; there is no coercion.
    /// `Error` is reachable from any state through the dedicated
    /// error-transition path, so it is not listed per-source here.
    pub fn can_transition_to(self, to: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, to),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Error)
                | (Connected, Syncing)
                | (Connected, Streaming)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Syncing, Synced)
                | (Syncing, Connected)
                | (Syncing, Disconnected)
                | (Syncing, Error)
                | (Synced, Syncing)
                | (Synced, Streaming)
                | (Synced, Disconnected)
                | (Synced, Error)
                | (Streaming, Connected)
                | (Streaming, Disconnected)
                | (Streaming, Error)
                | (Disconnected, Discovered)
                | (Disconnected, Connecting)
                | (Error, Discovered)
        )
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Discovered => "discovered",
            DeviceState::Connecting => "connecting",
            DeviceState::Reconnecting => "reconnecting",
            DeviceState::Connected => "connected",
            DeviceState::Syncing => "syncing",
            DeviceState::Synced => "synced",
            DeviceState::Streaming => "streaming",
            DeviceState::Disconnected => "disconnected",
            DeviceState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Rig-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalMode {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A scan is running.
    Scanning,
    /// One or more connections are being established.
    Connecting,
    /// Time synchronization is running.
    Syncing,
    /// Sensors are streaming and a recording may be open.
    Streaming,
    /// Accelerometer-based locate mode is active.
    Locating,
}

/// Time-synchronization state of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No offset has been established.
    #[default]
    NotSynced,
    /// A sync session is collecting samples.
    Syncing,
    /// A clock offset is available.
    Synced,
}

/// Firmware operating state reported by a sensor.
///
/// `Idle`, `TxDirect` and `TxBuffered` are confirmed vendor codes; the
/// remaining codes must be checked against device documentation before
/// a firmware update ships new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FirmwareState {
    /// Power-on default before initialization.
    None = 0x00,
    /// Initialized and quiescent; the only state streaming may start from.
    Idle = 0x01,
    /// Streaming samples directly as they are produced.
    TxDirect = 0x08,
    /// Streaming from the on-device buffer.
    TxBuffered = 0x09,
    /// Accelerometer locate mode.
    Locate = 0x0A,
}

impl FirmwareState {
    /// Decode a raw firmware state byte.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(FirmwareState::None),
            0x01 => Some(FirmwareState::Idle),
            0x08 => Some(FirmwareState::TxDirect),
            0x09 => Some(FirmwareState::TxBuffered),
            0x0A => Some(FirmwareState::Locate),
            _ => None,
        }
    }
}

/// Rotation axis selector for joint-angle extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Abduction/adduction.
    X,
    /// Flexion/extension (knee angles use this).
    Y,
    /// Internal/external rotation.
    Z,
}

/// One orientation sample as decoded from a streaming packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    /// Radio address of the originating peripheral.
    pub address: String,
    /// Millisecond timestamp on the device clock.
    pub device_timestamp_ms: u64,
    /// Unit orientation quaternion.
    pub quaternion: Quaternion,
}

/// One accelerometer sample, used by locate mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    /// Radio address of the originating peripheral.
    pub address: String,
    /// Millisecond timestamp on the device clock.
    pub device_timestamp_ms: u64,
    /// Acceleration in g.
    pub x: f64,
    /// Acceleration in g.
    pub y: f64,
    /// Acceleration in g.
    pub z: f64,
}

impl AccelSample {
    /// Magnitude of the acceleration vector in g.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A computed joint angle on the common host-time baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointAngleSample {
    /// Joint name from configuration (e.g. `left_knee`).
    pub joint: String,
    /// Angle in degrees after calibration.
    pub angle_deg: f64,
    /// Host-baseline timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// The proximal and distal sensors that produced the angle.
    pub devices: [DeviceId; 2],
    /// The relative rotation the angle was extracted from.
    pub relative: Quaternion,
}

/// Per-joint summary and trace inside a finalized recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointTrace {
    /// Angle values in arrival order (ring-capped during capture).
    pub values: Vec<f64>,
    /// Minimum observed angle.
    pub min: f64,
    /// Maximum observed angle.
    pub max: f64,
    /// Total samples observed (may exceed `values.len()` once capped).
    pub count: u64,
    /// Capture duration in milliseconds.
    pub duration_ms: u64,
}

/// A finalized recording ready for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Unique id assigned when the recording started.
    pub recording_id: Uuid,
    /// Caller-supplied session identifier.
    pub session_id: String,
    /// Caller-supplied exercise identifier.
    pub exercise_id: String,
    /// Caller-supplied set number.
    pub set_number: u32,
    /// Unix milliseconds when the recording started.
    pub start_time: u64,
    /// Total capture duration in milliseconds.
    pub duration_ms: u64,
    /// Per-joint traces, keyed by joint name.
    pub joints: std::collections::BTreeMap<String, JointTrace>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_round_trip() {
        for id in DeviceId::ALL {
            assert_eq!(DeviceId::from_u8(id as u8), Some(id));
        }
        assert_eq!(DeviceId::from_u8(0x13), None);
        assert_eq!(DeviceId::from_u8(0x00), None);
    }

    #[test]
    fn test_proximal_distal_encoding() {
        assert!(DeviceId::LeftThigh.is_proximal());
        assert!(DeviceId::RightThigh.is_proximal());
        assert!(DeviceId::LeftShin.is_distal());
        assert!(DeviceId::RightShin.is_distal());
        assert!(!DeviceId::LeftShin.is_proximal());
        assert!(!DeviceId::RightThigh.is_distal());
    }

    #[test]
    fn test_from_advertised_name() {
        assert_eq!(
            DeviceId::from_advertised_name("FLEXRIG-12").unwrap(),
            DeviceId::LeftThigh
        );
        assert_eq!(
            DeviceId::from_advertised_name("FLEXRIG-REV2-21").unwrap(),
            DeviceId::RightShin
        );
        assert!(DeviceId::from_advertised_name("FLEXRIG-99").is_err());
        assert!(DeviceId::from_advertised_name("FLEXRIG").is_err());
        assert!(DeviceId::from_advertised_name("").is_err());
    }

    #[test]
    fn test_transition_graph_allowed_edges() {
        use DeviceState::*;
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Reconnecting));
        assert!(Connected.can_transition_to(Syncing));
        assert!(Syncing.can_transition_to(Synced));
        assert!(Syncing.can_transition_to(Connected));
        assert!(Synced.can_transition_to(Syncing));
        assert!(Synced.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Discovered));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Error.can_transition_to(Discovered));
    }

    #[test]
    fn test_transition_graph_denied_edges() {
        use DeviceState::*;
        assert!(!Discovered.can_transition_to(Connected));
        assert!(!Discovered.can_transition_to(Streaming));
        assert!(!Connected.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(Connected));
        assert!(!Streaming.can_transition_to(Syncing));
        assert!(!Error.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Connected));
    }

    #[test]
    fn test_firmware_state_round_trip() {
        for state in [
            FirmwareState::None,
            FirmwareState::Idle,
            FirmwareState::TxDirect,
            FirmwareState::TxBuffered,
            FirmwareState::Locate,
        ] {
            assert_eq!(FirmwareState::from_u8(state as u8), Some(state));
        }
        assert_eq!(FirmwareState::from_u8(0x55), None);
    }

    #[test]
    fn test_accel_magnitude() {
        let sample = AccelSample {
            address: "aa:bb".into(),
            device_timestamp_ms: 0,
            x: 0.0,
            y: 0.0,
            z: 1.0,
        };
        assert!((sample.magnitude() - 1.0).abs() < 1e-12);

        let sample = AccelSample {
            x: 3.0,
            y: 4.0,
            z: 0.0,
            ..sample
        };
        assert!((sample.magnitude() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_recording_serializes_stably() {
        let mut joints = std::collections::BTreeMap::new();
        joints.insert(
            "left_knee".to_string(),
            JointTrace {
                values: vec![0.0, 12.5],
                min: 0.0,
                max: 12.5,
                count: 2,
                duration_ms: 20,
            },
        );
        let rec = Recording {
            recording_id: Uuid::nil(),
            session_id: "s1".into(),
            exercise_id: "squat".into(),
            set_number: 3,
            start_time: 1_700_000_000_000,
            duration_ms: 20,
            joints,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(json.contains("\"left_knee\""));
        assert!(json.contains("\"set_number\":3"));
        let back: Recording = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
