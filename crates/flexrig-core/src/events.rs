//! Outward broadcast events.
//!
//! The rig communicates with its presentation layer exclusively through
//! this channel: batched state snapshots (debounced by the state store)
//! plus the few real-time edges a UI renders specially. All events are
//! serializable so they can cross an IPC boundary unchanged.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use flexrig_types::{DeviceId, DeviceState, GlobalMode, SyncState};

/// Serializable view of one device inside a state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Sensor identity.
    pub device_id: DeviceId,
    /// Radio address.
    pub address: String,
    /// Advertised name seen at discovery.
    pub advertised_name: String,
    /// Lifecycle state.
    pub state: DeviceState,
    /// Time-sync state.
    pub sync_state: SyncState,
    /// Clock offset in milliseconds; meaningful only when synced.
    pub clock_offset_ms: Option<f64>,
    /// Sync progress 0..=100; lingers at 100 until the next session.
    pub sync_progress: Option<u8>,
    /// Battery percentage, when read.
    pub battery_pct: Option<u8>,
    /// Last observed RSSI in dBm.
    pub rssi: Option<i16>,
    /// Reconnection attempts made in the current episode.
    pub reconnect_attempts: u32,
    /// Unix ms of the next scheduled reconnect attempt.
    pub next_reconnect_at: Option<u64>,
    /// Unix ms the device was last seen (advertisement or packet).
    pub last_seen: u64,
    /// Last error surfaced for this device, for UI rendering.
    pub last_error: Option<String>,
}

/// A batched snapshot of the whole rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Global operating mode.
    pub global_mode: GlobalMode,
    /// Whether a recording is open.
    pub is_recording: bool,
    /// All registered devices, ordered by id.
    pub devices: Vec<DeviceSnapshot>,
}

/// Events published on the rig broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum RigEvent {
    /// Debounced (or forced) rig snapshot.
    StateUpdate(StateUpdate),
    /// A sync session started.
    SyncStarted {
        /// How many devices are being synced.
        device_count: usize,
    },
    /// Per-device sync progress.
    SyncProgress {
        /// The device being synced.
        device: DeviceId,
        /// Offset estimate so far, milliseconds.
        offset_ms: Option<f64>,
        /// Completed sample rounds.
        sample_index: usize,
        /// Total sample rounds.
        total: usize,
        /// Whether the device finished successfully.
        success: Option<bool>,
        /// Failure detail when `success == Some(false)`.
        message: Option<String>,
    },
    /// A sync session finished.
    SyncComplete {
        /// Devices attempted.
        total: usize,
        /// Devices that synced.
        success: usize,
        /// Devices that failed.
        failure: usize,
    },
    /// The set of devices currently shaking changed (locate mode).
    DeviceVibrating {
        /// Devices currently above the shake threshold.
        device_ids: Vec<DeviceId>,
    },
    /// Recording lifecycle edge.
    RecordingState {
        /// Whether a recording is now open.
        is_recording: bool,
        /// Session id when recording.
        session_id: Option<String>,
        /// Unix ms start time when recording.
        start_time: Option<u64>,
    },
}

/// Sender half of the rig broadcast channel.
pub type RigEventSender = broadcast::Sender<RigEvent>;

/// Receiver half of the rig broadcast channel.
pub type RigEventReceiver = broadcast::Receiver<RigEvent>;

/// Create a rig event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (RigEventSender, RigEventReceiver) {
    broadcast::channel(capacity)
}

/// Create a rig event channel with the default capacity of 128.
pub fn default_event_channel() -> (RigEventSender, RigEventReceiver) {
    event_channel(128)
}
