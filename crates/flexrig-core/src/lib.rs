//! BLE capture backbone for flexrig wearable motion sensors.
//!
//! A fleet of up to four body-worn inertial sensors (left/right thigh
//! and shin) stream orientation quaternions over Bluetooth Low Energy;
//! this crate connects them, synchronizes their clocks onto a common
//! host baseline, derives knee flexion angles in real time, and records
//! them for upload.
//!
//! # Architecture
//!
//! - [`transport`]: the radio capability ([`Transport`] /
//!   [`PeripheralLink`]), backed by btleplug in production and by
//!   [`mock::MockTransport`] in tests
//! - [`strategy`]: parallel or sequential connection policies
//! - [`session`]: per-sensor protocol handler (command frames,
//!   streaming packet decode)
//! - [`timesync`]: NTP-style round-trip clock-offset estimation
//! - [`store`]: the canonical [`StateStore`] holding device lifecycle
//!   states, the global mode, and the debounced snapshot broadcast
//! - [`reconnect`] and [`watchdog`]: backoff reconnection and
//!   silent-stream recovery
//! - [`datasync`], [`interpolation`], [`angle`], [`joints`]: the data
//!   plane from raw samples to joint angles on a fixed grid
//! - [`recording`] and [`sink`]: recording accumulation, HTTP upload,
//!   and the persistent retry queue
//! - [`coordinator`]: the outward command surface
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use flexrig_core::{BleTransport, Coordinator, RigConfig, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> flexrig_core::Result<()> {
//!     let config = RigConfig::load_default()?;
//!     let transport = Arc::new(BleTransport::new(TransportConfig {
//!         name_patterns: config.device_name_patterns.clone(),
//!         min_rssi: config.min_rssi,
//!     }));
//!     let rig = Coordinator::new(config, transport)?;
//!     rig.initialize().await?;
//!
//!     let scan = rig.scan().await;
//!     for device in scan.devices {
//!         rig.connect(&device.address, &device.advertised_name).await;
//!     }
//!     rig.sync_all().await;
//!     rig.start_recording("session-1", "squat", 1).await;
//!     Ok(())
//! }
//! ```

pub mod angle;
pub mod config;
pub mod coordinator;
pub mod datasync;
pub mod error;
pub mod events;
pub mod interpolation;
pub mod joints;
pub mod locate;
pub mod mock;
pub mod reconnect;
pub mod recording;
pub mod session;
pub mod sink;
pub mod store;
pub mod strategy;
pub mod timesync;
pub mod transport;
pub mod watchdog;

pub use angle::{JointAngle, compute_joint_angle};
pub use config::{
    Calibration, JointConfig, ReconnectConfig, RigConfig, SinkConfig, StrategyConfig, StrategyKind,
    WatchdogConfig,
};
pub use coordinator::{
    CommandResponse, Coordinator, DeviceSyncResult, ScanResponse, StartRecordingResponse,
    SyncAllResponse,
};
pub use datasync::{DataSyncConfig, DataSyncService};
pub use error::{Error, Result};
pub use events::{
    DeviceSnapshot, RigEvent, RigEventReceiver, RigEventSender, StateUpdate, default_event_channel,
    event_channel,
};
pub use interpolation::{GridSample, InterpolationEngine};
pub use joints::{DECIMAL_PRECISION, JointProcessor, SortingWindow};
pub use locate::{ShakeConfig, ShakeDetector};
pub use reconnect::ReconnectionManager;
pub use recording::RecordingBuffer;
pub use session::DeviceSession;
pub use sink::{HttpRecordingSink, PersistentQueue, RecordingSink, UploadPipeline};
pub use store::{DevicePatch, MotionHook, StateStore, StoreEvent};
pub use strategy::{ConnectOutcome, ConnectionStrategy, ParallelStrategy, SequentialStrategy};
pub use timesync::{TimeSyncConfig, TimeSyncEstimator, TimeSyncRunner};
pub use transport::{
    BleTransport, LinkState, PeripheralLink, Transport, TransportConfig, TransportEvent,
};
pub use watchdog::Watchdog;

// Re-export the shared types crate for downstream convenience.
pub use flexrig_types as types;
