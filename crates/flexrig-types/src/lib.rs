//! Shared types for the flexrig wearable-sensor capture backbone.
//!
//! This crate holds everything the rest of the workspace agrees on but
//! that performs no I/O: sensor identity, quaternion math, the vendor
//! wire protocol, and the BLE UUID constants.
//!
//! # Contents
//!
//! - **Sensor identity**: [`DeviceId`] for the four body positions
//! - **Orientation math**: [`Quaternion`] with SLERP and rotation matrices
//! - **Samples**: [`MotionSample`], [`AccelSample`], [`JointAngleSample`]
//! - **Wire protocol**: command frames and streaming packet parsing
//! - **Recordings**: the finalized [`Recording`] document
//!
//! Everything is `serde`-serializable so state snapshots and recordings
//! can cross process boundaries unchanged.

pub mod ble;
pub mod error;
pub mod quat;
pub mod types;
pub mod wire;

pub use error::{ParseError, ParseResult};
pub use quat::Quaternion;
pub use types::{
    AccelSample, Axis, DeviceId, DeviceState, FirmwareState, GlobalMode, JointAngleSample,
    JointTrace, MotionSample, Recording, SyncState,
};
pub use wire::{
    ACCEL_PACKET_LEN, ACCEL_SCALE_4G, CommandFrame, CommandId, PacketHeader, QUATERNION_PACKET_LEN,
    QUATERNION_SCALE, StreamPacket,
};
