//! BLE UUIDs for flexrig sensors.

use uuid::{Uuid, uuid};

/// Vendor service exposing the command and data characteristics.
pub const SENSOR_SERVICE: Uuid = uuid!("6e400001-c35d-44b2-9f4a-2f5b1e8d0a10");

/// Command characteristic (write + notify); carries command frames.
pub const COMMAND_CHARACTERISTIC: Uuid = uuid!("6e400002-c35d-44b2-9f4a-2f5b1e8d0a10");

/// Data characteristic (notify); carries streaming packets.
pub const DATA_CHARACTERISTIC: Uuid = uuid!("6e400003-c35d-44b2-9f4a-2f5b1e8d0a10");

/// Standard battery service.
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

/// Standard battery level characteristic.
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");
