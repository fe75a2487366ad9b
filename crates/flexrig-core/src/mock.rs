//! Scriptable in-memory transport for tests.
//!
//! [`MockTransport`] and [`MockPeripheral`] implement the transport
//! capability over an emulated sensor: a firmware state machine answers
//! command frames the way real hardware does, and tests inject
//! streaming packets or fault conditions (failed connects, link drops)
//! to drive the code paths that are awkward to reach with radios on a
//! bench.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use flexrig_types::ble::{COMMAND_CHARACTERISTIC, DATA_CHARACTERISTIC, SENSOR_SERVICE};
use flexrig_types::wire::{
    CommandFrame, CommandId, PACKET_KIND_ACCEL, PACKET_KIND_QUATERNION, PacketHeader,
    encode_accel_packet, encode_quaternion_packet,
};
use flexrig_types::{FirmwareState, Quaternion};

use crate::error::{Error, Result};
use crate::transport::{LinkState, PeripheralLink, Transport, TransportEvent};

/// In-memory transport holding scripted peripherals.
pub struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    peripherals: Mutex<HashMap<String, Arc<MockPeripheral>>>,
    initialized: AtomicBool,
    scanning: AtomicBool,
}

impl MockTransport {
    /// Create an empty mock transport.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            peripherals: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
        })
    }

    /// Register an emulated sensor. It advertises on the next scan.
    pub fn add_peripheral(&self, address: &str, name: &str) -> Arc<MockPeripheral> {
        let peripheral = Arc::new(MockPeripheral::new(address, name));
        self.peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(address.to_string(), Arc::clone(&peripheral));
        peripheral
    }

    /// Emit a discovery event for one registered peripheral.
    pub fn advertise(&self, address: &str) {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(address)
            .cloned();
        if let Some(peripheral) = peripheral {
            let _ = self.events.send(TransportEvent::DeviceDiscovered {
                address: peripheral.address(),
                name: peripheral.name.clone(),
                rssi: peripheral.rssi.load(Ordering::SeqCst) as i16,
            });
        }
    }

    /// Simulate a radio drop for a connected peripheral.
    pub fn drop_link(&self, address: &str) {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(address)
            .cloned();
        if let Some(peripheral) = peripheral {
            peripheral.force_disconnect();
            let _ = self.events.send(TransportEvent::PeripheralDisconnected {
                address: address.to_string(),
            });
        }
    }

    /// Whether a scan is currently active.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn initialize(&self) -> Result<bool> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(true)
    }

    async fn start_scan(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        self.scanning.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::ScanStarted);
        // Every registered sensor advertises promptly.
        let addresses: Vec<String> = self
            .peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        for address in addresses {
            self.advertise(&address);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.scanning.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::ScanStopped);
        Ok(())
    }

    async fn peripheral(&self, address: &str) -> Result<Option<Arc<dyn PeripheralLink>>> {
        Ok(self
            .peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(address)
            .cloned()
            .map(|p| p as Arc<dyn PeripheralLink>))
    }

    async fn forget_peripheral(&self, address: &str) -> Result<()> {
        self.peripherals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(address);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// An emulated sensor with a small firmware state machine.
pub struct MockPeripheral {
    address: String,
    /// Advertised name.
    pub name: String,
    /// Advertised RSSI (dBm, stored widened for atomic access).
    pub rssi: AtomicU32,
    state: Mutex<LinkState>,
    firmware: Mutex<FirmwareState>,
    battery: AtomicU32,
    device_clock: AtomicU64,
    /// Connects to fail before one succeeds.
    connect_failures: AtomicU32,
    /// When set, command writes go unanswered (timeout testing).
    mute_commands: AtomicBool,
    subscriptions: Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>,
    seq: AtomicU32,
}

impl MockPeripheral {
    fn new(address: &str, name: &str) -> Self {
        Self {
            address: address.to_string(),
            name: name.to_string(),
            rssi: AtomicU32::new(-60i32 as u32),
            state: Mutex::new(LinkState::Disconnected),
            firmware: Mutex::new(FirmwareState::Idle),
            battery: AtomicU32::new(88),
            device_clock: AtomicU64::new(10_000),
            connect_failures: AtomicU32::new(0),
            mute_commands: AtomicBool::new(false),
            subscriptions: Mutex::new(HashMap::new()),
            seq: AtomicU32::new(0),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Stop answering command writes (commands will time out).
    pub fn mute_commands(&self, muted: bool) {
        self.mute_commands.store(muted, Ordering::SeqCst);
    }

    /// Current emulated firmware state.
    pub fn firmware_state(&self) -> FirmwareState {
        *self.firmware.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Override the emulated firmware state.
    pub fn set_firmware_state(&self, state: FirmwareState) {
        *self.firmware.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Set the emulated device clock.
    pub fn set_device_clock(&self, ms: u64) {
        self.device_clock.store(ms, Ordering::SeqCst);
    }

    /// Set the emulated battery percentage.
    pub fn set_battery(&self, pct: u8) {
        self.battery.store(u32::from(pct), Ordering::SeqCst);
    }

    /// Deliver a quaternion packet as if the sensor streamed it.
    pub async fn inject_quaternion(&self, timestamp_ms: u32, quaternion: &Quaternion) {
        let header = PacketHeader {
            kind: PACKET_KIND_QUATERNION,
            flags: 0,
            seq: self.next_seq(),
            timestamp_ms,
        };
        self.notify(DATA_CHARACTERISTIC, encode_quaternion_packet(header, quaternion))
            .await;
    }

    /// Deliver an accelerometer packet.
    pub async fn inject_accel(&self, timestamp_ms: u32, x: f64, y: f64, z: f64) {
        let header = PacketHeader {
            kind: PACKET_KIND_ACCEL,
            flags: 0,
            seq: self.next_seq(),
            timestamp_ms,
        };
        self.notify(DATA_CHARACTERISTIC, encode_accel_packet(header, x, y, z))
            .await;
    }

    /// Deliver arbitrary bytes on a characteristic (malformed-packet
    /// tests).
    pub async fn inject_raw(&self, characteristic: Uuid, bytes: Vec<u8>) {
        self.notify(characteristic, bytes).await;
    }

    fn next_seq(&self) -> u16 {
        self.seq.fetch_add(1, Ordering::SeqCst) as u16
    }

    fn force_disconnect(&self) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = LinkState::Disconnected;
    }

    async fn notify(&self, characteristic: Uuid, bytes: Vec<u8>) {
        let sender = self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&characteristic)
            .cloned();
        if let Some(sender) = sender {
            let _ = sender.send(bytes).await;
        }
    }

    async fn handle_command(&self, bytes: &[u8]) {
        if self.mute_commands.load(Ordering::SeqCst) {
            return;
        }
        let Ok(frame) = CommandFrame::decode(bytes) else {
            return;
        };

        let response = match frame.command {
            CommandId::GetState => {
                CommandFrame::new(CommandId::GetState, vec![self.firmware_state() as u8])
            }
            CommandId::SetState => {
                if let Some(state) = frame.payload.first().copied().and_then(FirmwareState::from_u8)
                {
                    self.set_firmware_state(state);
                }
                CommandFrame::new(CommandId::SetState, vec![self.firmware_state() as u8])
            }
            CommandId::ResetToIdle => {
                self.set_firmware_state(FirmwareState::Idle);
                CommandFrame::new(CommandId::ResetToIdle, vec![FirmwareState::Idle as u8])
            }
            CommandId::GetBattery => CommandFrame::new(
                CommandId::GetBattery,
                vec![self.battery.load(Ordering::SeqCst) as u8],
            ),
            CommandId::TimesyncReadClock => {
                // The clock ticks a little per read so successive sync
                // rounds see motion.
                let clock = self.device_clock.fetch_add(2, Ordering::SeqCst);
                CommandFrame::new(CommandId::TimesyncReadClock, clock.to_le_bytes().to_vec())
            }
            CommandId::AccelStream => {
                self.set_firmware_state(FirmwareState::Locate);
                CommandFrame::new(CommandId::AccelStream, vec![FirmwareState::Locate as u8])
            }
        };
        self.notify(COMMAND_CHARACTERISTIC, response.encode()).await;
    }
}

#[async_trait]
impl PeripheralLink for MockPeripheral {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<()> {
        if self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::connection_failed(&self.address, "scripted failure"));
        }
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = LinkState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = LinkState::Disconnected;
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        Ok(())
    }

    async fn state(&self) -> LinkState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn discover_services(&self) -> Result<()> {
        if *self.state.lock().unwrap_or_else(|p| p.into_inner()) != LinkState::Connected {
            return Err(Error::connection_failed(&self.address, "not connected"));
        }
        Ok(())
    }

    async fn has_service(&self, service: Uuid) -> bool {
        service == SENSOR_SERVICE
    }

    async fn read(&self, _characteristic: Uuid) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn write(&self, characteristic: Uuid, bytes: &[u8], _with_response: bool) -> Result<()> {
        if characteristic == COMMAND_CHARACTERISTIC {
            self.handle_command(bytes).await;
        }
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(256);
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(characteristic, tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&characteristic);
        Ok(())
    }
}
