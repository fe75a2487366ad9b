//! Per-peripheral protocol session.
//!
//! A [`DeviceSession`] wraps a connected [`PeripheralLink`], wires up
//! the vendor service's Command and Data characteristics, and speaks
//! the command-frame protocol. Responses arrive as notifications on the
//! Command characteristic and are correlated to their request by the
//! single-outstanding-command discipline: a session-level mutex ensures
//! there is never more than one command in flight, so the next response
//! frame with the matching id belongs to it.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use flexrig_types::ble::{COMMAND_CHARACTERISTIC, DATA_CHARACTERISTIC, SENSOR_SERVICE};
use flexrig_types::wire::{CommandFrame, CommandId, STREAM_MODE_QUATERNION, StreamPacket};
use flexrig_types::{AccelSample, DeviceId, FirmwareState, MotionSample};

use crate::error::{Error, Result};
use crate::store::StateStore;
use crate::transport::PeripheralLink;
use crate::watchdog::Watchdog;

/// Default deadline for a command/response round trip.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Stream rate requested for capture.
pub const STREAM_RATE_HZ: u8 = 100;

/// Hook invoked for every decoded accelerometer sample (locate mode).
pub type AccelHook = Arc<dyn Fn(DeviceId, AccelSample) + Send + Sync>;

type PendingResponse = Arc<StdMutex<Option<(CommandId, oneshot::Sender<CommandFrame>)>>>;

/// Protocol handler for one connected sensor.
pub struct DeviceSession {
    device_id: DeviceId,
    address: String,
    link: Arc<dyn PeripheralLink>,
    /// Serializes commands; held across the full write-and-wait round.
    command_lock: Mutex<()>,
    pending: PendingResponse,
    pumps: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DeviceSession {
    /// Attach to a connected peripheral: discover the vendor service,
    /// subscribe both characteristics, and start the notification
    /// pumps. Decoded motion samples flow into the store's dispatch
    /// hook (which also feeds the watchdog heartbeat); accelerometer
    /// samples flow into `accel_hook`.
    #[tracing::instrument(level = "debug", skip_all, fields(device = %device_id))]
    pub async fn attach(
        link: Arc<dyn PeripheralLink>,
        device_id: DeviceId,
        store: Arc<StateStore>,
        watchdog: Arc<Watchdog>,
        accel_hook: AccelHook,
    ) -> Result<Arc<Self>> {
        let address = link.address();

        link.discover_services().await?;
        if !link.has_service(SENSOR_SERVICE).await {
            return Err(Error::gatt_setup(&address, "vendor service not found"));
        }

        let command_rx = link.subscribe(COMMAND_CHARACTERISTIC).await?;
        let data_rx = link.subscribe(DATA_CHARACTERISTIC).await?;

        let session = Arc::new(Self {
            device_id,
            address: address.clone(),
            link,
            command_lock: Mutex::new(()),
            pending: Arc::new(StdMutex::new(None)),
            pumps: StdMutex::new(Vec::new()),
        });

        // Command response pump: one frame resolves the one pending
        // round, anything else is a stray and gets logged.
        let pending = Arc::clone(&session.pending);
        let pump_address = address.clone();
        let command_pump = tokio::spawn(async move {
            let mut rx = command_rx;
            while let Some(bytes) = rx.recv().await {
                let frame = match CommandFrame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(address = %pump_address, error = %e, "dropping bad response frame");
                        continue;
                    }
                };
                let waiter = {
                    let mut slot = pending.lock().unwrap_or_else(|p| p.into_inner());
                    match slot.take() {
                        Some((expected, tx)) if expected == frame.command => Some(tx),
                        Some(other) => {
                            // Response for a different command than the
                            // outstanding one: put the waiter back.
                            *slot = Some(other);
                            None
                        }
                        None => None,
                    }
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        debug!(address = %pump_address, command = ?frame.command, "unsolicited response frame");
                    }
                }
            }
        });

        // Data pump: decode streaming packets, fan out samples.
        let pump_store = Arc::clone(&store);
        let pump_watchdog = Arc::clone(&watchdog);
        let pump_address = address.clone();
        let data_pump = tokio::spawn(async move {
            let mut rx = data_rx;
            while let Some(bytes) = rx.recv().await {
                match StreamPacket::decode(&bytes) {
                    Ok(StreamPacket::Quaternion { header, quaternion }) => {
                        pump_watchdog.heartbeat(device_id);
                        let sample = MotionSample {
                            address: pump_address.clone(),
                            device_timestamp_ms: u64::from(header.timestamp_ms),
                            quaternion,
                        };
                        let _ = pump_store.dispatch_motion(&pump_address, sample);
                    }
                    Ok(StreamPacket::Accel { header, x, y, z }) => {
                        pump_watchdog.heartbeat(device_id);
                        accel_hook(
                            device_id,
                            AccelSample {
                                address: pump_address.clone(),
                                device_timestamp_ms: u64::from(header.timestamp_ms),
                                x,
                                y,
                                z,
                            },
                        );
                    }
                    // Packet-level errors are dropped and logged, never
                    // fatal to the session.
                    Err(e) => {
                        warn!(address = %pump_address, error = %e, "dropping bad stream packet");
                    }
                }
            }
            debug!(address = %pump_address, "data pump ended");
        });

        *session.pumps.lock().unwrap_or_else(|p| p.into_inner()) = vec![command_pump, data_pump];
        Ok(session)
    }

    /// The sensor this session speaks for.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Radio address of the peripheral.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The underlying link.
    pub fn link(&self) -> &Arc<dyn PeripheralLink> {
        &self.link
    }

    /// Execute one command round with the default timeout.
    async fn execute(&self, frame: CommandFrame, name: &'static str) -> Result<CommandFrame> {
        self.execute_with_timeout(frame, name, COMMAND_TIMEOUT).await
    }

    /// Execute one command round with an explicit timeout.
    ///
    /// The command lock is held for the full round, so commands are
    /// strictly serialized per session; there is no pipelining.
    pub async fn execute_with_timeout(
        &self,
        frame: CommandFrame,
        name: &'static str,
        deadline: Duration,
    ) -> Result<CommandFrame> {
        let _guard = self.command_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            *slot = Some((frame.command, tx));
        }
        self.link
            .write(COMMAND_CHARACTERISTIC, &frame.encode(), true)
            .await?;

        match timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                let mut slot = self.pending.lock().unwrap_or_else(|p| p.into_inner());
                *slot = None;
                Err(Error::command_timeout(name, deadline))
            }
        }
    }

    /// Read the sensor's firmware operating state.
    pub async fn get_system_state(&self) -> Result<FirmwareState> {
        let response = self
            .execute(CommandFrame::bare(CommandId::GetState), "GET_STATE")
            .await?;
        Ok(response.as_firmware_state()?)
    }

    /// Read the battery percentage.
    pub async fn get_battery_level(&self) -> Result<u8> {
        let response = self
            .execute(CommandFrame::bare(CommandId::GetBattery), "GET_BATTERY")
            .await?;
        Ok(response.as_battery_pct()?)
    }

    /// Read the device-clock millisecond counter (one timesync round).
    pub async fn read_device_clock(&self, deadline: Duration) -> Result<u64> {
        let response = self
            .execute_with_timeout(
                CommandFrame::bare(CommandId::TimesyncReadClock),
                "TIMESYNC_READ_CLOCK",
                deadline,
            )
            .await?;
        Ok(response.as_device_clock_ms()?)
    }

    /// Start the quaternion stream at the capture rate.
    ///
    /// Verifies the firmware is idle first; any other state fails with
    /// [`Error::NotReadyForStreaming`] and mutates nothing.
    pub async fn start_streaming(&self) -> Result<()> {
        let state = self.get_system_state().await?;
        if state != FirmwareState::Idle {
            return Err(Error::NotReadyForStreaming {
                device: self.device_id,
                state,
            });
        }
        self.execute(
            CommandFrame::set_state_streaming(
                FirmwareState::TxDirect,
                STREAM_MODE_QUATERNION,
                STREAM_RATE_HZ,
            ),
            "SET_STATE",
        )
        .await?;
        debug!(device = %self.device_id, "streaming started");
        Ok(())
    }

    /// Stop streaming by returning the firmware to idle. Idempotent: a
    /// sensor that is already idle acknowledges the same way.
    pub async fn stop_streaming(&self) -> Result<()> {
        self.execute(
            CommandFrame::set_state(FirmwareState::Idle),
            "SET_STATE",
        )
        .await?;
        Ok(())
    }

    /// Force the firmware back to idle regardless of its current state.
    pub async fn reset_to_idle(&self) -> Result<()> {
        self.execute(CommandFrame::bare(CommandId::ResetToIdle), "RESET_TO_IDLE")
            .await?;
        Ok(())
    }

    /// Switch the sensor to the accelerometer stream (locate feature).
    pub async fn start_accel_stream(&self) -> Result<()> {
        self.execute(CommandFrame::bare(CommandId::AccelStream), "ACCEL_STREAM")
            .await?;
        Ok(())
    }

    /// Stop the notification pumps and release subscriptions.
    ///
    /// Called when the session is dropped from the coordinator's map;
    /// the link itself is disconnected by the caller.
    pub async fn detach(&self) {
        for handle in self.pumps.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            handle.abort();
        }
        let _ = self.link.unsubscribe(COMMAND_CHARACTERISTIC).await;
        let _ = self.link.unsubscribe(DATA_CHARACTERISTIC).await;
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
