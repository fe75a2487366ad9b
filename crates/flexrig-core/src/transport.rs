//! Radio transport capability.
//!
//! The rest of the system never touches the radio stack directly: it
//! talks to [`Transport`] (adapter-level operations and discovery
//! events) and [`PeripheralLink`] (per-peripheral GATT operations).
//! [`BleTransport`] backs these with btleplug; `mock::MockTransport`
//! backs them with a scriptable in-memory rig for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Events emitted by a [`Transport`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peripheral matching the discovery filter appeared for the
    /// first time in this cache lifetime.
    DeviceDiscovered {
        /// Radio address.
        address: String,
        /// Advertised name.
        name: String,
        /// Advertisement RSSI in dBm.
        rssi: i16,
    },
    /// Scanning started.
    ScanStarted,
    /// Scanning stopped.
    ScanStopped,
    /// A re-advertisement updated a known peripheral's signal strength.
    RssiUpdate {
        /// Radio address.
        address: String,
        /// New RSSI in dBm.
        rssi: i16,
    },
    /// The radio link to a peripheral dropped.
    PeripheralDisconnected {
        /// Radio address.
        address: String,
    },
    /// A transport-level failure that is reported but never fatal.
    Error(String),
}

/// Connection state of a peripheral link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No link.
    Disconnected,
    /// Connect in flight.
    Connecting,
    /// Link up.
    Connected,
    /// Disconnect in flight.
    Disconnecting,
}

/// Per-peripheral GATT capability.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Radio address of this peripheral.
    fn address(&self) -> String;

    /// Establish the radio link. Timeout policy belongs to the caller.
    async fn connect(&self) -> Result<()>;

    /// Tear the radio link down.
    async fn disconnect(&self) -> Result<()>;

    /// Current link state.
    async fn state(&self) -> LinkState;

    /// Run GATT service discovery.
    async fn discover_services(&self) -> Result<()>;

    /// Whether a service is present after discovery.
    async fn has_service(&self, service: Uuid) -> bool;

    /// Read a characteristic value.
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(&self, characteristic: Uuid, bytes: &[u8], with_response: bool) -> Result<()>;

    /// Subscribe to notifications on a characteristic.
    ///
    /// Notification payloads arrive on the returned bounded channel in
    /// radio order. Dropping the receiver ends delivery; call
    /// [`PeripheralLink::unsubscribe`] to stop the peripheral sending.
    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Stop notifications on a characteristic.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()>;
}

/// Adapter-level radio capability.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the radio. Returns `false` when no adapter is present.
    async fn initialize(&self) -> Result<bool>;

    /// Start scanning for rig sensors.
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Look up a peripheral in the cache by address.
    async fn peripheral(&self, address: &str) -> Result<Option<Arc<dyn PeripheralLink>>>;

    /// Drop a peripheral from the cache. The only sanctioned removal
    /// path; the next advertisement re-discovers it.
    async fn forget_peripheral(&self, address: &str) -> Result<()>;

    /// Subscribe to transport events.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Discovery filter settings for [`BleTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Advertised-name substrings that identify rig sensors.
    pub name_patterns: Vec<String>,
    /// RSSI floor in dBm.
    pub min_rssi: i16,
}

impl TransportConfig {
    /// Whether an advertisement passes the discovery filter.
    pub fn matches(&self, name: &str, rssi: i16) -> bool {
        rssi >= self.min_rssi && self.name_patterns.iter().any(|p| name.contains(p.as_str()))
    }
}

struct DiscoveredEntry {
    rssi: i16,
    last_seen: u64,
}

/// btleplug-backed transport.
pub struct BleTransport {
    config: TransportConfig,
    adapter: Mutex<Option<Adapter>>,
    events: broadcast::Sender<TransportEvent>,
    /// Discovery dedup: address -> latest advertisement bookkeeping.
    /// Shared with the event pump; cleared only by `forget_peripheral`.
    discovered: Arc<Mutex<HashMap<String, DiscoveredEntry>>>,
    links: Mutex<HashMap<String, Arc<BlePeripheralLink>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BleTransport {
    /// Create a transport with the given discovery filter.
    pub fn new(config: TransportConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            adapter: Mutex::new(None),
            events,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            links: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        }
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.adapter
            .lock()
            .await
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Latest advertisement seen for a cached peripheral, as
    /// `(rssi, last_seen_unix_ms)`.
    pub async fn last_advertisement(&self, address: &str) -> Option<(i16, u64)> {
        self.discovered
            .lock()
            .await
            .get(address)
            .map(|entry| (entry.rssi, entry.last_seen))
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        let adapter = self.adapter().await?;
        let wanted = address.to_lowercase();
        for peripheral in adapter.peripherals().await? {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().to_lowercase() == wanted {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Transport for BleTransport {
    #[tracing::instrument(level = "info", skip_all)]
    async fn initialize(&self) -> Result<bool> {
        let manager = Manager::new().await?;
        let adapter = match manager.adapters().await?.into_iter().next() {
            Some(adapter) => adapter,
            None => {
                warn!("no Bluetooth adapter available");
                return Ok(false);
            }
        };

        let mut stream = adapter.events().await?;
        *self.adapter.lock().await = Some(adapter.clone());

        // Event pump: advertisement and disconnect events from the
        // adapter become TransportEvents, with per-cache-lifetime
        // discovery dedup applied here so downstream code sees exactly
        // one DeviceDiscovered per peripheral.
        let events = self.events.clone();
        let config = self.config.clone();
        self.discovered.lock().await.clear();
        let dedup_handle = Arc::clone(&self.discovered);
        let pump_adapter = adapter.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let Ok(peripheral) = pump_adapter.peripheral(&id).await else {
                            continue;
                        };
                        let Ok(Some(props)) = peripheral.properties().await else {
                            continue;
                        };
                        let (Some(name), Some(rssi)) = (props.local_name.clone(), props.rssi)
                        else {
                            continue;
                        };
                        if !config.matches(&name, rssi) {
                            continue;
                        }
                        let address = props.address.to_string();
                        let mut map = dedup_handle.lock().await;
                        match map.get_mut(&address) {
                            Some(entry) => {
                                entry.rssi = rssi;
                                entry.last_seen = unix_ms();
                                let _ = events.send(TransportEvent::RssiUpdate {
                                    address: address.clone(),
                                    rssi,
                                });
                            }
                            None => {
                                debug!(%address, %name, rssi, "discovered rig sensor");
                                map.insert(
                                    address.clone(),
                                    DiscoveredEntry {
                                        rssi,
                                        last_seen: unix_ms(),
                                    },
                                );
                                let _ = events.send(TransportEvent::DeviceDiscovered {
                                    address,
                                    name,
                                    rssi,
                                });
                            }
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        if let Ok(peripheral) = pump_adapter.peripheral(&id).await {
                            if let Ok(Some(props)) = peripheral.properties().await {
                                let _ = events.send(TransportEvent::PeripheralDisconnected {
                                    address: props.address.to_string(),
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
        });
        *self.pump.lock().await = Some(handle);

        info!("transport initialized");
        Ok(true)
    }

    async fn start_scan(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| Error::ScanFailed(e.to_string()))?;
        let _ = self.events.send(TransportEvent::ScanStarted);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter
            .stop_scan()
            .await
            .map_err(|e| Error::ScanFailed(e.to_string()))?;
        let _ = self.events.send(TransportEvent::ScanStopped);
        Ok(())
    }

    async fn peripheral(&self, address: &str) -> Result<Option<Arc<dyn PeripheralLink>>> {
        {
            let links = self.links.lock().await;
            if let Some(link) = links.get(address) {
                return Ok(Some(Arc::clone(link) as Arc<dyn PeripheralLink>));
            }
        }
        match self.find_peripheral(address).await? {
            Some(peripheral) => {
                let link = Arc::new(BlePeripheralLink::new(address.to_string(), peripheral));
                self.links
                    .lock()
                    .await
                    .insert(address.to_string(), Arc::clone(&link));
                Ok(Some(link as Arc<dyn PeripheralLink>))
            }
            None => Ok(None),
        }
    }

    async fn forget_peripheral(&self, address: &str) -> Result<()> {
        self.discovered.lock().await.remove(address);
        if let Some(link) = self.links.lock().await.remove(address) {
            if link.state().await == LinkState::Connected {
                let _ = link.disconnect().await;
            }
        }
        debug!(%address, "forgot peripheral");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// btleplug-backed peripheral link.
pub struct BlePeripheralLink {
    address: String,
    peripheral: Peripheral,
    state: Mutex<LinkState>,
    /// Notification routing: characteristic UUID -> subscriber channel.
    subscriptions: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlePeripheralLink {
    fn new(address: String, peripheral: Peripheral) -> Self {
        Self {
            address,
            peripheral,
            state: Mutex::new(LinkState::Disconnected),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            pump: Mutex::new(None),
        }
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        let services = self.peripheral.services();
        let service_count = services.len();
        services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| {
                Error::gatt_setup(
                    &self.address,
                    format!("characteristic {uuid} not found in {service_count} services"),
                )
            })
    }

    async fn ensure_pump(&self) -> Result<()> {
        let mut pump = self.pump.lock().await;
        if pump.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let mut stream = self.peripheral.notifications().await?;
        let subscriptions = Arc::clone(&self.subscriptions);
        let address = self.address.clone();
        *pump = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let sender = {
                    let map = subscriptions.lock().await;
                    map.get(&notification.uuid).cloned()
                };
                if let Some(sender) = sender {
                    if sender.send(notification.value).await.is_err() {
                        let mut map = subscriptions.lock().await;
                        map.remove(&notification.uuid);
                    }
                }
            }
            debug!(%address, "notification stream ended");
        }));
        Ok(())
    }
}

#[async_trait]
impl PeripheralLink for BlePeripheralLink {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn connect(&self) -> Result<()> {
        *self.state.lock().await = LinkState::Connecting;
        match self.peripheral.connect().await {
            Ok(()) => {
                *self.state.lock().await = LinkState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.state.lock().await = LinkState::Disconnected;
                Err(Error::connection_failed(&self.address, e.to_string()))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        *self.state.lock().await = LinkState::Disconnecting;
        let result = self.peripheral.disconnect().await;
        *self.state.lock().await = LinkState::Disconnected;
        if let Some(handle) = self.pump.lock().await.take() {
            handle.abort();
        }
        self.subscriptions.lock().await.clear();
        result.map_err(Error::from)
    }

    async fn state(&self) -> LinkState {
        let tracked = *self.state.lock().await;
        // A tracked Connected can be stale after a silent radio drop.
        if tracked == LinkState::Connected
            && !self.peripheral.is_connected().await.unwrap_or(false)
        {
            return LinkState::Disconnected;
        }
        tracked
    }

    async fn discover_services(&self) -> Result<()> {
        self.peripheral.discover_services().await?;
        Ok(())
    }

    async fn has_service(&self, service: Uuid) -> bool {
        self.peripheral.services().iter().any(|s| s.uuid == service)
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let c = self.characteristic(characteristic).await?;
        Ok(self.peripheral.read(&c).await?)
    }

    async fn write(&self, characteristic: Uuid, bytes: &[u8], with_response: bool) -> Result<()> {
        let c = self.characteristic(characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(&c, bytes, write_type).await?;
        Ok(())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        let c = self.characteristic(characteristic).await?;
        self.ensure_pump().await?;
        let (tx, rx) = mpsc::channel(64);
        self.subscriptions.lock().await.insert(characteristic, tx);
        self.peripheral.subscribe(&c).await?;
        Ok(rx)
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let c = self.characteristic(characteristic).await?;
        self.subscriptions.lock().await.remove(&characteristic);
        self.peripheral.unsubscribe(&c).await?;
        Ok(())
    }
}

/// Current wall-clock time in Unix milliseconds.
pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_filter() {
        let config = TransportConfig {
            name_patterns: vec!["FLEXRIG".to_string()],
            min_rssi: -80,
        };

        assert!(config.matches("FLEXRIG-12", -60));
        assert!(config.matches("FLEXRIG-21", -80));
        assert!(!config.matches("FLEXRIG-12", -81));
        assert!(!config.matches("HRM-Chest 12345", -40));
    }

    #[test]
    fn test_discovery_filter_multiple_patterns() {
        let config = TransportConfig {
            name_patterns: vec!["FLEXRIG".to_string(), "KNEERIG".to_string()],
            min_rssi: -90,
        };
        assert!(config.matches("KNEERIG-11", -70));
        assert!(config.matches("FLEXRIG-22", -70));
        assert!(!config.matches("OTHERRIG-11", -70));
    }
}
