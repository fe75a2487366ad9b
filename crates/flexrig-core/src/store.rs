//! The canonical rig state store.
//!
//! Single source of truth for device lifecycle states, the global mode,
//! sync metadata, and the address-to-device routing used by the data
//! plane. Every mutation goes through a method here; no other component
//! holds references to the internal maps.
//!
//! The store lock is a short-lived `std::sync::Mutex` and is never held
//! across awaits; motion hooks are invoked after the lock is released.
//! Snapshots broadcast to observers are debounced (~50 ms) and
//! coalesced; critical edges (entering `Connected`, `Synced`, `Error`)
//! bypass the debounce via [`StateStore::force_broadcast`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use flexrig_types::{DeviceId, DeviceState, GlobalMode, MotionSample, SyncState};

use crate::error::{Error, Result};
use crate::events::{DeviceSnapshot, RigEvent, RigEventSender, StateUpdate};
use crate::transport::unix_ms;

/// Debounce window for coalesced snapshot broadcasts.
pub const BROADCAST_DEBOUNCE: Duration = Duration::from_millis(50);

/// Hook invoked for every motion sample routed to a device.
///
/// Hooks must not perform I/O; the store calls them outside its lock.
pub type MotionHook = Arc<dyn Fn(DeviceId, MotionSample) + Send + Sync>;

/// Internal change events for in-process observers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A device took a lifecycle transition.
    DeviceStateChanged {
        /// The device.
        device: DeviceId,
        /// State before.
        previous: DeviceState,
        /// State after.
        new: DeviceState,
    },
    /// The global mode changed.
    GlobalModeChanged {
        /// Mode before.
        previous: GlobalMode,
        /// Mode after.
        new: GlobalMode,
    },
    /// A device was registered.
    DeviceRegistered {
        /// The device.
        device: DeviceId,
    },
    /// A device was unregistered.
    DeviceUnregistered {
        /// The device.
        device: DeviceId,
    },
}

/// Field patch for [`StateStore::update_fields`].
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    /// New battery percentage.
    pub battery_pct: Option<u8>,
    /// New RSSI.
    pub rssi: Option<i16>,
    /// New reconnect attempt count.
    pub reconnect_attempts: Option<u32>,
    /// New next-reconnect time (Unix ms); `Some(None)` clears it.
    pub next_reconnect_at: Option<Option<u64>>,
    /// New last-seen time (Unix ms).
    pub last_seen: Option<u64>,
    /// New last-error text; `Some(None)` clears it.
    pub last_error: Option<Option<String>>,
}

struct DeviceEntry {
    address: String,
    advertised_name: String,
    state: DeviceState,
    sync_state: SyncState,
    clock_offset_ms: Option<f64>,
    sync_progress: Option<u8>,
    battery_pct: Option<u8>,
    rssi: Option<i16>,
    reconnect_attempts: u32,
    next_reconnect_at: Option<u64>,
    last_seen: u64,
    last_error: Option<String>,
}

impl DeviceEntry {
    fn snapshot(&self, device_id: DeviceId) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id,
            address: self.address.clone(),
            advertised_name: self.advertised_name.clone(),
            state: self.state,
            sync_state: self.sync_state,
            clock_offset_ms: self.clock_offset_ms,
            sync_progress: self.sync_progress,
            battery_pct: self.battery_pct,
            rssi: self.rssi,
            reconnect_attempts: self.reconnect_attempts,
            next_reconnect_at: self.next_reconnect_at,
            last_seen: self.last_seen,
            last_error: self.last_error.clone(),
        }
    }
}

struct Inner {
    devices: HashMap<DeviceId, DeviceEntry>,
    addr_to_id: HashMap<String, DeviceId>,
    hooks: HashMap<DeviceId, MotionHook>,
    global_mode: GlobalMode,
    is_recording: bool,
}

/// The canonical registry of devices and global mode.
///
/// Construction requires a running tokio runtime: the debounce task is
/// spawned at creation and lives for the store's lifetime.
pub struct StateStore {
    inner: Mutex<Inner>,
    store_events: broadcast::Sender<StoreEvent>,
    rig_events: RigEventSender,
    broadcast_queue: mpsc::UnboundedSender<()>,
}

impl StateStore {
    /// Create a store broadcasting snapshots on `rig_events`.
    pub fn new(rig_events: RigEventSender) -> Arc<Self> {
        let (store_events, _) = broadcast::channel(128);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<()>();

        Arc::new_cyclic(|weak: &Weak<StateStore>| {
            let weak = weak.clone();
            tokio::spawn(async move {
                // Trailing-edge debounce: first request opens the
                // window, everything queued inside it coalesces into
                // one snapshot.
                while queue_rx.recv().await.is_some() {
                    tokio::time::sleep(BROADCAST_DEBOUNCE).await;
                    while queue_rx.try_recv().is_ok() {}
                    let Some(store) = weak.upgrade() else { break };
                    store.emit_snapshot();
                }
            });

            StateStore {
                inner: Mutex::new(Inner {
                    devices: HashMap::new(),
                    addr_to_id: HashMap::new(),
                    hooks: HashMap::new(),
                    global_mode: GlobalMode::Idle,
                    is_recording: false,
                }),
                store_events,
                rig_events,
                broadcast_queue: queue_tx,
            }
        })
    }

    /// Subscribe to internal change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store_events.subscribe()
    }

    /// The outward rig event sender (shared with the coordinator).
    pub fn rig_events(&self) -> RigEventSender {
        self.rig_events.clone()
    }

    // --- Registration ---

    /// Register a discovered peripheral.
    ///
    /// The advertised name must resolve to a known sensor position.
    /// Re-registering the same address refreshes `last_seen` and
    /// returns the existing id; a different address for an
    /// already-registered id is rejected (the invariant allows address
    /// changes only through an unregister/register cycle).
    pub fn register_device(&self, address: &str, advertised_name: &str) -> Result<DeviceId> {
        let device_id = DeviceId::from_advertised_name(advertised_name)
            .map_err(|_| Error::UnknownDevicePattern {
                name: advertised_name.to_string(),
            })?;

        let mut inner = self.lock();
        if let Some(existing) = inner.devices.get_mut(&device_id) {
            if existing.address == address {
                existing.last_seen = unix_ms();
                return Ok(device_id);
            }
            return Err(Error::connection_failed(
                address,
                format!("{device_id} already registered at {}", existing.address),
            ));
        }

        inner.devices.insert(
            device_id,
            DeviceEntry {
                address: address.to_string(),
                advertised_name: advertised_name.to_string(),
                state: DeviceState::Discovered,
                sync_state: SyncState::NotSynced,
                clock_offset_ms: None,
                sync_progress: None,
                battery_pct: None,
                rssi: None,
                reconnect_attempts: 0,
                next_reconnect_at: None,
                last_seen: unix_ms(),
                last_error: None,
            },
        );
        inner.addr_to_id.insert(address.to_string(), device_id);
        drop(inner);

        debug!(%device_id, %address, "registered device");
        let _ = self
            .store_events
            .send(StoreEvent::DeviceRegistered { device: device_id });
        self.queue_broadcast();
        Ok(device_id)
    }

    /// Remove a device and all of its state, including its hook.
    pub fn unregister_device(&self, device_id: DeviceId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.devices.remove(&device_id) {
            inner.addr_to_id.remove(&entry.address);
            inner.hooks.remove(&device_id);
            drop(inner);
            debug!(%device_id, "unregistered device");
            let _ = self
                .store_events
                .send(StoreEvent::DeviceUnregistered { device: device_id });
            self.queue_broadcast();
        }
    }

    // --- Lifecycle transitions ---

    /// Take a lifecycle transition, validating it against the allowed
    /// graph. Illegal edges are rejected, never coerced.
    pub fn transition(&self, device_id: DeviceId, to: DeviceState) -> Result<()> {
        let (previous, critical) = {
            let mut inner = self.lock();
            let global_mode = inner.global_mode;
            let entry = inner
                .devices
                .get_mut(&device_id)
                .ok_or(Error::unavailable(device_id.to_string()))?;
            let from = entry.state;

            if !from.can_transition_to(to) {
                return Err(Error::InvalidTransition {
                    device: device_id,
                    from,
                    to,
                });
            }
            // A device may only stream while the rig itself does.
            if to == DeviceState::Streaming && global_mode != GlobalMode::Streaming {
                return Err(Error::InvalidTransition {
                    device: device_id,
                    from,
                    to,
                });
            }

            entry.state = to;
            if to == DeviceState::Connected {
                entry.reconnect_attempts = 0;
                entry.next_reconnect_at = None;
            }
            (
                from,
                matches!(to, DeviceState::Connected | DeviceState::Synced),
            )
        };

        debug!(%device_id, %previous, %to, "device transition");
        let _ = self.store_events.send(StoreEvent::DeviceStateChanged {
            device: device_id,
            previous,
            new: to,
        });
        if critical {
            self.force_broadcast();
        } else {
            self.queue_broadcast();
        }
        Ok(())
    }

    /// Move a device to the error state. Valid from any state.
    pub fn transition_to_error(&self, device_id: DeviceId, kind: &str, message: &str) {
        let previous = {
            let mut inner = self.lock();
            let Some(entry) = inner.devices.get_mut(&device_id) else {
                return;
            };
            let from = entry.state;
            entry.state = DeviceState::Error;
            entry.last_error = Some(format!("{kind}: {message}"));
            from
        };

        warn!(%device_id, kind, message, "device entered error state");
        let _ = self.store_events.send(StoreEvent::DeviceStateChanged {
            device: device_id,
            previous,
            new: DeviceState::Error,
        });
        self.force_broadcast();
    }

    // --- Sync metadata ---

    /// Update a device's time-sync state.
    ///
    /// The clock offset is stored only with `SyncState::Synced`;
    /// leaving the synced state clears it. Starting a new sync session
    /// resets progress; a completed session lingers at 100.
    pub fn set_sync_state(
        &self,
        device_id: DeviceId,
        sync_state: SyncState,
        offset_ms: Option<f64>,
    ) {
        {
            let mut inner = self.lock();
            let Some(entry) = inner.devices.get_mut(&device_id) else {
                return;
            };
            entry.sync_state = sync_state;
            entry.clock_offset_ms = match sync_state {
                SyncState::Synced => offset_ms,
                _ => None,
            };
            if sync_state == SyncState::Syncing {
                entry.sync_progress = Some(0);
            }
        }
        self.queue_broadcast();
    }

    /// Update a device's sync progress (0..=100).
    pub fn set_sync_progress(&self, device_id: DeviceId, progress: Option<u8>) {
        {
            let mut inner = self.lock();
            let Some(entry) = inner.devices.get_mut(&device_id) else {
                return;
            };
            entry.sync_progress = progress.map(|p| p.min(100));
        }
        self.queue_broadcast();
    }

    // --- Bookkeeping ---

    /// Apply a field patch (battery, rssi, reconnect bookkeeping).
    pub fn update_fields(&self, device_id: DeviceId, patch: DevicePatch) {
        {
            let mut inner = self.lock();
            let Some(entry) = inner.devices.get_mut(&device_id) else {
                return;
            };
            if let Some(battery) = patch.battery_pct {
                entry.battery_pct = Some(battery);
            }
            if let Some(rssi) = patch.rssi {
                entry.rssi = Some(rssi);
            }
            if let Some(attempts) = patch.reconnect_attempts {
                entry.reconnect_attempts = attempts;
            }
            if let Some(next) = patch.next_reconnect_at {
                entry.next_reconnect_at = next;
            }
            if let Some(seen) = patch.last_seen {
                entry.last_seen = seen;
            }
            if let Some(error) = patch.last_error {
                entry.last_error = error;
            }
        }
        self.queue_broadcast();
    }

    /// Set the global operating mode.
    pub fn set_global_mode(&self, mode: GlobalMode) {
        let previous = {
            let mut inner = self.lock();
            let previous = inner.global_mode;
            inner.global_mode = mode;
            previous
        };
        if previous != mode {
            debug!(?previous, ?mode, "global mode changed");
            let _ = self.store_events.send(StoreEvent::GlobalModeChanged {
                previous,
                new: mode,
            });
            self.queue_broadcast();
        }
    }

    /// Mark whether a recording is open (reflected in snapshots).
    pub fn set_recording(&self, recording: bool) {
        self.lock().is_recording = recording;
        self.queue_broadcast();
    }

    // --- Data-plane routing ---

    /// Register the motion hook for a device. One hook per device; a
    /// second registration replaces the first.
    pub fn register_hook(&self, device_id: DeviceId, hook: MotionHook) {
        self.lock().hooks.insert(device_id, hook);
    }

    /// Route an inbound motion sample to its device hook.
    ///
    /// O(1) address-to-id resolution; the hook runs after the store
    /// lock is released. Returns the device the sample was routed to,
    /// or `None` for unknown addresses.
    pub fn dispatch_motion(&self, address: &str, sample: MotionSample) -> Option<DeviceId> {
        let (device_id, hook) = {
            let mut inner = self.lock();
            let device_id = *inner.addr_to_id.get(address)?;
            if let Some(entry) = inner.devices.get_mut(&device_id) {
                entry.last_seen = unix_ms();
            }
            (device_id, inner.hooks.get(&device_id).cloned())
        };
        if let Some(hook) = hook {
            hook(device_id, sample);
        }
        Some(device_id)
    }

    // --- Broadcast ---

    /// Schedule a coalesced snapshot broadcast.
    pub fn queue_broadcast(&self) {
        let _ = self.broadcast_queue.send(());
    }

    /// Broadcast a snapshot immediately, bypassing the debounce.
    pub fn force_broadcast(&self) {
        self.emit_snapshot();
    }

    fn emit_snapshot(&self) {
        let update = self.snapshot();
        let _ = self.rig_events.send(RigEvent::StateUpdate(update));
    }

    /// Build the batched snapshot consumed by observers.
    ///
    /// Pure with respect to store state: two calls with no intervening
    /// mutation produce structurally equal values.
    pub fn snapshot(&self) -> StateUpdate {
        let inner = self.lock();
        let mut devices: Vec<DeviceSnapshot> = inner
            .devices
            .iter()
            .map(|(id, entry)| entry.snapshot(*id))
            .collect();
        devices.sort_by_key(|d| d.device_id);
        StateUpdate {
            global_mode: inner.global_mode,
            is_recording: inner.is_recording,
            devices,
        }
    }

    // --- Queries ---

    /// The current global mode.
    pub fn global_mode(&self) -> GlobalMode {
        self.lock().global_mode
    }

    /// Whether a recording is open.
    pub fn is_recording(&self) -> bool {
        self.lock().is_recording
    }

    /// Snapshot of a single device.
    pub fn device(&self, device_id: DeviceId) -> Option<DeviceSnapshot> {
        self.lock()
            .devices
            .get(&device_id)
            .map(|entry| entry.snapshot(device_id))
    }

    /// Lifecycle state of a single device.
    pub fn device_state(&self, device_id: DeviceId) -> Option<DeviceState> {
        self.lock().devices.get(&device_id).map(|entry| entry.state)
    }

    /// Resolve a radio address to a device id.
    pub fn id_for_address(&self, address: &str) -> Option<DeviceId> {
        self.lock().addr_to_id.get(address).copied()
    }

    /// Radio address of a device.
    pub fn address_for(&self, device_id: DeviceId) -> Option<String> {
        self.lock()
            .devices
            .get(&device_id)
            .map(|entry| entry.address.clone())
    }

    /// All devices currently in a given state.
    pub fn devices_in_state(&self, state: DeviceState) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self
            .lock()
            .devices
            .iter()
            .filter(|(_, entry)| entry.state == state)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Remove every device and reset the global mode. Admin purge.
    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.devices.clear();
            inner.addr_to_id.clear();
            inner.hooks.clear();
            inner.global_mode = GlobalMode::Idle;
            inner.is_recording = false;
        }
        self.force_broadcast();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // The store lock is never held across awaits, so poisoning can
        // only come from a panic in a short critical section.
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
