//! Exponential-backoff reconnection.
//!
//! The manager owns one cancellable timer task per device. It drives
//! state-store transitions and delegates the actual radio work to two
//! injected closures: `connect_fn` re-establishes a link and rebuilds
//! the session, `start_streaming_fn` restarts the stream when the rig
//! is in streaming mode. Exhausting the attempt budget parks the device
//! in the error state; only a fresh discovery recovers it after that.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use flexrig_types::{DeviceId, DeviceState, GlobalMode};

use crate::config::ReconnectConfig;
use crate::store::{DevicePatch, StateStore};
use crate::transport::unix_ms;

/// Async closure that reconnects a radio address and rebuilds its
/// session. Returns whether the device is connected afterwards.
pub type ConnectFn = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Async closure that restarts streaming on a reconnected device.
pub type StartStreamingFn = Arc<dyn Fn(DeviceId) -> BoxFuture<'static, ()> + Send + Sync>;

/// Schedules and drives reconnection attempts.
pub struct ReconnectionManager {
    store: Arc<StateStore>,
    config: ReconnectConfig,
    connect_fn: ConnectFn,
    start_streaming_fn: StartStreamingFn,
    attempts: Mutex<HashMap<DeviceId, u32>>,
    timers: Mutex<HashMap<DeviceId, tokio::task::JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl ReconnectionManager {
    /// Create a manager with injected radio closures.
    pub fn new(
        store: Arc<StateStore>,
        config: ReconnectConfig,
        connect_fn: ConnectFn,
        start_streaming_fn: StartStreamingFn,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            config,
            connect_fn,
            start_streaming_fn,
            attempts: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    /// Schedule reconnection for a device.
    ///
    /// A device already being reconnected keeps its existing timer; a
    /// second call is a no-op. The scheduled sleep is cancellable at
    /// any point via [`ReconnectionManager::cancel_reconnect`].
    pub fn schedule_reconnect(&self, device: DeviceId, reason: &str) {
        {
            let timers = self.timers.lock().unwrap_or_else(|p| p.into_inner());
            if timers.get(&device).is_some_and(|h| !h.is_finished()) {
                debug!(%device, "reconnect already scheduled");
                return;
            }
        }

        if !self.enter_reconnecting(device) {
            return;
        }
        info!(%device, reason, "scheduling reconnect");

        let weak = self.weak.clone();
        let handle = tokio::spawn(async move {
            let Some(manager) = weak.upgrade() else { return };
            manager.run(device).await;
            manager
                .timers
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&device);
        });
        self.timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(device, handle);
    }

    /// Cancel a scheduled reconnect, even mid-backoff-sleep.
    ///
    /// Clears the timer and the attempt counter; the radio is not
    /// touched.
    pub fn cancel_reconnect(&self, device: DeviceId) {
        if let Some(handle) = self
            .timers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&device)
        {
            handle.abort();
            info!(%device, "reconnect cancelled");
        }
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&device);
        self.store.update_fields(
            device,
            DevicePatch {
                reconnect_attempts: Some(0),
                next_reconnect_at: Some(None),
                ..Default::default()
            },
        );
    }

    /// Attempts made so far in the current episode.
    pub fn attempt_count(&self, device: DeviceId) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&device)
            .copied()
            .unwrap_or(0)
    }

    /// Move the device into `Reconnecting`, walking the legal edges
    /// from wherever it currently is.
    fn enter_reconnecting(&self, device: DeviceId) -> bool {
        if self.store.device_state(device) == Some(DeviceState::Disconnected) {
            // Disconnected reaches Reconnecting through Connecting.
            if self.store.transition(device, DeviceState::Connecting).is_err() {
                return false;
            }
        }
        match self.store.transition(device, DeviceState::Reconnecting) {
            Ok(()) => true,
            Err(e) => {
                warn!(%device, error = %e, "cannot enter reconnecting");
                false
            }
        }
    }

    async fn run(&self, device: DeviceId) {
        loop {
            let attempts = self.attempt_count(device);
            let delay = self.config.delay_for_attempt(attempts);
            let next_at = unix_ms() + delay.as_millis() as u64;
            self.store.update_fields(
                device,
                DevicePatch {
                    reconnect_attempts: Some(attempts),
                    next_reconnect_at: Some(Some(next_at)),
                    ..Default::default()
                },
            );
            debug!(%device, attempts, ?delay, "backing off before reconnect");
            sleep(delay).await;

            if self.store.transition(device, DeviceState::Connecting).is_err() {
                // Device was removed or moved on while we slept.
                return;
            }

            let Some(address) = self.store.address_for(device) else {
                return;
            };
            if (self.connect_fn)(address).await {
                self.attempts
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&device);
                self.store.update_fields(
                    device,
                    DevicePatch {
                        reconnect_attempts: Some(0),
                        next_reconnect_at: Some(None),
                        ..Default::default()
                    },
                );
                if self.store.global_mode() == GlobalMode::Streaming {
                    (self.start_streaming_fn)(device).await;
                }
                info!(%device, "reconnected");
                return;
            }

            let attempts = {
                let mut map = self.attempts.lock().unwrap_or_else(|p| p.into_inner());
                let count = map.entry(device).or_insert(0);
                *count += 1;
                *count
            };

            if attempts >= self.config.max_attempts {
                self.attempts
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&device);
                self.store.transition_to_error(
                    device,
                    "MaxReconnectExceeded",
                    &format!("gave up after {attempts} attempts"),
                );
                return;
            }

            if self.store.transition(device, DeviceState::Reconnecting).is_err() {
                return;
            }
        }
    }
}
