//! Stream-silence watchdog.
//!
//! A sensor can keep its radio link up while its stream silently
//! stalls (firmware hiccup, notification subscription lost). The
//! watchdog notices the silence and triggers stream recovery; an actual
//! link drop is not its business and is left to the reconnection
//! manager, which hears about it through the transport's disconnect
//! events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flexrig_types::{DeviceId, DeviceState};

use crate::config::WatchdogConfig;
use crate::store::StateStore;

/// Async predicate: is the radio link for this address still up?
pub type LinkAliveFn = Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Async recovery action: reset the sensor to idle and restart its
/// stream.
pub type RecoveryFn = Arc<dyn Fn(DeviceId, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Periodic supervisor for silent streams.
pub struct Watchdog {
    config: WatchdogConfig,
    store: Arc<StateStore>,
    heartbeats: Arc<Mutex<HashMap<DeviceId, Instant>>>,
    task: Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl Watchdog {
    /// Create a stopped watchdog.
    pub fn new(config: WatchdogConfig, store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            heartbeats: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        })
    }

    /// Record that a streaming packet was just observed for a device.
    ///
    /// Called from the session's data pump; must stay cheap.
    pub fn heartbeat(&self, device_id: DeviceId) {
        self.heartbeats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(device_id, Instant::now());
    }

    /// Start supervising. Replaces any previous run.
    pub fn start(&self, is_link_alive: LinkAliveFn, recover: RecoveryFn) {
        self.stop();

        let interval = Duration::from_millis(self.config.interval_ms);
        let silence = Duration::from_millis(self.config.silence_threshold_ms);
        let store = Arc::clone(&self.store);
        let heartbeats = Arc::clone(&self.heartbeats);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let streaming = store.devices_in_state(DeviceState::Streaming);
                for device_id in streaming {
                    let last = heartbeats
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .get(&device_id)
                        .copied();
                    let silent = match last {
                        Some(at) => at.elapsed() > silence,
                        // Never heard from since streaming started:
                        // seed the clock so the threshold applies from
                        // this tick onward.
                        None => {
                            heartbeats
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .insert(device_id, Instant::now());
                            false
                        }
                    };
                    if !silent {
                        continue;
                    }

                    let Some(address) = store.address_for(device_id) else {
                        continue;
                    };
                    if is_link_alive(address.clone()).await {
                        warn!(%device_id, "stream silent with live link, recovering");
                        // Reset the heartbeat so one silent episode
                        // triggers one recovery, not one per tick.
                        heartbeats
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .insert(device_id, Instant::now());
                        recover(device_id, address).await;
                    } else {
                        debug!(%device_id, "stream silent but link down, leaving to reconnection");
                    }
                }
            }
        });

        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some((cancel, handle));
        info!("watchdog started");
    }

    /// Stop supervising and clear heartbeat history. Cancellation is
    /// graceful: an in-flight recovery finishes before the task exits.
    pub fn stop(&self) {
        if let Some((cancel, _handle)) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take()
        {
            cancel.cancel();
            info!("watchdog stopped");
        }
        self.heartbeats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Whether the supervisor task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::default_event_channel;
    use flexrig_types::GlobalMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rig() -> (Arc<StateStore>, Arc<Watchdog>) {
        let (tx, _rx) = default_event_channel();
        let store = StateStore::new(tx);
        let watchdog = Watchdog::new(
            WatchdogConfig {
                interval_ms: 100,
                silence_threshold_ms: 250,
            },
            Arc::clone(&store),
        );
        (store, watchdog)
    }

    fn streaming_device(store: &StateStore) -> DeviceId {
        let id = store.register_device("aa:bb:cc:dd:ee:12", "FLEXRIG-12").unwrap();
        store.transition(id, DeviceState::Connecting).unwrap();
        store.transition(id, DeviceState::Connected).unwrap();
        store.set_global_mode(GlobalMode::Streaming);
        store.transition(id, DeviceState::Streaming).unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_with_live_link_recovers() {
        let (store, watchdog) = rig();
        let id = streaming_device(&store);
        watchdog.heartbeat(id);

        let recoveries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recoveries);
        watchdog.start(
            Arc::new(|_addr| Box::pin(async { true })),
            Arc::new(move |_id, _addr| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        // Silence threshold is 250 ms; after 400 ms one recovery fires.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(recoveries.load(Ordering::SeqCst), 1);

        watchdog.stop();
        assert!(!watchdog.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_link_yields_to_reconnection() {
        let (store, watchdog) = rig();
        let id = streaming_device(&store);
        watchdog.heartbeat(id);

        let recoveries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recoveries);
        watchdog.start(
            Arc::new(|_addr| Box::pin(async { false })),
            Arc::new(move |_id, _addr| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_stream_alive() {
        let (store, watchdog) = rig();
        let id = streaming_device(&store);

        let recoveries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recoveries);
        watchdog.start(
            Arc::new(|_addr| Box::pin(async { true })),
            Arc::new(move |_id, _addr| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        for _ in 0..6 {
            watchdog.heartbeat(id);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_streaming_devices_ignored() {
        let (store, watchdog) = rig();
        let id = store.register_device("aa:bb:cc:dd:ee:11", "FLEXRIG-11").unwrap();
        store.transition(id, DeviceState::Connecting).unwrap();
        store.transition(id, DeviceState::Connected).unwrap();

        let recoveries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&recoveries);
        watchdog.start(
            Arc::new(|_addr| Box::pin(async { true })),
            Arc::new(move |_id, _addr| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(recoveries.load(Ordering::SeqCst), 0);
    }
}
