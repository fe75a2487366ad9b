//! Common-baseline alignment at stream start.
//!
//! Device clocks are unrelated to one another; when streaming starts,
//! each device's first sample timestamp is recorded and the service
//! establishes `baseline = max(firsts)` once everyone has checked in or
//! an adaptive timeout gives up waiting. After that every sample is
//! shifted by its device's `baseline - first` offset, and anything that
//! still lands before the baseline is filtered out as predating it.
//!
//! The timeout adapts to how many devices have checked in: with an even
//! count the rig is likely at a pair boundary and the short wait
//! applies; an odd count means a partner sensor is probably mid-flight
//! and the longer wait applies, capped at `max_wait_ms` either way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use flexrig_types::DeviceId;

/// Timeout knobs for baseline establishment.
#[derive(Debug, Clone)]
pub struct DataSyncConfig {
    /// Wait when an even number of devices have checked in, ms.
    pub short_wait_ms: u64,
    /// Wait when an odd number of devices have checked in, ms.
    pub long_wait_ms: u64,
    /// Hard ceiling on the wait, ms.
    pub max_wait_ms: u64,
}

impl Default for DataSyncConfig {
    fn default() -> Self {
        Self {
            short_wait_ms: 150,
            long_wait_ms: 400,
            max_wait_ms: 1_000,
        }
    }
}

#[derive(Default)]
struct Inner {
    expected: usize,
    firsts: HashMap<DeviceId, u64>,
    baseline: Option<u64>,
    offsets: HashMap<DeviceId, i64>,
    epoch: u64,
}

/// Aligns device-clock timestamps onto a common baseline.
pub struct DataSyncService {
    config: DataSyncConfig,
    inner: Mutex<Inner>,
    weak: Weak<Self>,
}

impl DataSyncService {
    /// Create an idle service.
    pub fn new(config: DataSyncConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            inner: Mutex::new(Inner::default()),
            weak: weak.clone(),
        })
    }

    /// Begin a new alignment session expecting `expected` devices.
    ///
    /// Resets any previous baseline and starts the adaptive timeout
    /// task; the session becomes ready when every expected device has
    /// checked in or the timeout fires with at least one device seen.
    pub fn begin(&self, expected: usize) {
        let epoch = {
            let mut inner = self.lock();
            *inner = Inner {
                expected,
                epoch: inner.epoch + 1,
                ..Inner::default()
            };
            inner.epoch
        };
        debug!(expected, "data sync session started");

        let weak = self.weak.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                sleep(Duration::from_millis(25)).await;
                let Some(service) = weak.upgrade() else { return };
                let max_wait = Duration::from_millis(service.config.max_wait_ms);
                let done = {
                    let inner = service.lock();
                    // A newer session superseded this task.
                    if inner.epoch != epoch {
                        return;
                    }
                    inner.baseline.is_some()
                };
                if done {
                    return;
                }

                let checked_in = service.lock().firsts.len();
                let wait = if checked_in % 2 == 0 {
                    Duration::from_millis(service.config.short_wait_ms)
                } else {
                    Duration::from_millis(service.config.long_wait_ms)
                }
                .min(max_wait);

                if started.elapsed() >= wait && checked_in > 0 {
                    service.finalize(epoch);
                    return;
                }
                if started.elapsed() >= max_wait {
                    // Nothing ever checked in; give up quietly.
                    return;
                }
            }
        });
    }

    /// Feed one device timestamp through the aligner.
    ///
    /// Before the baseline is ready this records first-sample
    /// timestamps and returns `None` (finalizing immediately once every
    /// expected device has checked in). After readiness it returns the
    /// corrected timestamp, or `None` for samples that predate the
    /// baseline.
    pub fn observe(&self, device: DeviceId, device_ts: u64) -> Option<u64> {
        let mut inner = self.lock();
        if let Some(baseline) = inner.baseline {
            let offset = match inner.offsets.get(&device) {
                Some(offset) => *offset,
                None => {
                    // A device joining after readiness aligns its own
                    // start to the baseline; its offset persists for
                    // the rest of the session (reconnects keep the same
                    // device clock).
                    let offset = baseline as i64 - device_ts as i64;
                    inner.offsets.insert(device, offset);
                    offset
                }
            };
            let corrected = device_ts as i64 + offset;
            if (corrected as u64) < baseline {
                return None;
            }
            return Some(corrected as u64);
        }

        inner.firsts.entry(device).or_insert(device_ts);
        if inner.expected > 0 && inner.firsts.len() >= inner.expected {
            let epoch = inner.epoch;
            drop(inner);
            self.finalize(epoch);
        }
        None
    }

    /// Whether the baseline is established.
    pub fn is_ready(&self) -> bool {
        self.lock().baseline.is_some()
    }

    /// The established baseline, when ready.
    pub fn baseline(&self) -> Option<u64> {
        self.lock().baseline
    }

    /// Drop all session state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let epoch = inner.epoch;
        *inner = Inner {
            epoch: epoch + 1,
            ..Inner::default()
        };
    }

    fn finalize(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.baseline.is_some() || inner.firsts.is_empty() {
            return;
        }
        let baseline = *inner.firsts.values().max().expect("non-empty");
        inner.offsets = inner
            .firsts
            .iter()
            .map(|(device, first)| (*device, baseline as i64 - *first as i64))
            .collect();
        inner.baseline = Some(baseline);
        info!(
            baseline,
            devices = inner.offsets.len(),
            "data sync baseline established"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> Arc<DataSyncService> {
        DataSyncService::new(DataSyncConfig::default())
    }

    #[tokio::test]
    async fn test_pair_baseline_and_shift() {
        let service = service();
        service.begin(2);

        // First samples: A at 10_000, B at 10_050.
        assert_eq!(service.observe(DeviceId::LeftThigh, 10_000), None);
        assert_eq!(service.observe(DeviceId::LeftShin, 10_050), None);

        // Both expected devices checked in: ready immediately.
        assert!(service.is_ready());
        assert_eq!(service.baseline(), Some(10_050));

        // A shifts by +50, B by 0.
        assert_eq!(service.observe(DeviceId::LeftThigh, 10_010), Some(10_060));
        assert_eq!(service.observe(DeviceId::LeftShin, 10_060), Some(10_060));
    }

    #[tokio::test]
    async fn test_samples_predating_baseline_are_filtered() {
        let service = service();
        service.begin(2);
        service.observe(DeviceId::LeftThigh, 10_000);
        service.observe(DeviceId::LeftShin, 10_050);

        // An out-of-order A sample from before its first: corrected to
        // 10_040, which predates the 10_050 baseline.
        assert_eq!(service.observe(DeviceId::LeftThigh, 9_990), None);
        // Exactly at the baseline is kept.
        assert_eq!(service.observe(DeviceId::LeftThigh, 10_000), Some(10_050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_timeout_with_odd_count() {
        let service = service();
        service.begin(2);
        service.observe(DeviceId::LeftThigh, 5_000);

        // One device in (odd): short wait passes without readiness.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!service.is_ready());

        // The long wait fires and finalizes on the lone device.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(service.is_ready());
        assert_eq!(service.baseline(), Some(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_with_no_devices_stays_unready() {
        let service = service();
        service.begin(2);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(!service.is_ready());
    }

    #[tokio::test]
    async fn test_late_device_aligns_to_baseline() {
        let service = service();
        service.begin(1);
        service.observe(DeviceId::LeftThigh, 20_000);
        assert!(service.is_ready());

        // A device that never checked in before readiness gets its own
        // start aligned to the baseline.
        assert_eq!(service.observe(DeviceId::LeftShin, 90_000), Some(20_000));
        assert_eq!(service.observe(DeviceId::LeftShin, 90_010), Some(20_010));
    }

    #[tokio::test]
    async fn test_reset_clears_session() {
        let service = service();
        service.begin(1);
        service.observe(DeviceId::LeftThigh, 1_000);
        assert!(service.is_ready());

        service.reset();
        assert!(!service.is_ready());
        assert_eq!(service.observe(DeviceId::LeftThigh, 2_000), None);
    }
}
