//! NTP-style time synchronization.
//!
//! Each round writes `TIMESYNC_READ_CLOCK` and records the host clock
//! before the write (`t1`), the device clock from the response (`t2`),
//! and the host clock after the read (`t3`). The offset estimate for
//! the round is `t2 - (t1 + t3) / 2`.
//!
//! The final offset keeps only the lowest-RTT 80% of rounds and takes
//! the median of their offsets: minimum-delay selection suppresses
//! asymmetric-delay bias, and the median shrugs off residual outliers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use flexrig_types::{DeviceId, DeviceState, SyncState};

use crate::error::{Error, Result};
use crate::events::{RigEvent, RigEventSender};
use crate::session::DeviceSession;
use crate::store::StateStore;
use crate::transport::unix_ms;

/// Sample count below which the estimate is accepted with a warning.
pub const RECOMMENDED_SAMPLES: usize = 50;

/// Fraction of lowest-RTT samples retained for the median.
const TRIM_KEEP_FRACTION: f64 = 0.8;

/// One completed round-trip measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    /// Host clock before the write, Unix ms.
    pub t1: f64,
    /// Device clock from the response, ms.
    pub t2: f64,
    /// Host clock after the read, Unix ms.
    pub t3: f64,
    /// Round-trip time, ms.
    pub rtt: f64,
    /// Offset estimate for this round, ms.
    pub offset: f64,
}

/// Collects round samples and computes the robust clock offset.
#[derive(Debug)]
pub struct TimeSyncEstimator {
    device: DeviceId,
    target: usize,
    samples: Vec<SyncSample>,
}

impl TimeSyncEstimator {
    /// Create an estimator expecting `target` rounds.
    pub fn new(device: DeviceId, target: usize) -> Self {
        if target < RECOMMENDED_SAMPLES {
            warn!(
                %device,
                target,
                recommended = RECOMMENDED_SAMPLES,
                "time sync configured below the recommended sample count"
            );
        }
        Self {
            device,
            target,
            samples: Vec::with_capacity(target),
        }
    }

    /// Record one completed round.
    pub fn add_sample(&mut self, t1: f64, t2: f64, t3: f64) {
        self.samples.push(SyncSample {
            t1,
            t2,
            t3,
            rtt: t3 - t1,
            offset: t2 - (t1 + t3) / 2.0,
        });
    }

    /// Live progress as `(samples_collected, target)`.
    pub fn progress(&self) -> (usize, usize) {
        (self.samples.len(), self.target)
    }

    /// Compute the trimmed-median offset in milliseconds.
    ///
    /// Errors on an empty sample set. A single sample returns its own
    /// offset; otherwise the lowest-RTT 80% (at least one) are kept and
    /// the median of their offsets returned (mean of the middle two for
    /// even counts).
    pub fn compute_offset(&self) -> Result<f64> {
        if self.samples.is_empty() {
            return Err(Error::sync_failed(self.device, "no samples collected"));
        }

        let mut by_rtt: Vec<&SyncSample> = self.samples.iter().collect();
        by_rtt.sort_by(|a, b| a.rtt.total_cmp(&b.rtt));

        let keep = ((by_rtt.len() as f64 * TRIM_KEEP_FRACTION).floor() as usize).max(1);
        let mut offsets: Vec<f64> = by_rtt[..keep].iter().map(|s| s.offset).collect();
        offsets.sort_by(|a, b| a.total_cmp(b));

        let mid = offsets.len() / 2;
        let median = if offsets.len() % 2 == 1 {
            offsets[mid]
        } else {
            (offsets[mid - 1] + offsets[mid]) / 2.0
        };
        Ok(median)
    }
}

/// Timing knobs for a sync session.
#[derive(Debug, Clone)]
pub struct TimeSyncConfig {
    /// Rounds to run per device.
    pub rounds: usize,
    /// Deadline for a single round.
    pub round_timeout: Duration,
    /// Pause between rounds.
    pub inter_round_delay: Duration,
    /// Hard cap on a device's whole session.
    pub session_cap: Duration,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            rounds: 50,
            round_timeout: Duration::from_millis(100),
            inter_round_delay: Duration::from_millis(20),
            session_cap: Duration::from_secs(15),
        }
    }
}

/// Drives sync sessions against device sessions and publishes progress.
pub struct TimeSyncRunner {
    store: Arc<StateStore>,
    events: RigEventSender,
    config: TimeSyncConfig,
    /// Single-flight guard: one sync loop per device at a time.
    in_flight: Mutex<HashSet<DeviceId>>,
}

impl TimeSyncRunner {
    /// Create a runner publishing progress through `events`.
    pub fn new(store: Arc<StateStore>, events: RigEventSender, config: TimeSyncConfig) -> Self {
        Self {
            store,
            events,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Synchronize one device and return its clock offset.
    ///
    /// On failure the device returns to `Connected` (sync failures do
    /// not disconnect) and may be retried; a retry re-enters this same
    /// loop, never a parallel one.
    #[tracing::instrument(level = "info", skip_all, fields(device = %session.device_id()))]
    pub async fn sync_device(&self, session: &DeviceSession) -> Result<f64> {
        let device = session.device_id();
        {
            let mut guard = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if !guard.insert(device) {
                return Err(Error::sync_failed(device, "sync already in progress"));
            }
        }
        let result = self.run_session(session).await;
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&device);
        result
    }

    async fn run_session(&self, session: &DeviceSession) -> Result<f64> {
        let device = session.device_id();
        self.store.transition(device, DeviceState::Syncing)?;
        self.store.set_sync_state(device, SyncState::Syncing, None);

        let outcome = self.collect_and_compute(session).await;
        match outcome {
            Ok(offset) => {
                self.store
                    .set_sync_state(device, SyncState::Synced, Some(offset));
                // 100 only after a successful final offset; it lingers
                // there until the next session starts.
                self.store.set_sync_progress(device, Some(100));
                self.store.transition(device, DeviceState::Synced)?;
                let _ = self.events.send(RigEvent::SyncProgress {
                    device,
                    offset_ms: Some(offset),
                    sample_index: self.config.rounds,
                    total: self.config.rounds,
                    success: Some(true),
                    message: None,
                });
                info!(%device, offset_ms = offset, "time sync complete");
                Ok(offset)
            }
            Err(e) => {
                self.store.set_sync_state(device, SyncState::NotSynced, None);
                self.store.set_sync_progress(device, None);
                // Back to Connected: a failed sync never disconnects.
                if let Err(transition_err) = self.store.transition(device, DeviceState::Connected) {
                    warn!(%device, error = %transition_err, "could not return device to connected");
                }
                let _ = self.events.send(RigEvent::SyncProgress {
                    device,
                    offset_ms: None,
                    sample_index: 0,
                    total: self.config.rounds,
                    success: Some(false),
                    message: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    async fn collect_and_compute(&self, session: &DeviceSession) -> Result<f64> {
        let device = session.device_id();
        let mut estimator = TimeSyncEstimator::new(device, self.config.rounds);
        let deadline = tokio::time::Instant::now() + self.config.session_cap;
        let mut failed_rounds = 0usize;

        for round in 0..self.config.rounds {
            if tokio::time::Instant::now() >= deadline {
                warn!(%device, round, "sync session hit its duration cap");
                break;
            }

            let t1 = unix_ms() as f64;
            match session.read_device_clock(self.config.round_timeout).await {
                Ok(device_clock) => {
                    let t3 = unix_ms() as f64;
                    estimator.add_sample(t1, device_clock as f64, t3);
                }
                Err(e) => {
                    failed_rounds += 1;
                    debug!(%device, round, error = %e, "sync round failed");
                }
            }

            let (collected, total) = estimator.progress();
            // Cap live progress at 99; 100 is reserved for success.
            let pct = (((round + 1) * 100 / total.max(1)) as u8).min(99);
            self.store.set_sync_progress(device, Some(pct));
            let _ = self.events.send(RigEvent::SyncProgress {
                device,
                offset_ms: None,
                sample_index: collected,
                total,
                success: None,
                message: None,
            });

            sleep(self.config.inter_round_delay).await;
        }

        let (collected, _) = estimator.progress();
        if collected < RECOMMENDED_SAMPLES {
            warn!(
                %device,
                collected,
                failed_rounds,
                "computing offset from fewer than the recommended samples"
            );
        }
        estimator.compute_offset()
    }
}
