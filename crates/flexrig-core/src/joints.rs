//! Per-joint processing and fan-out.
//!
//! A [`JointProcessor`] watches the interpolated grid batches for its
//! configured sensor pair and produces one [`JointAngleSample`] per
//! grid instant both sensors are present. Samples are stamped with the
//! triggering grid timestamp (never a max across devices, which would
//! go stale when one leg's sensor lags) and rounded to
//! [`DECIMAL_PRECISION`] decimals.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use flexrig_types::{DeviceId, JointAngleSample, Quaternion};

use crate::angle::compute_joint_angle;
use crate::config::JointConfig;
use crate::error::Result;

/// Decimal places kept on published angles.
pub const DECIMAL_PRECISION: i32 = 2;

/// Processes one configured joint.
pub struct JointProcessor {
    config: JointConfig,
    latest: Mutex<Option<JointAngleSample>>,
    outputs: broadcast::Sender<JointAngleSample>,
}

impl JointProcessor {
    /// Create a processor for a configured joint.
    pub fn new(config: JointConfig) -> Self {
        let (outputs, _) = broadcast::channel(256);
        Self {
            config,
            latest: Mutex::new(None),
            outputs,
        }
    }

    /// The joint name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Subscribe to this joint's angle samples.
    pub fn subscribe(&self) -> broadcast::Receiver<JointAngleSample> {
        self.outputs.subscribe()
    }

    /// The most recent angle sample, if any.
    pub fn latest(&self) -> Option<JointAngleSample> {
        self.latest.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Process one grid snapshot.
    ///
    /// Needs at least two devices in the snapshot and this joint's
    /// configured proximal and distal sensors among them; otherwise
    /// nothing is produced. The returned sample has already been pushed
    /// to subscribers; the caller forwards it to the recording buffer
    /// when one is open.
    pub fn process(
        &self,
        snapshot: &HashMap<DeviceId, Quaternion>,
        timestamp_ms: u64,
    ) -> Result<Option<JointAngleSample>> {
        if snapshot.len() < 2 {
            return Ok(None);
        }
        let (Some(proximal), Some(distal)) = (
            snapshot.get(&self.config.proximal),
            snapshot.get(&self.config.distal),
        ) else {
            return Ok(None);
        };

        let computed = compute_joint_angle(
            (self.config.proximal, *proximal),
            (self.config.distal, *distal),
            self.config.axis,
            self.config.calibration,
        )?;

        let sample = JointAngleSample {
            joint: self.config.name.clone(),
            angle_deg: round_to_precision(computed.angle_deg),
            timestamp_ms,
            devices: computed.devices,
            relative: computed.relative,
        };

        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(sample.clone());
        if self.outputs.send(sample.clone()).is_err() {
            debug!(joint = %self.config.name, "no angle subscribers");
        }
        Ok(Some(sample))
    }
}

fn round_to_precision(angle: f64) -> f64 {
    let factor = 10f64.powi(DECIMAL_PRECISION);
    (angle * factor).round() / factor
}

/// Small cross-joint reordering window.
///
/// A rendering smoother: angles from different joints computed within
/// the window are released in timestamp order at roughly display rate.
/// Disabling it changes latency, never correctness.
pub struct SortingWindow {
    window_ms: u64,
    pending: Mutex<Vec<JointAngleSample>>,
}

impl SortingWindow {
    /// Create a window holding samples back `window_ms` milliseconds.
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Default 16 ms window (~60 Hz flushes).
    pub fn default_window() -> Self {
        Self::new(16)
    }

    /// Add a sample to the window.
    pub fn push(&self, sample: JointAngleSample) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(sample);
    }

    /// Release every sample older than the window, in timestamp order.
    pub fn drain_ready(&self, now_ms: u64) -> Vec<JointAngleSample> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let mut ready: Vec<JointAngleSample> = Vec::new();
        pending.retain(|sample| {
            if sample.timestamp_ms <= cutoff {
                ready.push(sample.clone());
                false
            } else {
                true
            }
        });
        ready.sort_by_key(|s| s.timestamp_ms);
        ready
    }

    /// Release everything regardless of age, in timestamp order.
    pub fn drain_all(&self) -> Vec<JointAngleSample> {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let mut ready: Vec<JointAngleSample> = pending.drain(..).collect();
        ready.sort_by_key(|s| s.timestamp_ms);
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn left_knee() -> JointProcessor {
        JointProcessor::new(JointConfig::left_knee())
    }

    fn snapshot(pairs: &[(DeviceId, Quaternion)]) -> HashMap<DeviceId, Quaternion> {
        pairs.iter().copied().collect()
    }

    fn rotation_y(degrees: f64) -> Quaternion {
        Quaternion::from_axis_angle([0.0, 1.0, 0.0], degrees.to_radians())
    }

    #[test]
    fn test_requires_two_devices() {
        let processor = left_knee();
        let snap = snapshot(&[(DeviceId::LeftThigh, Quaternion::IDENTITY)]);
        assert_eq!(processor.process(&snap, 1_000).unwrap(), None);
    }

    #[test]
    fn test_requires_configured_pair() {
        let processor = left_knee();
        // Two devices, but the right leg's pair.
        let snap = snapshot(&[
            (DeviceId::RightThigh, Quaternion::IDENTITY),
            (DeviceId::RightShin, Quaternion::IDENTITY),
        ]);
        assert_eq!(processor.process(&snap, 1_000).unwrap(), None);
    }

    #[test]
    fn test_produces_rounded_stamped_sample() {
        let processor = left_knee();
        let snap = snapshot(&[
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, rotation_y(33.333_333)),
        ]);
        let sample = processor.process(&snap, 4_560).unwrap().unwrap();
        assert_eq!(sample.joint, "left_knee");
        assert_eq!(sample.timestamp_ms, 4_560);
        assert!((sample.angle_deg - 33.33).abs() < 1e-9);
        assert_eq!(sample.devices, [DeviceId::LeftThigh, DeviceId::LeftShin]);

        assert_eq!(processor.latest().unwrap(), sample);
    }

    #[test]
    fn test_extra_devices_tolerated() {
        let processor = left_knee();
        let snap = snapshot(&[
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, rotation_y(10.0)),
            (DeviceId::RightThigh, rotation_y(50.0)),
            (DeviceId::RightShin, rotation_y(70.0)),
        ]);
        let sample = processor.process(&snap, 1_000).unwrap().unwrap();
        assert!((sample.angle_deg - 10.0).abs() < 0.01);
    }

    #[test]
    fn test_subscribers_receive_samples() {
        let processor = left_knee();
        let mut rx = processor.subscribe();
        let snap = snapshot(&[
            (DeviceId::LeftThigh, Quaternion::IDENTITY),
            (DeviceId::LeftShin, rotation_y(45.0)),
        ]);
        processor.process(&snap, 1_000).unwrap();
        let received = rx.try_recv().unwrap();
        assert!((received.angle_deg - 45.0).abs() < 0.01);
    }

    fn sample_at(joint: &str, ts: u64) -> JointAngleSample {
        JointAngleSample {
            joint: joint.to_string(),
            angle_deg: 0.0,
            timestamp_ms: ts,
            devices: [DeviceId::LeftThigh, DeviceId::LeftShin],
            relative: Quaternion::IDENTITY,
        }
    }

    #[test]
    fn test_sorting_window_orders_by_timestamp() {
        let window = SortingWindow::new(16);
        window.push(sample_at("right_knee", 1_010));
        window.push(sample_at("left_knee", 1_000));
        window.push(sample_at("left_knee", 1_020));

        let ready = window.drain_ready(1_100);
        let timestamps: Vec<u64> = ready.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1_000, 1_010, 1_020]);
    }

    #[test]
    fn test_sorting_window_holds_young_samples() {
        let window = SortingWindow::new(16);
        window.push(sample_at("left_knee", 1_000));
        window.push(sample_at("left_knee", 1_095));

        let ready = window.drain_ready(1_100);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].timestamp_ms, 1_000);

        // The young sample is still pending and drains later.
        let rest = window.drain_all();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].timestamp_ms, 1_095);
    }
}
