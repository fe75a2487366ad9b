//! Shake detection for locate mode.
//!
//! When the operator cannot tell which physical sensor is which, locate
//! mode streams accelerometer data and watches for the one being
//! shaken: at rest a sensor reads ~1 g of gravity, shaking swings the
//! magnitude well away from it. The detector keeps a short window of
//! magnitude deviations per device and reports the vibrating set only
//! when it changes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use flexrig_types::{AccelSample, DeviceId};

/// Shake sensitivity settings.
#[derive(Debug, Clone)]
pub struct ShakeConfig {
    /// Deviation from 1 g that counts as shaking.
    pub threshold_g: f64,
    /// How long a device stays "vibrating" after its last strong
    /// deviation, in host milliseconds.
    pub window_ms: u64,
}

impl Default for ShakeConfig {
    fn default() -> Self {
        Self {
            threshold_g: 0.6,
            window_ms: 400,
        }
    }
}

#[derive(Default)]
struct Inner {
    /// Per-device `(host_ms, |magnitude - 1|)` history within the window.
    deviations: HashMap<DeviceId, VecDeque<(u64, f64)>>,
    vibrating: Vec<DeviceId>,
}

/// Tracks which devices are being shaken.
pub struct ShakeDetector {
    config: ShakeConfig,
    inner: Mutex<Inner>,
}

impl ShakeDetector {
    /// Create a detector.
    pub fn new(config: ShakeConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Feed one accelerometer sample observed at `now_ms` host time.
    ///
    /// Returns the new vibrating set when it differs from the last one
    /// reported, `None` while it is unchanged.
    pub fn observe(
        &self,
        device: DeviceId,
        sample: &AccelSample,
        now_ms: u64,
    ) -> Option<Vec<DeviceId>> {
        let deviation = (sample.magnitude() - 1.0).abs();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let history = inner.deviations.entry(device).or_default();
        history.push_back((now_ms, deviation));
        let cutoff = now_ms.saturating_sub(self.config.window_ms);
        while history.front().is_some_and(|(ts, _)| *ts < cutoff) {
            history.pop_front();
        }

        let threshold = self.config.threshold_g;
        let mut vibrating: Vec<DeviceId> = inner
            .deviations
            .iter()
            .filter(|(_, history)| {
                history
                    .iter()
                    .any(|(ts, dev)| *ts >= cutoff && *dev > threshold)
            })
            .map(|(id, _)| *id)
            .collect();
        vibrating.sort();

        if vibrating == inner.vibrating {
            return None;
        }
        inner.vibrating = vibrating.clone();
        Some(vibrating)
    }

    /// The last reported vibrating set.
    pub fn current(&self) -> Vec<DeviceId> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .vibrating
            .clone()
    }

    /// Forget all history (used when locate mode stops).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.deviations.clear();
        inner.vibrating.clear();
    }
}
