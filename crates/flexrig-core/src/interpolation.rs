//! Fixed-grid quaternion interpolation.
//!
//! Sensors deliver samples on their own schedule; joints need every
//! device's orientation at the same instant. The engine keeps one
//! time-ordered buffer per device and snaps each inbound sample to a
//! shared temporal grid (`1000 / target_hz` ms spacing). The grid
//! origin is the first grid boundary at or after the first sample seen
//! after construction or reset, so the grid lives in the same time
//! domain as the corrected timestamps feeding it. The first sample to
//! land on an unprocessed grid point triggers interpolation of every
//! buffered device at that instant.
//!
//! No I/O happens here; the engine is driven synchronously from the
//! motion dispatch hook and returns the emitted batch to its caller.

use std::collections::{BTreeSet, HashMap, VecDeque};

use flexrig_types::{DeviceId, Quaternion};

/// Samples kept per device; roughly half a second at the capture rate.
const MAX_BUFFER_SAMPLES: usize = 64;

/// Processed grid points remembered for duplicate suppression.
const MAX_PROCESSED_POINTS: usize = 256;

/// One interpolated orientation on the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GridSample {
    /// The device.
    pub device_id: DeviceId,
    /// Interpolated unit quaternion.
    pub quaternion: Quaternion,
    /// Grid timestamp on the common baseline, ms.
    pub timestamp_ms: u64,
}

/// Per-device buffers and the shared grid.
pub struct InterpolationEngine {
    grid_interval: u64,
    origin: Option<u64>,
    buffers: HashMap<DeviceId, VecDeque<(u64, Quaternion)>>,
    processed: BTreeSet<u64>,
    last_emitted: Option<u64>,
}

impl InterpolationEngine {
    /// Create an engine with the given grid spacing; the origin aligns
    /// to the next boundary when the first sample arrives.
    pub fn new(grid_interval: u64) -> Self {
        Self {
            grid_interval: grid_interval.max(1),
            origin: None,
            buffers: HashMap::new(),
            processed: BTreeSet::new(),
            last_emitted: None,
        }
    }

    /// The grid spacing in milliseconds.
    pub fn grid_interval(&self) -> u64 {
        self.grid_interval
    }

    /// The grid origin, once the first sample has established it.
    pub fn origin(&self) -> Option<u64> {
        self.origin
    }

    /// Ingest one sample on the common baseline.
    ///
    /// Returns the batch of per-device grid samples when this sample's
    /// grid point had not been processed yet, `None` otherwise. Every
    /// returned quaternion is unit within 1e-5, and grid timestamps
    /// emitted over time are strictly monotonic multiples of the grid
    /// interval.
    pub fn process_sample(
        &mut self,
        device: DeviceId,
        quaternion: Quaternion,
        timestamp_ms: u64,
    ) -> Option<Vec<GridSample>> {
        let quaternion = quaternion.normalize();
        let origin = match self.origin {
            Some(origin) => origin,
            None => {
                let origin = timestamp_ms.div_ceil(self.grid_interval) * self.grid_interval;
                self.origin = Some(origin);
                origin
            }
        };
        self.insert_ordered(device, timestamp_ms, quaternion);

        let grid_t = self.snap_to_grid(origin, timestamp_ms);
        if self.processed.contains(&grid_t) {
            return None;
        }
        // A straggler snapping behind an already-emitted grid point
        // would break per-device monotonicity; its sample stays in the
        // buffer for future interpolation but emits nothing now.
        if self.last_emitted.is_some_and(|last| grid_t <= last) {
            return None;
        }
        self.processed.insert(grid_t);
        while self.processed.len() > MAX_PROCESSED_POINTS {
            let oldest = *self.processed.iter().next().expect("non-empty");
            self.processed.remove(&oldest);
        }
        self.last_emitted = Some(grid_t);

        let mut batch = Vec::with_capacity(self.buffers.len());
        for (id, buffer) in &self.buffers {
            if let Some(quaternion) = interpolate_at(buffer, grid_t) {
                batch.push(GridSample {
                    device_id: *id,
                    quaternion,
                    timestamp_ms: grid_t,
                });
            }
        }
        batch.sort_by_key(|s| s.device_id);
        Some(batch)
    }

    /// Drop all buffers and grid history; the next sample re-anchors
    /// the origin.
    pub fn reset(&mut self) {
        self.buffers.clear();
        self.processed.clear();
        self.last_emitted = None;
        self.origin = None;
    }

    fn snap_to_grid(&self, origin: u64, timestamp_ms: u64) -> u64 {
        let delta = timestamp_ms as i64 - origin as i64;
        let interval = self.grid_interval as i64;
        // Round-half-up to the nearest grid index; early samples snap
        // to the origin itself.
        let index = ((2 * delta + interval) / (2 * interval)).max(0);
        origin + index as u64 * self.grid_interval
    }

    fn insert_ordered(&mut self, device: DeviceId, timestamp_ms: u64, quaternion: Quaternion) {
        let buffer = self.buffers.entry(device).or_default();
        let at = buffer.partition_point(|(ts, _)| *ts <= timestamp_ms);
        buffer.insert(at, (timestamp_ms, quaternion));
        while buffer.len() > MAX_BUFFER_SAMPLES {
            buffer.pop_front();
        }
    }
}

/// Interpolate a device buffer at a grid instant.
///
/// With samples on both sides the result is the shortest-arc SLERP
/// between the bracketing pair; with only one side the nearest sample
/// is used verbatim; an empty buffer yields nothing.
fn interpolate_at(buffer: &VecDeque<(u64, Quaternion)>, grid_t: u64) -> Option<Quaternion> {
    if buffer.is_empty() {
        return None;
    }

    let after_idx = buffer.partition_point(|(ts, _)| *ts < grid_t);
    let before = after_idx.checked_sub(1).map(|i| buffer[i]);
    let after = buffer.get(after_idx).copied();

    match (before, after) {
        (Some((t0, q0)), Some((t1, q1))) => {
            if t0 == t1 {
                return Some(q0);
            }
            let frac = (grid_t - t0) as f64 / (t1 - t0) as f64;
            Some(q0.slerp(&q1, frac))
        }
        (Some((_, q)), None) | (None, Some((_, q))) => Some(q.normalize()),
        (None, None) => None,
    }
}
