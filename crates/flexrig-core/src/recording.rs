//! Recording accumulation.
//!
//! While the rig streams, joint angles accumulate here under a
//! session/exercise/set identifier triple. Finalizing produces the
//! [`Recording`] document handed to the sink; per-joint traces are
//! ring-capped so a runaway recording cannot grow without bound.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use tracing::{debug, info};
use uuid::Uuid;

use flexrig_types::{JointAngleSample, JointTrace, Recording};

use crate::transport::unix_ms;

/// Ring capacity per joint trace; ample for a single recording window.
pub const MAX_TRACE_SAMPLES: usize = 5_000;

#[derive(Debug)]
struct TraceAccumulator {
    values: VecDeque<f64>,
    min: f64,
    max: f64,
    count: u64,
    first_ts: u64,
    last_ts: u64,
}

impl TraceAccumulator {
    fn new(sample: &JointAngleSample) -> Self {
        Self {
            values: VecDeque::from([sample.angle_deg]),
            min: sample.angle_deg,
            max: sample.angle_deg,
            count: 1,
            first_ts: sample.timestamp_ms,
            last_ts: sample.timestamp_ms,
        }
    }

    fn push(&mut self, sample: &JointAngleSample) {
        self.values.push_back(sample.angle_deg);
        while self.values.len() > MAX_TRACE_SAMPLES {
            self.values.pop_front();
        }
        self.min = self.min.min(sample.angle_deg);
        self.max = self.max.max(sample.angle_deg);
        self.count += 1;
        self.last_ts = self.last_ts.max(sample.timestamp_ms);
    }

    fn into_trace(self) -> JointTrace {
        JointTrace {
            values: self.values.into(),
            min: self.min,
            max: self.max,
            count: self.count,
            duration_ms: self.last_ts.saturating_sub(self.first_ts),
        }
    }
}

#[derive(Debug)]
struct ActiveRecording {
    recording_id: Uuid,
    session_id: String,
    exercise_id: String,
    set_number: u32,
    start_time: u64,
    traces: HashMap<String, TraceAccumulator>,
}

/// Accumulates joint angles for the recording in progress.
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    inner: Mutex<Option<ActiveRecording>>,
}

impl RecordingBuffer {
    /// Create a closed buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a recording, or return the one already open.
    ///
    /// Starting twice is idempotent: the second call gets the same
    /// recording id and start time back.
    pub fn start(&self, session_id: &str, exercise_id: &str, set_number: u32) -> (Uuid, u64) {
        let mut inner = self.lock();
        if let Some(active) = inner.as_ref() {
            return (active.recording_id, active.start_time);
        }
        let recording_id = Uuid::new_v4();
        let start_time = unix_ms();
        info!(%recording_id, session_id, exercise_id, set_number, "recording started");
        *inner = Some(ActiveRecording {
            recording_id,
            session_id: session_id.to_string(),
            exercise_id: exercise_id.to_string(),
            set_number,
            start_time,
            traces: HashMap::new(),
        });
        (recording_id, start_time)
    }

    /// Whether a recording is open.
    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// The open recording's id, if any.
    pub fn current_id(&self) -> Option<Uuid> {
        self.lock().as_ref().map(|a| a.recording_id)
    }

    /// Append one joint angle to the open recording; a closed buffer
    /// drops the sample.
    pub fn push(&self, sample: &JointAngleSample) {
        let mut inner = self.lock();
        let Some(active) = inner.as_mut() else {
            return;
        };
        match active.traces.get_mut(&sample.joint) {
            Some(trace) => trace.push(sample),
            None => {
                active
                    .traces
                    .insert(sample.joint.clone(), TraceAccumulator::new(sample));
            }
        }
    }

    /// Close the recording and produce its document.
    ///
    /// Returns `None` when no joint accumulated any data (the recording
    /// is discarded, not uploaded). Idempotent in the sense that a
    /// second finalize on a closed buffer is a clean `None`.
    pub fn finalize(&self) -> Option<Recording> {
        let active = self.lock().take()?;
        let duration_ms = unix_ms().saturating_sub(active.start_time);

        if active.traces.is_empty() {
            debug!(recording_id = %active.recording_id, "recording had no data, discarding");
            return None;
        }

        let joints: BTreeMap<String, JointTrace> = active
            .traces
            .into_iter()
            .map(|(name, trace)| (name, trace.into_trace()))
            .collect();

        info!(
            recording_id = %active.recording_id,
            duration_ms,
            joints = joints.len(),
            "recording finalized"
        );
        Some(Recording {
            recording_id: active.recording_id,
            session_id: active.session_id,
            exercise_id: active.exercise_id,
            set_number: active.set_number,
            start_time: active.start_time,
            duration_ms,
            joints,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveRecording>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexrig_types::{DeviceId, Quaternion};

    fn sample(joint: &str, angle: f64, ts: u64) -> JointAngleSample {
        JointAngleSample {
            joint: joint.to_string(),
            angle_deg: angle,
            timestamp_ms: ts,
            devices: [DeviceId::LeftThigh, DeviceId::LeftShin],
            relative: Quaternion::IDENTITY,
        }
    }

    #[test]
    fn test_start_is_idempotent() {
        let buffer = RecordingBuffer::new();
        let (id1, t1) = buffer.start("s1", "squat", 1);
        let (id2, t2) = buffer.start("s1", "squat", 1);
        assert_eq!(id1, id2);
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_accumulates_per_joint() {
        let buffer = RecordingBuffer::new();
        buffer.start("s1", "squat", 1);
        buffer.push(&sample("left_knee", 10.0, 1_000));
        buffer.push(&sample("left_knee", 90.0, 1_010));
        buffer.push(&sample("left_knee", 45.0, 1_020));
        buffer.push(&sample("right_knee", -5.0, 1_010));

        let recording = buffer.finalize().unwrap();
        assert_eq!(recording.joints.len(), 2);

        let left = &recording.joints["left_knee"];
        assert_eq!(left.values, vec![10.0, 90.0, 45.0]);
        assert_eq!(left.min, 10.0);
        assert_eq!(left.max, 90.0);
        assert_eq!(left.count, 3);
        assert_eq!(left.duration_ms, 20);

        let right = &recording.joints["right_knee"];
        assert_eq!(right.count, 1);
        assert_eq!(right.duration_ms, 0);
    }

    #[test]
    fn test_empty_recording_finalizes_to_none() {
        let buffer = RecordingBuffer::new();
        buffer.start("s1", "squat", 1);
        assert!(buffer.finalize().is_none());
        // Second finalize on the closed buffer is a clean None too.
        assert!(buffer.finalize().is_none());
        assert!(!buffer.is_open());
    }

    #[test]
    fn test_pushes_to_closed_buffer_dropped() {
        let buffer = RecordingBuffer::new();
        buffer.push(&sample("left_knee", 10.0, 1_000));
        buffer.start("s1", "squat", 1);
        buffer.push(&sample("left_knee", 20.0, 1_010));
        let recording = buffer.finalize().unwrap();
        assert_eq!(recording.joints["left_knee"].values, vec![20.0]);
    }

    #[test]
    fn test_trace_ring_cap() {
        let buffer = RecordingBuffer::new();
        buffer.start("s1", "squat", 1);
        for i in 0..(MAX_TRACE_SAMPLES + 100) {
            buffer.push(&sample("left_knee", i as f64, 1_000 + i as u64 * 10));
        }
        let recording = buffer.finalize().unwrap();
        let trace = &recording.joints["left_knee"];
        assert_eq!(trace.values.len(), MAX_TRACE_SAMPLES);
        // Count keeps the true total; min/max cover the whole run.
        assert_eq!(trace.count, (MAX_TRACE_SAMPLES + 100) as u64);
        assert_eq!(trace.min, 0.0);
        assert_eq!(trace.max, (MAX_TRACE_SAMPLES + 99) as f64);
        // The ring kept the newest values.
        assert_eq!(trace.values[0], 100.0);
    }

    #[test]
    fn test_new_recording_after_finalize_gets_new_id() {
        let buffer = RecordingBuffer::new();
        let (first, _) = buffer.start("s1", "squat", 1);
        buffer.push(&sample("left_knee", 1.0, 1_000));
        buffer.finalize().unwrap();

        let (second, _) = buffer.start("s1", "squat", 2);
        assert_ne!(first, second);
    }
}
