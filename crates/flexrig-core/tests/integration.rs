//! End-to-end tests over the mock transport.
//!
//! These drive the coordinator the way the host application does:
//! scan, connect, sync, record, and the failure paths that matter
//! (silent radios, dropped links, partial stop failures).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use flexrig_core::mock::{MockPeripheral, MockTransport};
use flexrig_core::{
    Coordinator, ReconnectConfig, RigConfig, RigEvent, SinkConfig, StrategyConfig, Transport,
};
use flexrig_types::{DeviceId, DeviceState, GlobalMode, Quaternion, SyncState};

const LEFT_THIGH_ADDR: &str = "aa:bb:cc:dd:ee:12";
const LEFT_SHIN_ADDR: &str = "aa:bb:cc:dd:ee:11";

fn test_config(queue_dir: &std::path::Path) -> RigConfig {
    RigConfig {
        reconnect: ReconnectConfig {
            base_delay_ms: 50,
            max_delay_ms: 400,
            multiplier: 2.0,
            max_attempts: 3,
        },
        strategy: StrategyConfig {
            retry_delay_ms: 10,
            inter_connection_delay_ms: 10,
            stabilization_delay_ms: 10,
            state_verification_timeout_ms: 200,
            ..Default::default()
        },
        sink: SinkConfig {
            // Nothing listens here; uploads fail fast and queue.
            base_url: "http://127.0.0.1:9".to_string(),
            queue_dir: queue_dir.to_path_buf(),
            max_retries: 3,
            max_queue_size: 10,
            retry_interval_secs: 3_600,
        },
        sorting_window: false,
        ..Default::default()
    }
}

struct Rig {
    transport: Arc<MockTransport>,
    coordinator: Arc<Coordinator>,
    thigh: Arc<MockPeripheral>,
    shin: Arc<MockPeripheral>,
    _queue_dir: tempfile::TempDir,
}

async fn rig_with_pair() -> Rig {
    let queue_dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let thigh = transport.add_peripheral(LEFT_THIGH_ADDR, "FLEXRIG-12");
    let shin = transport.add_peripheral(LEFT_SHIN_ADDR, "FLEXRIG-11");
    let coordinator = Coordinator::new(
        test_config(queue_dir.path()),
        Arc::clone(&transport) as Arc<dyn flexrig_core::Transport>,
    )
    .unwrap();
    assert!(coordinator.initialize().await.unwrap());
    Rig {
        transport,
        coordinator,
        thigh,
        shin,
        _queue_dir: queue_dir,
    }
}

async fn connect_pair(rig: &Rig) {
    let scan = rig.coordinator.scan().await;
    assert!(scan.success);
    sleep(Duration::from_millis(50)).await;

    let response = rig.coordinator.connect(LEFT_THIGH_ADDR, "FLEXRIG-12").await;
    assert!(response.success, "{:?}", response.message);
    let response = rig.coordinator.connect(LEFT_SHIN_ADDR, "FLEXRIG-11").await;
    assert!(response.success, "{:?}", response.message);

    let store = rig.coordinator.store();
    assert_eq!(
        store.device_state(DeviceId::LeftThigh),
        Some(DeviceState::Connected)
    );
    assert_eq!(
        store.device_state(DeviceId::LeftShin),
        Some(DeviceState::Connected)
    );
}

fn rotation_y(degrees: f64) -> Quaternion {
    Quaternion::from_axis_angle([0.0, 1.0, 0.0], degrees.to_radians())
}

#[tokio::test]
async fn test_scan_discovers_and_registers_sensors() {
    let rig = rig_with_pair().await;

    let scan = rig.coordinator.scan().await;
    assert!(scan.success);
    sleep(Duration::from_millis(50)).await;

    let snapshot = rig.coordinator.get_all_devices();
    assert_eq!(snapshot.global_mode, GlobalMode::Scanning);
    assert_eq!(snapshot.devices.len(), 2);
    assert!(snapshot
        .devices
        .iter()
        .all(|d| d.state == DeviceState::Discovered));
    // Ordered by device id: shin (0x11) before thigh (0x12).
    assert_eq!(snapshot.devices[0].device_id, DeviceId::LeftShin);
    assert_eq!(snapshot.devices[1].device_id, DeviceId::LeftThigh);
}

#[tokio::test]
async fn test_scan_requests_coalesce() {
    let rig = rig_with_pair().await;

    assert!(rig.coordinator.scan().await.success);
    sleep(Duration::from_millis(50)).await;

    // A second request inside the restart interval serves a snapshot.
    let second = rig.coordinator.scan().await;
    assert!(second.success);
    assert_eq!(second.message.as_deref(), Some("scan already active"));
    assert_eq!(second.devices.len(), 2);
}

#[tokio::test]
async fn test_unknown_advertised_name_is_rejected() {
    let queue_dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    transport.add_peripheral("aa:bb:cc:dd:ee:99", "FLEXRIG-99");
    let coordinator = Coordinator::new(
        test_config(queue_dir.path()),
        Arc::clone(&transport) as Arc<dyn flexrig_core::Transport>,
    )
    .unwrap();
    coordinator.initialize().await.unwrap();

    coordinator.scan().await;
    sleep(Duration::from_millis(50)).await;

    // The 0x99 suffix names no sensor position: rejection, not a guess.
    assert!(coordinator.get_all_devices().devices.is_empty());

    let response = coordinator.connect("aa:bb:cc:dd:ee:99", "FLEXRIG-99").await;
    assert!(!response.success);
    assert!(response.message.unwrap().contains("unknown device pattern"));
}

#[tokio::test]
async fn test_connect_reads_battery_and_broadcasts() {
    let rig = rig_with_pair().await;
    rig.thigh.set_battery(42);
    let mut events = rig.coordinator.subscribe();

    connect_pair(&rig).await;

    let snapshot = rig.coordinator.get_all_devices();
    let thigh = snapshot
        .devices
        .iter()
        .find(|d| d.device_id == DeviceId::LeftThigh)
        .unwrap();
    assert_eq!(thigh.battery_pct, Some(42));
    assert_eq!(snapshot.global_mode, GlobalMode::Idle);

    // At least one forced snapshot covered the connected edge.
    let mut saw_connected = false;
    while let Ok(event) = events.try_recv() {
        if let RigEvent::StateUpdate(update) = event {
            if update
                .devices
                .iter()
                .any(|d| d.state == DeviceState::Connected)
            {
                saw_connected = true;
            }
        }
    }
    assert!(saw_connected);
}

#[tokio::test]
async fn test_sync_all_establishes_offsets() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    rig.thigh.set_device_clock(50_000);
    rig.shin.set_device_clock(1_000_000);
    let mut events = rig.coordinator.subscribe();

    let response = rig.coordinator.sync_all().await;
    assert!(response.success, "{:?}", response.results);
    assert_eq!(response.results.len(), 2);

    let store = rig.coordinator.store();
    for device in [DeviceId::LeftThigh, DeviceId::LeftShin] {
        let snap = store.device(device).unwrap();
        assert_eq!(snap.state, DeviceState::Synced);
        assert_eq!(snap.sync_state, SyncState::Synced);
        assert!(snap.clock_offset_ms.unwrap().is_finite());
        // Progress lingers at 100 until the next session.
        assert_eq!(snap.sync_progress, Some(100));
    }

    let mut saw_started = false;
    let mut saw_complete = false;
    while let Ok(event) = events.try_recv() {
        match event {
            RigEvent::SyncStarted { device_count } => {
                assert_eq!(device_count, 2);
                saw_started = true;
            }
            RigEvent::SyncComplete {
                total,
                success,
                failure,
            } => {
                assert_eq!((total, success, failure), (2, 2, 0));
                saw_complete = true;
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_complete);
}

#[tokio::test]
async fn test_sync_failure_returns_device_to_connected() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    rig.shin.mute_commands(true);

    let response = rig.coordinator.sync_all().await;
    assert!(!response.success);

    let store = rig.coordinator.store();
    // The muted device failed but was not disconnected.
    assert_eq!(
        store.device_state(DeviceId::LeftShin),
        Some(DeviceState::Connected)
    );
    // Its partner synced regardless: all-settled semantics.
    assert_eq!(
        store.device_state(DeviceId::LeftThigh),
        Some(DeviceState::Synced)
    );

    let shin_result = response
        .results
        .iter()
        .find(|r| r.device == DeviceId::LeftShin)
        .unwrap();
    assert!(!shin_result.success);
    assert!(shin_result.message.is_some());
}

#[tokio::test]
async fn test_recording_pipeline_produces_angles() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    let mut angles = rig.coordinator.subscribe_angles();

    let response = rig.coordinator.start_recording("session-1", "squat", 1).await;
    assert!(response.success, "{:?}", response.message);
    let recording_id = response.recording_id.unwrap();
    assert_eq!(
        rig.coordinator.store().global_mode(),
        GlobalMode::Streaming
    );
    assert_eq!(
        rig.coordinator.store().device_state(DeviceId::LeftThigh),
        Some(DeviceState::Streaming)
    );

    // Thigh level, shin at 90 degrees of flexion. First samples set the
    // baseline (thigh 10_000, shin 10_050), the rest stream through.
    let shin_q = rotation_y(90.0);
    rig.thigh.inject_quaternion(10_000, &Quaternion::IDENTITY).await;
    rig.shin.inject_quaternion(10_050, &shin_q).await;
    sleep(Duration::from_millis(20)).await;
    for i in 1..=20u32 {
        rig.thigh
            .inject_quaternion(10_000 + i * 10, &Quaternion::IDENTITY)
            .await;
        rig.shin.inject_quaternion(10_050 + i * 10, &shin_q).await;
    }
    sleep(Duration::from_millis(50)).await;

    let mut produced = Vec::new();
    while let Ok(sample) = angles.try_recv() {
        produced.push(sample);
    }
    assert!(!produced.is_empty(), "pipeline produced no angles");
    for sample in &produced {
        assert_eq!(sample.joint, "left_knee");
        assert!((sample.angle_deg.abs() - 90.0).abs() < 1.0, "{}", sample.angle_deg);
        assert!(sample.relative.is_unit(1e-5));
    }

    // Idempotent start: same recording id back.
    let again = rig.coordinator.start_recording("session-1", "squat", 1).await;
    assert!(again.success);
    assert_eq!(again.recording_id, Some(recording_id));

    let stop = rig.coordinator.stop_recording().await;
    assert!(stop.success, "{:?}", stop.message);
    assert_eq!(rig.coordinator.store().global_mode(), GlobalMode::Idle);
    assert!(!rig.coordinator.store().is_recording());
}

#[tokio::test]
async fn test_stop_recording_with_radio_error_degrades_gracefully() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    let mut events = rig.coordinator.subscribe();

    let response = rig.coordinator.start_recording("session-1", "squat", 1).await;
    assert!(response.success);

    // One sensor goes silent; its stop command will time out.
    rig.shin.mute_commands(true);
    let stop = rig.coordinator.stop_recording().await;

    // Degraded success: the cleanup still ran to completion.
    assert!(stop.success);
    assert!(stop.message.unwrap().contains("errors"));
    assert_eq!(rig.coordinator.store().global_mode(), GlobalMode::Idle);
    assert!(!rig.coordinator.store().is_recording());

    let mut saw_recording_stopped = false;
    while let Ok(event) = events.try_recv() {
        if let RigEvent::RecordingState {
            is_recording: false,
            ..
        } = event
        {
            saw_recording_stopped = true;
        }
    }
    assert!(saw_recording_stopped);
}

#[tokio::test]
async fn test_live_streaming_records_nothing() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    let mut angles = rig.coordinator.subscribe_angles();

    let response = rig.coordinator.start_streaming().await;
    assert!(response.success, "{:?}", response.message);
    assert_eq!(
        rig.coordinator.store().global_mode(),
        GlobalMode::Streaming
    );
    assert!(!rig.coordinator.store().is_recording());
    assert_eq!(
        rig.coordinator.store().device_state(DeviceId::LeftThigh),
        Some(DeviceState::Streaming)
    );

    rig.thigh.inject_quaternion(10_000, &Quaternion::IDENTITY).await;
    rig.shin.inject_quaternion(10_000, &Quaternion::IDENTITY).await;
    sleep(Duration::from_millis(20)).await;
    for i in 1..=10u32 {
        rig.thigh
            .inject_quaternion(10_000 + i * 10, &Quaternion::IDENTITY)
            .await;
        rig.shin
            .inject_quaternion(10_000 + i * 10, &Quaternion::IDENTITY)
            .await;
    }
    sleep(Duration::from_millis(50)).await;
    assert!(angles.try_recv().is_ok(), "live pipeline produced no angles");

    let stop = rig.coordinator.stop_streaming().await;
    assert!(stop.success, "{:?}", stop.message);
    assert_eq!(rig.coordinator.store().global_mode(), GlobalMode::Idle);

    // Nothing was recorded, uploaded, or queued.
    assert_eq!(
        std::fs::read_dir(rig._queue_dir.path()).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_recording_opens_over_live_stream() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    assert!(rig.coordinator.start_streaming().await.success);

    let response = rig.coordinator.start_recording("session-1", "squat", 1).await;
    assert!(response.success, "{:?}", response.message);
    assert!(rig.coordinator.store().is_recording());

    // stop_streaming with a recording open is the full stop path.
    let stop = rig.coordinator.stop_streaming().await;
    assert!(stop.success, "{:?}", stop.message);
    assert!(!rig.coordinator.store().is_recording());
    assert_eq!(rig.coordinator.store().global_mode(), GlobalMode::Idle);
}

#[tokio::test]
async fn test_stop_recording_is_idempotent() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;

    rig.coordinator.start_recording("session-1", "squat", 1).await;
    assert!(rig.coordinator.stop_recording().await.success);
    // Second stop with nothing in progress still succeeds.
    let second = rig.coordinator.stop_recording().await;
    assert!(second.success);
}

#[tokio::test]
async fn test_link_drop_schedules_reconnect_and_recovers() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;

    rig.transport.drop_link(LEFT_SHIN_ADDR);
    sleep(Duration::from_millis(20)).await;

    let store = rig.coordinator.store();
    assert_eq!(
        store.device_state(DeviceId::LeftShin),
        Some(DeviceState::Reconnecting)
    );

    // The 50 ms backoff elapses and the reconnect succeeds.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.device_state(DeviceId::LeftShin),
        Some(DeviceState::Connected)
    );
}

#[tokio::test]
async fn test_reconnect_exhaustion_parks_device_in_error() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;

    rig.shin.fail_next_connects(u32::MAX);
    rig.transport.drop_link(LEFT_SHIN_ADDR);

    // Backoffs 50 + 100 + 200 ms, then the third failure exhausts the
    // budget.
    sleep(Duration::from_millis(800)).await;

    let store = rig.coordinator.store();
    let snap = store.device(DeviceId::LeftShin).unwrap();
    assert_eq!(snap.state, DeviceState::Error);
    assert!(snap.last_error.unwrap().contains("MaxReconnectExceeded"));

    // Re-advertisement recovers it to discovered.
    rig.transport.advertise(LEFT_SHIN_ADDR);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        store.device_state(DeviceId::LeftShin),
        Some(DeviceState::Discovered)
    );
}

#[tokio::test]
async fn test_disconnect_cancels_reconnecting_without_radio() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;

    rig.shin.fail_next_connects(u32::MAX);
    rig.transport.drop_link(LEFT_SHIN_ADDR);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(
        rig.coordinator.store().device_state(DeviceId::LeftShin),
        Some(DeviceState::Reconnecting)
    );

    let response = rig.coordinator.disconnect(LEFT_SHIN_ADDR).await;
    assert!(response.success, "{:?}", response.message);
    assert_eq!(
        rig.coordinator.store().device_state(DeviceId::LeftShin),
        Some(DeviceState::Disconnected)
    );

    // No reconnect attempt fires later.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(
        rig.coordinator.store().device_state(DeviceId::LeftShin),
        Some(DeviceState::Disconnected)
    );
}

#[tokio::test]
async fn test_remove_purges_device_completely() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;

    let response = rig.coordinator.remove(LEFT_SHIN_ADDR).await;
    assert!(response.success);

    let store = rig.coordinator.store();
    assert_eq!(store.device(DeviceId::LeftShin), None);
    assert_eq!(store.id_for_address(LEFT_SHIN_ADDR), None);
    // Gone from the transport cache too.
    assert!(rig
        .transport
        .peripheral(LEFT_SHIN_ADDR)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_locate_mode_reports_shaken_device() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;
    let mut events = rig.coordinator.subscribe();

    let response = rig.coordinator.locate_start().await;
    assert!(response.success, "{:?}", response.message);
    assert_eq!(
        rig.coordinator.store().global_mode(),
        GlobalMode::Locating
    );
    assert_eq!(
        rig.thigh.firmware_state(),
        flexrig_types::FirmwareState::Locate
    );

    // The thigh sensor gets shaken; the shin rests at 1 g.
    for i in 0..5u32 {
        rig.thigh.inject_accel(20_000 + i * 20, 2.5, 0.5, 1.0).await;
        rig.shin.inject_accel(20_000 + i * 20, 0.0, 0.0, 1.0).await;
    }
    sleep(Duration::from_millis(50)).await;

    let mut vibrating = None;
    while let Ok(event) = events.try_recv() {
        if let RigEvent::DeviceVibrating { device_ids } = event {
            vibrating = Some(device_ids);
        }
    }
    assert_eq!(vibrating, Some(vec![DeviceId::LeftThigh]));

    let response = rig.coordinator.locate_stop().await;
    assert!(response.success);
    assert_eq!(rig.coordinator.store().global_mode(), GlobalMode::Idle);
    assert_eq!(
        rig.thigh.firmware_state(),
        flexrig_types::FirmwareState::Idle
    );
}

#[tokio::test]
async fn test_failed_upload_lands_in_persistent_queue() {
    let queue_dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new();
    let thigh = transport.add_peripheral(LEFT_THIGH_ADDR, "FLEXRIG-12");
    let shin = transport.add_peripheral(LEFT_SHIN_ADDR, "FLEXRIG-11");
    let coordinator = Coordinator::new(
        test_config(queue_dir.path()),
        Arc::clone(&transport) as Arc<dyn flexrig_core::Transport>,
    )
    .unwrap();
    coordinator.initialize().await.unwrap();
    coordinator.scan().await;
    sleep(Duration::from_millis(50)).await;
    assert!(coordinator.connect(LEFT_THIGH_ADDR, "FLEXRIG-12").await.success);
    assert!(coordinator.connect(LEFT_SHIN_ADDR, "FLEXRIG-11").await.success);

    coordinator.start_recording("session-1", "squat", 1).await;
    thigh.inject_quaternion(10_000, &Quaternion::IDENTITY).await;
    shin.inject_quaternion(10_000, &Quaternion::IDENTITY).await;
    sleep(Duration::from_millis(20)).await;
    for i in 1..=10u32 {
        thigh.inject_quaternion(10_000 + i * 10, &Quaternion::IDENTITY).await;
        shin.inject_quaternion(10_000 + i * 10, &Quaternion::IDENTITY).await;
    }
    sleep(Duration::from_millis(50)).await;
    coordinator.stop_recording().await;

    // Nothing listens on the sink port, so the recording is queued on
    // disk for the retry sweep.
    let queued: Vec<_> = std::fs::read_dir(queue_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(queued.len(), 1);
    let content = std::fs::read_to_string(queued[0].path()).unwrap();
    assert!(content.contains("left_knee"));
    assert!(content.contains("session-1"));
}

#[tokio::test]
async fn test_clear_states_purges_everything() {
    let rig = rig_with_pair().await;
    connect_pair(&rig).await;

    let response = rig.coordinator.clear_states().await;
    assert!(response.success);

    let snapshot = rig.coordinator.get_all_devices();
    assert!(snapshot.devices.is_empty());
    assert_eq!(snapshot.global_mode, GlobalMode::Idle);
}
