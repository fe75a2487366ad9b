//! Top-level orchestration.
//!
//! The [`Coordinator`] glues the transport, state store, device
//! sessions, data plane, and recording together and exposes the
//! outward command surface the host application calls. Control flows in
//! from these commands and from asynchronous transport events; data
//! flows from sessions through the store's dispatch hook into the
//! interpolation grid, the joint processors, and the recording buffer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flexrig_types::{
    DeviceId, DeviceState, FirmwareState, GlobalMode, JointAngleSample, Quaternion,
};
use uuid::Uuid;

use crate::config::RigConfig;
use crate::datasync::{DataSyncConfig, DataSyncService};
use crate::error::{Error, Result};
use crate::events::{DeviceSnapshot, RigEvent, RigEventReceiver, RigEventSender, StateUpdate};
use crate::interpolation::InterpolationEngine;
use crate::joints::{JointProcessor, SortingWindow};
use crate::locate::{ShakeConfig, ShakeDetector};
use crate::recording::RecordingBuffer;
use crate::reconnect::ReconnectionManager;
use crate::session::DeviceSession;
use crate::sink::UploadPipeline;
use crate::store::{DevicePatch, StateStore};
use crate::strategy::{ConnectionStrategy, strategy_from_config};
use crate::timesync::{TimeSyncConfig, TimeSyncRunner};
use crate::transport::{LinkState, Transport, TransportEvent, unix_ms};
use crate::watchdog::Watchdog;

/// Result of a scan request.
#[derive(Debug, Clone)]
pub struct ScanResponse {
    /// Whether the scan is running (or a coalesced snapshot was served).
    pub success: bool,
    /// Devices currently in the discovered state.
    pub devices: Vec<DeviceSnapshot>,
    /// Failure detail; scan failures are reported, never fatal.
    pub message: Option<String>,
}

/// Result of a simple command.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Whether the command succeeded (possibly degraded).
    pub success: bool,
    /// Detail, including aggregated partial errors.
    pub message: Option<String>,
}

impl CommandResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Per-device outcome of a sync session.
#[derive(Debug, Clone)]
pub struct DeviceSyncResult {
    /// The device.
    pub device: DeviceId,
    /// Whether the device synced.
    pub success: bool,
    /// The established offset on success.
    pub offset_ms: Option<f64>,
    /// Failure detail.
    pub message: Option<String>,
}

/// Result of `sync_all`.
#[derive(Debug, Clone)]
pub struct SyncAllResponse {
    /// Whether every attempted device synced.
    pub success: bool,
    /// One entry per attempted device.
    pub results: Vec<DeviceSyncResult>,
}

/// Result of `start_recording`.
#[derive(Debug, Clone)]
pub struct StartRecordingResponse {
    /// Whether a recording is open.
    pub success: bool,
    /// The recording id when open.
    pub recording_id: Option<Uuid>,
    /// Failure detail.
    pub message: Option<String>,
}

/// The rig orchestrator.
pub struct Coordinator {
    config: RigConfig,
    transport: Arc<dyn Transport>,
    store: Arc<StateStore>,
    events: RigEventSender,
    strategy: Arc<dyn ConnectionStrategy>,
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    reconnect: Arc<ReconnectionManager>,
    watchdog: Arc<Watchdog>,
    timesync: TimeSyncRunner,
    datasync: Arc<DataSyncService>,
    engine: StdMutex<InterpolationEngine>,
    joints: Vec<Arc<JointProcessor>>,
    angles: broadcast::Sender<JointAngleSample>,
    sorting: Option<Arc<SortingWindow>>,
    recording: RecordingBuffer,
    uploads: UploadPipeline,
    shake: ShakeDetector,
    /// Per-address setup locks: one in-flight setup per peripheral.
    setup_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_scan_restart: StdMutex<Option<Instant>>,
    pump: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    flush_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    weak: Weak<Self>,
}

impl Coordinator {
    /// Build a coordinator over a transport.
    ///
    /// Requires a running tokio runtime; background tasks (broadcast
    /// debounce, upload retries) are spawned here. Call
    /// [`Coordinator::initialize`] before issuing commands.
    pub fn new(config: RigConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;

        let (events, _) = crate::events::event_channel(256);
        let store = StateStore::new(events.clone());
        let watchdog = Watchdog::new(config.watchdog.clone(), Arc::clone(&store));
        let datasync = DataSyncService::new(DataSyncConfig::default());
        let engine = InterpolationEngine::new(config.grid_interval_ms());
        let joints: Vec<Arc<JointProcessor>> = config
            .joints
            .iter()
            .map(|j| Arc::new(JointProcessor::new(j.clone())))
            .collect();
        let uploads = UploadPipeline::from_config(&config.sink)?;
        uploads.start_retry_task();
        let strategy = strategy_from_config(&config.strategy);
        let (angles, _) = broadcast::channel(512);
        let sorting = config
            .sorting_window
            .then(|| Arc::new(SortingWindow::default_window()));

        // The ordered window drains to the combined angle feed at
        // roughly display rate.
        let flush_task = sorting.clone().map(|window| {
            let angles = angles.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(16));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    for sample in window.drain_ready(unix_ms()) {
                        let _ = angles.send(sample);
                    }
                }
            })
        });

        Ok(Arc::new_cyclic(|weak: &Weak<Coordinator>| {
            let reconnect = ReconnectionManager::new(
                Arc::clone(&store),
                config.reconnect.clone(),
                reconnect_closure(weak.clone()),
                restart_streaming_closure(weak.clone()),
            );
            let timesync = TimeSyncRunner::new(
                Arc::clone(&store),
                events.clone(),
                TimeSyncConfig::default(),
            );
            Self {
                strategy,
                transport,
                store,
                events,
                timesync,
                sessions: RwLock::new(HashMap::new()),
                reconnect,
                watchdog,
                datasync,
                engine: StdMutex::new(engine),
                joints,
                angles,
                sorting,
                recording: RecordingBuffer::new(),
                uploads,
                shake: ShakeDetector::new(ShakeConfig::default()),
                setup_locks: Mutex::new(HashMap::new()),
                last_scan_restart: StdMutex::new(None),
                pump: StdMutex::new(None),
                flush_task: StdMutex::new(flush_task),
                weak: weak.clone(),
                config,
            }
        }))
    }

    /// Open the radio and start consuming transport events.
    pub async fn initialize(&self) -> Result<bool> {
        if !self.transport.initialize().await? {
            return Ok(false);
        }

        let weak = self.weak.clone();
        let mut events = self.transport.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(coordinator) = weak.upgrade() else { break };
                coordinator.handle_transport_event(event).await;
            }
        });
        *self.pump.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(true)
    }

    /// Subscribe to the outward broadcast channel.
    pub fn subscribe(&self) -> RigEventReceiver {
        self.events.subscribe()
    }

    /// Subscribe to the combined joint-angle feed.
    pub fn subscribe_angles(&self) -> broadcast::Receiver<JointAngleSample> {
        self.angles.subscribe()
    }

    /// The configured joint processors.
    pub fn joints(&self) -> &[Arc<JointProcessor>] {
        &self.joints
    }

    /// The state store (queries only; mutations stay in here).
    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    // --- Outward command surface ---

    /// Start or coalesce a scan.
    ///
    /// While a scan is active, repeated requests inside the restart
    /// interval serve a snapshot of currently discovered devices
    /// instead of thrashing the radio.
    pub async fn scan(&self) -> ScanResponse {
        let discovered = || {
            self.store
                .snapshot()
                .devices
                .into_iter()
                .filter(|d| d.state == DeviceState::Discovered)
                .collect::<Vec<_>>()
        };

        let restart_gap = Duration::from_millis(self.config.scan_burst_gap_ms);
        if self.store.global_mode() == GlobalMode::Scanning {
            let recent = self
                .last_scan_restart
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .is_some_and(|at| at.elapsed() < restart_gap);
            if recent {
                return ScanResponse {
                    success: true,
                    devices: discovered(),
                    message: Some("scan already active".into()),
                };
            }
            let _ = self.transport.stop_scan().await;
        }

        self.store.set_global_mode(GlobalMode::Scanning);
        match self.transport.start_scan().await {
            Ok(()) => {
                *self
                    .last_scan_restart
                    .lock()
                    .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());
                ScanResponse {
                    success: true,
                    devices: discovered(),
                    message: None,
                }
            }
            Err(e) => {
                // Scan failures are reported but never fatal.
                self.store.set_global_mode(GlobalMode::Idle);
                warn!(error = %e, "scan failed");
                ScanResponse {
                    success: false,
                    devices: discovered(),
                    message: Some(e.to_string()),
                }
            }
        }
    }

    /// Connect one peripheral and set up its session.
    pub async fn connect(&self, address: &str, advertised_name: &str) -> CommandResponse {
        let device_id = match self.store.register_device(address, advertised_name) {
            Ok(id) => id,
            Err(e) => return CommandResponse::fail(e.to_string()),
        };

        if self.store.global_mode() == GlobalMode::Scanning {
            let _ = self.transport.stop_scan().await;
        }
        self.store.set_global_mode(GlobalMode::Connecting);
        let result = self.connect_inner(address, device_id).await;
        self.store.set_global_mode(GlobalMode::Idle);
        self.store.force_broadcast();

        match result {
            Ok(()) => CommandResponse::ok(),
            Err(e) => CommandResponse::fail(e.to_string()),
        }
    }

    async fn connect_inner(&self, address: &str, device_id: DeviceId) -> Result<()> {
        let setup_lock = self.setup_lock(address).await;
        let _guard = setup_lock.lock().await;

        match self.store.device_state(device_id) {
            Some(DeviceState::Connected | DeviceState::Synced | DeviceState::Streaming) => {
                return Ok(());
            }
            Some(DeviceState::Discovered | DeviceState::Disconnected) => {
                self.store.transition(device_id, DeviceState::Connecting)?;
            }
            Some(DeviceState::Connecting | DeviceState::Reconnecting) => {
                return Err(Error::connection_failed(address, "connect already in flight"));
            }
            Some(other) => {
                return Err(Error::connection_failed(
                    address,
                    format!("device is {other}"),
                ));
            }
            None => return Err(Error::unavailable(address)),
        }

        let link = self
            .transport
            .peripheral(address)
            .await?
            .ok_or_else(|| Error::unavailable(address))?;

        let outcomes = self.strategy.connect(vec![link.clone()]).await;
        let outcome = outcomes
            .first()
            .ok_or_else(|| Error::connection_failed(address, "no outcome from strategy"))?;
        if let Err(reason) = &outcome.result {
            // Failed connects enter the backoff machinery rather than
            // dead-ending: the reconnection manager owns the retries.
            self.reconnect_manager()
                .schedule_reconnect(device_id, reason);
            return Err(Error::connection_failed(address, reason.clone()));
        }

        self.setup_session(device_id, address).await
    }

    /// Build the session for a connected link and move the device to
    /// `Connected`. Callers hold the per-address setup lock.
    async fn setup_session(&self, device_id: DeviceId, address: &str) -> Result<()> {
        let link = self
            .transport
            .peripheral(address)
            .await?
            .ok_or_else(|| Error::unavailable(address))?;

        let weak = self.weak.clone();
        let accel_hook: crate::session::AccelHook = Arc::new(move |device, sample| {
            if let Some(coordinator) = weak.upgrade() {
                if let Some(set) = coordinator.shake.observe(device, &sample, unix_ms()) {
                    let _ = coordinator
                        .events
                        .send(RigEvent::DeviceVibrating { device_ids: set });
                }
            }
        });

        let session = DeviceSession::attach(
            link,
            device_id,
            Arc::clone(&self.store),
            Arc::clone(&self.watchdog),
            accel_hook,
        )
        .await?;

        let weak = self.weak.clone();
        self.store.register_hook(
            device_id,
            Arc::new(move |device, sample| {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.ingest_motion(device, sample.quaternion, sample.device_timestamp_ms);
                }
            }),
        );

        let previous = self
            .sessions
            .write()
            .await
            .insert(address.to_string(), Arc::clone(&session));
        if let Some(previous) = previous {
            previous.detach().await;
        }

        self.store.transition(device_id, DeviceState::Connected)?;

        match session.get_battery_level().await {
            Ok(pct) => self.store.update_fields(
                device_id,
                DevicePatch {
                    battery_pct: Some(pct),
                    ..Default::default()
                },
            ),
            Err(e) => debug!(%device_id, error = %e, "battery read failed"),
        }

        info!(%device_id, address, "device connected");
        Ok(())
    }

    /// The synchronous data-plane path: baseline-correct, interpolate,
    /// derive joints, record. Runs inside the motion dispatch hook; no
    /// I/O, no locks held across user callbacks.
    fn ingest_motion(&self, device: DeviceId, quaternion: Quaternion, device_ts: u64) {
        let Some(corrected) = self.datasync.observe(device, device_ts) else {
            return;
        };
        let batch = {
            let mut engine = self.engine.lock().unwrap_or_else(|p| p.into_inner());
            engine.process_sample(device, quaternion, corrected)
        };
        let Some(batch) = batch else { return };
        let grid_ts = match batch.first() {
            Some(sample) => sample.timestamp_ms,
            None => return,
        };
        let snapshot: HashMap<DeviceId, Quaternion> = batch
            .into_iter()
            .map(|s| (s.device_id, s.quaternion))
            .collect();

        for joint in &self.joints {
            match joint.process(&snapshot, grid_ts) {
                Ok(Some(sample)) => {
                    if self.recording.is_open() {
                        self.recording.push(&sample);
                    }
                    match &self.sorting {
                        Some(window) => window.push(sample),
                        None => {
                            let _ = self.angles.send(sample);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(joint = joint.name(), error = %e, "joint computation failed"),
            }
        }
    }

    /// Disconnect a peripheral; also cancels in-flight connect or
    /// scheduled reconnect attempts.
    pub async fn disconnect(&self, address: &str) -> CommandResponse {
        let Some(device_id) = self.store.id_for_address(address) else {
            return CommandResponse::fail(format!("unknown address {address}"));
        };

        let result = match self.store.device_state(device_id) {
            Some(DeviceState::Reconnecting) => {
                // Timer-only path: the radio is not touched.
                self.reconnect_manager().cancel_reconnect(device_id);
                self.store.transition(device_id, DeviceState::Disconnected)
            }
            Some(DeviceState::Connecting) => {
                // Cancel an in-flight connect: the disconnect may be a
                // no-op depending on radio state.
                if let Ok(Some(link)) = self.transport.peripheral(address).await {
                    let _ = link.disconnect().await;
                }
                self.drop_session(address).await;
                self.store
                    .transition(device_id, DeviceState::Reconnecting)
                    .and_then(|_| {
                        self.reconnect_manager().cancel_reconnect(device_id);
                        self.store.transition(device_id, DeviceState::Disconnected)
                    })
            }
            Some(
                DeviceState::Connected
                | DeviceState::Syncing
                | DeviceState::Synced
                | DeviceState::Streaming,
            ) => {
                if let Some(session) = self.session_for(address).await {
                    let _ = session.stop_streaming().await;
                }
                if let Ok(Some(link)) = self.transport.peripheral(address).await {
                    let _ = link.disconnect().await;
                }
                self.drop_session(address).await;
                self.store.transition(device_id, DeviceState::Disconnected)
            }
            Some(DeviceState::Discovered | DeviceState::Disconnected | DeviceState::Error) => {
                Ok(())
            }
            None => Err(Error::unavailable(address)),
        };

        self.store.force_broadcast();
        match result {
            Ok(()) => CommandResponse::ok(),
            Err(e) => CommandResponse::fail(e.to_string()),
        }
    }

    /// Full removal: disconnect, unregister, purge the transport cache.
    pub async fn remove(&self, address: &str) -> CommandResponse {
        let response = self.disconnect(address).await;
        if let Some(device_id) = self.store.id_for_address(address) {
            self.reconnect_manager().cancel_reconnect(device_id);
            self.store.unregister_device(device_id);
        }
        let _ = self.transport.forget_peripheral(address).await;
        response
    }

    /// Time-synchronize every connected device, all-settled.
    pub async fn sync_all(&self) -> SyncAllResponse {
        let sessions: Vec<Arc<DeviceSession>> = {
            let map = self.sessions.read().await;
            map.values()
                .filter(|s| {
                    matches!(
                        self.store.device_state(s.device_id()),
                        Some(DeviceState::Connected | DeviceState::Synced)
                    )
                })
                .cloned()
                .collect()
        };

        if sessions.is_empty() {
            return SyncAllResponse {
                success: false,
                results: Vec::new(),
            };
        }

        self.store.set_global_mode(GlobalMode::Syncing);
        let _ = self.events.send(RigEvent::SyncStarted {
            device_count: sessions.len(),
        });

        // All-settled: one device failing to sync must not abort the
        // others.
        let mut results = Vec::with_capacity(sessions.len());
        let outcomes = futures::future::join_all(sessions.iter().map(|session| {
            let runner = &self.timesync;
            async move { (session.device_id(), runner.sync_device(session).await) }
        }))
        .await;
        for (device, outcome) in outcomes {
            results.push(match outcome {
                Ok(offset) => DeviceSyncResult {
                    device,
                    success: true,
                    offset_ms: Some(offset),
                    message: None,
                },
                Err(e) => DeviceSyncResult {
                    device,
                    success: false,
                    offset_ms: None,
                    message: Some(e.to_string()),
                },
            });
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let _ = self.events.send(RigEvent::SyncComplete {
            total: results.len(),
            success: success_count,
            failure: results.len() - success_count,
        });
        self.store.set_global_mode(GlobalMode::Idle);
        self.store.force_broadcast();

        SyncAllResponse {
            success: success_count == results.len(),
            results,
        }
    }

    /// Start streaming and open a recording. Idempotent: a second call
    /// while recording returns the same recording id.
    pub async fn start_recording(
        &self,
        session_id: &str,
        exercise_id: &str,
        set_number: u32,
    ) -> StartRecordingResponse {
        if self.recording.is_open() {
            return StartRecordingResponse {
                success: true,
                recording_id: self.recording.current_id(),
                message: Some("already recording".into()),
            };
        }

        // Live streams may already be running (start_streaming); then
        // the recording just opens over them.
        let mut errors = Vec::new();
        if self.store.global_mode() != GlobalMode::Streaming {
            match self.begin_streaming().await {
                Ok(stream_errors) => errors = stream_errors,
                Err(message) => {
                    return StartRecordingResponse {
                        success: false,
                        recording_id: None,
                        message: Some(message),
                    };
                }
            }
        }

        let (recording_id, start_time) = self.recording.start(session_id, exercise_id, set_number);
        self.store.set_recording(true);
        let _ = self.events.send(RigEvent::RecordingState {
            is_recording: true,
            session_id: Some(session_id.to_string()),
            start_time: Some(start_time),
        });
        self.store.force_broadcast();

        StartRecordingResponse {
            success: true,
            recording_id: Some(recording_id),
            message: (!errors.is_empty()).then(|| format!("started with errors: {}", errors.join("; "))),
        }
    }

    /// Start the quaternion streams without opening a recording.
    ///
    /// Live monitoring mode: joint angles flow to subscribers but no
    /// `RecordingBuffer` opens and nothing reaches the sink. A later
    /// `start_recording` reuses the running streams.
    pub async fn start_streaming(&self) -> CommandResponse {
        if self.store.global_mode() == GlobalMode::Streaming {
            return CommandResponse::ok_with("already streaming");
        }
        match self.begin_streaming().await {
            Ok(errors) if errors.is_empty() => CommandResponse::ok(),
            Ok(errors) => {
                CommandResponse::ok_with(format!("started with errors: {}", errors.join("; ")))
            }
            Err(message) => CommandResponse::fail(message),
        }
    }

    /// Stop streaming. With a recording open this is `stop_recording`;
    /// a live-only stream winds down without touching the sink.
    pub async fn stop_streaming(&self) -> CommandResponse {
        if self.recording.is_open() {
            return self.stop_recording().await;
        }
        let errors = self.end_streaming().await;
        self.store.force_broadcast();
        if errors.is_empty() {
            CommandResponse::ok()
        } else {
            CommandResponse::ok_with(format!("stopped with errors: {}", errors.join("; ")))
        }
    }

    /// Enter streaming mode: baseline session, grid reset, all-settled
    /// per-device stream starts, watchdog. Returns the per-device
    /// errors of a partial start; errs (and reverts the mode) when no
    /// device started at all.
    async fn begin_streaming(&self) -> std::result::Result<Vec<String>, String> {
        let sessions: Vec<Arc<DeviceSession>> =
            self.sessions.read().await.values().cloned().collect();
        if sessions.is_empty() {
            return Err("no connected devices".to_string());
        }

        self.store.set_global_mode(GlobalMode::Streaming);
        self.datasync.begin(sessions.len());
        self.engine
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reset();

        // All-settled stream start; a device that cannot start does not
        // hold the others back.
        let mut errors = Vec::new();
        let mut started = 0usize;
        for session in &sessions {
            match self.start_device_stream(session).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(device = %session.device_id(), error = %e, "stream start failed");
                    self.store.update_fields(
                        session.device_id(),
                        DevicePatch {
                            last_error: Some(Some(e.to_string())),
                            ..Default::default()
                        },
                    );
                    errors.push(format!("{}: {e}", session.device_id()));
                }
            }
        }

        if started == 0 {
            self.store.set_global_mode(GlobalMode::Idle);
            self.datasync.reset();
            return Err(format!("no device started streaming ({})", errors.join("; ")));
        }

        self.start_watchdog();
        Ok(errors)
    }

    /// Leave streaming mode: stop device streams, stop the watchdog,
    /// reset the baseline, flush the sorting window, return to idle.
    /// Runs to completion regardless of radio errors and reports them.
    async fn end_streaming(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let sessions: Vec<Arc<DeviceSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in &sessions {
            if self.store.device_state(session.device_id()) != Some(DeviceState::Streaming) {
                continue;
            }
            if let Err(e) = session.stop_streaming().await {
                // One device failing to stop must not abort the rest of
                // the cleanup.
                errors.push(format!("{}: {e}", session.device_id()));
            }
            if let Err(e) = self
                .store
                .transition(session.device_id(), DeviceState::Connected)
            {
                errors.push(format!("{}: {e}", session.device_id()));
            }
        }

        self.watchdog.stop();
        self.datasync.reset();
        if let Some(window) = &self.sorting {
            for sample in window.drain_all() {
                let _ = self.angles.send(sample);
            }
        }
        self.store.set_global_mode(GlobalMode::Idle);
        errors
    }

    async fn start_device_stream(&self, session: &Arc<DeviceSession>) -> Result<()> {
        let device_id = session.device_id();
        // A sensor stuck outside idle gets one forced reset first.
        let state = session.get_system_state().await?;
        if state != FirmwareState::Idle {
            debug!(%device_id, ?state, "sensor not idle, resetting");
            session.reset_to_idle().await?;
        }
        session.start_streaming().await?;
        self.store.transition(device_id, DeviceState::Streaming)?;
        Ok(())
    }

    /// Stop streaming and close the recording.
    ///
    /// Idempotent, and the cleanup runs to completion even when radio
    /// commands fail mid-way: the global mode returns to idle, the
    /// watchdog stops, and the recording-state edge is broadcast
    /// regardless. Partial failures degrade the message, not the
    /// success.
    pub async fn stop_recording(&self) -> CommandResponse {
        let was_recording = self.recording.is_open();

        // Finally-discipline: the teardown and everything below run no
        // matter what the radio says on the way down.
        let mut errors = self.end_streaming().await;
        if let Some(recording) = self.recording.finalize() {
            if let Err(e) = self.uploads.submit(recording).await {
                errors.push(format!("upload: {e}"));
            }
        }
        self.store.set_recording(false);
        let _ = self.events.send(RigEvent::RecordingState {
            is_recording: false,
            session_id: None,
            start_time: None,
        });
        self.store.force_broadcast();

        if errors.is_empty() {
            if was_recording {
                CommandResponse::ok()
            } else {
                CommandResponse::ok_with("no recording was in progress")
            }
        } else {
            CommandResponse::ok_with(format!("stopped with errors: {}", errors.join("; ")))
        }
    }

    /// Switch connected sensors to the accelerometer stream so shaking
    /// one identifies it.
    pub async fn locate_start(&self) -> CommandResponse {
        if self.store.global_mode() == GlobalMode::Streaming {
            return CommandResponse::fail(Error::StreamingAlreadyActive.to_string());
        }
        let sessions: Vec<Arc<DeviceSession>> =
            self.sessions.read().await.values().cloned().collect();
        if sessions.is_empty() {
            return CommandResponse::fail("no connected devices");
        }

        self.store.set_global_mode(GlobalMode::Locating);
        self.shake.reset();
        let mut errors = Vec::new();
        for session in &sessions {
            if let Err(e) = session.start_accel_stream().await {
                errors.push(format!("{}: {e}", session.device_id()));
            }
        }
        if errors.len() == sessions.len() {
            self.store.set_global_mode(GlobalMode::Idle);
            return CommandResponse::fail(format!("locate failed: {}", errors.join("; ")));
        }
        if errors.is_empty() {
            CommandResponse::ok()
        } else {
            CommandResponse::ok_with(format!("locate started with errors: {}", errors.join("; ")))
        }
    }

    /// Leave locate mode and return sensors to idle.
    pub async fn locate_stop(&self) -> CommandResponse {
        let sessions: Vec<Arc<DeviceSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut errors = Vec::new();
        for session in &sessions {
            if let Err(e) = session.reset_to_idle().await {
                errors.push(format!("{}: {e}", session.device_id()));
            }
        }
        self.shake.reset();
        self.store.set_global_mode(GlobalMode::Idle);
        self.store.force_broadcast();
        if errors.is_empty() {
            CommandResponse::ok()
        } else {
            CommandResponse::ok_with(format!("stopped with errors: {}", errors.join("; ")))
        }
    }

    /// Snapshot of every device plus the global mode.
    pub fn get_all_devices(&self) -> StateUpdate {
        self.store.snapshot()
    }

    /// Admin purge: drop every session and all device state.
    pub async fn clear_states(&self) -> CommandResponse {
        let sessions: Vec<(String, Arc<DeviceSession>)> = self
            .sessions
            .write()
            .await
            .drain()
            .collect();
        for (address, session) in sessions {
            self.reconnect_manager().cancel_reconnect(session.device_id());
            session.detach().await;
            if let Ok(Some(link)) = self.transport.peripheral(&address).await {
                let _ = link.disconnect().await;
            }
        }
        self.watchdog.stop();
        self.datasync.reset();
        let _ = self.recording.finalize();
        self.store.clear();
        CommandResponse::ok()
    }

    // --- Transport event handling ---

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered { address, name, rssi } => {
                match self.store.register_device(&address, &name) {
                    Ok(device_id) => {
                        // Re-advertisement of a dropped or errored
                        // device brings it back to discovered.
                        if matches!(
                            self.store.device_state(device_id),
                            Some(DeviceState::Disconnected | DeviceState::Error)
                        ) {
                            let _ = self.store.transition(device_id, DeviceState::Discovered);
                        }
                        self.store.update_fields(
                            device_id,
                            DevicePatch {
                                rssi: Some(rssi),
                                last_seen: Some(unix_ms()),
                                ..Default::default()
                            },
                        );
                    }
                    Err(Error::UnknownDevicePattern { name }) => {
                        debug!(%address, %name, "ignoring non-rig advertisement");
                    }
                    Err(e) => debug!(%address, error = %e, "discovery registration failed"),
                }
            }
            TransportEvent::RssiUpdate { address, rssi } => {
                if let Some(device_id) = self.store.id_for_address(&address) {
                    self.store.update_fields(
                        device_id,
                        DevicePatch {
                            rssi: Some(rssi),
                            last_seen: Some(unix_ms()),
                            ..Default::default()
                        },
                    );
                }
            }
            TransportEvent::PeripheralDisconnected { address } => {
                self.handle_link_drop(&address).await;
            }
            TransportEvent::ScanStarted | TransportEvent::ScanStopped => {}
            TransportEvent::Error(message) => {
                warn!(%message, "transport error");
            }
        }
    }

    async fn handle_link_drop(&self, address: &str) {
        let Some(device_id) = self.store.id_for_address(address) else {
            return;
        };
        let state = self.store.device_state(device_id);
        if !matches!(
            state,
            Some(
                DeviceState::Connected
                    | DeviceState::Syncing
                    | DeviceState::Synced
                    | DeviceState::Streaming
            )
        ) {
            return;
        }

        info!(%device_id, address, "link dropped");
        self.drop_session(address).await;
        if let Err(e) = self.store.transition(device_id, DeviceState::Disconnected) {
            warn!(%device_id, error = %e, "disconnect transition failed");
            return;
        }
        self.reconnect_manager()
            .schedule_reconnect(device_id, "link lost");
    }

    // --- Internals shared with the reconnect closures ---

    pub(crate) async fn reconnect_device(&self, address: String) -> bool {
        let setup_lock = self.setup_lock(&address).await;
        let _guard = setup_lock.lock().await;

        let Some(device_id) = self.store.id_for_address(&address) else {
            return false;
        };
        let link = match self.transport.peripheral(&address).await {
            Ok(Some(link)) => link,
            _ => return false,
        };
        let timeout = Duration::from_millis(self.config.strategy.connection_timeout_ms);
        match tokio::time::timeout(timeout, link.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%device_id, error = %e, "reconnect attempt failed");
                return false;
            }
            Err(_) => {
                let _ = link.disconnect().await;
                return false;
            }
        }
        match self.setup_session(device_id, &address).await {
            Ok(()) => true,
            Err(e) => {
                debug!(%device_id, error = %e, "session setup after reconnect failed");
                let _ = link.disconnect().await;
                false
            }
        }
    }

    pub(crate) async fn restart_streaming(&self, device_id: DeviceId) {
        let Some(address) = self.store.address_for(device_id) else {
            return;
        };
        let Some(session) = self.session_for(&address).await else {
            return;
        };
        let result = async {
            session.reset_to_idle().await?;
            session.start_streaming().await?;
            self.store.transition(device_id, DeviceState::Streaming)
        }
        .await;
        if let Err(e) = result {
            warn!(%device_id, error = %e, "stream restart after reconnect failed");
        }
    }

    fn start_watchdog(&self) {
        let weak = self.weak.clone();
        let alive_weak = weak.clone();
        self.watchdog.start(
            Arc::new(move |address| {
                let weak = alive_weak.clone();
                Box::pin(async move {
                    let Some(coordinator) = weak.upgrade() else {
                        return false;
                    };
                    match coordinator.transport.peripheral(&address).await {
                        Ok(Some(link)) => link.state().await == LinkState::Connected,
                        _ => false,
                    }
                })
            }),
            Arc::new(move |device_id, address| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(coordinator) = weak.upgrade() else {
                        return;
                    };
                    let Some(session) = coordinator.session_for(&address).await else {
                        return;
                    };
                    let result = async {
                        session.reset_to_idle().await?;
                        session.start_streaming().await
                    }
                    .await;
                    match result {
                        Ok(()) => info!(%device_id, "silent stream recovered"),
                        Err(e) => warn!(%device_id, error = %e, "stream recovery failed"),
                    }
                })
            }),
        );
    }

    fn reconnect_manager(&self) -> &Arc<ReconnectionManager> {
        &self.reconnect
    }

    async fn session_for(&self, address: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().await.get(address).cloned()
    }

    async fn drop_session(&self, address: &str) {
        if let Some(session) = self.sessions.write().await.remove(address) {
            session.detach().await;
        }
    }

    async fn setup_lock(&self, address: &str) -> Arc<Mutex<()>> {
        let mut locks = self.setup_locks.lock().await;
        Arc::clone(
            locks
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
        if let Some(handle) = self
            .flush_task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

fn reconnect_closure(weak: Weak<Coordinator>) -> crate::reconnect::ConnectFn {
    Arc::new(move |address| {
        let weak = weak.clone();
        Box::pin(async move {
            match weak.upgrade() {
                Some(coordinator) => coordinator.reconnect_device(address).await,
                None => false,
            }
        })
    })
}

fn restart_streaming_closure(weak: Weak<Coordinator>) -> crate::reconnect::StartStreamingFn {
    Arc::new(move |device_id| {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.restart_streaming(device_id).await;
            }
        })
    })
}
