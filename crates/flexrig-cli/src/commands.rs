//! Command implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::time::sleep;
use tracing::info;

use flexrig_core::{Coordinator, DeviceSnapshot, RigEvent};
use flexrig_types::DeviceState;

/// Scan and print what advertises.
pub async fn cmd_scan(rig: &Arc<Coordinator>, timeout: u64, json: bool, quiet: bool) -> Result<()> {
    let response = rig.scan().await;
    if !response.success {
        bail!(
            "scan failed: {}",
            response.message.unwrap_or_else(|| "unknown".into())
        );
    }
    if !quiet {
        eprintln!("Scanning for {timeout}s...");
    }
    sleep(Duration::from_secs(timeout)).await;

    let snapshot = rig.get_all_devices();
    let discovered: Vec<&DeviceSnapshot> = snapshot
        .devices
        .iter()
        .filter(|d| d.state == DeviceState::Discovered)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    if discovered.is_empty() {
        println!("No rig sensors found.");
        return Ok(());
    }
    println!("{} sensor(s) found:", discovered.len());
    for device in discovered {
        println!(
            "  {}  {}  {}  rssi {}",
            device.device_id,
            device.address,
            device.advertised_name,
            device
                .rssi
                .map(|r| r.to_string())
                .unwrap_or_else(|| "?".into()),
        );
    }
    Ok(())
}

/// List known sensors and rig state without touching the radio.
pub fn cmd_devices(rig: &Arc<Coordinator>, json: bool) -> Result<()> {
    let snapshot = rig.get_all_devices();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!(
        "Mode: {:?}{}",
        snapshot.global_mode,
        if snapshot.is_recording { " (recording)" } else { "" }
    );
    if snapshot.devices.is_empty() {
        println!("No known sensors.");
        return Ok(());
    }
    for device in &snapshot.devices {
        println!(
            "  {}  {}  {}  battery {}  offset {}",
            device.device_id,
            device.address,
            device.state,
            device
                .battery_pct
                .map(|b| format!("{b}%"))
                .unwrap_or_else(|| "?".into()),
            device
                .clock_offset_ms
                .map(|o| format!("{o:+.1} ms"))
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(())
}

/// Connect the rig and synchronize sensor clocks, nothing more.
pub async fn cmd_sync(rig: &Arc<Coordinator>, quiet: bool) -> Result<()> {
    let connected = connect_discovered(rig, quiet).await?;
    if !quiet {
        eprintln!("{connected} sensor(s) connected, syncing clocks...");
    }

    let sync = rig.sync_all().await;
    for result in &sync.results {
        match (result.success, result.offset_ms) {
            (true, Some(offset)) => {
                println!("  {}  offset {offset:+.1} ms", result.device);
            }
            _ => println!(
                "  {}  failed: {}",
                result.device,
                result.message.clone().unwrap_or_default()
            ),
        }
    }
    let failures = sync.results.iter().filter(|r| !r.success).count();
    if failures > 0 {
        bail!("{failures} of {} sensor(s) failed to sync", sync.results.len());
    }
    Ok(())
}

/// Connect every discovered sensor; errors if none connect.
async fn connect_discovered(rig: &Arc<Coordinator>, quiet: bool) -> Result<usize> {
    rig.scan().await;
    sleep(Duration::from_secs(5)).await;

    let discovered: Vec<DeviceSnapshot> = rig
        .get_all_devices()
        .devices
        .into_iter()
        .filter(|d| d.state == DeviceState::Discovered)
        .collect();
    if discovered.is_empty() {
        bail!("no rig sensors in range");
    }

    let mut connected = 0;
    for device in &discovered {
        if !quiet {
            eprintln!("Connecting {}...", device.device_id);
        }
        let response = rig.connect(&device.address, &device.advertised_name).await;
        if response.success {
            connected += 1;
        } else {
            eprintln!(
                "  {} failed: {}",
                device.device_id,
                response.message.unwrap_or_default()
            );
        }
    }
    if connected == 0 {
        bail!("no sensor connected");
    }
    Ok(connected)
}

/// Full capture flow: connect, sync, record, stop.
pub async fn cmd_record(
    rig: &Arc<Coordinator>,
    session: &str,
    exercise: &str,
    set: u32,
    duration: u64,
    quiet: bool,
) -> Result<()> {
    let connected = connect_discovered(rig, quiet).await?;
    if !quiet {
        eprintln!("{connected} sensor(s) connected, syncing clocks...");
    }

    let sync = rig.sync_all().await;
    for result in &sync.results {
        match (&result.success, &result.offset_ms) {
            (true, Some(offset)) => info!(device = %result.device, offset_ms = offset, "synced"),
            _ => eprintln!(
                "  {} sync failed: {}",
                result.device,
                result.message.clone().unwrap_or_default()
            ),
        }
    }

    let response = rig.start_recording(session, exercise, set).await;
    if !response.success {
        bail!(
            "recording did not start: {}",
            response.message.unwrap_or_else(|| "unknown".into())
        );
    }
    let recording_id = response
        .recording_id
        .context("recording started without an id")?;
    if !quiet {
        eprintln!("Recording {recording_id} for {duration}s...");
    }

    sleep(Duration::from_secs(duration)).await;

    let stop = rig.stop_recording().await;
    match stop.message {
        Some(message) => println!("Recording {recording_id} stopped: {message}"),
        None => println!("Recording {recording_id} stopped."),
    }
    Ok(())
}

/// Live angle stream without recording.
pub async fn cmd_watch(rig: &Arc<Coordinator>, duration: u64, quiet: bool) -> Result<()> {
    connect_discovered(rig, quiet).await?;
    rig.sync_all().await;

    let mut angles = rig.subscribe_angles();
    // Streaming-only mode: nothing is recorded or uploaded.
    let response = rig.start_streaming().await;
    if !response.success {
        bail!(
            "streaming did not start: {}",
            response.message.unwrap_or_else(|| "unknown".into())
        );
    }

    let deadline = (duration > 0).then(|| tokio::time::Instant::now() + Duration::from_secs(duration));
    let expired = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);
    loop {
        tokio::select! {
            sample = angles.recv() => {
                if let Ok(sample) = sample {
                    println!("{:>10}  {:<12} {:>8.2} deg", sample.timestamp_ms, sample.joint, sample.angle_deg);
                }
            }
            _ = &mut expired => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    rig.stop_streaming().await;
    Ok(())
}

/// Locate mode: print which sensor is being shaken.
pub async fn cmd_locate(rig: &Arc<Coordinator>, duration: u64, quiet: bool) -> Result<()> {
    connect_discovered(rig, quiet).await?;

    let mut events = rig.subscribe();
    let response = rig.locate_start().await;
    if !response.success {
        bail!(
            "locate did not start: {}",
            response.message.unwrap_or_else(|| "unknown".into())
        );
    }
    if !quiet {
        eprintln!("Locate mode for {duration}s: shake a sensor to identify it.");
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            event = events.recv() => {
                if let Ok(RigEvent::DeviceVibrating { device_ids }) = event {
                    if device_ids.is_empty() {
                        println!("  (still)");
                    } else {
                        for id in device_ids {
                            println!("  shaking: {id}");
                        }
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    rig.locate_stop().await;
    Ok(())
}
