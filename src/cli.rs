// SPDX-License-Identifier: GPL-3.0-only

//! Command-line front end
//!
//! Every command builds the registry from the installed tools, runs one
//! detection pass, registers the configured network cameras and then works
//! through the same controller the preview uses.

use camhub::backends::camera::{
    self, CameraBackend, CameraBackendType, CameraInfo, CameraManager, CommandRunner,
    ConflictResolver, ControlValue, HotplugMonitor, ManagerEvent, SystemRunner,
    dependencies, gphoto2::Gphoto2Backend, network,
};
use camhub::config::{SettingsStore, parse_cli_value};
use camhub::errors::{AppError, AppResult};
use camhub::profiles::{ProfileStore, apply_profile};
use camhub::session::{
    ControllerOptions, GstLaunchEngine, PlayOutcome, SessionEvent, StreamController,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Registry, settings and runner shared by one command
struct Context {
    runner: Arc<dyn CommandRunner>,
    settings: Arc<SettingsStore>,
    manager: CameraManager,
}

impl Context {
    async fn open() -> AppResult<Self> {
        let settings = Arc::new(SettingsStore::open_default()?);
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let manager = CameraManager::probe(build_backends(&runner, settings.as_ref())).await;

        if !manager.detect_cameras().await {
            debug!("Detection pass found nothing new");
        }
        for (entry, e) in manager.add_network_cameras(&settings.settings().ip_cameras) {
            warn!(name = %entry.name, error = %e, "Skipping configured network camera");
        }

        Ok(Self {
            runner,
            settings,
            manager,
        })
    }

    /// Controller without a pipeline, for control and profile commands
    fn controller(&self) -> StreamController {
        self.controller_with(Arc::new(GstLaunchEngine::new()), None)
    }

    fn controller_with(
        &self,
        engine: Arc<dyn camhub::session::PipelineEngine>,
        hotplug: Option<camera::HotplugHandle>,
    ) -> StreamController {
        StreamController::new(
            self.manager.clone(),
            engine,
            ControllerOptions {
                resolver: Some(ConflictResolver::new(Arc::clone(&self.runner))),
                settings: Some(Arc::clone(&self.settings)),
                hotplug,
                ..ControllerOptions::default()
            },
        )
    }

    fn camera(&self, id: &str) -> AppResult<CameraInfo> {
        self.manager.camera(id).ok_or_else(|| {
            AppError::InvalidArgument(format!(
                "no camera '{}' (run 'camhub list' to see the available ids)",
                id
            ))
        })
    }
}

/// Drivers in registration order, with the gphoto2 bitrate from settings
fn build_backends(
    runner: &Arc<dyn CommandRunner>,
    settings: &SettingsStore,
) -> Vec<Arc<dyn CameraBackend>> {
    let bitrate = settings.settings().gphoto2_bitrate;
    CameraBackendType::ALL
        .iter()
        .map(|backend_type| match backend_type {
            CameraBackendType::Gphoto2 => {
                Arc::new(Gphoto2Backend::new(Arc::clone(runner)).with_bitrate(bitrate))
                    as Arc<dyn CameraBackend>
            }
            other => camera::get_backend_for_type(*other, Arc::clone(runner)),
        })
        .collect()
}

// ===== Cameras =====

/// List all registered cameras
pub async fn list_cameras(json: bool) -> AppResult<()> {
    let ctx = Context::open().await?;
    let cameras = ctx.manager.cameras();

    if json {
        println!("{}", serde_json::to_string_pretty(&cameras)?);
        return Ok(());
    }

    if cameras.is_empty() {
        println!("No cameras found");
    } else {
        println!("Available cameras:");
        for cam in &cameras {
            let best = cam
                .formats
                .iter()
                .max_by_key(|f| f.pixels())
                .map(|f| format!("{}x{}", f.width, f.height))
                .unwrap_or_else(|| "-".to_string());
            println!("  {:<36} {:<10} {:<10} {}", cam.id, cam.backend.to_string(), best, cam.name);
        }
    }

    let missing = ctx.manager.unavailable_backends();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
        println!();
        println!("Unavailable backends: {} (see 'camhub doctor')", names.join(", "));
    }
    Ok(())
}

// ===== Controls =====

/// Print a camera's controls grouped by category
pub async fn show_controls(camera_id: &str) -> AppResult<()> {
    let ctx = Context::open().await?;
    ctx.camera(camera_id)?;
    let controls = ctx.controller().controls(camera_id).await?;

    if controls.is_empty() {
        println!("{} has no adjustable controls", camera_id);
        return Ok(());
    }

    let mut current = None;
    for control in &controls {
        if current != Some(control.category) {
            println!("{:?}:", control.category);
            current = Some(control.category);
        }
        let mut line = format!("  {:<28} {:<10} = {}", control.id, format!("{:?}", control.control_type), control.value);
        if let (Some(min), Some(max)) = (control.minimum, control.maximum) {
            line.push_str(&format!("  [{}..{}]", min, max));
        }
        if !control.choices.is_empty() {
            line.push_str(&format!("  ({})", control.choices.join(" | ")));
        }
        if control.is_read_only() {
            line.push_str("  read-only");
        } else if control.is_inactive() {
            line.push_str("  inactive");
        }
        println!("{}", line);
    }
    Ok(())
}

/// Set one control, parsing the value by the control's type
pub async fn set_control(camera_id: &str, control_id: &str, raw: &str) -> AppResult<()> {
    let ctx = Context::open().await?;
    ctx.camera(camera_id)?;
    let controller = ctx.controller();

    let controls = controller.controls(camera_id).await?;
    let control = controls
        .iter()
        .find(|c| c.id == control_id)
        .ok_or_else(|| AppError::InvalidArgument(format!("{} has no control '{}'", camera_id, control_id)))?;
    let value = ControlValue::parse_for(control.control_type, raw)?;

    controller.set_control(camera_id, control_id, value.clone()).await?;
    println!("{} = {}", control_id, value);
    Ok(())
}

/// Reset one control, or every control, to its default
pub async fn reset_controls(camera_id: &str, control_id: Option<&str>) -> AppResult<()> {
    let ctx = Context::open().await?;
    ctx.camera(camera_id)?;
    let count = ctx.controller().reset_controls(camera_id, control_id).await?;
    println!("Reset {} control(s)", count);
    Ok(())
}

// ===== Photo =====

/// File name for a photo taken now
fn photo_file_name(pattern: &str) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let pattern = if pattern.trim().is_empty() { "photo_{datetime}" } else { pattern };
    format!("{}.jpg", pattern.replace("{datetime}", &stamp))
}

/// Capture a still through the camera's driver
pub async fn take_photo(camera_id: &str, output: Option<PathBuf>) -> AppResult<()> {
    let ctx = Context::open().await?;
    let cam = ctx.camera(camera_id)?;
    let backend = ctx
        .manager
        .backend(cam.backend)
        .ok_or_else(|| AppError::Other(format!("{} backend is not available", cam.backend)))?;
    if !backend.can_capture_photo() {
        return Err(AppError::InvalidArgument(format!(
            "{} cameras cannot take photos",
            cam.backend
        )));
    }

    let settings = ctx.settings.settings();
    let path = match output {
        Some(path) if path.is_dir() => path.join(photo_file_name(&settings.photo_name_pattern)),
        Some(path) => path,
        None => settings.photo_dir().join(photo_file_name(&settings.photo_name_pattern)),
    };
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    println!("Capturing from {}...", cam.name);
    let target = path.clone();
    tokio::task::spawn_blocking(move || backend.capture_photo(&cam, &target))
        .await
        .map_err(|e| AppError::Other(format!("capture task failed: {}", e)))??;

    println!("Photo saved: {}", path.display());
    Ok(())
}

// ===== Preview =====

/// Stream a camera until Ctrl+C or the duration elapses
pub async fn play(camera_id: &str, duration: Option<u64>) -> AppResult<()> {
    let ctx = Context::open().await?;
    ctx.camera(camera_id)?;

    let hotplug = ctx
        .settings
        .settings()
        .hotplug_enabled
        .then(|| HotplugMonitor::new(ctx.manager.clone(), Arc::clone(&ctx.runner)).spawn_default());

    let (pipeline_tx, pipeline_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(GstLaunchEngine::new().with_events(pipeline_tx));
    let controller = ctx.controller_with(engine, hotplug.clone());
    let mut session_events = controller.subscribe();
    let mut registry_events = ctx.manager.subscribe();
    let pipeline_task = controller.attach_pipeline_events(pipeline_rx);
    let registry_task = controller.attach_registry_events();

    let outcome = controller.play(camera_id, None).await;
    let result = match outcome {
        Ok(PlayOutcome::Dropped) => Err(AppError::Other("camera is busy starting".to_string())),
        Ok(outcome) => {
            if outcome == PlayOutcome::Connecting {
                println!("Connecting...");
            }
            watch(&controller, &mut session_events, &mut registry_events, duration).await
        }
        Err(e) => Err(e.into()),
    };

    controller.shutdown().await;
    pipeline_task.abort();
    registry_task.abort();
    if let Some(hotplug) = hotplug {
        hotplug.stop();
    }
    result
}

/// Report session progress until the stream ends
async fn watch(
    controller: &StreamController,
    session_events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    registry_events: &mut tokio::sync::broadcast::Receiver<ManagerEvent>,
    duration: Option<u64>,
) -> AppResult<()> {
    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    if controller.state() == camhub::SessionState::Playing {
        println!("Playing (Ctrl+C to stop)");
    }

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(());
            }
            event = session_events.recv() => match event {
                Ok(SessionEvent::Playing { .. }) => println!("Playing (Ctrl+C to stop)"),
                Ok(SessionEvent::Error { message, .. }) => return Err(AppError::Other(message)),
                Ok(SessionEvent::Stopped { .. }) => return Ok(()),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Session events lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            event = registry_events.recv() => {
                if let Ok(ManagerEvent::DetectionFailed { backend, reason }) = event {
                    warn!(%backend, %reason, "Detection failed");
                }
            }
        }
    }
}

// ===== Network cameras =====

/// Validate and store a network camera
pub fn add_url(name: &str, url: &str) -> AppResult<()> {
    let url = network::validate_url(url)?;
    let settings = SettingsStore::open_default()?;
    let entry = network::NetworkCameraEntry::new(name.trim(), url.clone());
    let id = network::camera_from_entry(&entry)?.id;

    let mut added = false;
    settings.update(|s| {
        if !s.ip_cameras.iter().any(|e| e.url == entry.url) {
            s.ip_cameras.push(entry.clone());
            added = true;
        }
    })?;

    if added {
        println!("Added {} as {}", url, id);
    } else {
        println!("{} is already configured", url);
    }
    Ok(())
}

// ===== Settings =====

pub fn config_get(key: Option<&str>) -> AppResult<()> {
    let store = SettingsStore::open_default()?;
    match key {
        Some(key) => {
            let value = store
                .get(key)
                .ok_or_else(|| AppError::InvalidArgument(format!("unknown setting '{}'", key)))?;
            println!("{}", value);
        }
        None => {
            let mut keys = store.keys();
            keys.sort();
            for key in keys {
                if let Some(value) = store.get(&key) {
                    println!("{} = {}", key, value);
                }
            }
            println!();
            println!("File: {}", store.path().display());
        }
    }
    Ok(())
}

pub fn config_set(key: &str, raw: &str) -> AppResult<()> {
    let store = SettingsStore::open_default()?;
    store.set(key, parse_cli_value(raw))?;
    if let Some(value) = store.get(key) {
        println!("{} = {}", key, value);
    }
    Ok(())
}

// ===== Profiles =====

async fn profile_context(camera_id: &str) -> AppResult<(Context, CameraInfo, ProfileStore)> {
    let ctx = Context::open().await?;
    let cam = ctx.camera(camera_id)?;
    Ok((ctx, cam, ProfileStore::open_default()?))
}

pub async fn profile_list(camera_id: &str) -> AppResult<()> {
    let (_ctx, cam, store) = profile_context(camera_id).await?;
    let names = store.list(&cam);
    if names.is_empty() {
        println!("No profiles saved for {}", cam.name);
    }
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}

pub async fn profile_save(camera_id: &str, name: &str) -> AppResult<()> {
    let (ctx, cam, store) = profile_context(camera_id).await?;
    let controls = ctx.controller().controls(camera_id).await?;
    let path = store.save(&cam, name, &controls)?;
    println!("Saved {}", path.display());
    Ok(())
}

pub async fn profile_load(camera_id: &str, name: &str) -> AppResult<()> {
    let (ctx, cam, store) = profile_context(camera_id).await?;
    let values = store.load(&cam, name)?;
    let report = apply_profile(&ctx.controller(), camera_id, &values).await;
    println!("Applied {} control(s)", report.applied);
    for (control, e) in &report.failed {
        println!("  {}: {}", control, e);
    }
    Ok(())
}

pub async fn profile_delete(camera_id: &str, name: &str) -> AppResult<()> {
    let (_ctx, cam, store) = profile_context(camera_id).await?;
    if store.delete(&cam, name)? {
        println!("Deleted {}", name);
    } else {
        println!("No profile named {}", name);
    }
    Ok(())
}

// ===== Diagnostics =====

/// Report installed tools and usable backends
pub async fn doctor() -> AppResult<()> {
    let deps = dependencies::check_all();
    for dep in &deps {
        let mark = if dep.available { "ok" } else if dep.critical { "MISSING" } else { "missing" };
        println!("  {:<16} {:<8} {}", dep.name, mark, dep.purpose);
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
    let manager = CameraManager::with_default_backends(runner).await;
    let available: Vec<String> = manager.available_backends().iter().map(ToString::to_string).collect();
    println!();
    println!("Usable backends: {}", available.join(", "));

    let missing = dependencies::missing_critical(&deps);
    if !missing.is_empty() {
        return Err(AppError::Other(format!(
            "missing critical tools: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Show the processes holding a device node
pub async fn holders(device: &str) -> AppResult<()> {
    if !Path::new(device).exists() {
        return Err(AppError::InvalidArgument(format!("{} does not exist", device)));
    }
    let resolver = ConflictResolver::new(Arc::new(SystemRunner::new()));
    let device = device.to_string();
    let holders = tokio::task::spawn_blocking(move || resolver.processes_holding(&device))
        .await
        .map_err(|e| AppError::Other(format!("lookup task failed: {}", e)))?;

    if holders.is_empty() {
        println!("No process holds the device");
    }
    for holder in holders {
        println!("  {}", holder);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_file_name() {
        let name = photo_file_name("shot_{datetime}");
        assert!(name.starts_with("shot_"));
        assert!(name.ends_with(".jpg"));
        assert!(!name.contains("{datetime}"));
        assert!(photo_file_name("").starts_with("photo_"));
    }

    #[test]
    fn test_gphoto2_backend_replaced() {
        let runner: Arc<dyn CommandRunner> = Arc::new(camera::ScriptedRunner::new());
        let settings = SettingsStore::open(
            std::env::temp_dir().join(format!("camhub-cli-{}", uuid::Uuid::new_v4())).join("settings.json"),
        );
        let backends = build_backends(&runner, &settings);
        let types: Vec<CameraBackendType> = backends.iter().map(|b| b.backend_type()).collect();
        assert_eq!(types, CameraBackendType::ALL.to_vec());
    }
}
