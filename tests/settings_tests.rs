// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for persisted settings and control profiles

mod common;

use camhub::backends::camera::network::NetworkCameraEntry;
use camhub::backends::camera::{CameraBackend, CameraBackendType, CameraManager, ControlValue};
use camhub::config::{Settings, SettingsStore};
use camhub::errors::AppError;
use camhub::profiles::{ProfileStore, ProfileValues, apply_profile};
use camhub::session::{ControllerOptions, StreamController};
use common::{CallLog, FakeBackend, RecordingEngine};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn temp_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("camhub-{}-{}", label, uuid::Uuid::new_v4()))
}

#[test]
fn test_settings_survive_reopen() {
    let dir = temp_dir("settings");
    let path = dir.join("camhub").join("settings.json");

    let store = SettingsStore::open(&path);
    assert_eq!(store.settings(), Settings::default());
    store
        .update(|s| {
            s.preferred_resolution = "1080p".to_string();
            s.ip_cameras.push(NetworkCameraEntry::new("Garage", "rtsp://192.168.1.20/stream1"));
        })
        .unwrap();
    store.set("fps-limit", json!(30)).unwrap();

    let reopened = SettingsStore::open(&path);
    let settings = reopened.settings();
    assert_eq!(settings.preferred_resolution, "1080p");
    assert_eq!(settings.fps_cap(), Some(30));
    assert_eq!(settings.ip_cameras.len(), 1);

    // No temporary files are left next to the settings file
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_unchanged_update_does_not_write() {
    let dir = temp_dir("nowrite");
    let path = dir.join("settings.json");
    let store = SettingsStore::open(&path);

    store.update(|_| {}).unwrap();

    assert!(!path.exists());
}

#[test]
fn test_set_rejects_unknown_keys_and_bad_types() {
    let dir = temp_dir("reject");
    let store = SettingsStore::open(dir.join("settings.json"));

    assert!(matches!(
        store.set("sidebar-width", json!(300)),
        Err(AppError::Config(_))
    ));
    assert!(matches!(
        store.set("fps-limit", json!("fast")),
        Err(AppError::Config(_))
    ));
    assert_eq!(store.get("fps-limit"), Some(json!(0)));
    assert!(store.keys().contains(&"hotplug_enabled".to_string()));
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn test_corrupt_file_falls_back_to_defaults() {
    let dir = temp_dir("corrupt");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();

    let store = SettingsStore::open(&path);

    assert_eq!(store.settings(), Settings::default());
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_profile_round_trip_through_controller() {
    let log = CallLog::default();
    let webcams: Arc<dyn CameraBackend> =
        Arc::new(FakeBackend::new(CameraBackendType::V4l2, &["v4l2:/dev/video0"], log.clone()));
    let manager = CameraManager::probe(vec![webcams]).await;
    manager.detect_cameras().await;
    let controller = StreamController::new(
        manager.clone(),
        Arc::new(RecordingEngine::new(log.clone())),
        ControllerOptions::default(),
    );
    let camera = manager.camera("v4l2:/dev/video0").unwrap();
    let store = ProfileStore::new(temp_dir("profiles"));

    let controls = controller.controls(&camera.id).await.unwrap();
    store.save(&camera, "evening", &controls).unwrap();
    assert_eq!(store.list(&camera), vec!["evening"]);

    let mut values: ProfileValues = store.load(&camera, "evening").unwrap();
    assert_eq!(values.get("brightness"), Some(&ControlValue::Int(10)));
    values.insert("zoom_absolute".to_string(), ControlValue::Int(3));

    let report = apply_profile(&controller, &camera.id, &values).await;

    assert_eq!(report.applied, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "zoom_absolute");
    assert_eq!(log.count("set_control:"), 2);
    let _ = std::fs::remove_dir_all(store.root());
}
