// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for camera detection, registration and hotplug

mod common;

use camhub::backends::camera::hotplug::PollOutcome;
use camhub::backends::camera::network::{NetworkCameraEntry, validate_url};
use camhub::backends::camera::v4l2::V4l2Backend;
use camhub::backends::camera::{
    BackendError, CameraBackend, CameraBackendType, CameraManager, CommandOutput, HotplugMonitor,
    ManagerEvent, ScriptedRunner,
};
use common::{CallLog, FakeBackend};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast::error::TryRecvError;

const TWO_WEBCAMS: &str = "\
HD Webcam: HD Webcam (usb-0000:00:14.0-6):
\t/dev/video0
\t/dev/video1
\t/dev/media0

Brio 4K: Brio 4K (usb-0000:00:14.0-9):
\t/dev/video2
\t/dev/video3
\t/dev/media1

Dummy video device (0x0000) (platform:v4l2loopback-000):
\t/dev/video10
";

const FORMATS: &str = "\
ioctl: VIDIOC_ENUM_FMT
\tType: Video Capture

\t[0]: 'MJPG' (Motion-JPEG, compressed)
\t\tSize: Discrete 1920x1080
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t\tSize: Discrete 1280x720
\t\t\tInterval: Discrete 0.033s (30.000 fps)
\t[1]: 'YUYV' (YUYV 4:2:2)
\t\tSize: Discrete 640x480
\t\t\tInterval: Discrete 0.033s (30.000 fps)
";

fn webcam_runner() -> Arc<ScriptedRunner> {
    let runner = Arc::new(ScriptedRunner::new());
    runner
        .respond("v4l2-ctl", &["--version"], CommandOutput::ok("v4l2-ctl 1.24.1"))
        .respond("v4l2-ctl", &["--list-devices"], CommandOutput::ok(TWO_WEBCAMS))
        .respond("v4l2-ctl", &["--info"], CommandOutput::ok("Device Caps: 0x04200001\n\tVideo Capture\n"))
        .respond("v4l2-ctl", &["--list-formats-ext"], CommandOutput::ok(FORMATS));
    runner
}

fn fake(backend_type: CameraBackendType, ids: &[&str], log: &CallLog) -> Arc<FakeBackend> {
    Arc::new(FakeBackend::new(backend_type, ids, log.clone()))
}

fn as_backend(backend: &Arc<FakeBackend>) -> Arc<dyn CameraBackend> {
    backend.clone()
}

#[tokio::test]
async fn test_two_webcams_are_listed_with_formats() {
    let runner = webcam_runner();
    let backend: Arc<dyn CameraBackend> = Arc::new(V4l2Backend::new(runner.clone()));
    let manager = CameraManager::probe(vec![Arc::clone(&backend)]).await;
    let mut events = manager.subscribe();

    assert!(manager.detect_cameras().await);

    let cameras = manager.cameras();
    let ids: Vec<&str> = cameras.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["v4l2:/dev/video0", "v4l2:/dev/video2"]);
    assert!(cameras.iter().all(|c| !c.formats.is_empty()));
    assert!(matches!(events.try_recv(), Ok(ManagerEvent::CamerasChanged(list)) if list.len() == 2));

    // No PipeWire node for the device, so the node is opened directly
    let descriptor = backend.source_descriptor(&cameras[0], None).unwrap();
    assert!(descriptor.contains("device=/dev/video0"), "{}", descriptor);
    assert!(descriptor.contains("1920"), "{}", descriptor);
}

#[tokio::test]
async fn test_duplicate_ids_keep_first_registered_backend() {
    let log = CallLog::default();
    let manager = CameraManager::probe(vec![
        as_backend(&fake(CameraBackendType::V4l2, &["cam:a", "cam:shared"], &log)),
        as_backend(&fake(CameraBackendType::Libcamera, &["cam:shared", "cam:b"], &log)),
    ])
    .await;

    manager.detect_cameras().await;

    let cameras = manager.cameras();
    let ids: Vec<&str> = cameras.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["cam:a", "cam:shared", "cam:b"]);
    let shared = manager.camera("cam:shared").unwrap();
    assert_eq!(shared.backend, CameraBackendType::V4l2);
}

#[tokio::test]
async fn test_change_event_only_when_ids_change() {
    let log = CallLog::default();
    let webcams = fake(CameraBackendType::V4l2, &["v4l2:/dev/video0"], &log);
    let manager = CameraManager::probe(vec![as_backend(&webcams)]).await;
    let mut events = manager.subscribe();

    manager.detect_cameras().await;
    assert!(matches!(events.try_recv(), Ok(ManagerEvent::CamerasChanged(_))));

    // Same ids: no event
    manager.detect_cameras().await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    webcams.set_ids(&["v4l2:/dev/video0", "v4l2:/dev/video2"]);
    manager.detect_cameras().await;
    match events.try_recv() {
        Ok(ManagerEvent::CamerasChanged(list)) => assert_eq!(list.len(), 2),
        other => panic!("expected a change event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_backend_keeps_previous_cameras() {
    let log = CallLog::default();
    let webcams = fake(CameraBackendType::V4l2, &["v4l2:/dev/video0"], &log);
    let sensors = fake(CameraBackendType::Libcamera, &["libcamera:imx219"], &log);
    let manager = CameraManager::probe(vec![as_backend(&webcams), as_backend(&sensors)]).await;
    manager.detect_cameras().await;
    let mut events = manager.subscribe();

    sensors.fail_detection.store(true, Ordering::SeqCst);
    manager.detect_cameras().await;

    assert!(manager.camera("libcamera:imx219").is_some());
    assert!(manager.camera("v4l2:/dev/video0").is_some());
    match events.try_recv() {
        Ok(ManagerEvent::DetectionFailed { backend, .. }) => {
            assert_eq!(backend, CameraBackendType::Libcamera)
        }
        other => panic!("expected a failure event, got {:?}", other),
    }
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_script_url_is_rejected() {
    assert!(matches!(
        validate_url("javascript:alert(1)"),
        Err(BackendError::InvalidUrl(_))
    ));

    let manager = CameraManager::probe(vec![]).await;
    let rejected = manager.add_network_cameras(&[
        NetworkCameraEntry::new("Evil", "javascript:alert(1)"),
        NetworkCameraEntry::new("Garage", "rtsp://192.168.1.20:554/stream1"),
    ]);

    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].0.name, "Evil");
    let ids: Vec<String> = manager.cameras().into_iter().map(|c| c.id).collect();
    assert_eq!(ids, vec!["ip:rtsp://192.168.1.20:554/stream1"]);
}

#[tokio::test]
async fn test_hotplug_detects_only_on_topology_change() {
    let log = CallLog::default();
    let manager = CameraManager::probe(vec![as_backend(&fake(CameraBackendType::V4l2, &["v4l2:/dev/video0"], &log))]).await;

    let runner = Arc::new(ScriptedRunner::new());
    runner
        .respond("lsusb", &[], CommandOutput::ok("Bus 001 Device 001: ID 1d6b:0002 hub\n"))
        .respond("lsusb", &[], CommandOutput::ok("Bus 001 Device 001: ID 1d6b:0002 hub\n"))
        .respond(
            "lsusb",
            &[],
            CommandOutput::ok("Bus 001 Device 001: ID 1d6b:0002 hub\nBus 001 Device 007: ID 04a9:3218 Canon, Inc. EOS 600D\n"),
        );
    let monitor = HotplugMonitor::new(manager.clone(), runner);

    assert_eq!(monitor.poll_once().await, PollOutcome::Changed);
    assert_eq!(log.count("detect:"), 1);

    assert_eq!(monitor.poll_once().await, PollOutcome::Unchanged);
    assert_eq!(log.count("detect:"), 1);

    assert_eq!(monitor.poll_once().await, PollOutcome::Changed);
    assert_eq!(log.count("detect:"), 2);
}

#[tokio::test]
async fn test_hotplug_change_during_detection_is_picked_up_later() {
    let log = CallLog::default();
    let webcams = fake(CameraBackendType::V4l2, &["v4l2:/dev/video0"], &log);
    let manager = CameraManager::probe(vec![as_backend(&webcams)]).await;
    let runner = Arc::new(ScriptedRunner::new());
    runner.respond(
        "lsusb",
        &[],
        CommandOutput::ok("Bus 001 Device 007: ID 04a9:3218 Canon, Inc. EOS 600D\n"),
    );
    let monitor = HotplugMonitor::new(manager.clone(), runner);

    let release = webcams.hold_detection();
    let running = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.detect_cameras().await })
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while !manager.is_detecting() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("detection never started");

    assert_eq!(monitor.poll_once().await, PollOutcome::Busy);

    release.send(()).unwrap();
    assert!(running.await.unwrap());
    assert_eq!(monitor.poll_once().await, PollOutcome::Changed);
    assert_eq!(log.count("detect:"), 2);
    assert_eq!(monitor.poll_once().await, PollOutcome::Unchanged);
}
