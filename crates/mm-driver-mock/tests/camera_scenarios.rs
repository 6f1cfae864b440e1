//! Mock camera acquisition sessions.

use mm_core::device::{Acquisition, Device, DeviceContext, OptionValue};
use mm_core::poller::{PollEvent, SampleCount};
use mm_core::registry::DeviceRegistry;
use mm_core::{DriverError, DriverErrorKind};
use mm_driver_mock::{ErrorScenario, MockCamera, MockCameraConfig, MockCameraFactory};
use std::time::Duration;

fn small(seed: u64) -> MockCameraConfig {
    MockCameraConfig {
        width: 16,
        height: 16,
        exposure_ms: 5.0,
        seed: Some(seed),
        ..Default::default()
    }
}

fn kind(err: &anyhow::Error) -> DriverErrorKind {
    err.downcast_ref::<DriverError>()
        .map(|e| e.kind)
        .unwrap_or(DriverErrorKind::Unknown)
}

#[tokio::test(start_paused = true)]
async fn finite_session_delivers_numbered_frames() {
    let camera = MockCamera::new("Camera", &small(1));
    let mut frames = camera.subscribe_frames();
    let mut readings = camera.subscribe();

    camera
        .start(SampleCount::Finite(3), Duration::from_millis(1))
        .await
        .unwrap();
    camera.wait_idle().await;

    for expected in 0..3u64 {
        let frame = frames.recv().await.unwrap().into_sample().unwrap().value;
        assert_eq!(frame.frame_number, expected);
        assert_eq!(frame.data.len(), 16 * 16 * 2);
        assert_eq!(frame.pixel(0, 0), Some(0));
    }
    let reading = readings.recv().await.unwrap().into_sample().unwrap().value;
    assert_eq!(reading.get("Width"), Some(&OptionValue::Int(16)));
    assert_eq!(
        camera.get_option("FramesDelivered").await.unwrap(),
        OptionValue::Int(3)
    );
    assert!(!camera.busy().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn not_ready_attempts_are_retried() {
    let cfg = MockCameraConfig {
        not_ready_every: Some(2),
        ..small(2)
    };
    let camera = MockCamera::new("Camera", &cfg);
    let mut frames = camera.subscribe_frames();

    camera
        .start(SampleCount::Finite(4), Duration::ZERO)
        .await
        .unwrap();
    camera.wait_idle().await;

    let mut numbers = Vec::new();
    while let Ok(event) = frames.try_recv() {
        match event {
            PollEvent::Sample(sample) => numbers.push(sample.value.frame_number),
            PollEvent::Failed(err) => panic!("session failed: {err}"),
        }
    }
    assert_eq!(numbers, vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn fail_after_ends_session_once() {
    let cfg = MockCameraConfig {
        fail_after: Some(2),
        ..small(3)
    };
    let camera = MockCamera::new("Camera", &cfg);
    let mut readings = camera.subscribe();

    camera
        .start(SampleCount::Unbounded, Duration::from_millis(1))
        .await
        .unwrap();
    camera.wait_idle().await;

    let mut samples = 0;
    let mut failures = 0;
    while let Ok(event) = readings.try_recv() {
        match event {
            PollEvent::Sample(_) => samples += 1,
            PollEvent::Failed(err) => {
                assert!(err.is_fatal());
                failures += 1;
            }
        }
    }
    assert_eq!((samples, failures), (2, 1));
    assert!(!camera.is_running());
}

#[tokio::test(start_paused = true)]
async fn injected_disconnect_stops_a_running_session() {
    let camera = MockCamera::new("Camera", &small(4));
    let mut readings = camera.subscribe();

    camera
        .start(SampleCount::Unbounded, Duration::from_millis(10))
        .await
        .unwrap();
    let first = readings.recv().await.unwrap();
    assert!(matches!(first, PollEvent::Sample(_)));

    camera.inject(ErrorScenario::Disconnect);
    camera.wait_idle().await;

    let mut last = None;
    while let Ok(event) = readings.try_recv() {
        last = Some(event);
    }
    assert!(matches!(last, Some(PollEvent::Failed(e)) if e.is_fatal()));

    // The camera can be restarted once the fault is cleared.
    camera.clear_scenarios();
    camera
        .start(SampleCount::Finite(1), Duration::ZERO)
        .await
        .unwrap();
    camera.wait_idle().await;
}

#[tokio::test(start_paused = true)]
async fn seeded_cameras_render_identical_frames() {
    let a = MockCamera::new("A", &small(42));
    let b = MockCamera::new("B", &small(42));

    let fa = a.snap().await.unwrap();
    let fb = b.snap().await.unwrap();
    assert_eq!(fa.data, fb.data);

    let next = a.snap().await.unwrap();
    assert_ne!(fa.data, next.data);
}

#[tokio::test(start_paused = true)]
async fn geometry_is_validated_and_locked_during_acquisition() {
    let camera = MockCamera::new("Camera", &small(5));

    let err = camera
        .set_option("Width", OptionValue::Int(5000))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::InvalidParameter);

    let err = camera
        .set_option("FramesDelivered", OptionValue::Int(1))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::Permission);

    camera.set_option("Width", OptionValue::Int(8)).await.unwrap();
    camera
        .set_option("Exposure", OptionValue::Float(2.5))
        .await
        .unwrap();
    assert_eq!(
        camera.get_option("Width").await.unwrap(),
        OptionValue::Int(8)
    );

    camera
        .start(SampleCount::Unbounded, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(camera.busy().await.unwrap());
    let err = camera
        .set_option("Height", OptionValue::Int(8))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::Permission);

    camera.close().await.unwrap();
    assert!(!camera.busy().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn registry_builds_camera_from_toml() {
    let registry = DeviceRegistry::new();
    registry.register_factory(Box::new(MockCameraFactory));

    let params: toml::Value = toml::from_str("width = 8\nheight = 4\nseed = 7").unwrap();
    let device = registry
        .instantiate(DeviceContext::new("Camera"), "mock_camera", params)
        .await
        .unwrap();

    assert_eq!(device.driver_type(), "mock_camera");
    assert_eq!(
        device.get_option("Height").await.unwrap(),
        OptionValue::Int(4)
    );
    let acquisition = device.acquisition().unwrap();
    let mut readings = acquisition.subscribe();
    acquisition
        .start(SampleCount::Finite(1), Duration::ZERO)
        .await
        .unwrap();
    acquisition.wait_idle().await;
    assert!(matches!(readings.recv().await, Ok(PollEvent::Sample(_))));

    registry.close_all().await;
}
