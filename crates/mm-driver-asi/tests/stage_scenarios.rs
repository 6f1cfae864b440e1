//! ASI stage behaviour against a scripted controller.

use mm_core::device::{Device, OptionValue};
use mm_core::error::{DriverError, DriverErrorKind};
use mm_core::mock_serial::{ScriptHandle, ScriptedDevice};
use mm_core::serial::SerialChannel;
use mm_core::transactor::Transactor;
use mm_driver_asi::{AsiStage, AsiStageConfig, AxisSet, Joystick, JoystickPolarity};

fn stage(device: ScriptedDevice, cfg: AsiStageConfig) -> (AsiStage, ScriptHandle) {
    let (port, handle) = device.spawn();
    let transactor = Transactor::new(SerialChannel::new("COM3", Box::new(port)));
    (AsiStage::new("XYStage", transactor, &cfg), handle)
}

fn xy() -> AsiStageConfig {
    AsiStageConfig::new("COM3", AxisSet::Xy)
}

fn kind(err: &anyhow::Error) -> DriverErrorKind {
    err.downcast_ref::<DriverError>()
        .map(|e| e.kind)
        .unwrap_or(DriverErrorKind::Unknown)
}

#[tokio::test(start_paused = true)]
async fn open_reads_status_and_position() {
    let (stage, handle) = stage(
        ScriptedDevice::new()
            .on(b"/\r", b"N\r\n")
            .on(b"W X Y\r", b":A 1500 -200\r\n"),
        xy(),
    );

    stage.open().await.unwrap();

    assert_eq!(stage.cached_position(), vec![150.0, -20.0]);
    assert_eq!(handle.received(), vec![b"/\r".to_vec(), b"W X Y\r".to_vec()]);
    assert!(!stage.busy().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn rejected_move_leaves_cached_position_unchanged() {
    let (stage, _handle) = stage(
        ScriptedDevice::new()
            .on(b"M X=100 Y=100\r", b":A\r\n")
            .on(b"M X=99999999 Y=0\r", b":N-5\r\n"),
        xy(),
    );

    stage.move_to(&[10.0, 10.0]).await.unwrap();
    let err = stage.move_to(&[9_999_999.9, 0.0]).await.unwrap_err();

    assert_eq!(kind(&err), DriverErrorKind::Hardware);
    assert!(err.to_string().contains(":N-5"));
    assert_eq!(stage.cached_position(), vec![10.0, 10.0]);
}

#[tokio::test(start_paused = true)]
async fn single_axis_option_moves_only_that_axis() {
    let (stage, handle) = stage(ScriptedDevice::new().on(b"M Y=250\r", b":A\r\n"), xy());

    stage
        .set_option("PositionY", OptionValue::Int(25))
        .await
        .unwrap();

    assert_eq!(handle.received(), vec![b"M Y=250\r".to_vec()]);
    assert_eq!(stage.cached_position(), vec![0.0, 25.0]);
}

#[tokio::test(start_paused = true)]
async fn joystick_mirror_round_trips() {
    let (stage, handle) = stage(
        ScriptedDevice::new()
            .on(b"JS X=-60 Y=-5\r", b":A\r\n")
            .on(b"JS X? Y?\r", b":A X=-60 Y=-5\r\n"),
        xy(),
    );

    let wanted = Joystick {
        fast: 60.0,
        slow: 5.0,
        polarity: JoystickPolarity::Mirrored,
    };
    stage.set_joystick(wanted).await.unwrap();
    assert_eq!(stage.joystick().await.unwrap(), wanted);

    assert_eq!(
        stage.get_option("JoystickMirror").await.unwrap(),
        OptionValue::Text("Yes".into())
    );
    assert_eq!(
        stage.get_option("JoystickFastSpeed").await.unwrap(),
        OptionValue::Float(60.0)
    );
    assert_eq!(handle.received()[0], b"JS X=-60 Y=-5\r".to_vec());
}

#[tokio::test(start_paused = true)]
async fn mixed_joystick_signs_are_rejected() {
    let (stage, _handle) = stage(
        ScriptedDevice::new().on(b"JS X? Y?\r", b":A X=-60 Y=5\r\n"),
        xy(),
    );

    let err = stage.joystick().await.unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::Hardware);
    assert!(err.to_string().contains("inconsistent"));
}

#[tokio::test(start_paused = true)]
async fn mirror_option_rewrites_both_speeds() {
    let (stage, handle) = stage(
        ScriptedDevice::new()
            .on(b"2JS X? Y?\r", b":A X=40 Y=4\r\n")
            .on(b"2JS X=-40 Y=-4\r", b":A\r\n"),
        AsiStageConfig {
            card_address: Some("2".into()),
            ..xy()
        },
    );

    stage
        .set_option("JoystickMirror", OptionValue::Text("Yes".into()))
        .await
        .unwrap();

    assert_eq!(
        handle.received(),
        vec![b"2JS X? Y?\r".to_vec(), b"2JS X=-40 Y=-4\r".to_vec()]
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_option_writes_send_nothing() {
    let (stage, handle) = stage(ScriptedDevice::new(), xy());

    let err = stage
        .set_option("JoystickMirror", OptionValue::Text("Maybe".into()))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::InvalidParameter);

    let err = stage
        .set_option("StepSizeUm", OptionValue::Float(0.2))
        .await
        .unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::Permission);

    let err = stage.get_option("PositionZ").await.unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::InvalidParameter);

    assert!(handle.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_controller_times_out() {
    let (stage, _handle) = stage(
        ScriptedDevice::new(),
        AsiStageConfig {
            timeout_ms: Some(50),
            ..AsiStageConfig::new("COM3", AxisSet::Z)
        },
    );

    let err = stage.position().await.unwrap_err();
    assert_eq!(kind(&err), DriverErrorKind::Timeout);
}
