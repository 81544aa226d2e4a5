//! Frame decoding over an in-process serial link.

use std::time::{Duration, Instant};

use daq_core::{AcquisitionEngine, DaqError, EngineContext, EngineState, Field, Instrument};
use daq_driver_datalogger::{
    read_frame, DataloggerConfig, DataloggerDriver, DataloggerSample, MODEL_THERMOCOUPLE,
};
use tokio::io::AsyncWriteExt;

const TIMEOUT: Duration = Duration::from_millis(50);

fn thermocouple() -> DataloggerConfig {
    DataloggerConfig {
        port: "/dev/null".into(),
        model: MODEL_THERMOCOUPLE.into(),
        timeout_ms: 50,
        ..DataloggerConfig::default()
    }
}

fn close(a: Option<f64>, b: f64) -> bool {
    a.is_some_and(|a| (a - b).abs() < 1e-9)
}

#[tokio::test]
async fn humidity_frame_decodes_both_channels() {
    let (mut host, mut device) = tokio::io::duplex(64);
    host.write_all(&[0x02, 0x00, 0xfa, 0x01, 0xc2, 0x03]).await.unwrap();

    let sample = read_frame(&mut device, false, TIMEOUT).await.unwrap().unwrap();
    assert!(close(sample.channels[0], 25.0));
    assert!(close(sample.channels[1], 45.0));
}

#[tokio::test]
async fn status_byte_marks_channel_absent() {
    let (mut host, mut device) = tokio::io::duplex(64);
    host.write_all(&[0x02, 0x00, 0x00, 0xfa, 0x08, 0x3f, 0xff, 0x00, 0x03])
        .await
        .unwrap();

    let sample = read_frame(&mut device, true, TIMEOUT).await.unwrap().unwrap();
    assert!(close(sample.channels[0], 25.0));
    assert_eq!(sample.channels[1], None);
    assert_eq!(
        DataloggerDriver::format_sample(&sample),
        vec![Field::Float(sample.channels[0].unwrap()), Field::Empty]
    );
}

#[tokio::test]
async fn malformed_frame_yields_nothing_and_next_frame_decodes() {
    let (mut host, mut device) = tokio::io::duplex(64);
    // Wrong terminator, then a good frame.
    host.write_all(&[0x02, 0x00, 0x10, 0x00, 0x20, 0x7f]).await.unwrap();
    host.write_all(&[0x02, 0x00, 0x10, 0x00, 0x20, 0x03]).await.unwrap();

    assert_eq!(read_frame(&mut device, false, TIMEOUT).await.unwrap(), None);
    let sample = read_frame(&mut device, false, TIMEOUT).await.unwrap().unwrap();
    assert!(close(sample.channels[0], 1.6));
    assert!(close(sample.channels[1], 3.2));
}

#[tokio::test]
async fn short_read_closes_the_link() {
    let (mut host, mut device) = tokio::io::duplex(64);
    host.write_all(&[0x02, 0x00]).await.unwrap();
    drop(host);
    let err = read_frame(&mut device, false, TIMEOUT).await.unwrap_err();
    assert!(matches!(err, DaqError::TransportClosed(_)));

    let (_host, mut silent) = tokio::io::duplex(64);
    let err = read_frame(&mut silent, true, TIMEOUT).await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn driver_samples_streamed_frames() {
    let (mut host, device) = tokio::io::duplex(256);
    let mut driver = DataloggerDriver::with_io("env", thermocouple(), Box::new(device));
    let (mut ctx, _commands, _samples) = EngineContext::new("env", Instant::now());
    driver.setup(&mut ctx).await.unwrap();

    host.write_all(&[0x02, 0x00, 0x00, 0xfa, 0x00, 0x01, 0x2c, 0x00, 0x03])
        .await
        .unwrap();
    let sample = driver.sample(&mut ctx).await.unwrap();
    assert_eq!(
        sample,
        Some(DataloggerSample {
            channels: [Some(decode(0x00, 0xfa)), Some(decode(0x01, 0x2c))],
        })
    );
    driver.cleanup().await;
}

fn decode(hi: u8, lo: u8) -> f64 {
    daq_driver_datalogger::decode_channel(hi, lo)
}

#[test]
fn silent_logger_fails_only_its_engine() {
    let (host, device) = tokio::io::duplex(64);
    let driver = DataloggerDriver::with_io("env", thermocouple(), Box::new(device));
    let mut engine = AcquisitionEngine::start("env", driver, Instant::now()).unwrap();
    engine.wait_for_setup().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine.state().is_terminal() {
        assert!(Instant::now() < deadline, "engine kept running without data");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(engine.state(), EngineState::Failed(_)));
    assert!(engine.drain_samples().is_empty());
    drop(host);
}

#[test]
fn validation_requires_port() {
    assert!(DataloggerConfig::default().validate("env").is_err());
    assert!(thermocouple().validate("env").is_ok());
    assert!(DataloggerConfig {
        baud_rate: 0,
        ..thermocouple()
    }
    .validate("env")
    .is_err());
}
