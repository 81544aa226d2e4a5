//! Power supply driver against an in-process fake instrument.

use std::time::{Duration, Instant};

use daq_core::{DaqError, EngineContext, Field, Instrument};
use daq_driver_dc_power::{DcPowerCommand, DcPowerConfig, DcPowerDriver};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// Minimal SCPI power supply: 2 ohm load behind a current limit.
async fn fake_supply(io: DuplexStream) -> Vec<String> {
    let mut io = BufReader::new(io);
    let mut received = Vec::new();
    let (mut volts, mut limit, mut on) = (0.0_f64, 1.0_f64, false);
    loop {
        let mut line = String::new();
        if io.read_line(&mut line).await.unwrap_or(0) == 0 {
            return received;
        }
        let line = line.trim().to_string();
        let reply = match line.as_str() {
            "*IDN?" => Some("ACME,PSU-3005,0001,1.0".to_string()),
            "MEAS:VOLT?" => Some(format!("{}", if on { volts } else { 0.0 })),
            "MEAS:CURR?" => Some(format!("{}", if on { (volts / 2.0).min(limit) } else { 0.0 })),
            "OUTP ON" => {
                on = true;
                None
            }
            "OUTP OFF" => {
                on = false;
                None
            }
            other => {
                if let Some(v) = other.strip_prefix("VOLT ") {
                    volts = v.parse().unwrap();
                } else if let Some(a) = other.strip_prefix("CURR ") {
                    limit = a.parse().unwrap();
                }
                None
            }
        };
        received.push(line);
        if let Some(reply) = reply {
            io.get_mut().write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        }
    }
}

fn config() -> DcPowerConfig {
    DcPowerConfig {
        resource: "fake:5025".into(),
        sample_interval_ms: 0,
        voltage: Some(3.0),
        current_limit: Some(1.0),
        output: Some(true),
        ..DcPowerConfig::default()
    }
}

#[tokio::test]
async fn setup_applies_initial_state_and_samples_read_back() {
    let (host, device) = tokio::io::duplex(1024);
    let supply = tokio::spawn(fake_supply(host));

    let mut driver = DcPowerDriver::with_io("psu", config(), Box::new(device));
    let (mut ctx, _commands, _samples) = EngineContext::new("psu", Instant::now());
    driver.setup(&mut ctx).await.unwrap();

    let sample = driver.sample(&mut ctx).await.unwrap().unwrap();
    assert_eq!(sample.voltage, 3.0);
    assert_eq!(sample.current, 1.0);

    driver.apply(DcPowerCommand::SetVoltage(1.0), &mut ctx).await.unwrap();
    let sample = driver.sample(&mut ctx).await.unwrap().unwrap();
    assert_eq!(sample.current, 0.5);
    assert_eq!(
        DcPowerDriver::format_sample(&sample),
        vec![Field::Float(1.0), Field::Float(0.5)]
    );

    driver.apply(DcPowerCommand::SetOutput(false), &mut ctx).await.unwrap();
    assert_eq!(driver.sample(&mut ctx).await.unwrap().unwrap().voltage, 0.0);

    driver.cleanup().await;
    let received = supply.await.unwrap();
    assert_eq!(&received[..4], ["*IDN?", "CURR 1", "VOLT 3", "OUTP ON"]);
}

#[tokio::test]
async fn silent_device_fails_setup() {
    let (_host, device) = tokio::io::duplex(1024);
    let cfg = DcPowerConfig {
        timeout_ms: 20,
        ..config()
    };
    let mut driver = DcPowerDriver::with_io("psu", cfg, Box::new(device));
    let (mut ctx, _commands, _samples) = EngineContext::new("psu", Instant::now());
    let err = driver.setup(&mut ctx).await.unwrap_err();
    assert!(matches!(err, DaqError::Setup { .. }));
}

#[tokio::test]
async fn dropped_link_is_fatal() {
    let (host, device) = tokio::io::duplex(1024);
    let supply = tokio::spawn(fake_supply(host));
    let mut driver = DcPowerDriver::with_io("psu", DcPowerConfig { output: None, ..config() }, Box::new(device));
    let (mut ctx, _commands, _samples) = EngineContext::new("psu", Instant::now());
    driver.setup(&mut ctx).await.unwrap();

    supply.abort();
    let _ = supply.await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let err = driver.sample(&mut ctx).await.unwrap_err();
    assert!(err.is_fatal(), "{err}");
}

#[test]
fn headers_and_validation() {
    let driver = DcPowerDriver::new("psu", config());
    assert_eq!(driver.headers(), vec!["Voltage (V)", "Current (A)"]);
    assert!(config().validate("psu").is_ok());
    assert!(DcPowerConfig::default().validate("psu").is_err());
    assert!(DcPowerConfig { voltage: Some(-1.0), ..config() }.validate("psu").is_err());
}
