//! SCPI DC power supply driver.
//!
//! Each sample reads back output voltage and current. Output state, voltage setpoint and
//! current limit are deferred [`DcPowerCommand`]s executed on the engine thread.

use std::time::Duration;

use async_trait::async_trait;
use daq_core::scpi::{DynIo, ScpiSession};
use daq_core::{DaqError, EngineContext, Field, Instrument, Pacer};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration of one power supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DcPowerConfig {
    /// Transport resource (`host:port` or `TCPIP0::host::port::SOCKET`).
    pub resource: String,
    /// Reply timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Time between readbacks, in milliseconds.
    pub sample_interval_ms: u64,
    /// Voltage setpoint applied at setup.
    pub voltage: Option<f64>,
    /// Current limit applied at setup.
    pub current_limit: Option<f64>,
    /// Output state applied at setup.
    pub output: Option<bool>,
}

impl Default for DcPowerConfig {
    fn default() -> Self {
        Self {
            resource: String::new(),
            timeout_ms: 2000,
            sample_interval_ms: 1000,
            voltage: None,
            current_limit: None,
            output: None,
        }
    }
}

impl DcPowerConfig {
    /// Check semantic constraints.
    pub fn validate(&self, id: &str) -> Result<(), DaqError> {
        if self.resource.trim().is_empty() {
            return Err(DaqError::Configuration(format!(
                "instrument '{id}': resource is required"
            )));
        }
        for (label, value) in [("voltage", self.voltage), ("current_limit", self.current_limit)] {
            if matches!(value, Some(v) if !(v >= 0.0 && v.is_finite())) {
                return Err(DaqError::Configuration(format!(
                    "instrument '{id}': {label} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

/// Deferred power supply actions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DcPowerCommand {
    /// Switch the output on or off.
    SetOutput(bool),
    /// Voltage setpoint in volts.
    SetVoltage(f64),
    /// Current limit in amperes.
    SetCurrentLimit(f64),
}

/// One readback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcPowerSample {
    /// Measured output voltage in volts.
    pub voltage: f64,
    /// Measured output current in amperes.
    pub current: f64,
}

/// DC power supply instrument.
pub struct DcPowerDriver {
    name: String,
    config: DcPowerConfig,
    session: Option<ScpiSession>,
    injected: Option<DynIo>,
    pacer: Pacer,
}

impl DcPowerDriver {
    /// Driver that connects to `config.resource` during setup.
    pub fn new(name: impl Into<String>, config: DcPowerConfig) -> Self {
        let pacer = Pacer::new(Duration::from_millis(config.sample_interval_ms));
        Self {
            name: name.into(),
            config,
            session: None,
            injected: None,
            pacer,
        }
    }

    /// Driver talking over an already open stream.
    pub fn with_io(name: impl Into<String>, config: DcPowerConfig, io: DynIo) -> Self {
        let mut driver = Self::new(name, config);
        driver.injected = Some(io);
        driver
    }

    fn session(&mut self) -> Result<&mut ScpiSession, DaqError> {
        self.session.as_mut().ok_or(DaqError::NotRunning)
    }

    async fn execute(&mut self, command: DcPowerCommand) -> Result<(), DaqError> {
        let line = match command {
            DcPowerCommand::SetOutput(on) => format!("OUTP {}", if on { "ON" } else { "OFF" }),
            DcPowerCommand::SetVoltage(v) => format!("VOLT {v}"),
            DcPowerCommand::SetCurrentLimit(a) => format!("CURR {a}"),
        };
        self.session()?.write(&line).await
    }
}

#[async_trait]
impl Instrument for DcPowerDriver {
    type Command = DcPowerCommand;
    type Sample = DcPowerSample;

    fn kind(&self) -> &'static str {
        "dc_power"
    }

    fn headers(&self) -> Vec<String> {
        vec!["Voltage (V)".to_string(), "Current (A)".to_string()]
    }

    fn format_sample(sample: &DcPowerSample) -> Vec<Field> {
        vec![Field::Float(sample.voltage), Field::Float(sample.current)]
    }

    async fn setup(&mut self, _ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut session = match self.injected.take() {
            Some(io) => ScpiSession::new(self.name.clone(), io, timeout),
            None => ScpiSession::connect_tcp(self.name.clone(), &self.config.resource, timeout).await?,
        };
        let id = session
            .identify()
            .await
            .map_err(|e| DaqError::setup(self.name.clone(), e.to_string()))?;
        if id.model.is_empty() {
            return Err(DaqError::setup(self.name.clone(), "empty identification reply"));
        }
        info!(instrument = %self.name, manufacturer = %id.manufacturer, model = %id.model, "power supply identified");
        self.session = Some(session);

        let initial = [
            self.config.current_limit.map(DcPowerCommand::SetCurrentLimit),
            self.config.voltage.map(DcPowerCommand::SetVoltage),
            self.config.output.map(DcPowerCommand::SetOutput),
        ];
        for command in initial.into_iter().flatten() {
            self.execute(command)
                .await
                .map_err(|e| DaqError::setup(self.name.clone(), e.to_string()))?;
        }
        Ok(())
    }

    async fn sample(&mut self, ctx: &mut EngineContext<Self>) -> Result<Option<DcPowerSample>, DaqError> {
        let session = self.session()?;
        let voltage = session.query_f64("MEAS:VOLT?").await?;
        let current = session.query_f64("MEAS:CURR?").await?;
        self.pacer.pace(ctx).await?;
        Ok(Some(DcPowerSample { voltage, current }))
    }

    async fn apply(&mut self, command: DcPowerCommand, _ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        info!(instrument = %self.name, ?command, "power supply command");
        self.execute(command).await
    }

    async fn cleanup(&mut self) {
        if self.session.take().is_none() {
            warn!(instrument = %self.name, "power supply was never connected");
        }
    }
}
