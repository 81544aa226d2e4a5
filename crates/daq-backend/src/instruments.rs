//! Closed dispatch over the instrument kinds the backend knows how to run.

use std::time::Instant;

use daq_core::{Acquired, AcquisitionEngine, DaqError, EngineCommand, EngineState, Field};
use daq_driver_datalogger::{DataloggerDriver, DataloggerSample};
use daq_driver_dc_power::{DcPowerCommand, DcPowerDriver, DcPowerSample};
use daq_driver_vna::{VnaCommand, VnaDriver, VnaSample};

use crate::config::{DriverConfig, InstrumentConfig};

/// A started engine of any supported kind.
pub enum RunningInstrument {
    /// Network analyzer.
    Vna(AcquisitionEngine<VnaDriver>),
    /// Power supply.
    DcPower(AcquisitionEngine<DcPowerDriver>),
    /// Datalogger.
    Datalogger(AcquisitionEngine<DataloggerDriver>),
}

/// A sample from any supported kind.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentSample {
    /// Network analyzer sweep.
    Vna(VnaSample),
    /// Power supply readback.
    DcPower(DcPowerSample),
    /// Datalogger frame.
    Datalogger(DataloggerSample),
}

/// A deferred command addressed to one instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentCommand {
    /// Network analyzer command.
    Vna(VnaCommand),
    /// Power supply command.
    DcPower(DcPowerCommand),
}

impl InstrumentCommand {
    fn kind(&self) -> &'static str {
        match self {
            InstrumentCommand::Vna(_) => "vna",
            InstrumentCommand::DcPower(_) => "dc_power",
        }
    }
}

macro_rules! each_engine {
    ($self:expr, $engine:ident => $body:expr) => {
        match $self {
            RunningInstrument::Vna($engine) => $body,
            RunningInstrument::DcPower($engine) => $body,
            RunningInstrument::Datalogger($engine) => $body,
        }
    };
}

/// Start the engine for one configured instrument. Setup continues on the engine thread.
pub fn launch(config: &InstrumentConfig, epoch: Instant) -> Result<RunningInstrument, DaqError> {
    let name = config.id.as_str();
    Ok(match &config.driver {
        DriverConfig::Vna(cfg) => RunningInstrument::Vna(AcquisitionEngine::start(
            name,
            VnaDriver::new(name, cfg.clone()),
            epoch,
        )?),
        DriverConfig::DcPower(cfg) => RunningInstrument::DcPower(AcquisitionEngine::start(
            name,
            DcPowerDriver::new(name, cfg.clone()),
            epoch,
        )?),
        DriverConfig::Datalogger(cfg) => RunningInstrument::Datalogger(AcquisitionEngine::start(
            name,
            DataloggerDriver::new(name, cfg.clone()),
            epoch,
        )?),
    })
}

impl From<AcquisitionEngine<VnaDriver>> for RunningInstrument {
    fn from(engine: AcquisitionEngine<VnaDriver>) -> Self {
        RunningInstrument::Vna(engine)
    }
}

impl From<AcquisitionEngine<DcPowerDriver>> for RunningInstrument {
    fn from(engine: AcquisitionEngine<DcPowerDriver>) -> Self {
        RunningInstrument::DcPower(engine)
    }
}

impl From<AcquisitionEngine<DataloggerDriver>> for RunningInstrument {
    fn from(engine: AcquisitionEngine<DataloggerDriver>) -> Self {
        RunningInstrument::Datalogger(engine)
    }
}

impl RunningInstrument {
    /// Instrument name.
    pub fn name(&self) -> &str {
        each_engine!(self, e => e.name())
    }

    /// Instrument type tag.
    pub fn kind(&self) -> &'static str {
        each_engine!(self, e => e.kind())
    }

    /// Whether this is a network analyzer.
    pub fn is_vna(&self) -> bool {
        matches!(self, RunningInstrument::Vna(_))
    }

    /// Column headers after the timestamp and elapsed columns.
    pub fn headers(&self) -> &[String] {
        each_engine!(self, e => e.headers())
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        each_engine!(self, e => e.state())
    }

    /// Block until setup finished.
    pub fn wait_for_setup(&mut self) -> Result<(), DaqError> {
        each_engine!(self, e => e.wait_for_setup())
    }

    /// Tell the driver that recording started or stopped.
    pub fn notify_recording(&self, recording: bool) -> Result<(), DaqError> {
        each_engine!(self, e => e.send(if recording {
            EngineCommand::RecordStart
        } else {
            EngineCommand::RecordStop
        }))
    }

    /// Queue a deferred command. A command for another kind is rejected.
    pub fn enqueue(&self, command: InstrumentCommand) -> Result<(), DaqError> {
        match (self, command) {
            (RunningInstrument::Vna(e), InstrumentCommand::Vna(c)) => e.enqueue(c),
            (RunningInstrument::DcPower(e), InstrumentCommand::DcPower(c)) => e.enqueue(c),
            (_, command) => Err(DaqError::CommandMismatch {
                instrument: self.name().to_string(),
                expected: command.kind(),
            }),
        }
    }

    /// Take every queued sample.
    pub fn drain(&mut self) -> Vec<Acquired<InstrumentSample>> {
        fn wrap<S>(
            samples: Vec<Acquired<S>>,
            f: impl Fn(S) -> InstrumentSample,
        ) -> Vec<Acquired<InstrumentSample>> {
            samples
                .into_iter()
                .map(|a| Acquired {
                    timestamp: a.timestamp,
                    elapsed: a.elapsed,
                    sample: f(a.sample),
                })
                .collect()
        }
        match self {
            RunningInstrument::Vna(e) => wrap(e.drain_samples(), InstrumentSample::Vna),
            RunningInstrument::DcPower(e) => wrap(e.drain_samples(), InstrumentSample::DcPower),
            RunningInstrument::Datalogger(e) => {
                wrap(e.drain_samples(), InstrumentSample::Datalogger)
            }
        }
    }

    /// Format a sample produced by this instrument.
    pub fn format_sample(&self, sample: &InstrumentSample) -> Result<Vec<Field>, DaqError> {
        match (self, sample) {
            (RunningInstrument::Vna(e), InstrumentSample::Vna(s)) => Ok(e.format_sample(s)),
            (RunningInstrument::DcPower(e), InstrumentSample::DcPower(s)) => Ok(e.format_sample(s)),
            (RunningInstrument::Datalogger(e), InstrumentSample::Datalogger(s)) => {
                Ok(e.format_sample(s))
            }
            _ => Err(DaqError::CommandMismatch {
                instrument: self.name().to_string(),
                expected: self.kind(),
            }),
        }
    }

    /// Signal the engine to stop without waiting.
    pub fn request_stop(&self) {
        each_engine!(self, e => e.request_stop())
    }

    /// Stop the engine and join its thread.
    pub fn stop(&mut self) {
        each_engine!(self, e => e.stop())
    }
}
