//! Layered application settings.
//!
//! Sources, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. A TOML file (optional; a missing file only warns)
//! 3. Environment variables prefixed `LABDAQ_`, `__` separating nested keys
//!
//! ```bash
//! LABDAQ_RECORD_SAMPLES=100 labdaq run --config lab.toml
//! LABDAQ_FLUSH__INTERVAL_S=2.5 labdaq run --config lab.toml
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use daq_core::DaqError;
use daq_driver_datalogger::DataloggerConfig;
use daq_driver_dc_power::DcPowerConfig;
use daq_driver_vna::VnaConfig;
use daq_storage::FlushConfig;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LABDAQ_";

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured.
    #[default]
    Pretty,
    /// Single-line.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Default log level, overridable with `RUST_LOG`.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Directory receiving session files.
    pub datadir: PathBuf,
    /// Control loop tick, in milliseconds.
    pub poll_interval_ms: u64,
    /// Session length limit in seconds, 0 for unlimited.
    pub record_duration_s: f64,
    /// Master sample limit per session, 0 for unlimited.
    pub record_samples: u64,
    /// Instrument pacing session limits.
    pub master_instrument: Option<String>,
    /// Session labels offered in order.
    pub samples: Vec<String>,
    /// Periodic flush of log files.
    pub flush: FlushConfig,
    /// Configured instruments, in start order.
    pub instruments: Vec<InstrumentConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            datadir: PathBuf::from("./data"),
            poll_interval_ms: 250,
            record_duration_s: 0.0,
            record_samples: 0,
            master_instrument: None,
            samples: Vec::new(),
            flush: FlushConfig::default(),
            instruments: Vec::new(),
        }
    }
}

/// One `[[instruments]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique name; also the log file suffix.
    pub id: String,
    /// Driver selection and its settings.
    #[serde(flatten)]
    pub driver: DriverConfig,
}

/// Closed set of instrument types, selected by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverConfig {
    /// Network analyzer with resonance tracking.
    Vna(VnaConfig),
    /// SCPI power supply.
    DcPower(DcPowerConfig),
    /// Serial temperature/humidity logger.
    Datalogger(DataloggerConfig),
}

impl DriverConfig {
    /// The `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverConfig::Vna(_) => "vna",
            DriverConfig::DcPower(_) => "dc_power",
            DriverConfig::Datalogger(_) => "datalogger",
        }
    }
}

impl Settings {
    /// Load defaults, then `path` (if it exists), then `LABDAQ_*` variables, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        if let Some(path) = path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            } else {
                warn!(path = %path.display(), "config file not found, using defaults");
            }
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings: Settings = figment
            .extract()
            .context("Failed to extract configuration")?;
        settings
            .validate()
            .context("Configuration validation failed")?;
        Ok(settings)
    }

    /// Parse and validate TOML text on top of the defaults, ignoring the environment.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(text))
            .extract()
            .context("Failed to extract configuration")?;
        settings
            .validate()
            .context("Configuration validation failed")?;
        Ok(settings)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), DaqError> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return invalid(format!("invalid log level '{}'", self.log_level));
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive".into());
        }
        if !(self.record_duration_s >= 0.0 && self.record_duration_s.is_finite()) {
            return invalid(format!(
                "record_duration_s must be a non-negative number, got {}",
                self.record_duration_s
            ));
        }
        self.flush.interval()?;
        for label in &self.samples {
            check_file_fragment("session label", label)?;
        }

        let mut ids = HashSet::new();
        for inst in &self.instruments {
            check_file_fragment("instrument id", &inst.id)?;
            if !ids.insert(inst.id.as_str()) {
                return invalid(format!("duplicate instrument id '{}'", inst.id));
            }
            match &inst.driver {
                DriverConfig::Vna(cfg) => cfg.validate(&inst.id)?,
                DriverConfig::DcPower(cfg) => cfg.validate(&inst.id)?,
                DriverConfig::Datalogger(cfg) => cfg.validate(&inst.id)?,
            }
        }

        if let Some(master) = &self.master_instrument {
            if !ids.contains(master.as_str()) {
                return invalid(format!("master_instrument '{master}' is not configured"));
            }
        }
        Ok(())
    }

    /// Session length limit, `None` when unlimited.
    pub fn record_duration(&self) -> Option<Duration> {
        (self.record_duration_s > 0.0).then(|| Duration::from_secs_f64(self.record_duration_s))
    }

    /// Master sample limit, `None` when unlimited.
    pub fn record_limit(&self) -> Option<u64> {
        (self.record_samples > 0).then_some(self.record_samples)
    }

    /// Control loop tick.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Reject names that cannot be embedded in a file name.
pub fn check_file_fragment(what: &str, value: &str) -> Result<(), DaqError> {
    let bad = value.trim().is_empty()
        || value == "."
        || value == ".."
        || value.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(DaqError::Configuration(format!(
            "{what} '{value}' is not usable as a file name"
        )));
    }
    Ok(())
}
