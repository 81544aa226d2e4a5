//! The orchestrator: running engines, the master instrument and logging sessions.
//!
//! All methods run on the control thread. Engines are only reached through their queues,
//! so nothing here blocks on an instrument except [`Backend::start`] waiting for setup.
//!
//! Session limits are paced by the master instrument. Its rows are handled first on every
//! tick; once its sample budget is spent or the record duration has passed, rows from the
//! other instruments are still logged up to the master's last logged timestamp, then the
//! session closes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use daq_core::{Acquired, DaqError};
use daq_storage::DataLogger;
use tracing::{debug, info, warn};

use crate::config::{check_file_fragment, Settings};
use crate::instruments::{launch, InstrumentCommand, InstrumentSample, RunningInstrument};

/// Receives `(seconds since engine start, sample)` for every drained sample.
pub type DisplayCallback<'a> = Box<dyn FnMut(f64, &InstrumentSample) + 'a>;

/// Outcome of [`Backend::start`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Instruments now running, in configuration order.
    pub started: Vec<String>,
    /// Instruments whose engine failed to start or set up.
    pub failed: Vec<(String, DaqError)>,
    /// Instrument pacing session limits.
    pub master: Option<String>,
}

impl StartReport {
    /// Whether every configured instrument started.
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug)]
struct Session {
    label: String,
    requested_at: DateTime<Utc>,
    log_start: Option<DateTime<Utc>>,
    remaining: Option<u64>,
    last_master_row: Option<DateTime<Utc>>,
    ended: bool,
}

impl Session {
    fn origin(&self) -> DateTime<Utc> {
        self.log_start.unwrap_or(self.requested_at)
    }
}

/// Owns the running instruments and the data logger.
pub struct Backend {
    settings: Settings,
    instruments: Vec<RunningInstrument>,
    master: Option<String>,
    logger: DataLogger,
    session: Option<Session>,
}

impl Backend {
    /// Backend for validated settings. Nothing runs until [`start`](Self::start).
    pub fn new(settings: Settings) -> Result<Self, DaqError> {
        let logger = DataLogger::new(&settings.flush)?;
        Ok(Self {
            settings,
            instruments: Vec::new(),
            master: None,
            logger,
            session: None,
        })
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start an engine per configured instrument and wait for their setup.
    ///
    /// Instruments that fail are reported and left out; the rest keep running.
    pub fn start(&mut self) -> Result<StartReport, DaqError> {
        if self.is_running() {
            return Err(DaqError::AlreadyRunning);
        }
        let epoch = Instant::now();
        let mut launched = Vec::new();
        let mut failed = Vec::new();
        for config in &self.settings.instruments {
            match launch(config, epoch) {
                Ok(instrument) => launched.push(instrument),
                Err(e) => {
                    warn!(instrument = %config.id, error = %e, "engine failed to start");
                    failed.push((config.id.clone(), e));
                }
            }
        }
        let mut report = self.adopt(launched)?;
        failed.append(&mut report.failed);
        report.failed = failed;
        Ok(report)
    }

    /// Take over already started engines, wait for their setup and choose the master.
    pub fn adopt(&mut self, instruments: Vec<RunningInstrument>) -> Result<StartReport, DaqError> {
        if self.is_running() {
            return Err(DaqError::AlreadyRunning);
        }
        let mut report = StartReport::default();
        for mut instrument in instruments {
            match instrument.wait_for_setup() {
                Ok(()) => {
                    report.started.push(instrument.name().to_string());
                    self.instruments.push(instrument);
                }
                Err(e) => {
                    warn!(instrument = %instrument.name(), error = %e, "instrument setup failed");
                    report.failed.push((instrument.name().to_string(), e));
                    instrument.stop();
                }
            }
        }

        self.master = self.choose_master();
        report.master = self.master.clone();
        info!(
            running = report.started.len(),
            failed = report.failed.len(),
            master = ?self.master,
            "backend started"
        );
        Ok(report)
    }

    fn choose_master(&self) -> Option<String> {
        if let Some(wanted) = &self.settings.master_instrument {
            if self.instruments.iter().any(|i| i.name() == wanted) {
                return Some(wanted.clone());
            }
            warn!(master = %wanted, "configured master is not running, choosing another");
        }
        self.instruments
            .iter()
            .find(|i| i.is_vna())
            .or_else(|| self.instruments.first())
            .map(|i| i.name().to_string())
    }

    /// Close any session, then stop and join every engine.
    pub fn stop(&mut self) -> Result<(), DaqError> {
        let closed = self.stop_logging();
        for instrument in &self.instruments {
            instrument.request_stop();
        }
        for mut instrument in self.instruments.drain(..) {
            instrument.stop();
            debug!(instrument = %instrument.name(), state = %instrument.state(), "engine joined");
        }
        self.master = None;
        info!("backend stopped");
        closed
    }

    /// Whether any engine is running.
    pub fn is_running(&self) -> bool {
        !self.instruments.is_empty()
    }

    /// Whether at least one engine is still sampling.
    pub fn has_live_engines(&self) -> bool {
        self.instruments.iter().any(|i| !i.state().is_terminal())
    }

    /// Names of running instruments.
    pub fn instrument_names(&self) -> Vec<&str> {
        self.instruments.iter().map(|i| i.name()).collect()
    }

    /// A running instrument by name.
    pub fn instrument(&self, name: &str) -> Option<&RunningInstrument> {
        self.instruments.iter().find(|i| i.name() == name)
    }

    /// The instrument pacing session limits.
    pub fn master(&self) -> Option<&str> {
        self.master.as_deref()
    }

    /// Queue a deferred command for one instrument.
    pub fn enqueue(&self, name: &str, command: InstrumentCommand) -> Result<(), DaqError> {
        self.instrument(name)
            .ok_or_else(|| DaqError::UnknownInstrument(name.to_string()))?
            .enqueue(command)
    }

    /// Open `<label>_<instrument>.csv` files and notify every driver that recording began.
    ///
    /// New files get a header row; files extended from an earlier session do not.
    pub fn start_logging(&mut self, label: &str) -> Result<(), DaqError> {
        if !self.is_running() {
            return Err(DaqError::NotRunning);
        }
        check_file_fragment("session label", label)?;
        if self.session.is_some() {
            self.stop_logging()?;
        }

        let names: Vec<String> = self.instruments.iter().map(|i| i.name().to_string()).collect();
        let existed = self.logger.open(&names[..], &self.settings.datadir, label)?;
        for instrument in &self.instruments {
            if existed.get(instrument.name()).copied().unwrap_or(false) {
                continue;
            }
            let mut header = vec!["Timestamp".to_string(), "Time (s)".to_string()];
            header.extend(instrument.headers().iter().cloned());
            if let Err(e) = self.logger.write(instrument.name(), &header) {
                let _ = self.logger.close();
                return Err(e);
            }
        }

        for instrument in &self.instruments {
            if let Err(e) = instrument.notify_recording(true) {
                warn!(instrument = %instrument.name(), error = %e, "recording notification not delivered");
            }
        }
        self.session = Some(Session {
            label: label.to_string(),
            requested_at: Utc::now(),
            log_start: None,
            remaining: self.settings.record_limit(),
            last_master_row: None,
            ended: false,
        });
        info!(label, datadir = %self.settings.datadir.display(), "logging started");
        Ok(())
    }

    /// Close the session, if any, and notify every driver that recording ended.
    pub fn stop_logging(&mut self) -> Result<(), DaqError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        for instrument in &self.instruments {
            if let Err(e) = instrument.notify_recording(false) {
                debug!(instrument = %instrument.name(), error = %e, "recording stop not delivered");
            }
        }
        info!(label = %session.label, "logging stopped");
        self.logger.close()
    }

    /// Whether a session is open.
    pub fn is_logging(&self) -> bool {
        self.session.is_some()
    }

    /// Label of the open session.
    pub fn session_label(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.label.as_str())
    }

    /// Configured session labels.
    pub fn session_labels(&self) -> &[String] {
        &self.settings.samples
    }

    /// The label after `current` in the configured list, wrapping to the first.
    pub fn next_label(&self, current: &str) -> Option<&str> {
        let labels = &self.settings.samples;
        let next = match labels.iter().position(|l| l == current) {
            Some(i) => (i + 1) % labels.len(),
            None => 0,
        };
        labels.get(next).map(String::as_str)
    }

    /// Drain every engine once: log rows while a session is open and feed display callbacks.
    ///
    /// Returns whether the session is still open afterwards. A logging error closes the
    /// session and is returned once every sample of the tick has been delivered.
    pub fn process_samples(
        &mut self,
        callbacks: &mut HashMap<String, DisplayCallback<'_>>,
    ) -> Result<bool, DaqError> {
        let master = self
            .master
            .as_deref()
            .and_then(|m| self.instruments.iter().position(|i| i.name() == m));
        let order: Vec<usize> = master
            .into_iter()
            .chain((0..self.instruments.len()).filter(|i| Some(*i) != master))
            .collect();
        let duration = self.settings.record_duration();

        let mut failure = None;
        for index in order {
            let is_master = Some(index) == master;
            let instrument = &mut self.instruments[index];
            let samples = instrument.drain();
            for acquired in &samples {
                if let Some(session) = self.session.as_mut().filter(|_| failure.is_none()) {
                    let logged = log_row(
                        &mut self.logger,
                        session,
                        instrument,
                        is_master,
                        duration,
                        acquired,
                    );
                    if let Err(e) = logged {
                        warn!(instrument = %instrument.name(), error = %e, "logging failed, closing session");
                        failure = Some(e);
                    }
                }
                if let Some(callback) = callbacks.get_mut(instrument.name()) {
                    callback(acquired.elapsed, &acquired.sample);
                }
            }
        }

        if let (Some(session), Some(limit)) = (self.session.as_mut(), duration) {
            if !session.ended && exceeded(Utc::now() - session.origin(), limit) {
                session.ended = true;
            }
        }

        if let Some(e) = failure {
            if let Err(close) = self.stop_logging() {
                warn!(error = %close, "closing log files after failure");
            }
            return Err(e);
        }
        if self.session.as_ref().is_some_and(|s| s.ended) {
            info!("record limit reached");
            self.stop_logging()?;
        }
        Ok(self.is_logging())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "backend stopped with error");
            }
        }
    }
}

fn exceeded(elapsed: chrono::Duration, limit: Duration) -> bool {
    elapsed.to_std().is_ok_and(|e| e > limit)
}

fn seconds(elapsed: chrono::Duration) -> f64 {
    elapsed.num_microseconds().map_or(f64::NAN, |us| us as f64 * 1e-6)
}

fn log_row(
    logger: &mut DataLogger,
    session: &mut Session,
    instrument: &RunningInstrument,
    is_master: bool,
    duration: Option<Duration>,
    acquired: &Acquired<InstrumentSample>,
) -> Result<(), DaqError> {
    if is_master {
        if session.ended {
            return Ok(());
        }
        let start = *session.log_start.get_or_insert(acquired.timestamp);
        if duration.is_some_and(|limit| exceeded(acquired.timestamp - start, limit)) {
            session.ended = true;
            return Ok(());
        }
    } else if session.ended {
        match session.last_master_row {
            Some(last) if acquired.timestamp <= last => {}
            _ => return Ok(()),
        }
    }

    let elapsed = seconds(acquired.timestamp - session.origin());
    let mut row = vec![
        acquired.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        format!("{elapsed:.3}"),
    ];
    row.extend(
        instrument
            .format_sample(&acquired.sample)?
            .iter()
            .map(ToString::to_string),
    );
    logger.write(instrument.name(), &row)?;

    if is_master {
        session.last_master_row = Some(acquired.timestamp);
        if let Some(remaining) = session.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                session.ended = true;
            }
        }
    }
    Ok(())
}
