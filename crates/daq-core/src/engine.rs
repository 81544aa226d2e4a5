//! Per-instrument acquisition engine.
//!
//! Each engine owns one dedicated OS thread (named `acq-<instrument>`) running a
//! current-thread tokio runtime. The instrument value is moved onto that thread and is only
//! touched there, so no locks guard driver or tracking state.
//!
//! ## Loop
//!
//! ```text
//! setup ──ok──▶ ┌─ stop requested? ── yes ──▶ cleanup ─▶ Stopped
//!    │          │  drain pending commands (snapshot, FIFO, each to completion)
//!  error        │  sample() ─▶ Some(s) ─▶ timestamp + push to SampleQueue
//!    ▼          └─ (None: nothing this cycle)
//! cleanup ─▶ Failed
//! ```
//!
//! Fatal errors ([`DaqError::is_fatal`]) end the loop in [`EngineState::Failed`]; any other
//! error drops the current cycle. [`DaqError::Halted`] ends the loop normally.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::error::DaqError;
use crate::instrument::{Field, Instrument};
use crate::queue::{Acquired, CommandQueue, EngineCommand, SampleQueue};

/// Lifecycle of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// Created, thread not yet running setup.
    Idle,
    /// `setup()` in progress.
    SettingUp,
    /// Sampling loop active.
    Running,
    /// Stop requested, loop winding down.
    Stopping,
    /// Loop exited and cleanup ran.
    Stopped,
    /// Setup failed or a fatal error ended the loop.
    Failed(String),
}

impl EngineState {
    /// Whether the loop has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped | EngineState::Failed(_))
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => f.write_str("idle"),
            EngineState::SettingUp => f.write_str("setting up"),
            EngineState::Running => f.write_str("running"),
            EngineState::Stopping => f.write_str("stopping"),
            EngineState::Stopped => f.write_str("stopped"),
            EngineState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Handle to a running acquisition engine, held by the control thread.
pub struct AcquisitionEngine<I: Instrument> {
    name: String,
    kind: &'static str,
    headers: Vec<String>,
    commands: CommandQueue<I::Command>,
    samples: SampleQueue<I::Sample>,
    running: Arc<AtomicBool>,
    state: watch::Receiver<EngineState>,
    setup: Option<oneshot::Receiver<Result<(), DaqError>>>,
    thread: Option<JoinHandle<()>>,
}

impl<I: Instrument> AcquisitionEngine<I> {
    /// Spawn the engine thread and return immediately.
    ///
    /// `epoch` is the reference for the `elapsed` stamp of every sample.
    pub fn start(
        name: impl Into<String>,
        instrument: I,
        epoch: Instant,
    ) -> Result<Self, DaqError> {
        let name = name.into();
        let kind = instrument.kind();
        let headers = instrument.headers();
        let running = Arc::new(AtomicBool::new(true));
        let (ctx, commands, samples) =
            EngineContext::with_flag(name.clone(), epoch, running.clone());
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);
        let (setup_tx, setup_rx) = oneshot::channel();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(format!("acq-{name}"))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let message = format!("failed to create tokio runtime: {e}");
                        state_tx.send_replace(EngineState::Failed(message.clone()));
                        let _ = setup_tx.send(Err(DaqError::setup(thread_name, message)));
                        return;
                    }
                };
                rt.block_on(run(instrument, ctx, state_tx, setup_tx));
            })?;

        info!(instrument = %name, kind, "acquisition engine started");
        Ok(Self {
            name,
            kind,
            headers,
            commands,
            samples,
            running,
            state: state_rx,
            setup: Some(setup_rx),
            thread: Some(thread),
        })
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instrument kind tag.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Column headers of the instrument, captured before the thread started.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Format a sample produced by this engine.
    pub fn format_sample(&self, sample: &I::Sample) -> Vec<Field> {
        I::format_sample(sample)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Whether the sampling loop is active.
    pub fn is_running(&self) -> bool {
        matches!(*self.state.borrow(), EngineState::Running)
    }

    /// Block until setup finished; returns the setup error if it failed.
    ///
    /// Must be called from outside any tokio runtime (the control thread).
    pub fn wait_for_setup(&mut self) -> Result<(), DaqError> {
        match self.setup.take() {
            Some(rx) => rx.blocking_recv().unwrap_or_else(|_| {
                Err(DaqError::setup(
                    self.name.clone(),
                    "engine thread exited during setup",
                ))
            }),
            None => match self.state() {
                EngineState::Failed(reason) => Err(DaqError::setup(self.name.clone(), reason)),
                _ => Ok(()),
            },
        }
    }

    /// Queue an instrument command. Non-blocking.
    pub fn enqueue(&self, command: I::Command) -> Result<(), DaqError> {
        self.commands.enqueue(command)
    }

    /// Queue an engine-level message (record start/stop, ping).
    pub fn send(&self, command: EngineCommand<I::Command>) -> Result<(), DaqError> {
        self.commands.send(command)
    }

    /// Cloneable sender for this engine's command queue.
    pub fn command_queue(&self) -> CommandQueue<I::Command> {
        self.commands.clone()
    }

    /// Remove and return every sample produced since the last call.
    pub fn drain_samples(&mut self) -> Vec<Acquired<I::Sample>> {
        self.samples.drain()
    }

    /// Signal the loop to stop without waiting for it.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Wake any cancellable wait; a closed queue means the loop already exited.
        let _ = self.commands.send(EngineCommand::Ping);
    }

    /// Signal the loop to stop and join its thread. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(instrument = %self.name, "acquisition thread panicked");
            }
            info!(instrument = %self.name, state = %self.state(), "acquisition engine stopped");
        }
    }
}

impl<I: Instrument> Drop for AcquisitionEngine<I> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run<I: Instrument>(
    mut instrument: I,
    mut ctx: EngineContext<I>,
    state: watch::Sender<EngineState>,
    setup: oneshot::Sender<Result<(), DaqError>>,
) {
    let name = ctx.name().to_string();
    state.send_replace(EngineState::SettingUp);
    debug!(instrument = %name, "running setup");

    if let Err(e) = instrument.setup(&mut ctx).await {
        if matches!(e, DaqError::Halted) {
            info!(instrument = %name, "stopped during setup");
            state.send_replace(EngineState::Stopped);
        } else {
            error!(instrument = %name, error = %e, "setup failed");
            state.send_replace(EngineState::Failed(e.to_string()));
        }
        let _ = setup.send(Err(e));
        instrument.cleanup().await;
        return;
    }
    state.send_replace(EngineState::Running);
    let _ = setup.send(Ok(()));

    let outcome = sampling_loop(&mut instrument, &mut ctx).await;

    state.send_replace(EngineState::Stopping);
    instrument.cleanup().await;
    match outcome {
        Ok(()) => {
            state.send_replace(EngineState::Stopped);
        }
        Err(e) => {
            error!(instrument = %name, error = %e, "acquisition loop failed");
            state.send_replace(EngineState::Failed(e.to_string()));
        }
    }
}

async fn sampling_loop<I: Instrument>(
    instrument: &mut I,
    ctx: &mut EngineContext<I>,
) -> Result<(), DaqError> {
    while ctx.is_running() {
        for command in ctx.take_pending() {
            let result = match command {
                EngineCommand::Instrument(c) => instrument.apply(c, ctx).await,
                EngineCommand::RecordStart => instrument.on_record_start().await,
                EngineCommand::RecordStop => instrument.on_record_stop().await,
                EngineCommand::Ping => Ok(()),
            };
            if let Err(e) = result {
                classify(ctx.name(), e, "command")?;
            }
        }

        if !ctx.is_running() {
            break;
        }

        // Samples carry the time their cycle began, not the time the driver finished with them.
        let (timestamp, elapsed) = (Utc::now(), ctx.elapsed());
        match instrument.sample(ctx).await {
            Ok(Some(sample)) => ctx.emit_at(sample, timestamp, elapsed),
            Ok(None) => {}
            Err(e) => classify(ctx.name(), e, "sample")?,
        }
    }
    Ok(())
}

/// Decide whether an error ends the loop. `Halted` ends it without failure.
fn classify(name: &str, error: DaqError, step: &str) -> Result<(), DaqError> {
    match error {
        DaqError::Halted => {
            debug!(instrument = %name, step, "halted by stop request");
            Ok(())
        }
        e if e.is_fatal() => Err(e),
        e => {
            warn!(instrument = %name, step, error = %e, "dropping cycle");
            Ok(())
        }
    }
}
