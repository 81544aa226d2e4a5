//! Capabilities available to a driver while it runs on its engine thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::DaqError;
use crate::instrument::Instrument;
use crate::queue::{Acquired, CommandQueue, EngineCommand, SampleQueue};

/// Engine-side end of both queues plus the shared stop flag.
///
/// Drivers use it to block without losing responsiveness ([`wait_with_cancel`]),
/// to push extra samples ([`emit`]) and to observe whether a logging session is active.
///
/// Commands that arrive during a cancellable wait are not executed there; they are kept in
/// arrival order and run at the start of the next loop iteration, before any newer command.
///
/// [`wait_with_cancel`]: EngineContext::wait_with_cancel
/// [`emit`]: EngineContext::emit
pub struct EngineContext<I: Instrument> {
    name: String,
    commands: mpsc::UnboundedReceiver<EngineCommand<I::Command>>,
    deferred: VecDeque<EngineCommand<I::Command>>,
    samples: mpsc::UnboundedSender<Acquired<I::Sample>>,
    running: Arc<AtomicBool>,
    recording: bool,
    epoch: std::time::Instant,
}

impl<I: Instrument> EngineContext<I> {
    /// Build a free-standing context with its queues, running until the queues are dropped.
    ///
    /// Used to drive an instrument directly (tests, one-shot tools) without an engine thread.
    pub fn new(
        name: impl Into<String>,
        epoch: std::time::Instant,
    ) -> (Self, CommandQueue<I::Command>, SampleQueue<I::Sample>) {
        Self::with_flag(name.into(), epoch, Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn with_flag(
        name: String,
        epoch: std::time::Instant,
        running: Arc<AtomicBool>,
    ) -> (Self, CommandQueue<I::Command>, SampleQueue<I::Sample>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        let ctx = Self {
            name: name.clone(),
            commands: cmd_rx,
            deferred: VecDeque::new(),
            samples: sample_tx,
            running,
            recording: false,
            epoch,
        };
        (ctx, CommandQueue::new(name, cmd_tx), SampleQueue::new(sample_rx))
    }

    /// Instrument name this context belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the engine has not been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a logging session is active.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Seconds since the engine epoch.
    pub fn elapsed(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Fail with [`DaqError::Halted`] if a stop was requested.
    pub fn check_running(&self) -> Result<(), DaqError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DaqError::Halted)
        }
    }

    /// Timestamp a sample now and push it onto the sample queue.
    pub fn emit(&self, sample: I::Sample) {
        self.emit_at(sample, Utc::now(), self.elapsed());
    }

    /// Push a sample acquired at an earlier `timestamp`, `elapsed` seconds after the epoch.
    pub fn emit_at(&self, sample: I::Sample, timestamp: DateTime<Utc>, elapsed: f64) {
        let acquired = Acquired {
            timestamp,
            elapsed,
            sample,
        };
        if self.samples.send(acquired).is_err() {
            tracing::debug!(instrument = %self.name, "sample queue closed, dropping sample");
        }
    }

    /// Block for `duration`, returning early with [`DaqError::Halted`] on a stop request.
    pub async fn wait_with_cancel(&mut self, duration: Duration) -> Result<(), DaqError> {
        self.wait_until(Instant::now() + duration).await
    }

    /// Block until `deadline`, returning early with [`DaqError::Halted`] on a stop request.
    pub async fn wait_until(&mut self, deadline: Instant) -> Result<(), DaqError> {
        loop {
            self.check_running()?;
            match tokio::time::timeout_at(deadline, self.commands.recv()).await {
                Err(_elapsed) => return self.check_running(),
                Ok(Some(command)) => self.defer(command),
                Ok(None) => {
                    tokio::time::sleep_until(deadline).await;
                    return self.check_running();
                }
            }
        }
    }

    /// Block until the recording state equals `recording`, polling every 200 ms.
    pub async fn wait_for_recording(&mut self, recording: bool) -> Result<(), DaqError> {
        while self.recording != recording {
            self.wait_with_cancel(Duration::from_millis(200)).await?;
        }
        Ok(())
    }

    /// Take every command pending at this moment, oldest first.
    ///
    /// Commands arriving after this call wait for the next iteration.
    pub(crate) fn take_pending(&mut self) -> Vec<EngineCommand<I::Command>> {
        while let Ok(command) = self.commands.try_recv() {
            self.defer(command);
        }
        self.deferred.drain(..).collect()
    }

    fn defer(&mut self, command: EngineCommand<I::Command>) {
        match command {
            EngineCommand::Ping => {}
            EngineCommand::RecordStart => {
                self.recording = true;
                self.deferred.push_back(command);
            }
            EngineCommand::RecordStop => {
                self.recording = false;
                self.deferred.push_back(command);
            }
            EngineCommand::Instrument(_) => self.deferred.push_back(command),
        }
    }
}

/// Keeps a fixed sampling cadence against a monotonically advancing deadline.
///
/// Each call to [`Pacer::pace`] advances the deadline by one interval and waits for it, so
/// time spent acquiring and processing does not accumulate into drift. A pacer that has
/// fallen behind restarts from the current time instead of firing a burst of catch-up calls.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    next_call: Option<Instant>,
}

impl Pacer {
    /// Pacer with the given interval. A zero interval never waits.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_call: None,
        }
    }

    /// Configured interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait out the rest of the current interval.
    pub async fn pace<I: Instrument>(&mut self, ctx: &mut EngineContext<I>) -> Result<(), DaqError> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let deadline = self.advance(Instant::now());
        ctx.wait_until(deadline).await
    }

    fn advance(&mut self, now: Instant) -> Instant {
        let deadline = match self.next_call {
            Some(previous) => (previous + self.interval).max(now),
            None => now + self.interval,
        };
        self.next_call = Some(deadline);
        deadline
    }
}
