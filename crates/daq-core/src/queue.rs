//! Command and sample queues between the control thread and an engine thread.
//!
//! Both queues are unbounded tokio `mpsc` channels:
//! - [`CommandQueue`] carries [`EngineCommand`]s into the engine loop (cloneable, any thread)
//! - [`SampleQueue`] carries [`Acquired`] samples out of it (single consumer, drained per tick)
//!
//! Neither side ever blocks: `enqueue` is a channel send and `drain` a `try_recv` loop.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::DaqError;

/// A message for the engine loop.
#[derive(Debug)]
pub enum EngineCommand<C> {
    /// Instrument-specific deferred action.
    Instrument(C),
    /// A logging session started.
    RecordStart,
    /// A logging session ended.
    RecordStop,
    /// Liveness no-op; wakes cancellable waits so they re-check the stop flag.
    Ping,
}

/// A sample stamped by the engine that produced it.
#[derive(Debug, Clone)]
pub struct Acquired<S> {
    /// Wall-clock acquisition time.
    pub timestamp: DateTime<Utc>,
    /// Seconds since the engine epoch.
    pub elapsed: f64,
    /// The instrument sample.
    pub sample: S,
}

/// Sending half of an engine's command channel.
#[derive(Debug)]
pub struct CommandQueue<C> {
    name: String,
    tx: mpsc::UnboundedSender<EngineCommand<C>>,
}

impl<C> Clone for CommandQueue<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<C> CommandQueue<C> {
    pub(crate) fn new(name: String, tx: mpsc::UnboundedSender<EngineCommand<C>>) -> Self {
        Self { name, tx }
    }

    /// Queue an instrument command. Fails once the engine loop has exited.
    pub fn enqueue(&self, command: C) -> Result<(), DaqError> {
        self.send(EngineCommand::Instrument(command))
    }

    /// Queue an engine-level message.
    pub fn send(&self, command: EngineCommand<C>) -> Result<(), DaqError> {
        self.tx
            .send(command)
            .map_err(|_| DaqError::EngineStopped(self.name.clone()))
    }

    /// Whether the receiving engine has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of an engine's sample channel.
#[derive(Debug)]
pub struct SampleQueue<S> {
    rx: mpsc::UnboundedReceiver<Acquired<S>>,
}

impl<S> SampleQueue<S> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Acquired<S>>) -> Self {
        Self { rx }
    }

    /// Remove and return every sample queued since the last call, oldest first.
    pub fn drain(&mut self) -> Vec<Acquired<S>> {
        let mut drained = Vec::new();
        while let Ok(sample) = self.rx.try_recv() {
            drained.push(sample);
        }
        drained
    }
}
