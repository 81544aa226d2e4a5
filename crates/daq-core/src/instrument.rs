//! The instrument contract consumed by the acquisition engine.

use std::fmt;

use async_trait::async_trait;

use crate::context::EngineContext;
use crate::error::DaqError;

/// One formatted value of a logged row.
///
/// A row is `[timestamp, elapsed] + format_sample(..)`; `Empty` renders as an empty cell and
/// marks values that do not exist for this sample (e.g. a disabled segment).
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Floating point value.
    Float(f64),
    /// Integer value.
    Int(i64),
    /// Free text.
    Text(String),
    /// Absent value.
    Empty,
}

impl Field {
    /// Whether this field carries no value.
    pub fn is_empty(&self) -> bool {
        matches!(self, Field::Empty)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Float(v) => write!(f, "{v}"),
            Field::Int(v) => write!(f, "{v}"),
            Field::Text(s) => f.write_str(s),
            Field::Empty => Ok(()),
        }
    }
}

impl From<f64> for Field {
    fn from(value: f64) -> Self {
        Field::Float(value)
    }
}

impl From<Option<f64>> for Field {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Field::Empty, Field::Float)
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Int(value)
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Text(value)
    }
}

/// A concrete instrument driven by an [`AcquisitionEngine`](crate::AcquisitionEngine).
///
/// The driver value is moved onto the engine thread and is never shared: every method runs
/// on that thread, and commands reach it only through [`Instrument::apply`], which the
/// engine calls between sampling steps. This is the only synchronization the driver state
/// needs.
///
/// # Lifecycle
///
/// `setup` → (`apply`* → `sample`)* → `cleanup`. `cleanup` runs once when the loop exits,
/// including after a failed `setup`.
///
/// # Errors
///
/// Errors returned from `sample` and `apply` are classified with
/// [`DaqError::is_fatal`]: fatal errors stop the engine, anything else drops the current
/// cycle and the loop continues. [`DaqError::Halted`] means a cancellable wait observed a
/// stop request and ends the loop normally.
#[async_trait]
pub trait Instrument: Send + Sized + 'static {
    /// Deferred actions accepted through the command queue.
    type Command: Send + 'static;

    /// One acquisition result.
    type Sample: Send + 'static;

    /// Short kind tag used in logs ("vna", "dc_power", ...).
    fn kind(&self) -> &'static str;

    /// Column names for the logged file, after the timestamp and elapsed columns.
    fn headers(&self) -> Vec<String>;

    /// Format a sample into fields, one per header.
    fn format_sample(sample: &Self::Sample) -> Vec<Field>;

    /// Connect and configure the instrument.
    async fn setup(&mut self, ctx: &mut EngineContext<Self>) -> Result<(), DaqError>;

    /// Acquire one sample. `Ok(None)` means there is nothing to log this cycle.
    async fn sample(
        &mut self,
        ctx: &mut EngineContext<Self>,
    ) -> Result<Option<Self::Sample>, DaqError>;

    /// Execute one deferred command.
    async fn apply(
        &mut self,
        command: Self::Command,
        ctx: &mut EngineContext<Self>,
    ) -> Result<(), DaqError>;

    /// Called on the engine thread when a logging session begins.
    async fn on_record_start(&mut self) -> Result<(), DaqError> {
        Ok(())
    }

    /// Called on the engine thread when a logging session ends.
    async fn on_record_stop(&mut self) -> Result<(), DaqError> {
        Ok(())
    }

    /// Release the instrument. Must tolerate a partially completed `setup`.
    async fn cleanup(&mut self);
}
