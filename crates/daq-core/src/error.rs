//! Custom error types for the acquisition stack.
//!
//! This module defines the primary error type, `DaqError`, shared by the engine, the
//! instrument drivers, the data logger and the backend. Using the `thiserror` crate, it
//! provides a centralized and consistent way to handle the different failure modes of a
//! running acquisition, from configuration mistakes to a dropped instrument connection.
//!
//! ## Error Hierarchy
//!
//! Errors fall into four broad categories:
//!
//! 1. **Configuration Errors** - `Configuration`
//!    - Raised while loading and validating settings, before any engine starts.
//!    - Recovery: fix the configuration file and restart.
//!
//! 2. **Engine-fatal Errors** - `Setup`, `TransportClosed`, `Io`
//!    - The instrument is unreachable, misidentified, or its connection dropped.
//!    - The owning engine stops; other engines are unaffected.
//!
//! 3. **Cycle-local Errors** - `TransientRead`, `FitConvergence`, `Instrument`
//!    - A single read or fit failed. The sample of that cycle is dropped and the
//!      sampling loop continues.
//!
//! 4. **Control Errors** - `Halted`, `EngineStopped`, `Storage`, `NotRunning`, ...
//!    - Raised on the control surface (session lifecycle, command routing, logging).
//!
//! By using `#[from]`, `DaqError` can be created from `std::io::Error` with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition stack.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when configuration values parse correctly but fail semantic validation
    /// (e.g. a segment with zero span, duplicate instrument ids).
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Instrument setup failed (unreachable, misidentified, refused configuration).
    ///
    /// **Error Type**: Fatal to the owning engine only. The orchestrator reports it and
    /// leaves the instrument out of the running set.
    #[error("Setup of instrument '{instrument}' failed: {message}")]
    Setup {
        /// Instrument (or model) that failed.
        instrument: String,
        /// Human readable reason.
        message: String,
    },

    /// A single read from the instrument failed or timed out.
    ///
    /// **Error Type**: Transient. The sample of the current cycle is dropped.
    #[error("Transient read error: {0}")]
    TransientRead(String),

    /// The resonance fit did not converge for a segment.
    ///
    /// Handled inside the network analyzer driver; never escapes the sampling loop.
    #[error("Curve fit failed: {0}")]
    FitConvergence(String),

    /// The connection to the instrument was closed mid-operation.
    ///
    /// **Error Type**: Fatal to the owning engine.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The instrument answered with something unexpected.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A cancellable wait observed a stop request.
    #[error("Acquisition halted")]
    Halted,

    /// A command was submitted to an engine whose loop has already exited.
    #[error("Engine '{0}' is not accepting commands")]
    EngineStopped(String),

    /// Data logging failed (closed logger, unknown file, encoding error).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation requires a running session.
    #[error("Acquisition is not running")]
    NotRunning,

    /// Operation requires a stopped session.
    #[error("Acquisition is already running")]
    AlreadyRunning,

    /// No running instrument has this name.
    #[error("Unknown instrument '{0}'")]
    UnknownInstrument(String),

    /// A command was routed to an instrument of a different kind.
    #[error("Instrument '{instrument}' does not accept {expected} commands")]
    CommandMismatch {
        /// Target instrument.
        instrument: String,
        /// Kind of command that was submitted.
        expected: &'static str,
    },
}

impl DaqError {
    /// Shorthand for a [`DaqError::Setup`] error.
    pub fn setup(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Setup {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    /// Whether this error terminates the engine that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Setup { .. } | DaqError::TransportClosed(_) | DaqError::Io(_)
        )
    }

    /// Whether this error only invalidates the current sampling cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DaqError::TransientRead(_) | DaqError::FitConvergence(_) | DaqError::Instrument(_)
        )
    }
}
