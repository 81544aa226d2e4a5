//! `daq-core`
//!
//! Core trait definitions and the concurrent acquisition engine for labdaq.
//!
//! This crate provides the building blocks every instrument driver and the backend
//! orchestrator share:
//!
//! - [`Instrument`]: the contract a concrete driver implements (setup, sample, cleanup,
//!   headers, formatting, deferred commands).
//! - [`AcquisitionEngine`]: runs one instrument on its own named thread with a
//!   current-thread tokio runtime, draining a [`CommandQueue`] and filling a [`SampleQueue`].
//! - [`EngineContext`]: the capability handed to a driver while it runs (cancellable waits,
//!   emitting samples, recording state).
//! - [`DaqError`]: the error taxonomy shared across the workspace.
//! - [`scpi::ScpiSession`]: newline-terminated SCPI over any async byte stream.
//!
//! ## Example
//!
//! ```rust,ignore
//! use daq_core::{AcquisitionEngine, EngineState};
//! use std::time::Instant;
//!
//! let mut engine = AcquisitionEngine::start("psu", driver, Instant::now())?;
//! engine.wait_for_setup()?;
//! assert_eq!(engine.state(), EngineState::Running);
//! for acquired in engine.drain_samples() {
//!     println!("{:.3} s: {:?}", acquired.elapsed, acquired.sample);
//! }
//! engine.stop();
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod queue;
pub mod scpi;
#[cfg(feature = "serial")]
pub mod serial;

pub use context::{EngineContext, Pacer};
pub use engine::{AcquisitionEngine, EngineState};
pub use error::{AppResult, DaqError};
pub use instrument::{Field, Instrument};
pub use queue::{Acquired, CommandQueue, EngineCommand, SampleQueue};
