//! Vector network analyzer driver with resonance tracking.
//!
//! Measures transmission resonances in a segmented sweep and keeps each segment's window
//! centered on its resonance as it drifts.
//!
//! - [`VnaDriver`]: the [`daq_core::Instrument`] implementation
//! - [`fit::lorentz_fit`]: skewed-Lorentzian least-squares fit
//! - [`tracking::track_window`]: the recenter/rescale rule
//! - [`model`]: E5071x, N5232a and simulated analyzers
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_core::AcquisitionEngine;
//! use daq_driver_vna::{VnaCommand, VnaConfig, VnaDriver};
//!
//! let driver = VnaDriver::new("vna", config);
//! let mut engine = AcquisitionEngine::start("vna", driver, std::time::Instant::now())?;
//! engine.wait_for_setup()?;
//! engine.enqueue(VnaCommand::ForceRetrack)?;
//! ```

pub mod config;
pub mod driver;
pub mod fit;
pub mod model;
pub mod sample;
pub mod segment;
pub mod tracking;

pub use config::{SegmentConfig, SimulatedResonance, SimulationConfig, VnaConfig, VnaModelKind};
pub use driver::{VnaCommand, VnaDriver};
pub use sample::{SegmentMeasurement, Trace, VnaSample};
pub use segment::Segment;
pub use tracking::TrackingState;
