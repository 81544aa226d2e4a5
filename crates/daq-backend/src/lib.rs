//! `daq-backend`
//!
//! Everything between the command line and the engines:
//!
//! - [`config::Settings`]: layered configuration (defaults, TOML, `LABDAQ_*` environment)
//! - [`instruments`]: closed dispatch over the supported instrument kinds
//! - [`Backend`]: starts engines, chooses the master instrument and runs logging sessions
//! - [`telemetry`]: tracing subscriber setup
//!
//! ```rust,ignore
//! let settings = Settings::load(Some(Path::new("lab.toml")))?;
//! let mut backend = Backend::new(settings)?;
//! let report = backend.start()?;
//! backend.start_logging("sampleA")?;
//! while backend.process_samples(&mut HashMap::new())? {
//!     std::thread::sleep(backend.settings().poll_interval());
//! }
//! backend.stop()?;
//! ```

pub mod backend;
pub mod config;
pub mod instruments;
pub mod telemetry;

pub use backend::{Backend, DisplayCallback, StartReport};
pub use config::{DriverConfig, InstrumentConfig, LogFormat, Settings};
pub use instruments::{InstrumentCommand, InstrumentSample, RunningInstrument};
