//! Concrete network analyzer models.
//!
//! Each model hides its command dialect behind [`VnaModel`]; the tracking driver only
//! speaks in segments, triggers, marker readouts and sweep data.

mod e5071x;
mod n5232a;
mod simulated;

pub use e5071x::E5071x;
pub use n5232a::N5232a;
pub use simulated::SimulatedVna;

use async_trait::async_trait;
use daq_core::DaqError;
use num_complex::Complex64;

use crate::segment::Segment;

/// Firmware marker bandwidth readout of one resonance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerReading {
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Center frequency in Hz.
    pub center_frequency: f64,
    /// Quality factor as computed by the instrument.
    pub quality_factor: f64,
    /// Insertion loss in dB.
    pub insertion_loss: f64,
}

impl MarkerReading {
    /// Parse a `bw, f0, q, il` value list.
    pub fn from_values(values: &[f64]) -> Result<Self, DaqError> {
        match values {
            [bandwidth, center_frequency, quality_factor, insertion_loss, ..] => Ok(Self {
                bandwidth: *bandwidth,
                center_frequency: *center_frequency,
                quality_factor: *quality_factor,
                insertion_loss: *insertion_loss,
            }),
            _ => Err(DaqError::TransientRead(format!(
                "marker readout has {} values, expected 4",
                values.len()
            ))),
        }
    }
}

/// A network analyzer the tracking driver can drive.
#[async_trait]
pub trait VnaModel: Send {
    /// Model name for logs.
    fn name(&self) -> &'static str;

    /// Whether the firmware can peak-search and report bandwidth markers.
    fn supports_markers(&self) -> bool;

    /// Bring the analyzer into segmented S21 mode.
    async fn setup(&mut self, use_markers: bool) -> Result<(), DaqError>;

    /// Program the enabled segments of `segments`, in order.
    async fn set_segments(&mut self, segments: &[Segment]) -> Result<(), DaqError>;

    /// Autoscale the display.
    async fn autoscale(&mut self) -> Result<(), DaqError>;

    /// Trigger a sweep. In marker mode the analyzer sweeps continuously and a trigger is
    /// only issued when `force` is set.
    async fn trigger(&mut self, use_markers: bool, force: bool) -> Result<(), DaqError>;

    /// Read marker `marker` (1-based).
    async fn marker_data(&mut self, marker: usize) -> Result<MarkerReading, DaqError>;

    /// Complex S21 of the last sweep, all enabled segments concatenated.
    async fn sweep_data(&mut self) -> Result<Vec<Complex64>, DaqError>;

    /// Stimulus frequencies of the last sweep.
    async fn freq_data(&mut self) -> Result<Vec<f64>, DaqError>;

    /// Release the instrument.
    async fn cleanup(&mut self);
}

/// Pair up interleaved `re, im` values.
pub(crate) fn complex_pairs(values: &[f64]) -> Result<Vec<Complex64>, DaqError> {
    if values.len() % 2 != 0 {
        return Err(DaqError::TransientRead(format!(
            "sweep data has odd length {}",
            values.len()
        )));
    }
    Ok(values
        .chunks_exact(2)
        .map(|pair| Complex64::new(pair[0], pair[1]))
        .collect())
}
