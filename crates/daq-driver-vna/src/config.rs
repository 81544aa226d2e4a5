//! Static configuration of a network analyzer instrument.

use std::collections::BTreeMap;

use daq_core::DaqError;
use serde::{Deserialize, Serialize};

/// Concrete analyzer behind the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VnaModelKind {
    /// Keysight E5071 series (markers supported).
    #[default]
    E5071x,
    /// Keysight N5232A PNA-L (sweep mode only).
    N5232a,
    /// Software analyzer with modeled resonances.
    Simulated,
}

/// One configured frequency segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Center frequency in Hz.
    pub f0: f64,
    /// Span in Hz.
    pub span: f64,
    /// Number of points.
    pub points: usize,
    /// IF bandwidth in Hz.
    pub ifbw: f64,
    /// Source power in dBm.
    pub power: f64,
    /// Whether the segment is swept at start.
    pub enabled: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            f0: 2.5e9,
            span: 1e6,
            points: 201,
            ifbw: 1e3,
            power: 0.0,
            enabled: true,
        }
    }
}

/// A resonance modeled by the simulated analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedResonance {
    /// Center frequency in Hz at the first sweep.
    pub f0: f64,
    /// Full width at the 1/sqrt(2) amplitude level, in Hz.
    pub bandwidth: f64,
    /// Linear peak transmission amplitude.
    #[serde(default = "default_peak")]
    pub amplitude: f64,
    /// Linear amplitude slope in 1/Hz.
    #[serde(default)]
    pub skew: f64,
}

fn default_peak() -> f64 {
    0.05
}

/// Settings of the simulated analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Modeled resonances.
    pub resonances: Vec<SimulatedResonance>,
    /// Center frequency drift applied to every resonance per sweep, in Hz.
    pub drift_per_sweep: f64,
    /// Standard deviation of additive amplitude noise.
    pub noise: f64,
    /// Seed of the noise generator.
    pub seed: u64,
    /// Whether the simulated firmware reports marker bandwidth data.
    pub markers: bool,
    /// Time one triggered sweep takes, in milliseconds.
    pub latency_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            resonances: vec![
                SimulatedResonance {
                    f0: 2.5e9,
                    bandwidth: 500e3,
                    amplitude: default_peak(),
                    skew: 0.0,
                },
                SimulatedResonance {
                    f0: 4.529e9,
                    bandwidth: 300e3,
                    amplitude: default_peak(),
                    skew: 0.0,
                },
            ],
            drift_per_sweep: 0.0,
            noise: 1e-4,
            seed: 0,
            markers: false,
            latency_ms: 100,
        }
    }
}

/// Configuration of one network analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VnaConfig {
    /// Analyzer model.
    pub model: VnaModelKind,
    /// Transport resource (`host:port` or `TCPIP0::host::port::SOCKET`).
    pub resource: String,
    /// Follow the measured center frequency.
    pub track_frequency: bool,
    /// Follow the measured bandwidth.
    pub track_span: bool,
    /// Read firmware marker results instead of fitting sweeps.
    pub use_markers: bool,
    /// Target span as a multiple of the measured bandwidth.
    pub bandwidth_factor: f64,
    /// Fraction of the half span the resonance may wander before recentering.
    pub center_tolerance: f64,
    /// Relative mismatch between span and target span before rescaling.
    pub span_tolerance: f64,
    /// Minimum time between samples, in milliseconds. Zero samples back to back.
    pub sample_interval_ms: u64,
    /// Settle time after programming the initial segments, in milliseconds.
    pub settle_time_ms: u64,
    /// Reply timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Log every fitted point at debug level.
    pub verbose: bool,
    /// Segments by name.
    pub segments: BTreeMap<String, SegmentConfig>,
    /// Simulated analyzer settings, used when `model = "simulated"`.
    pub simulation: SimulationConfig,
}

impl Default for VnaConfig {
    fn default() -> Self {
        Self {
            model: VnaModelKind::default(),
            resource: String::new(),
            track_frequency: true,
            track_span: false,
            use_markers: false,
            bandwidth_factor: 4.0,
            center_tolerance: 0.8,
            span_tolerance: 0.3,
            sample_interval_ms: 0,
            settle_time_ms: 1000,
            timeout_ms: 5000,
            verbose: false,
            segments: BTreeMap::new(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl VnaConfig {
    /// Check semantic constraints.
    pub fn validate(&self, id: &str) -> Result<(), DaqError> {
        let invalid = |msg: String| Err(DaqError::Configuration(format!("instrument '{id}': {msg}")));

        if self.segments.is_empty() {
            return invalid("at least one segment is required".into());
        }
        for (name, seg) in &self.segments {
            if seg.points < 5 {
                return invalid(format!("segment '{name}' needs at least 5 points"));
            }
            if !(seg.span > 0.0 && seg.span.is_finite()) {
                return invalid(format!("segment '{name}' span must be positive"));
            }
            if !(seg.ifbw > 0.0 && seg.ifbw.is_finite()) {
                return invalid(format!("segment '{name}' ifbw must be positive"));
            }
            if !(seg.f0 > 0.0 && seg.f0.is_finite()) {
                return invalid(format!("segment '{name}' f0 must be positive"));
            }
        }
        if !(self.bandwidth_factor > 0.0 && self.bandwidth_factor.is_finite()) {
            return invalid("bandwidth_factor must be positive".into());
        }
        for (label, value) in [
            ("center_tolerance", self.center_tolerance),
            ("span_tolerance", self.span_tolerance),
        ] {
            if !(value > 0.0 && value <= 10.0) {
                return invalid(format!("{label} must be in (0, 10]"));
            }
        }
        if self.model != VnaModelKind::Simulated && self.resource.trim().is_empty() {
            return invalid("resource is required".into());
        }
        if !(self.simulation.noise >= 0.0 && self.simulation.noise.is_finite()) {
            return invalid("simulation noise must be a non-negative number".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_segment() -> VnaConfig {
        let mut cfg = VnaConfig {
            model: VnaModelKind::Simulated,
            ..VnaConfig::default()
        };
        cfg.segments.insert("mode1".into(), SegmentConfig::default());
        cfg
    }

    #[test]
    fn defaults_validate() {
        assert!(one_segment().validate("vna").is_ok());
    }

    #[test]
    fn rejects_bad_segments_and_tolerances() {
        let mut cfg = one_segment();
        cfg.segments.clear();
        assert!(cfg.validate("vna").is_err());

        let mut cfg = one_segment();
        cfg.segments.insert("tiny".into(), SegmentConfig { points: 3, ..SegmentConfig::default() });
        assert!(cfg.validate("vna").is_err());

        let mut cfg = one_segment();
        cfg.center_tolerance = 0.0;
        assert!(cfg.validate("vna").is_err());

        let mut cfg = one_segment();
        cfg.model = VnaModelKind::E5071x;
        assert!(cfg.validate("vna").is_err());
    }
}
