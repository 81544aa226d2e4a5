//! Resonance tracking state and the window retargeting rule.

use daq_core::DaqError;

use crate::config::VnaConfig;
use crate::sample::VnaSample;
use crate::segment::{segments_from_config, Segment};

/// Which adjustments a measured resonance asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowDecision {
    /// The resonance edge left the tolerated part of the window.
    pub recenter: bool,
    /// `bandwidth · factor` and the span disagree by more than the tolerance.
    pub rescale: bool,
}

/// Decide whether a window `(center, span)` still fits a resonance `(f0, bw)`.
///
/// Recenter when `|center − f0| + bw/2 > span · center_tolerance / 2`, so the ±bw/2 points
/// stay inside the tolerated fraction of the window. Rescale when `bw · bandwidth_factor`
/// and `span` differ by more than `span_tolerance` in either direction.
pub fn track_window(
    center: f64,
    span: f64,
    f0: f64,
    bw: f64,
    center_tolerance: f64,
    span_tolerance: f64,
    bandwidth_factor: f64,
) -> WindowDecision {
    let edge_error = (center - f0).abs() + bw / 2.0;
    let recenter = edge_error > span * center_tolerance * 0.5;

    let target = bw * bandwidth_factor;
    let rescale = target / span > 1.0 + span_tolerance || span / target > 1.0 + span_tolerance;
    WindowDecision { recenter, rescale }
}

/// Mutable tracking state owned by the driver on its engine thread.
#[derive(Debug, Clone)]
pub struct TrackingState {
    /// Live segment list, in logged column order.
    pub segments: Vec<Segment>,
    /// Follow the measured center frequency.
    pub track_frequency: bool,
    /// Follow the measured bandwidth.
    pub track_span: bool,
    /// Read firmware markers instead of fitting sweeps.
    pub use_markers: bool,
    /// Manual tracking toggle.
    pub tracking_enabled: bool,
    /// One-shot retrack request.
    pub forced_retrack: bool,
    /// Per-point debug logging.
    pub verbose: bool,
    bandwidth_factor: f64,
    bandwidth_factor_override: Option<f64>,
    center_tolerance: f64,
    span_tolerance: f64,
}

impl TrackingState {
    /// Fresh state from the static configuration.
    pub fn from_config(config: &VnaConfig) -> Self {
        Self {
            segments: segments_from_config(&config.segments),
            track_frequency: config.track_frequency,
            track_span: config.track_span,
            use_markers: config.use_markers,
            tracking_enabled: true,
            forced_retrack: false,
            verbose: config.verbose,
            bandwidth_factor: config.bandwidth_factor,
            bandwidth_factor_override: None,
            center_tolerance: config.center_tolerance,
            span_tolerance: config.span_tolerance,
        }
    }

    /// Effective bandwidth factor (override if set).
    pub fn bandwidth_factor(&self) -> f64 {
        self.bandwidth_factor_override.unwrap_or(self.bandwidth_factor)
    }

    /// Set or clear the bandwidth factor override.
    pub fn set_bandwidth_factor_override(&mut self, factor: Option<f64>) -> Result<(), DaqError> {
        if let Some(f) = factor {
            if !(f > 0.0 && f.is_finite()) {
                return Err(DaqError::Configuration(format!(
                    "bandwidth factor must be positive, got {f}"
                )));
            }
        }
        self.bandwidth_factor_override = factor;
        Ok(())
    }

    /// Enable or disable the segment at `index`.
    pub fn set_segment_enabled(&mut self, index: usize, enabled: bool) -> Result<(), DaqError> {
        let count = self.segments.len();
        let segment = self.segments.get_mut(index).ok_or_else(|| {
            DaqError::Configuration(format!("segment index {index} out of range (0..{count})"))
        })?;
        segment.enabled = enabled;
        Ok(())
    }

    /// Restore every segment's configured center and span.
    pub fn reset_segments(&mut self) {
        self.segments.iter_mut().for_each(Segment::reset);
    }

    /// Whether any retargeting can happen this cycle.
    pub fn retarget_armed(&self) -> bool {
        (self.track_frequency || self.track_span) && (self.tracking_enabled || self.forced_retrack)
    }

    /// Whether the lost-track slope correction applies.
    pub fn corrects_lost_track(&self) -> bool {
        self.track_frequency && self.tracking_enabled
    }

    /// Shift segment `index` one full span towards increasing amplitude.
    pub fn step_towards_slope(&mut self, index: usize, slope: f64) {
        if let Some(segment) = self.segments.get_mut(index) {
            if slope > 0.0 {
                segment.center_frequency += segment.span;
            } else {
                segment.center_frequency -= segment.span;
            }
        }
    }

    /// Move segment windows after a successful measurement.
    ///
    /// Returns whether any segment was retargeted; the caller must then reprogram the
    /// instrument. A pending forced retrack is consumed when it causes a retarget.
    pub fn retarget(&mut self, sample: &VnaSample) -> bool {
        if !self.retarget_armed() {
            return false;
        }
        let factor = self.bandwidth_factor();
        let mut retracked = false;

        for (segment, measurement) in self.segments.iter_mut().zip(&sample.segments) {
            let Some(m) = measurement else { continue };
            if !segment.enabled {
                continue;
            }
            let decision = track_window(
                segment.center_frequency,
                segment.span,
                m.center_frequency,
                m.bandwidth,
                self.center_tolerance,
                self.span_tolerance,
                factor,
            );
            let wanted = (decision.recenter && self.track_frequency)
                || (decision.rescale && self.track_span)
                || self.forced_retrack;
            if !wanted {
                continue;
            }
            retracked = true;
            if self.track_frequency {
                segment.center_frequency = m.center_frequency;
            }
            if self.track_span {
                let span = m.bandwidth * factor;
                if span.is_finite() && span > 0.0 {
                    segment.span = span;
                }
            }
            tracing::debug!(
                segment = %segment.name,
                center = segment.center_frequency,
                span = segment.span,
                "retargeted segment"
            );
        }

        if retracked {
            self.forced_retrack = false;
        }
        retracked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentConfig;
    use crate::sample::SegmentMeasurement;

    fn state(track_frequency: bool, track_span: bool) -> TrackingState {
        let mut cfg = VnaConfig {
            track_frequency,
            track_span,
            ..VnaConfig::default()
        };
        cfg.segments.insert(
            "mode1".into(),
            SegmentConfig { f0: 2.5e9, span: 1e6, ..SegmentConfig::default() },
        );
        TrackingState::from_config(&cfg)
    }

    fn measured(f0: f64, bw: f64) -> VnaSample {
        VnaSample {
            segments: vec![Some(SegmentMeasurement::new(bw, f0, -20.0))],
        }
    }

    #[test]
    fn window_rule_thresholds() {
        // 1 MHz span, tolerance 0.8: edge error may reach 400 kHz.
        let ok = track_window(2.5e9, 1e6, 2.5e9 + 150e3, 250e3, 0.8, 0.3, 4.0);
        assert_eq!(ok, WindowDecision { recenter: false, rescale: false });
        let drifted = track_window(2.5e9, 1e6, 2.5e9 + 300e3, 250e3, 0.8, 0.3, 4.0);
        assert!(drifted.recenter);
        let narrow = track_window(2.5e9, 1e6, 2.5e9, 100e3, 0.8, 0.3, 4.0);
        assert!(narrow.rescale && !narrow.recenter);
        let wide = track_window(2.5e9, 1e6, 2.5e9, 350e3, 0.8, 0.3, 4.0);
        assert!(wide.rescale);
    }

    #[test]
    fn recenters_only_when_drift_exceeds_tolerance() {
        let mut st = state(true, false);
        assert!(!st.retarget(&measured(2.5e9 + 100e3, 250e3)));
        assert_eq!(st.segments[0].center_frequency, 2.5e9);

        assert!(st.retarget(&measured(2.5e9 + 320e3, 250e3)));
        assert_eq!(st.segments[0].center_frequency, 2.5e9 + 320e3);
        assert_eq!(st.segments[0].span, 1e6);
    }

    #[test]
    fn rescales_span_from_bandwidth() {
        let mut st = state(false, true);
        st.set_bandwidth_factor_override(Some(5.0)).unwrap();
        assert!(st.retarget(&measured(2.5e9, 100e3)));
        assert!((st.segments[0].span - 500e3).abs() < 1e-6);
        assert_eq!(st.segments[0].center_frequency, 2.5e9);
    }

    #[test]
    fn forced_retrack_is_one_shot() {
        let mut st = state(true, false);
        st.tracking_enabled = false;
        assert!(!st.retarget(&measured(2.5e9 + 350e3, 250e3)));

        st.forced_retrack = true;
        assert!(st.retarget(&measured(2.5e9 + 10e3, 250e3)));
        assert!(!st.forced_retrack);
        assert_eq!(st.segments[0].center_frequency, 2.5e9 + 10e3);
        assert!(!st.retarget(&measured(2.5e9 + 350e3, 250e3)));
    }

    #[test]
    fn disabled_and_absent_segments_are_skipped() {
        let mut st = state(true, false);
        st.set_segment_enabled(0, false).unwrap();
        assert!(!st.retarget(&measured(2.6e9, 250e3)));
        assert!(!st.retarget(&VnaSample { segments: vec![None] }));
        assert!(st.set_segment_enabled(3, true).is_err());
    }

    #[test]
    fn zero_bandwidth_does_not_collapse_span() {
        let mut st = state(true, true);
        assert!(st.retarget(&measured(2.5e9, 0.0)));
        assert_eq!(st.segments[0].span, 1e6);
    }

    #[test]
    fn lost_track_steps_one_span() {
        let mut st = state(true, false);
        st.step_towards_slope(0, 1.0);
        assert_eq!(st.segments[0].center_frequency, 2.5e9 + 1e6);
        st.step_towards_slope(0, -0.5);
        st.step_towards_slope(0, -0.5);
        assert_eq!(st.segments[0].center_frequency, 2.5e9 - 1e6);
        st.reset_segments();
        assert_eq!(st.segments[0].center_frequency, 2.5e9);
    }
}
