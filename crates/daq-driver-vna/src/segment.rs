//! Frequency segments of a segmented sweep.

use std::collections::BTreeMap;

use crate::config::SegmentConfig;

/// One frequency sub-sweep.
///
/// `center_frequency` and `span` are live values moved by tracking; the `default_*` fields
/// keep the configured baseline for a manual reset.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Stable identity, used in column names.
    pub name: String,
    /// Current center frequency in Hz.
    pub center_frequency: f64,
    /// Current span in Hz.
    pub span: f64,
    /// Number of points.
    pub point_count: usize,
    /// IF bandwidth in Hz.
    pub if_bandwidth: f64,
    /// Source power in dBm.
    pub power: f64,
    /// Configured center frequency.
    pub default_center_frequency: f64,
    /// Configured span.
    pub default_span: f64,
    /// Whether the segment is swept.
    pub enabled: bool,
}

impl Segment {
    /// Segment at its configured baseline.
    pub fn new(
        name: impl Into<String>,
        center_frequency: f64,
        span: f64,
        point_count: usize,
        if_bandwidth: f64,
        power: f64,
    ) -> Self {
        Self {
            name: name.into(),
            center_frequency,
            span,
            point_count,
            if_bandwidth,
            power,
            default_center_frequency: center_frequency,
            default_span: span,
            enabled: true,
        }
    }

    /// Lowest swept frequency.
    pub fn start(&self) -> f64 {
        self.center_frequency - self.span / 2.0
    }

    /// Highest swept frequency.
    pub fn stop(&self) -> f64 {
        self.center_frequency + self.span / 2.0
    }

    /// Evenly spaced sweep frequencies from start to stop inclusive.
    pub fn frequencies(&self) -> Vec<f64> {
        let start = self.start();
        match self.point_count {
            0 => Vec::new(),
            1 => vec![self.center_frequency],
            n => {
                let step = self.span / (n - 1) as f64;
                (0..n).map(|i| start + step * i as f64).collect()
            }
        }
    }

    /// Restore the configured center and span.
    pub fn reset(&mut self) {
        self.center_frequency = self.default_center_frequency;
        self.span = self.default_span;
    }
}

/// Build the ordered segment list: ascending center frequency, ties by name.
pub fn segments_from_config(config: &BTreeMap<String, SegmentConfig>) -> Vec<Segment> {
    let mut segments: Vec<Segment> = config
        .iter()
        .map(|(name, cfg)| {
            let mut segment = Segment::new(name, cfg.f0, cfg.span, cfg.points, cfg.ifbw, cfg.power);
            segment.enabled = cfg.enabled;
            segment
        })
        .collect();
    segments.sort_by(|a, b| {
        a.center_frequency
            .total_cmp(&b.center_frequency)
            .then_with(|| a.name.cmp(&b.name))
    });
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_sorted_by_center_frequency() {
        let mut cfg = BTreeMap::new();
        cfg.insert("a_high".to_string(), SegmentConfig { f0: 4.5e9, ..SegmentConfig::default() });
        cfg.insert("b_low".to_string(), SegmentConfig { f0: 2.5e9, ..SegmentConfig::default() });
        cfg.insert("c_mid".to_string(), SegmentConfig { f0: 3.0e9, enabled: false, ..SegmentConfig::default() });

        let names: Vec<String> = segments_from_config(&cfg).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b_low", "c_mid", "a_high"]);
        assert!(!segments_from_config(&cfg)[1].enabled);
    }

    #[test]
    fn frequencies_span_the_window() {
        let seg = Segment::new("m", 1e6, 2e3, 5, 100.0, 0.0);
        assert_eq!(seg.frequencies(), vec![999_000.0, 999_500.0, 1_000_000.0, 1_000_500.0, 1_001_000.0]);
    }

    #[test]
    fn reset_restores_baseline() {
        let mut seg = Segment::new("m", 1e9, 1e6, 201, 1e3, 0.0);
        seg.center_frequency += 3e5;
        seg.span = 2e6;
        seg.reset();
        assert_eq!(seg.center_frequency, 1e9);
        assert_eq!(seg.span, 1e6);
    }
}
