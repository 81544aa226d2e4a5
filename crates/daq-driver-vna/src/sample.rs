//! Per-segment resonance measurements and their logged layout.

use daq_core::Field;

use crate::segment::Segment;

/// Raw sweep slice a measurement was fit to.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Frequencies in Hz.
    pub frequency: Vec<f64>,
    /// Linear magnitudes.
    pub amplitude: Vec<f64>,
}

/// Resonance parameters of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMeasurement {
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Center frequency in Hz.
    pub center_frequency: f64,
    /// `center_frequency / bandwidth`; absent when the bandwidth is zero.
    pub quality_factor: Option<f64>,
    /// Peak transmission in dB.
    pub insertion_loss: f64,
    /// Amplitude slope in 1/Hz; absent for firmware marker readings.
    pub skew: Option<f64>,
    /// Sweep slice, for sweep-mode measurements.
    pub trace: Option<Trace>,
}

impl SegmentMeasurement {
    /// Measurement with the quality factor derived from center and bandwidth.
    pub fn new(bandwidth: f64, center_frequency: f64, insertion_loss: f64) -> Self {
        Self {
            bandwidth,
            center_frequency,
            quality_factor: quality_factor(center_frequency, bandwidth),
            insertion_loss,
            skew: None,
            trace: None,
        }
    }
}

/// `f0 / bw`, undefined for a zero or non-finite bandwidth.
pub fn quality_factor(center_frequency: f64, bandwidth: f64) -> Option<f64> {
    (bandwidth != 0.0 && bandwidth.is_finite()).then(|| center_frequency / bandwidth)
}

/// One acquisition: one entry per configured segment, `None` where the segment is disabled.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VnaSample {
    /// Entries indexed like the segment list.
    pub segments: Vec<Option<SegmentMeasurement>>,
}

impl VnaSample {
    /// Number of entries (always the configured segment count).
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the sample has no entries.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Measurement at `index`, if that segment was enabled.
    pub fn get(&self, index: usize) -> Option<&SegmentMeasurement> {
        self.segments.get(index).and_then(Option::as_ref)
    }

    fn column<T>(&self, pick: impl Fn(&SegmentMeasurement) -> Option<T>) -> Vec<Option<T>> {
        self.segments
            .iter()
            .map(|m| m.as_ref().and_then(&pick))
            .collect()
    }

    /// Bandwidths per segment.
    pub fn bandwidths(&self) -> Vec<Option<f64>> {
        self.column(|m| Some(m.bandwidth))
    }

    /// Center frequencies per segment.
    pub fn center_frequencies(&self) -> Vec<Option<f64>> {
        self.column(|m| Some(m.center_frequency))
    }

    /// Quality factors per segment.
    pub fn quality_factors(&self) -> Vec<Option<f64>> {
        self.column(|m| m.quality_factor)
    }

    /// Insertion losses per segment.
    pub fn insertion_losses(&self) -> Vec<Option<f64>> {
        self.column(|m| Some(m.insertion_loss))
    }

    /// Skews per segment.
    pub fn skews(&self) -> Vec<Option<f64>> {
        self.column(|m| m.skew)
    }
}

/// Column headers: frequencies, then Q factors, then insertion losses, each in segment order.
pub fn headers(segments: &[Segment]) -> Vec<String> {
    let mut h: Vec<String> = segments
        .iter()
        .map(|s| format!("Frequency {}/Hz", s.name))
        .collect();
    h.extend(segments.iter().map(|s| format!("Q factor {}", s.name)));
    h.extend(segments.iter().map(|s| format!("Insertion loss {}/dB", s.name)));
    h
}

/// Fields in [`headers`] order.
pub fn format_sample(sample: &VnaSample) -> Vec<Field> {
    sample
        .center_frequencies()
        .into_iter()
        .chain(sample.quality_factors())
        .chain(sample.insertion_losses())
        .map(Field::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_bandwidth_has_no_quality_factor() {
        assert_eq!(SegmentMeasurement::new(0.0, 2.5e9, -3.0).quality_factor, None);
        assert_eq!(SegmentMeasurement::new(5e5, 2.5e9, -3.0).quality_factor, Some(5000.0));
    }

    #[test]
    fn disabled_segment_leaves_empty_cells() {
        let segments = vec![
            Segment::new("a", 1e9, 1e6, 11, 1e3, 0.0),
            Segment::new("b", 2e9, 1e6, 11, 1e3, 0.0),
        ];
        let sample = VnaSample {
            segments: vec![None, Some(SegmentMeasurement::new(2e5, 2e9, -6.0))],
        };
        let fields = format_sample(&sample);
        assert_eq!(fields.len(), headers(&segments).len());
        assert_eq!(
            fields,
            vec![
                Field::Empty,
                Field::Float(2e9),
                Field::Empty,
                Field::Float(1e4),
                Field::Empty,
                Field::Float(-6.0),
            ]
        );
        assert_eq!(headers(&segments)[2], "Q factor a");
    }
}
