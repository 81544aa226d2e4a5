use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use daq_core::DaqError;
use num_complex::Complex64;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use super::{MarkerReading, VnaModel};
use crate::config::{SimulatedResonance, SimulationConfig};
use crate::fit::skewed_lorentzian;
use crate::sample::quality_factor;
use crate::segment::Segment;

/// Software analyzer producing skewed-Lorentzian transmission peaks.
///
/// Every trigger counts as one sweep; resonance centers move by `drift_per_sweep` per sweep.
/// Noise is drawn from a seeded ChaCha generator, so runs are reproducible.
pub struct SimulatedVna {
    resonances: Vec<SimulatedResonance>,
    drift_per_sweep: f64,
    noise: Normal<f64>,
    rng: ChaCha8Rng,
    markers: bool,
    latency: Duration,
    segments: Vec<Segment>,
    sweeps: Arc<AtomicU64>,
}

impl SimulatedVna {
    /// Build from the simulation settings.
    pub fn new(config: &SimulationConfig) -> Result<Self, DaqError> {
        let noise = Normal::new(0.0, config.noise)
            .map_err(|e| DaqError::Configuration(format!("simulation noise: {e}")))?;
        Ok(Self {
            resonances: config.resonances.clone(),
            drift_per_sweep: config.drift_per_sweep,
            noise,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            markers: config.markers,
            latency: Duration::from_millis(config.latency_ms),
            segments: Vec::new(),
            sweeps: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Shared counter of completed sweeps.
    pub fn sweep_counter(&self) -> Arc<AtomicU64> {
        self.sweeps.clone()
    }

    /// Resonance centers at the current sweep.
    pub fn current_centers(&self) -> Vec<f64> {
        let offset = self.drift();
        self.resonances.iter().map(|r| r.f0 + offset).collect()
    }

    fn drift(&self) -> f64 {
        self.sweeps.load(Ordering::SeqCst) as f64 * self.drift_per_sweep
    }

    fn amplitude(&self, f: f64, offset: f64) -> f64 {
        self.resonances
            .iter()
            .map(|r| skewed_lorentzian(f, r.f0 + offset, r.bandwidth, r.amplitude, r.skew))
            .sum()
    }
}

#[async_trait]
impl VnaModel for SimulatedVna {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn supports_markers(&self) -> bool {
        self.markers
    }

    async fn setup(&mut self, _use_markers: bool) -> Result<(), DaqError> {
        self.sweeps.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn set_segments(&mut self, segments: &[Segment]) -> Result<(), DaqError> {
        self.segments = segments.to_vec();
        Ok(())
    }

    async fn autoscale(&mut self) -> Result<(), DaqError> {
        Ok(())
    }

    async fn trigger(&mut self, _use_markers: bool, _force: bool) -> Result<(), DaqError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn marker_data(&mut self, marker: usize) -> Result<MarkerReading, DaqError> {
        let segment = self
            .segments
            .iter()
            .filter(|s| s.enabled)
            .nth(marker.saturating_sub(1))
            .ok_or_else(|| DaqError::TransientRead(format!("marker {marker} is not active")))?;
        let offset = self.drift();
        let nearest = self
            .resonances
            .iter()
            .min_by(|a, b| {
                let da = (a.f0 + offset - segment.center_frequency).abs();
                let db = (b.f0 + offset - segment.center_frequency).abs();
                da.total_cmp(&db)
            })
            .ok_or_else(|| DaqError::TransientRead("no peak found".into()))?;
        let center_frequency = nearest.f0 + offset;
        Ok(MarkerReading {
            bandwidth: nearest.bandwidth,
            center_frequency,
            quality_factor: quality_factor(center_frequency, nearest.bandwidth).unwrap_or(0.0),
            insertion_loss: 20.0 * nearest.amplitude.log10(),
        })
    }

    async fn sweep_data(&mut self) -> Result<Vec<Complex64>, DaqError> {
        let offset = self.drift();
        let frequencies = self.freq_data().await?;
        let mut data = Vec::with_capacity(frequencies.len());
        for f in frequencies {
            let re = self.amplitude(f, offset) + self.noise.sample(&mut self.rng);
            data.push(Complex64::new(re, 0.0));
        }
        Ok(data)
    }

    async fn freq_data(&mut self) -> Result<Vec<f64>, DaqError> {
        Ok(self
            .segments
            .iter()
            .filter(|s| s.enabled)
            .flat_map(Segment::frequencies)
            .collect())
    }

    async fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SimulationConfig {
        SimulationConfig {
            resonances: vec![SimulatedResonance {
                f0: 2.5e9,
                bandwidth: 250e3,
                amplitude: 0.05,
                skew: 0.0,
            }],
            noise: 0.0,
            latency_ms: 0,
            markers: true,
            ..SimulationConfig::default()
        }
    }

    #[tokio::test]
    async fn sweep_covers_enabled_segments_only() {
        let mut vna = SimulatedVna::new(&quiet()).unwrap();
        let mut off = Segment::new("off", 3e9, 1e6, 11, 1e3, 0.0);
        off.enabled = false;
        vna.set_segments(&[Segment::new("on", 2.5e9, 1e6, 21, 1e3, 0.0), off])
            .await
            .unwrap();
        vna.trigger(false, false).await.unwrap();

        let f = vna.freq_data().await.unwrap();
        let s = vna.sweep_data().await.unwrap();
        assert_eq!(f.len(), 21);
        assert_eq!(s.len(), 21);
        // Peak sits in the middle of the window.
        let peak = s.iter().map(|c| c.norm()).fold(0.0, f64::max);
        assert!((s[10].norm() - peak).abs() < 1e-12);
    }

    #[tokio::test]
    async fn drift_moves_markers_per_sweep() {
        let mut cfg = quiet();
        cfg.drift_per_sweep = 1e3;
        let mut vna = SimulatedVna::new(&cfg).unwrap();
        vna.set_segments(&[Segment::new("on", 2.5e9, 1e6, 21, 1e3, 0.0)]).await.unwrap();
        vna.trigger(true, false).await.unwrap();
        vna.trigger(true, false).await.unwrap();

        let reading = vna.marker_data(1).await.unwrap();
        assert_eq!(reading.center_frequency, 2.5e9 + 2e3);
        assert_eq!(vna.sweep_counter().load(Ordering::SeqCst), 2);
        assert!(vna.marker_data(2).await.unwrap_err().is_transient());
    }
}
