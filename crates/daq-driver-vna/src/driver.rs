//! Resonance-tracking network analyzer driver.
//!
//! One sampling step:
//!
//! 1. trigger a sweep (sweep mode) or let the analyzer run continuously (marker mode)
//! 2. read marker bandwidth results, or fit each enabled segment of the sweep
//! 3. on a failed fit, step the lost segment one span towards the rising slope, reprogram,
//!    and drop the cycle
//! 4. in marker mode, drop readings identical to the previous one
//! 5. retarget drifted windows, reprogram and re-trigger before returning the sample
//! 6. pace against the sample interval
//!
//! Tracking state lives in the driver, which lives on the engine thread; [`VnaCommand`]s are
//! the only way to change it from outside.

use std::time::Duration;

use async_trait::async_trait;
use daq_core::scpi::ScpiSession;
use daq_core::{DaqError, EngineContext, Field, Instrument, Pacer};
use tracing::{debug, info, warn};

use crate::config::{VnaConfig, VnaModelKind};
use crate::fit::{linear_slope, lorentz_fit};
use crate::model::{E5071x, N5232a, SimulatedVna, VnaModel};
use crate::sample::{self, SegmentMeasurement, Trace, VnaSample};
use crate::tracking::TrackingState;

/// Deferred actions executed on the engine thread.
#[derive(Debug, Clone, PartialEq)]
pub enum VnaCommand {
    /// Enable or disable the segment at an index of the segment list; reprograms the sweep.
    SetSegmentEnabled {
        /// Segment index.
        index: usize,
        /// New state.
        enabled: bool,
    },
    /// Override the bandwidth factor, or clear the override with `None`.
    SetBandwidthFactorOverride(Option<f64>),
    /// Manual tracking toggle.
    SetTrackingEnabled(bool),
    /// Move every segment back to its configured window; reprograms the sweep.
    ResetSegments,
    /// Retarget every enabled segment on the next successful measurement.
    ForceRetrack,
    /// Per-point debug logging.
    SetVerbose(bool),
}

/// Network analyzer instrument.
pub struct VnaDriver {
    name: String,
    config: VnaConfig,
    state: TrackingState,
    model: Option<Box<dyn VnaModel>>,
    injected: Option<Box<dyn VnaModel>>,
    last_sample: Option<VnaSample>,
    pacer: Pacer,
}

impl VnaDriver {
    /// Driver that connects to the configured model during setup.
    pub fn new(name: impl Into<String>, config: VnaConfig) -> Self {
        let state = TrackingState::from_config(&config);
        let pacer = Pacer::new(Duration::from_millis(config.sample_interval_ms));
        Self {
            name: name.into(),
            config,
            state,
            model: None,
            injected: None,
            last_sample: None,
            pacer,
        }
    }

    /// Driver using an already constructed model instead of connecting.
    pub fn with_model(name: impl Into<String>, config: VnaConfig, model: Box<dyn VnaModel>) -> Self {
        let mut driver = Self::new(name, config);
        driver.injected = Some(model);
        driver
    }

    /// Current tracking state.
    pub fn tracking(&self) -> &TrackingState {
        &self.state
    }

    async fn connect(&mut self) -> Result<Box<dyn VnaModel>, DaqError> {
        if let Some(model) = self.injected.take() {
            return Ok(model);
        }
        let timeout = Duration::from_millis(self.config.timeout_ms);
        Ok(match self.config.model {
            VnaModelKind::E5071x => {
                let session = ScpiSession::connect_tcp(&self.name, &self.config.resource, timeout).await?;
                Box::new(E5071x::new(session))
            }
            VnaModelKind::N5232a => {
                let session = ScpiSession::connect_tcp(&self.name, &self.config.resource, timeout).await?;
                Box::new(N5232a::new(session))
            }
            VnaModelKind::Simulated => Box::new(SimulatedVna::new(&self.config.simulation)?),
        })
    }

    fn model(&mut self) -> Result<&mut (dyn VnaModel + 'static), DaqError> {
        self.model.as_deref_mut().ok_or(DaqError::NotRunning)
    }

    /// Push the segment list to the analyzer and wait for a fresh sweep in the new windows.
    async fn reprogram(&mut self) -> Result<(), DaqError> {
        let use_markers = self.state.use_markers;
        let model = self.model.as_deref_mut().ok_or(DaqError::NotRunning)?;
        model.set_segments(&self.state.segments).await?;
        model.trigger(use_markers, true).await
    }

    async fn read_markers(&mut self) -> Result<Option<VnaSample>, DaqError> {
        let model = self.model.as_deref_mut().ok_or(DaqError::NotRunning)?;
        let mut data = VnaSample::default();
        let mut marker = 0;
        for segment in &self.state.segments {
            if !segment.enabled {
                data.segments.push(None);
                continue;
            }
            marker += 1;
            match model.marker_data(marker).await {
                Ok(r) => data.segments.push(Some(SegmentMeasurement::new(
                    r.bandwidth,
                    r.center_frequency,
                    r.insertion_loss,
                ))),
                Err(e) if e.is_transient() => {
                    debug!(instrument = %self.name, segment = %segment.name, error = %e, "marker read failed");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        if self.last_sample.as_ref() == Some(&data) {
            return Ok(None);
        }
        self.last_sample = Some(data.clone());
        Ok(Some(data))
    }

    async fn read_sweep(&mut self) -> Result<Option<VnaSample>, DaqError> {
        let model = self.model.as_deref_mut().ok_or(DaqError::NotRunning)?;
        let sweep = model.sweep_data().await?;
        let freq = model.freq_data().await?;
        let ampl: Vec<f64> = sweep.iter().map(|c| c.norm()).collect();

        let expected: usize = self
            .state
            .segments
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.point_count)
            .sum();
        if ampl.len() != expected || freq.len() != expected {
            return Err(DaqError::TransientRead(format!(
                "sweep has {} values and {} frequencies, expected {expected}",
                ampl.len(),
                freq.len()
            )));
        }

        let correct = self.state.corrects_lost_track();
        let mut data = VnaSample::default();
        let mut lost = Vec::new();
        let mut start = 0;
        for (index, segment) in self.state.segments.iter().enumerate() {
            if !segment.enabled {
                data.segments.push(None);
                continue;
            }
            let f = &freq[start..start + segment.point_count];
            let a = &ampl[start..start + segment.point_count];
            start += segment.point_count;

            if self.state.verbose {
                for (fi, ai) in f.iter().zip(a) {
                    debug!(instrument = %self.name, segment = %segment.name, frequency = fi, amplitude = ai, "sweep point");
                }
            }

            match lorentz_fit(f, a) {
                Ok(fit) => {
                    let mut m = SegmentMeasurement::new(fit.bandwidth, fit.center_frequency, fit.insertion_loss);
                    m.skew = Some(fit.skew);
                    m.trace = Some(Trace {
                        frequency: f.to_vec(),
                        amplitude: a.to_vec(),
                    });
                    data.segments.push(Some(m));
                }
                Err(e) => {
                    warn!(instrument = %self.name, segment = %segment.name, error = %e, "lost track");
                    lost.push((index, linear_slope(f, a)));
                    data.segments.push(None);
                }
            }
        }

        if lost.is_empty() {
            return Ok(Some(data));
        }
        if correct {
            for (index, slope) in lost {
                self.state.step_towards_slope(index, slope);
            }
            self.reprogram().await?;
        }
        Ok(None)
    }

    async fn acquire(&mut self) -> Result<Option<VnaSample>, DaqError> {
        let use_markers = self.state.use_markers;
        self.model()?.trigger(use_markers, false).await?;

        let data = if use_markers {
            self.read_markers().await?
        } else {
            self.read_sweep().await?
        };
        let Some(data) = data else { return Ok(None) };

        if self.state.retarget(&data) {
            self.reprogram().await?;
        }
        Ok(Some(data))
    }
}

fn setup_error(name: &str, error: DaqError) -> DaqError {
    match error {
        e @ (DaqError::Setup { .. } | DaqError::Halted) => e,
        e => DaqError::setup(name, e.to_string()),
    }
}

#[async_trait]
impl Instrument for VnaDriver {
    type Command = VnaCommand;
    type Sample = VnaSample;

    fn kind(&self) -> &'static str {
        "vna"
    }

    fn headers(&self) -> Vec<String> {
        sample::headers(&self.state.segments)
    }

    fn format_sample(sample: &VnaSample) -> Vec<Field> {
        sample::format_sample(sample)
    }

    async fn setup(&mut self, ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        let name = self.name.clone();
        let model = self.connect().await.map_err(|e| setup_error(&name, e))?;
        if self.state.use_markers && !model.supports_markers() {
            warn!(instrument = %name, model = model.name(), "markers not supported, using sweep fitting");
            self.state.use_markers = false;
        }
        self.model = Some(model);

        let use_markers = self.state.use_markers;
        let model = self.model.as_deref_mut().ok_or(DaqError::NotRunning)?;
        model.setup(use_markers).await.map_err(|e| setup_error(&name, e))?;
        model
            .set_segments(&self.state.segments)
            .await
            .map_err(|e| setup_error(&name, e))?;
        ctx.wait_with_cancel(Duration::from_millis(self.config.settle_time_ms))
            .await?;
        self.model()?
            .autoscale()
            .await
            .map_err(|e| setup_error(&name, e))?;

        self.last_sample = None;
        info!(
            instrument = %name,
            segments = self.state.segments.len(),
            use_markers,
            track_frequency = self.state.track_frequency,
            track_span = self.state.track_span,
            "network analyzer ready"
        );
        Ok(())
    }

    async fn sample(&mut self, ctx: &mut EngineContext<Self>) -> Result<Option<VnaSample>, DaqError> {
        let outcome = self.acquire().await;
        if matches!(&outcome, Err(e) if e.is_fatal()) {
            return outcome;
        }
        self.pacer.pace(ctx).await?;
        outcome
    }

    async fn apply(&mut self, command: VnaCommand, _ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        debug!(instrument = %self.name, ?command, "applying command");
        match command {
            VnaCommand::SetSegmentEnabled { index, enabled } => {
                self.state.set_segment_enabled(index, enabled)?;
                self.reprogram().await?;
            }
            VnaCommand::SetBandwidthFactorOverride(factor) => {
                self.state.set_bandwidth_factor_override(factor)?;
            }
            VnaCommand::SetTrackingEnabled(enabled) => self.state.tracking_enabled = enabled,
            VnaCommand::ResetSegments => {
                self.state.reset_segments();
                self.reprogram().await?;
            }
            VnaCommand::ForceRetrack => self.state.forced_retrack = true,
            VnaCommand::SetVerbose(verbose) => self.state.verbose = verbose,
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        if let Some(model) = self.model.as_deref_mut() {
            model.cleanup().await;
        }
        self.model = None;
    }
}
