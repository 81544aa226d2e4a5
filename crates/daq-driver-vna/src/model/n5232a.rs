use async_trait::async_trait;
use daq_core::scpi::ScpiSession;
use daq_core::DaqError;
use num_complex::Complex64;

use super::{complex_pairs, MarkerReading, VnaModel};
use crate::segment::Segment;

/// Keysight N5232A PNA-L. Sweep mode only, manual trigger.
pub struct N5232a {
    session: ScpiSession,
}

impl N5232a {
    /// Wrap a connected session.
    pub fn new(session: ScpiSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl VnaModel for N5232a {
    fn name(&self) -> &'static str {
        "N5232a"
    }

    fn supports_markers(&self) -> bool {
        false
    }

    async fn setup(&mut self, use_markers: bool) -> Result<(), DaqError> {
        if use_markers {
            return Err(DaqError::setup(self.name(), "marker mode is not supported"));
        }
        let id = self.session.identify().await?;
        if !id.model.to_ascii_uppercase().starts_with("N52") {
            return Err(DaqError::setup(
                self.name(),
                format!("unexpected instrument '{} {}'", id.manufacturer, id.model),
            ));
        }
        tracing::info!(model = %id.model, serial = %id.serial, "N5232a identified");

        let s = &mut self.session;
        s.reset().await?;
        s.write(":CALC1:PAR1:DEF S21").await?;
        s.write(":INIT1:CONT ON").await?;
        s.write(":TRIG:SOUR MAN").await?;
        s.write(":SENS1:SWE:TYPE SEGM").await?;
        s.write(":SENS1:SWE:DELAY 0.001").await?;
        s.write(":SENS1:SWE:GEN STEP").await
    }

    async fn set_segments(&mut self, segments: &[Segment]) -> Result<(), DaqError> {
        let enabled: Vec<&Segment> = segments.iter().filter(|s| s.enabled).collect();
        let mut items = vec!["SSTOP".to_string(), enabled.len().to_string()];
        for s in enabled {
            items.extend([
                "1".to_string(),
                s.point_count.to_string(),
                s.center_frequency.to_string(),
                s.span.to_string(),
                s.if_bandwidth.to_string(),
                "0".to_string(),
                s.power.to_string(),
            ]);
        }
        self.session.write(":SENS1:SEGM:BWID:CONT ON").await?;
        self.session.write(":SENS1:SEGM:POW:CONT ON").await?;
        self.session.write_list(":SENS1:SEGM:LIST", &items).await
    }

    async fn autoscale(&mut self) -> Result<(), DaqError> {
        self.session.write(":DISP:WIND1:TRAC1:Y:AUTO").await
    }

    async fn trigger(&mut self, _use_markers: bool, _force: bool) -> Result<(), DaqError> {
        self.session.write(":INIT:IMM").await?;
        self.session.wait_complete().await
    }

    async fn marker_data(&mut self, _marker: usize) -> Result<MarkerReading, DaqError> {
        Err(DaqError::Instrument("N5232a has no bandwidth markers".into()))
    }

    async fn sweep_data(&mut self) -> Result<Vec<Complex64>, DaqError> {
        let values = self.session.query_values(":CALC1:DATA? SDAT").await?;
        complex_pairs(&values)
    }

    async fn freq_data(&mut self) -> Result<Vec<f64>, DaqError> {
        self.session.query_values(":CALC1:X?").await
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.session.write(":TRIG:SOUR IMM").await {
            tracing::debug!(error = %e, "could not restore free-run trigger");
        }
    }
}
