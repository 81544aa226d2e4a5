use async_trait::async_trait;
use daq_core::scpi::ScpiSession;
use daq_core::DaqError;
use num_complex::Complex64;

use super::{complex_pairs, MarkerReading, VnaModel};
use crate::segment::Segment;

/// Keysight E5071 ENA.
///
/// Sweep mode uses the bus trigger; marker mode lets the analyzer sweep continuously with
/// multi-peak bandwidth markers tracking each resonance.
pub struct E5071x {
    session: ScpiSession,
}

impl E5071x {
    /// Wrap a connected session.
    pub fn new(session: ScpiSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl VnaModel for E5071x {
    fn name(&self) -> &'static str {
        "E5071x"
    }

    fn supports_markers(&self) -> bool {
        true
    }

    async fn setup(&mut self, use_markers: bool) -> Result<(), DaqError> {
        let id = self.session.identify().await?;
        if !id.model.to_ascii_uppercase().starts_with("E50") {
            return Err(DaqError::setup(
                self.name(),
                format!("unexpected instrument '{} {}'", id.manufacturer, id.model),
            ));
        }
        tracing::info!(model = %id.model, serial = %id.serial, "E5071x identified");

        let s = &mut self.session;
        s.reset().await?;
        s.write(":CALC1:PAR1:DEF S21").await?;
        s.write(":INIT1:CONT ON").await?;
        if !use_markers {
            s.write(":TRIG:SOUR BUS").await?;
        }
        s.write(":SENS1:SWE:TYPE SEGM").await?;
        s.write(":SENS1:SWE:DELAY 0.001").await?;
        s.write(":SENS1:SWE:GEN STEP").await?;
        if use_markers {
            s.write(":CALC1:MARK:BWID ON").await?;
            s.write(":CALC1:MARK:FUNC:MULT:TYPE PEAK").await?;
            s.write(":CALC1:MARK:FUNC:EXEC").await?;
            s.write(":CALC1:MARK:FUNC:MULT:TRAC ON").await?;
        }
        Ok(())
    }

    async fn set_segments(&mut self, segments: &[Segment]) -> Result<(), DaqError> {
        // [<buf>,<stim>,<ifbw>,<pow>,<del>,<time>,<segm>] then f0,span,points,ifbw,power per segment
        let enabled: Vec<&Segment> = segments.iter().filter(|s| s.enabled).collect();
        let mut data = vec![5.0, 1.0, 1.0, 1.0, 0.0, 0.0, enabled.len() as f64];
        for s in enabled {
            data.extend([
                s.center_frequency,
                s.span,
                s.point_count as f64,
                s.if_bandwidth,
                s.power,
            ]);
        }
        self.session.write_values(":SENS1:SEGM:DATA", &data).await
    }

    async fn autoscale(&mut self) -> Result<(), DaqError> {
        self.session.write(":DISP:WIND1:TRAC1:Y:AUTO").await
    }

    async fn trigger(&mut self, use_markers: bool, force: bool) -> Result<(), DaqError> {
        if use_markers && force {
            self.session.write(":TRIG:SOUR BUS").await?;
        }
        if !use_markers || force {
            self.session.write(":TRIG:SING").await?;
            self.session.wait_complete().await?;
        }
        if use_markers && force {
            self.session.write(":TRIG:SOUR INT").await?;
        }
        Ok(())
    }

    async fn marker_data(&mut self, marker: usize) -> Result<MarkerReading, DaqError> {
        let values = self
            .session
            .query_values(&format!(":CALC1:MARK{marker}:BWID:DATA?"))
            .await?;
        MarkerReading::from_values(&values)
    }

    async fn sweep_data(&mut self) -> Result<Vec<Complex64>, DaqError> {
        let values = self.session.query_values(":CALC1:DATA:SDAT?").await?;
        complex_pairs(&values)
    }

    async fn freq_data(&mut self) -> Result<Vec<f64>, DaqError> {
        self.session.query_values(":SENS1:FREQ:DATA?").await
    }

    async fn cleanup(&mut self) {
        if let Err(e) = self.session.write(":TRIG:SOUR INT").await {
            tracing::debug!(error = %e, "could not restore internal trigger");
        }
    }
}
