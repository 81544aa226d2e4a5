//! Serial environmental datalogger driver.
//!
//! The logger streams fixed frames on its own schedule:
//!
//! ```text
//! humidity model:      0x02 ch0_hi ch0_lo ch1_hi ch1_lo 0x03
//! thermocouple "1316": 0x02 st0 ch0_hi ch0_lo st1 ch1_hi ch1_lo 0x00 0x03
//! ```
//!
//! Channel values are 14-bit tenths: `((hi & 0x3f) << 8 | lo) · 0.1`. A non-zero status byte
//! marks its channel absent. A frame with a wrong start or end byte yields no sample.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use daq_core::scpi::DynIo;
use daq_core::serial::{drain_serial_buffer, open_serial_async};
use daq_core::{DaqError, EngineContext, Field, Instrument};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const UNEXPECTED_CLOSE: &str = "serial port closed unexpectedly";

/// Two-thermocouple model with status bytes.
pub const MODEL_THERMOCOUPLE: &str = "1316";

/// Configuration of one datalogger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataloggerConfig {
    /// Serial device path.
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Model; `"1316"` selects the thermocouple frame, anything else temperature/humidity.
    pub model: String,
    /// Maximum silence before the link counts as lost, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for DataloggerConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            model: String::new(),
            timeout_ms: 3000,
        }
    }
}

impl DataloggerConfig {
    /// Check semantic constraints.
    pub fn validate(&self, id: &str) -> Result<(), DaqError> {
        if self.port.trim().is_empty() {
            return Err(DaqError::Configuration(format!(
                "instrument '{id}': serial port is required"
            )));
        }
        if self.baud_rate == 0 {
            return Err(DaqError::Configuration(format!(
                "instrument '{id}': baud_rate must be positive"
            )));
        }
        Ok(())
    }

    fn thermocouple(&self) -> bool {
        self.model == MODEL_THERMOCOUPLE
    }
}

/// One frame: two channels, absent where the logger flagged an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataloggerSample {
    /// Channel values in display units.
    pub channels: [Option<f64>; 2],
}

/// Decode one 14-bit channel value.
pub fn decode_channel(hi: u8, lo: u8) -> f64 {
    f64::from(u16::from(lo) | (u16::from(hi & 0x3f) << 8)) * 0.1
}

/// Read one frame. `Ok(None)` for a malformed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    io: &mut R,
    thermocouple: bool,
    timeout: Duration,
) -> Result<Option<DataloggerSample>, DaqError> {
    let mut reader = FrameReader { io, timeout };
    if reader.byte().await? != STX {
        return Ok(None);
    }

    let channels = if thermocouple {
        let status0 = reader.byte().await?;
        let ch0 = reader.channel().await?;
        let status1 = reader.byte().await?;
        let ch1 = reader.channel().await?;
        if reader.byte().await? != 0x00 {
            return Ok(None);
        }
        [(status0 == 0).then_some(ch0), (status1 == 0).then_some(ch1)]
    } else {
        [Some(reader.channel().await?), Some(reader.channel().await?)]
    };

    if reader.byte().await? != ETX {
        return Ok(None);
    }
    Ok(Some(DataloggerSample { channels }))
}

struct FrameReader<'a, R> {
    io: &'a mut R,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<'_, R> {
    async fn exact<const N: usize>(&mut self) -> Result<[u8; N], DaqError> {
        let mut buf = [0u8; N];
        match tokio::time::timeout(self.timeout, self.io.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(_)) | Err(_) => Err(DaqError::TransportClosed(UNEXPECTED_CLOSE.to_string())),
        }
    }

    async fn byte(&mut self) -> Result<u8, DaqError> {
        Ok(self.exact::<1>().await?[0])
    }

    async fn channel(&mut self) -> Result<f64, DaqError> {
        let [hi, lo] = self.exact::<2>().await?;
        Ok(decode_channel(hi, lo))
    }
}

/// Datalogger instrument. Takes no commands.
pub struct DataloggerDriver {
    name: String,
    config: DataloggerConfig,
    io: Option<DynIo>,
}

impl DataloggerDriver {
    /// Driver that opens `config.port` during setup.
    pub fn new(name: impl Into<String>, config: DataloggerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            io: None,
        }
    }

    /// Driver reading from an already open stream.
    pub fn with_io(name: impl Into<String>, config: DataloggerConfig, io: DynIo) -> Self {
        Self {
            name: name.into(),
            config,
            io: Some(io),
        }
    }
}

#[async_trait]
impl Instrument for DataloggerDriver {
    type Command = Infallible;
    type Sample = DataloggerSample;

    fn kind(&self) -> &'static str {
        "datalogger"
    }

    fn headers(&self) -> Vec<String> {
        let headers: [&str; 2] = if self.config.thermocouple() {
            ["Temperature1 (C)", "Temperature2 (C)"]
        } else {
            ["Temperature (C)", "Relative Humidity (%)"]
        };
        headers.iter().map(|h| (*h).to_string()).collect()
    }

    fn format_sample(sample: &DataloggerSample) -> Vec<Field> {
        sample.channels.iter().map(|c| Field::from(*c)).collect()
    }

    async fn setup(&mut self, _ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        if self.io.is_none() {
            let port = open_serial_async(&self.config.port, self.config.baud_rate, &self.name).await?;
            self.io = Some(Box::new(port));
        }
        if let Some(io) = self.io.as_mut() {
            let stale = drain_serial_buffer(io, 50).await;
            if stale > 0 {
                debug!(instrument = %self.name, stale, "discarded partial frame");
            }
        }
        info!(instrument = %self.name, port = %self.config.port, model = %self.config.model, "datalogger open");
        Ok(())
    }

    async fn sample(&mut self, ctx: &mut EngineContext<Self>) -> Result<Option<DataloggerSample>, DaqError> {
        ctx.check_running()?;
        let io = self.io.as_mut().ok_or(DaqError::NotRunning)?;
        let frame = read_frame(io, self.config.thermocouple(), Duration::from_millis(self.config.timeout_ms)).await?;
        if frame.is_none() {
            debug!(instrument = %self.name, "malformed frame skipped");
        }
        Ok(frame)
    }

    async fn apply(&mut self, command: Infallible, _ctx: &mut EngineContext<Self>) -> Result<(), DaqError> {
        match command {}
    }

    async fn cleanup(&mut self) {
        self.io = None;
    }
}
