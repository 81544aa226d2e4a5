//! SCPI over any async byte stream.
//!
//! [`ScpiSession`] speaks newline-terminated SCPI over a boxed [`InstrumentIo`] stream:
//! a TCP socket for LAN instruments, or `tokio::io::duplex` in tests.
//!
//! Error mapping:
//! - read timeout → [`DaqError::TransientRead`], or [`DaqError::TransportClosed`] once more than
//!   [`MAX_STALE_REPLIES`] replies are outstanding
//! - EOF or a failed write → [`DaqError::TransportClosed`]
//! - unparsable reply → [`DaqError::Instrument`]
//! - connection failure → [`DaqError::Setup`]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};

use crate::error::DaqError;

/// Default SCPI raw socket port.
pub const DEFAULT_PORT: u16 = 5025;

/// Timed-out replies a session tolerates before treating the link as lost.
pub const MAX_STALE_REPLIES: usize = 3;

/// Trait alias for async instrument I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry SCPI:
/// - `tokio::net::TcpStream` (LAN instruments)
/// - `tokio_serial::SerialStream` (RS-232)
/// - `tokio::io::DuplexStream` (testing)
pub trait InstrumentIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> InstrumentIo for T {}

/// Type-erased boxed instrument stream.
pub type DynIo = Box<dyn InstrumentIo>;

/// Parsed `*IDN?` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer field.
    pub manufacturer: String,
    /// Model field.
    pub model: String,
    /// Serial number field.
    pub serial: String,
    /// Firmware revision field.
    pub firmware: String,
}

impl Identity {
    /// Parse a comma separated identification string. Missing fields are empty.
    pub fn parse(reply: &str) -> Self {
        let mut parts = reply.trim().splitn(4, ',').map(|s| s.trim().to_string());
        Self {
            manufacturer: parts.next().unwrap_or_default(),
            model: parts.next().unwrap_or_default(),
            serial: parts.next().unwrap_or_default(),
            firmware: parts.next().unwrap_or_default(),
        }
    }
}

/// A SCPI command/query session.
///
/// A query that times out leaves its reply in flight. The session counts such replies and
/// discards that many lines before reading the next answer, so a late reply is never
/// handed to a later query.
pub struct ScpiSession {
    name: String,
    stream: BufReader<DynIo>,
    timeout: Duration,
    /// Bytes of a reply line that has not been terminated yet.
    partial: Vec<u8>,
    /// Replies owed to queries that already timed out.
    stale: usize,
}

impl ScpiSession {
    /// Wrap an already connected stream.
    pub fn new(name: impl Into<String>, io: DynIo, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            stream: BufReader::new(io),
            timeout,
            partial: Vec::new(),
            stale: 0,
        }
    }

    /// Connect to `host:port` or a VISA socket resource `TCPIP[n]::host::port::SOCKET`.
    pub async fn connect_tcp(
        name: impl Into<String>,
        resource: &str,
        io_timeout: Duration,
    ) -> Result<Self, DaqError> {
        let name = name.into();
        let (host, port) = parse_resource(resource)
            .map_err(|e| DaqError::setup(name.clone(), e.to_string()))?;

        let stream = timeout(io_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| DaqError::setup(name.clone(), format!("connection timeout to {host}:{port}")))?
            .map_err(|e| DaqError::setup(name.clone(), format!("failed to connect to {host}:{port}: {e}")))?;

        // Disable Nagle's algorithm for low latency
        stream
            .set_nodelay(true)
            .map_err(|e| DaqError::setup(name.clone(), e.to_string()))?;

        tracing::info!(instrument = %name, %host, port, "connected");
        Ok(Self::new(name, Box::new(stream), io_timeout))
    }

    /// Set the reply timeout.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    /// Send a command without expecting a reply.
    pub async fn write(&mut self, command: &str) -> Result<(), DaqError> {
        tracing::trace!(instrument = %self.name, command, "SCPI write");
        let line = format!("{command}\n");
        let io = self.stream.get_mut();
        io.write_all(line.as_bytes())
            .await
            .map_err(|e| DaqError::TransportClosed(format!("{}: write failed: {e}", self.name)))?;
        io.flush()
            .await
            .map_err(|e| DaqError::TransportClosed(format!("{}: flush failed: {e}", self.name)))
    }

    /// Send `header`, a space, then a comma separated list of values.
    pub async fn write_values(&mut self, header: &str, values: &[f64]) -> Result<(), DaqError> {
        let items: Vec<String> = values.iter().map(f64::to_string).collect();
        self.write_list(header, &items).await
    }

    /// Send `header`, a space, then the items joined by commas.
    pub async fn write_list(&mut self, header: &str, items: &[String]) -> Result<(), DaqError> {
        self.write(&format!("{header} {}", items.join(","))).await
    }

    /// Send a query and read one reply line.
    pub async fn query(&mut self, query: &str) -> Result<String, DaqError> {
        self.write(query).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            // read_until keeps partially read bytes in `partial` when the timeout cancels it.
            match timeout_at(deadline, self.stream.read_until(b'\n', &mut self.partial)).await {
                Ok(Ok(0)) => {
                    return Err(DaqError::TransportClosed(format!(
                        "{}: connection closed by device",
                        self.name
                    )))
                }
                Ok(Ok(_)) => {
                    let line = std::mem::take(&mut self.partial);
                    let trimmed = String::from_utf8_lossy(&line).trim().to_string();
                    if self.stale > 0 {
                        self.stale -= 1;
                        tracing::debug!(instrument = %self.name, response = %trimmed, "discarding late SCPI reply");
                        continue;
                    }
                    tracing::trace!(instrument = %self.name, query, response = %trimmed, "SCPI reply");
                    return Ok(trimmed);
                }
                Ok(Err(e)) => {
                    return Err(DaqError::TransportClosed(format!(
                        "{}: read failed: {e}",
                        self.name
                    )))
                }
                Err(_) => {
                    self.stale += 1;
                    if self.stale > MAX_STALE_REPLIES {
                        return Err(DaqError::TransportClosed(format!(
                            "{}: {} replies outstanding, last for {query}",
                            self.name, self.stale
                        )));
                    }
                    return Err(DaqError::TransientRead(format!(
                        "{}: timeout waiting for response to {query}",
                        self.name
                    )));
                }
            }
        }
    }

    /// Query a single floating point value.
    pub async fn query_f64(&mut self, query: &str) -> Result<f64, DaqError> {
        let response = self.query(query).await?;
        parse_f64_response(&response)
    }

    /// Query a comma separated list of floating point values.
    pub async fn query_values(&mut self, query: &str) -> Result<Vec<f64>, DaqError> {
        let response = self.query(query).await?;
        parse_values(&response)
    }

    /// Query and parse `*IDN?`.
    pub async fn identify(&mut self) -> Result<Identity, DaqError> {
        Ok(Identity::parse(&self.query("*IDN?").await?))
    }

    /// Wait for pending operations with `*OPC?`.
    pub async fn wait_complete(&mut self) -> Result<(), DaqError> {
        self.query("*OPC?").await.map(|_| ())
    }

    /// Reset the instrument and clear its status.
    pub async fn reset(&mut self) -> Result<(), DaqError> {
        self.write("*RST").await?;
        self.write("*CLS").await
    }
}

/// Split a resource string into host and port.
pub fn parse_resource(resource: &str) -> Result<(String, u16), DaqError> {
    let resource = resource.trim();
    if resource.to_ascii_uppercase().starts_with("TCPIP") {
        let parts: Vec<&str> = resource.split("::").collect();
        return match parts.as_slice() {
            [_, host, port, suffix] if suffix.eq_ignore_ascii_case("SOCKET") => {
                let port = port.parse::<u16>().map_err(|_| {
                    DaqError::Configuration(format!("invalid port in resource '{resource}'"))
                })?;
                Ok(((*host).to_string(), port))
            }
            [_, host] | [_, host, _] => Ok(((*host).to_string(), DEFAULT_PORT)),
            _ => Err(DaqError::Configuration(format!(
                "unsupported VISA resource '{resource}'"
            ))),
        };
    }
    match resource.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                DaqError::Configuration(format!("invalid port in resource '{resource}'"))
            })?;
            Ok((host.to_string(), port))
        }
        None if !resource.is_empty() => Ok((resource.to_string(), DEFAULT_PORT)),
        _ => Err(DaqError::Configuration(format!(
            "invalid resource '{resource}'"
        ))),
    }
}

/// Parse a floating point reply.
pub fn parse_f64_response(response: &str) -> Result<f64, DaqError> {
    response.trim().parse::<f64>().map_err(|_| {
        DaqError::Instrument(format!("failed to parse SCPI response as f64: '{response}'"))
    })
}

/// Parse a comma separated list of floating point values. An empty reply is an empty list.
pub fn parse_values(response: &str) -> Result<Vec<f64>, DaqError> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed.split(',').map(parse_f64_response).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[test]
    fn resource_strings() {
        assert_eq!(
            parse_resource("192.168.0.10:5025").unwrap(),
            ("192.168.0.10".to_string(), 5025)
        );
        assert_eq!(
            parse_resource("TCPIP0::10.0.0.2::5025::SOCKET").unwrap(),
            ("10.0.0.2".to_string(), 5025)
        );
        assert_eq!(
            parse_resource("TCPIP::vna.lab::INSTR").unwrap(),
            ("vna.lab".to_string(), DEFAULT_PORT)
        );
        assert_eq!(parse_resource("vna.lab").unwrap(), ("vna.lab".to_string(), DEFAULT_PORT));
        assert!(parse_resource("vna.lab:notaport").is_err());
        assert!(parse_resource("").is_err());
    }

    #[test]
    fn value_lists() {
        assert_eq!(parse_values("1.5,+2E3, -0.25").unwrap(), vec![1.5, 2000.0, -0.25]);
        assert!(parse_values("").unwrap().is_empty());
        assert!(matches!(parse_values("1,x"), Err(DaqError::Instrument(_))));
    }

    #[test]
    fn identity_fields() {
        let id = Identity::parse("Keysight Technologies,E5071C,MY46100000,A.11.00\n");
        assert_eq!(id.manufacturer, "Keysight Technologies");
        assert_eq!(id.model, "E5071C");
        assert_eq!(id.firmware, "A.11.00");
        assert_eq!(Identity::parse("ACME").model, "");
    }

    #[tokio::test]
    async fn query_over_duplex() {
        let (host, device) = tokio::io::duplex(256);
        let mut session = ScpiSession::new("test", Box::new(device), Duration::from_secs(1));

        let responder = tokio::spawn(async move {
            let mut host = tokio::io::BufReader::new(host);
            let mut line = String::new();
            host.read_line(&mut line).await.unwrap();
            assert_eq!(line, "MEAS:VOLT?\n");
            host.get_mut().write_all(b"+1.2500E+01\n").await.unwrap();
            host
        });

        let value = session.query_f64("MEAS:VOLT?").await.unwrap();
        assert!((value - 12.5).abs() < 1e-12);
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_is_transient_and_eof_is_closed() {
        let (host, device) = tokio::io::duplex(256);
        let mut session = ScpiSession::new("test", Box::new(device), Duration::from_millis(20));

        let err = session.query("*IDN?").await.unwrap_err();
        assert!(err.is_transient());

        drop(host);
        let err = session.query("*IDN?").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn late_reply_is_not_returned_to_next_query() {
        let (host, device) = tokio::io::duplex(256);
        let mut session = ScpiSession::new("test", Box::new(device), Duration::from_millis(50));

        let responder = tokio::spawn(async move {
            let mut host = tokio::io::BufReader::new(host);
            let mut line = String::new();
            host.read_line(&mut line).await.unwrap();
            assert_eq!(line, "*OPC?\n");
            tokio::time::sleep(Duration::from_millis(80)).await;
            host.get_mut().write_all(b"1\n").await.unwrap();

            line.clear();
            host.read_line(&mut line).await.unwrap();
            assert_eq!(line, "MEAS:VOLT?\n");
            host.get_mut().write_all(b"+1.25E+01\n").await.unwrap();
            host
        });

        let err = session.wait_complete().await.unwrap_err();
        assert!(err.is_transient());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(session.query("MEAS:VOLT?").await.unwrap(), "+1.25E+01");
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn split_reply_survives_timeout() {
        let (mut host, device) = tokio::io::duplex(256);
        let mut session = ScpiSession::new("test", Box::new(device), Duration::from_millis(30));

        host.write_all(b"+1.2").await.unwrap();
        assert!(session.query("MEAS:VOLT?").await.unwrap_err().is_transient());
        host.write_all(b"5E+01\n+3.0E+00\n").await.unwrap();

        assert_eq!(session.query_f64("MEAS:CURR?").await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn silent_device_escalates_to_closed() {
        let (_host, device) = tokio::io::duplex(256);
        let mut session = ScpiSession::new("test", Box::new(device), Duration::from_millis(10));

        for _ in 0..MAX_STALE_REPLIES {
            assert!(session.query("*OPC?").await.unwrap_err().is_transient());
        }
        assert!(session.query("*OPC?").await.unwrap_err().is_fatal());
    }
}
