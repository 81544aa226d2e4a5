//! Serial port helpers for driver crates.
//!
//! Requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! daq-core = { path = "../daq-core", features = ["serial"] }
//! ```
//!
//! Opened ports are plain [`InstrumentIo`](crate::scpi::InstrumentIo) streams, so drivers can
//! be tested against `tokio::io::duplex` instead of hardware.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DaqError;

/// Open a serial port (8N1, no flow control) without blocking the runtime.
///
/// # Errors
///
/// Returns [`DaqError::Setup`] if the port cannot be opened.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> Result<tokio_serial::SerialStream, DaqError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::setup(
                    device_name_owned,
                    format!("failed to open serial port {port_path_owned}: {e}"),
                )
            })
    })
    .await
    .map_err(|e| DaqError::setup(device_name, format!("serial open task failed: {e}")))?
}

/// Read and discard whatever is immediately available, for at most `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        match tokio::time::timeout_at(deadline, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);

        host.write_all(b"\x02").await.unwrap();
        let mut buf = [0u8; 1];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x02);
    }
}
