//! Serial / TCP transport for a homenet bus
//!
//! A port's `path` is a serial device unless it contains `:`, in which case
//! it is `host:port` TCP (common for RS-485-over-ethernet adapters). Serial
//! devices are awaited with a bounded wait so the bridge can start before
//! a USB adapter enumerates.

use crate::infra::config::{Parity, SerialConfig, StopBits};
use crate::infra::error::TransportError;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

/// Read half of an open transport.
pub type TransportReader = Box<dyn AsyncRead + Unpin + Send>;
/// Write half of an open transport.
pub type TransportWriter = Box<dyn AsyncWrite + Unpin + Send>;

const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn boxed_split<T>(stream: T) -> (TransportReader, TransportWriter)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Open the transport for a port, waiting up to `wait_timeout` for a serial
/// device node to appear.
pub async fn open(
    serial: &SerialConfig,
    wait_timeout: Duration,
) -> Result<(TransportReader, TransportWriter), TransportError> {
    if serial.is_tcp() {
        let stream = TcpStream::connect(&serial.path).await.map_err(|source| {
            TransportError::Open { path: serial.path.clone(), source }
        })?;
        stream.set_nodelay(true).ok();
        info!(path = %serial.path, "tcp_transport_connected");
        return Ok(boxed_split(stream));
    }

    wait_for_device(&serial.path, wait_timeout).await?;

    let data_bits = match serial.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(TransportError::Unsupported(format!("data_bits {other}")));
        }
    };
    let parity = match serial.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Mark | Parity::Space => {
            return Err(TransportError::Unsupported("mark/space parity".to_string()));
        }
    };
    let stop_bits = match serial.stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
        StopBits::OnePointFive => {
            return Err(TransportError::Unsupported("1.5 stop bits".to_string()));
        }
    };

    let port = tokio_serial::new(&serial.path, serial.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .timeout(Duration::from_millis(100))
        .open_native_async()
        .map_err(|e| TransportError::Open {
            path: serial.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;

    info!(path = %serial.path, baud = %serial.baud_rate, "serial_transport_opened");
    Ok(boxed_split(port))
}

/// Poll for the device node until it exists or the bounded wait elapses.
async fn wait_for_device(path: &str, wait_timeout: Duration) -> Result<(), TransportError> {
    let deadline = tokio::time::Instant::now() + wait_timeout;
    while !Path::new(path).exists() {
        if tokio::time::Instant::now() >= deadline {
            return Err(TransportError::DeviceWaitTimeout {
                path: path.to_string(),
                waited_ms: wait_timeout.as_millis() as u64,
            });
        }
        debug!(path = %path, "waiting_for_device");
        tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_missing_device_times_out() {
        let result = wait_for_device("/dev/does-not-exist-9999", Duration::from_millis(1200)).await;
        match result {
            Err(TransportError::DeviceWaitTimeout { waited_ms, .. }) => {
                assert_eq!(waited_ms, 1200);
            }
            other => panic!("expected DeviceWaitTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_existing_path_returns_immediately() {
        assert!(wait_for_device("/", Duration::from_millis(10)).await.is_ok());
    }
}
