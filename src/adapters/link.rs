use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

/// Bidirectional byte stream to the sensor unit. Methods take `&self` so one
/// shared handle can serve the blocking reader loop and concurrent command
/// writes. Discovery and pairing live outside the core; by the time a link
/// exists it is already a connected stream.
pub trait DeviceLink: Send + Sync + 'static {
    /// Reads the next chunk of bytes. `Ok(0)` means the peer closed the
    /// stream. `WouldBlock`/`TimedOut` errors mean no data within the read
    /// timeout; the reader loop uses them to poll its stop flag.
    fn read_chunk(&self, buffer: &mut [u8]) -> std::io::Result<usize>;

    fn write_all(&self, bytes: &[u8]) -> std::io::Result<()>;

    /// Safe to call at any time, including concurrently with a blocked read.
    fn shutdown(&self);
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to resolve device address {addr}: {source}")]
    Resolve {
        addr: String,
        source: std::io::Error,
    },
    #[error("failed to connect to device at {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("invalid replay script: {0}")]
    InvalidScript(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream link over a TCP socket. The radio's SPP channel is surfaced by the
/// platform Bluetooth layer as a socket (e.g. an rfcomm bind), and the
/// hardware simulator speaks the same transport.
#[derive(Debug)]
pub struct TcpDeviceLink {
    stream: TcpStream,
}

impl TcpDeviceLink {
    pub fn connect(addr: &str, read_timeout: Duration) -> Result<Self, LinkError> {
        let mut resolved = addr.to_socket_addrs().map_err(|source| LinkError::Resolve {
            addr: addr.to_string(),
            source,
        })?;
        let target = resolved.next().ok_or_else(|| LinkError::Resolve {
            addr: addr.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no socket address resolved for device endpoint",
            ),
        })?;

        let stream = TcpStream::connect(target).map_err(|source| LinkError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        stream.set_read_timeout(Some(read_timeout))?;

        Ok(Self { stream })
    }
}

impl DeviceLink for TcpDeviceLink {
    fn read_chunk(&self, buffer: &mut [u8]) -> std::io::Result<usize> {
        (&self.stream).read(buffer)
    }

    fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut stream = &self.stream;
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
