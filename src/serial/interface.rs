use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use tokio::time::{sleep, timeout, Instant};

use super::{Result, SerialError};

pub const BAUD_RATE: u32 = 115_200;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const WRITE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Byte-level access to one serial handle.
///
/// `read_data` returns as soon as at least one byte is available and fails
/// with [`SerialError::Timeout`] when nothing arrives within `timeout_ms`.
#[async_trait]
pub trait SerialPortIO: Send {
    fn open(&mut self, port_name: &str) -> Result<()>;
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn port_name(&self) -> Option<String>;
    fn clear_buffers(&mut self) -> Result<()>;
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;
    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize>;
}

/// Enumerates ports and hands out fresh handles.
pub trait SerialBackend: Send + Sync {
    fn list_ports(&self) -> Result<Vec<String>>;
    fn create_port(&self) -> Box<dyn SerialPortIO>;
}

/// `serialport`-backed handle used against real hardware.
pub struct SerialInterface {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
    baud_rate: u32,
}

impl SerialInterface {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            port: None,
            port_name: None,
            baud_rate,
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(SerialError::PortClosed)
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new(BAUD_RATE)
    }
}

fn map_io(e: std::io::Error) -> SerialError {
    let err = SerialError::IoError(e);
    if err.is_port_closed() {
        SerialError::PortClosed
    } else {
        err
    }
}

fn map_serialport(e: serialport::Error) -> SerialError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => SerialError::PortClosed,
        _ => SerialError::SerialportError(e),
    }
}

#[async_trait]
impl SerialPortIO for SerialInterface {
    fn open(&mut self, port_name: &str) -> Result<()> {
        self.close();
        let port = serialport::new(port_name, self.baud_rate)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => SerialError::PortNotFound(port_name.to_string()),
                _ => SerialError::ConnectionFailed(format!("{}: {}", port_name, e)),
            })?;

        self.port = Some(port);
        self.port_name = Some(port_name.to_string());
        log::debug!("Opened {} at {} baud", port_name, self.baud_rate);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            if let Some(name) = &self.port_name {
                log::debug!("Closed {}", name);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.port
            .as_ref()
            .map(|port| port.bytes_to_read().is_ok())
            .unwrap_or(false)
    }

    fn port_name(&self) -> Option<String> {
        self.port_name.clone()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.port_mut()?
            .clear(ClearBuffer::All)
            .map_err(map_serialport)
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(data).map_err(map_io)?;
        port.flush().map_err(map_io)?;
        Ok(())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let port = self.port_mut()?;

        let read_operation = async {
            loop {
                match port.bytes_to_read() {
                    Ok(0) => sleep(POLL_INTERVAL).await,
                    Ok(available) => {
                        let wanted = buffer.len().min(available as usize);
                        match port.read(&mut buffer[..wanted]) {
                            Ok(0) => sleep(POLL_INTERVAL).await,
                            Ok(bytes_read) => return Ok(bytes_read),
                            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                            Err(e) => return Err(map_io(e)),
                        }
                    }
                    Err(e) => return Err(map_serialport(e)),
                }
            }
        };

        timeout(Duration::from_millis(timeout_ms), read_operation)
            .await
            .map_err(|_| SerialError::Timeout)?
    }
}

/// Backend over the operating system's serial ports.
#[derive(Debug, Clone)]
pub struct SystemSerialBackend {
    baud_rate: u32,
}

impl SystemSerialBackend {
    pub fn new(baud_rate: u32) -> Arc<Self> {
        Arc::new(Self { baud_rate })
    }
}

impl SerialBackend for SystemSerialBackend {
    fn list_ports(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = serialport::available_ports()?
            .into_iter()
            .map(|port| port.port_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn create_port(&self) -> Box<dyn SerialPortIO> {
        Box::new(SerialInterface::new(self.baud_rate))
    }
}

/// Collects everything that arrives until `window` has elapsed.
pub async fn read_for(io: &mut dyn SerialPortIO, window: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + window;
    let mut received = Vec::new();
    let mut buffer = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match io.read_data(&mut buffer, remaining.as_millis().max(1) as u64).await {
            Ok(n) => received.extend_from_slice(&buffer[..n]),
            Err(SerialError::Timeout) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(received)
}

/// Reads exactly `len` bytes or fails with [`SerialError::Timeout`].
pub async fn read_exact(io: &mut dyn SerialPortIO, len: usize, limit: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + limit;
    let mut received = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SerialError::Timeout);
        }
        filled += io
            .read_data(&mut received[filled..], remaining.as_millis().max(1) as u64)
            .await?;
    }
    Ok(received)
}
