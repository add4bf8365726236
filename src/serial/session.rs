use std::sync::Arc;
use std::time::Duration;

use log::Level;
use tokio::sync::OwnedMutexGuard;

use super::interface::{read_exact, read_for, SerialPortIO};
use super::state::{ensure_connection, Link};
use super::token::{decode_token, encode_int, encode_path, Ack, Token};
use super::{Result, SerialError};
use crate::settings::Settings;

/// Exclusive access to a connection for the length of one transaction.
///
/// Handed to command bodies by the pipeline. Nothing else reads or writes the
/// port while a session is alive.
pub struct Session {
    io: OwnedMutexGuard<Box<dyn SerialPortIO>>,
    link: Arc<Link>,
}

impl Session {
    pub(crate) fn new(io: OwnedMutexGuard<Box<dyn SerialPortIO>>, link: Arc<Link>) -> Self {
        Self { io, link }
    }

    /// Timeouts and limits of the owning connection.
    pub fn settings(&self) -> &Settings {
        &self.link.settings
    }

    /// Id of the cart on this connection, once known.
    pub fn device_id(&self) -> Option<String> {
        self.link.device_id()
    }

    /// Port currently open, if any.
    pub fn port_name(&self) -> Option<String> {
        self.io.port_name()
    }

    /// Whether the port is still open.
    pub fn is_open(&self) -> bool {
        self.io.is_open()
    }

    /// Discards anything buffered in either direction.
    pub fn clear_buffers(&mut self) -> Result<()> {
        self.io.clear_buffers()
    }

    /// Writes raw bytes.
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.io.send_data(data).await
    }

    /// Writes a 16-bit token, little-endian.
    pub async fn send_token(&mut self, token: Token) -> Result<()> {
        log::trace!("-> {:?} ({})", token, hex::encode(token.to_wire()));
        self.io.send_data(&token.to_wire()).await
    }

    pub async fn send_byte(&mut self, value: u8) -> Result<()> {
        self.io.send_data(&[value]).await
    }

    /// Writes the low `width` bytes of `value`, little-endian.
    pub async fn send_int(&mut self, value: u32, width: usize) -> Result<()> {
        self.io.send_data(&encode_int(value, width)).await
    }

    /// Sends `path` NUL-terminated after validating it.
    pub async fn send_path(&mut self, path: &str) -> Result<()> {
        let bytes = encode_path(path)?;
        self.io.send_data(&bytes).await
    }

    /// Reads exactly `len` bytes or fails with `Timeout` after `limit`.
    pub async fn read_exact(&mut self, len: usize, limit: Duration) -> Result<Vec<u8>> {
        read_exact(&mut **self.io, len, limit).await
    }

    /// Everything that arrives within `window`, possibly nothing.
    pub async fn read_for(&mut self, window: Duration) -> Result<Vec<u8>> {
        read_for(&mut **self.io, window).await
    }

    /// Like [`read_for`](Self::read_for), decoded lossily as text.
    pub async fn read_text_for(&mut self, window: Duration) -> Result<String> {
        let bytes = self.read_for(window).await?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// Reads one 16-bit little-endian token.
    pub async fn read_token(&mut self, limit: Duration) -> Result<u16> {
        let bytes = self.read_exact(2, limit).await?;
        let value = decode_token([bytes[0], bytes[1]]);
        log::trace!("<- 0x{}", hex::encode_upper(value.to_be_bytes()));
        Ok(value)
    }

    /// Reads a token within the ack timeout, whatever it is.
    pub async fn read_ack(&mut self) -> Result<Ack> {
        let limit = self.settings().ack_timeout();
        Ok(Ack::from(self.read_token(limit).await?))
    }

    /// Reads one acknowledgement and fails unless it is `Ack`.
    pub async fn expect_ack(&mut self) -> Result<()> {
        match self.read_ack().await? {
            Ack::Ack => Ok(()),
            Ack::Fail => Err(SerialError::DeviceFailure("cart answered with Fail".to_string())),
            other => Err(SerialError::UnexpectedToken(other.value())),
        }
    }

    /// Closes the port. Unless reopened, the transaction ends in `ConnectionLost`.
    pub fn close(&mut self) {
        self.io.close();
    }

    /// Reopens the port if needed, rescanning when the cart moved. Returns the port name.
    pub async fn ensure_connection(&mut self) -> Result<String> {
        let wait = self.link.settings.handshake_read();
        ensure_connection(&mut **self.io, &self.link, wait).await
    }

    /// Forces a fresh connection: close, wait for the cart to come back, reopen.
    ///
    /// Gives up after the configured number of attempts.
    pub async fn reconnect(&mut self) -> Result<String> {
        let attempts = self.link.settings.reconnect_attempts.max(1);
        let delay = self.link.settings.reconnect_delay();
        let mut last_error = None;

        for attempt in 1..=attempts {
            self.io.close();
            tokio::time::sleep(delay).await;
            match self.ensure_connection().await {
                Ok(port) => {
                    self.log(Level::Info, format!("Reconnected on {}", port));
                    return Ok(port);
                }
                Err(e) => {
                    self.log(
                        Level::Warn,
                        format!("Reconnect attempt {} of {} failed: {}", attempt, attempts, e),
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| SerialError::ConnectionFailed("reconnect failed".to_string())))
    }

    /// Reads whatever the cart still has to say and logs it.
    pub async fn drain(&mut self) -> Vec<u8> {
        if !self.io.is_open() {
            return Vec::new();
        }
        let window = self.link.settings.drain_timeout();
        let bytes = read_for(&mut **self.io, window).await.unwrap_or_default();
        self.log_device_bytes(&bytes);
        bytes
    }

    /// Logs under this cart's id, to `log` and the connection's sink.
    pub fn log(&self, level: Level, message: impl Into<String>) {
        self.link.log(level, message);
    }

    /// Forwards cart output as device lines.
    pub fn log_device_bytes(&self, bytes: &[u8]) {
        self.link.log_device_bytes(bytes);
    }
}
