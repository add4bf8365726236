use std::sync::Arc;

use crate::serial::interface::{read_for, SerialBackend, SerialPortIO};
use crate::serial::token::VERSION_CHECK;
use crate::serial::Result;
use crate::settings::Settings;

use super::version::check_version;
use super::Cart;

/// Asks every enumerable port for cart firmware.
pub struct CartFinder {
    backend: Arc<dyn SerialBackend>,
    settings: Settings,
}

impl CartFinder {
    pub fn new(backend: Arc<dyn SerialBackend>, settings: Settings) -> Self {
        Self { backend, settings }
    }

    /// One record per port whose handshake reply carries the cart signature.
    ///
    /// Ports that fail to open or answer with anything else are skipped.
    /// Every port it opened is closed again before this returns.
    pub async fn scan(&self) -> Vec<Cart> {
        let ports = match self.backend.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                log::error!("Unable to enumerate serial ports: {}", e);
                return Vec::new();
            }
        };
        log::info!("Scanning {} port(s) for carts", ports.len());

        let mut carts = Vec::new();
        for port in ports {
            let mut io = self.backend.create_port();
            if let Err(e) = io.open(&port) {
                log::warn!("Unable to open {}: {}", port, e);
                continue;
            }

            let response = self.handshake(&mut *io).await;
            io.close();

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    log::warn!("Handshake on {} failed: {}", port, e);
                    continue;
                }
            };

            let check = check_version(&response);
            if !check.is_cart {
                log::debug!("{} is not a cart", port);
                continue;
            }

            match &check.version {
                Some(version) if check.is_compatible => {
                    log::info!("Found cart on {} (firmware {})", port, version)
                }
                Some(version) => log::warn!(
                    "Found cart on {} with unsupported firmware {}",
                    port,
                    version
                ),
                None => log::warn!("Found cart on {} without a firmware version", port),
            }
            carts.push(Cart::discovered(&port, &check));
        }

        carts
    }

    async fn handshake(&self, io: &mut dyn SerialPortIO) -> Result<String> {
        io.clear_buffers()?;
        io.send_data(&[VERSION_CHECK]).await?;
        let bytes = read_for(io, self.settings.handshake_read()).await?;
        Ok(String::from_utf8_lossy(&bytes).trim().to_string())
    }
}
