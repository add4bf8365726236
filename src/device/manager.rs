use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::logging::{LogLine, LogSink};
use crate::serial::commands::{self, LaunchResult, TransferReport};
use crate::serial::{
    CommandFailure, CommandPipeline, CommandResult, DirectoryListing, DirectoryRequest,
    FileTransferItem, LaunchRequest, QueuePolicy, SerialBackend, SerialStateContext, StorageType,
    SystemSerialBackend, TransactionLock,
};
use crate::settings::Settings;

use super::{Cart, CartFinder, CartTagger, DeviceError, Result, UNIDENTIFIED_PREFIX};

/// A discovered cart together with the connection that drives it.
#[derive(Clone)]
pub struct CartDevice {
    pub cart: Cart,
    pub connection: Arc<SerialStateContext>,
}

/// Central registry of carts.
/// Handles discovery, tagging, connect/disconnect and routes protocol
/// operations to the right connection through one shared transaction lock.
pub struct DeviceConnectionManager {
    backend: Arc<dyn SerialBackend>,
    settings: Settings,
    logs: LogSink,
    pipeline: CommandPipeline,
    finder: CartFinder,
    tagger: CartTagger,
    available: Arc<RwLock<Vec<CartDevice>>>,
    connected: Arc<RwLock<Vec<CartDevice>>>,
}

impl DeviceConnectionManager {
    pub fn new(backend: Arc<dyn SerialBackend>, settings: Settings, logs: LogSink) -> Self {
        Self::with_lock(backend, settings, logs, TransactionLock::new())
    }

    /// Manager over the host's serial ports, with the receiving end of its log lines.
    pub fn system(settings: Settings) -> (Self, mpsc::Receiver<LogLine>) {
        let (logs, rx) = LogSink::channel(settings.log_capacity);
        let backend = SystemSerialBackend::new(settings.baud_rate);
        (Self::new(backend, settings, logs), rx)
    }

    /// Shares `lock` with any other component that talks to the same carts.
    pub fn with_lock(
        backend: Arc<dyn SerialBackend>,
        settings: Settings,
        logs: LogSink,
        lock: TransactionLock,
    ) -> Self {
        let pipeline = CommandPipeline::new(lock);
        Self {
            finder: CartFinder::new(backend.clone(), settings.clone()),
            tagger: CartTagger::new(pipeline.clone()),
            backend,
            settings,
            logs,
            pipeline,
            available: Arc::new(RwLock::new(Vec::new())),
            connected: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn pipeline(&self) -> &CommandPipeline {
        &self.pipeline
    }

    fn new_connection(&self) -> Arc<SerialStateContext> {
        Arc::new(SerialStateContext::new(
            self.backend.clone(),
            self.settings.clone(),
            self.logs.clone(),
        ))
    }

    /// Rebuilds the available list from a fresh scan.
    ///
    /// Every existing connection is released first so the scanner can open
    /// the ports. Carts that were connected before and are still present end
    /// up connected again; all others are left with their port closed.
    pub async fn find_carts(&self) -> Vec<Cart> {
        let previously_connected: HashSet<String> = self
            .connected
            .read()
            .await
            .iter()
            .map(|device| device.cart.device_id.clone())
            .collect();

        let stale: Vec<CartDevice> = {
            let mut available = self.available.write().await;
            let mut connected = self.connected.write().await;
            available.drain(..).chain(connected.drain(..)).collect()
        };
        for device in &stale {
            device.connection.dispose().await;
        }
        drop(stale);

        let mut devices: Vec<CartDevice> = Vec::new();
        let mut unidentified = 0;

        for mut cart in self.finder.scan().await {
            let connection = self.new_connection();
            if let Err(e) = connection.set_port(&cart.com_port) {
                log::warn!("Skipping cart on {}: {}", cart.com_port, e);
                continue;
            }
            if let Err(e) = connection.open_port().await {
                log::warn!("Unable to connect to cart on {}: {}", cart.com_port, e);
                connection.dispose().await;
                continue;
            }

            let sd = self.tagger.ensure_tag(&connection, StorageType::Sd, None).await;
            let usb = self
                .tagger
                .ensure_tag(&connection, StorageType::Usb, sd.device_id.clone())
                .await;

            let device_id = match sd.device_id.clone().or_else(|| usb.device_id.clone()) {
                Some(id) => id,
                None => {
                    let id = format!("{}[{}]", UNIDENTIFIED_PREFIX, unidentified);
                    unidentified += 1;
                    log::warn!("Cart on {} could not be tagged, using {}", cart.com_port, id);
                    id
                }
            };

            if devices.iter().any(|device| device.cart.device_id == device_id) {
                log::warn!(
                    "Cart on {} carries id {} which is already in use, ignoring it",
                    cart.com_port,
                    device_id
                );
                connection.dispose().await;
                continue;
            }

            cart.assign_identity(&device_id, sd, usb);
            connection.set_device_id(&device_id);
            devices.push(CartDevice { cart, connection });
        }

        let mut reconnected = Vec::new();
        for device in &devices {
            if previously_connected.contains(&device.cart.device_id) {
                log::info!("Cart {} is still present, keeping it connected", device.cart.device_id);
                reconnected.push(device.clone());
            } else {
                device.connection.close_port().await;
            }
        }

        log::info!(
            "Discovery finished: {} cart(s) available, {} connected",
            devices.len(),
            reconnected.len()
        );
        let carts = devices.iter().map(|device| device.cart.clone()).collect();
        *self.available.write().await = devices;
        *self.connected.write().await = reconnected;
        carts
    }

    pub async fn available_carts(&self) -> Vec<Cart> {
        self.available
            .read()
            .await
            .iter()
            .map(|device| device.cart.clone())
            .collect()
    }

    pub async fn connected_carts(&self) -> Vec<Cart> {
        self.connected
            .read()
            .await
            .iter()
            .map(|device| device.cart.clone())
            .collect()
    }

    pub async fn connected_device(&self, device_id: &str) -> Option<CartDevice> {
        self.connected
            .read()
            .await
            .iter()
            .find(|device| device.cart.device_id == device_id)
            .cloned()
    }

    pub async fn connect(&self, device_id: &str) -> Result<Cart> {
        if let Some(device) = self.connected_device(device_id).await {
            return Ok(device.cart);
        }

        let device = self
            .available
            .read()
            .await
            .iter()
            .find(|device| device.cart.device_id == device_id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(device_id.to_string()))?;

        device.connection.open_port().await?;
        self.connected.write().await.push(device.clone());
        log::info!("Connected to cart {}", device_id);
        Ok(device.cart)
    }

    /// Releases a connected cart. It stays available for a later `connect`.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let device = {
            let mut connected = self.connected.write().await;
            let position = connected
                .iter()
                .position(|device| device.cart.device_id == device_id)
                .ok_or_else(|| DeviceError::NotConnected(device_id.to_string()))?;
            connected.remove(position)
        };
        device.connection.dispose().await;

        let replacement = self.new_connection();
        replacement.set_port(&device.cart.com_port)?;
        replacement.set_device_id(device_id);

        let mut available = self.available.write().await;
        if let Some(entry) = available
            .iter_mut()
            .find(|entry| entry.cart.device_id == device_id)
        {
            entry.connection = replacement;
        }
        log::info!("Disconnected cart {}", device_id);
        Ok(())
    }

    async fn connection_for(&self, device_id: &str) -> CommandResult<Arc<SerialStateContext>> {
        self.connected_device(device_id)
            .await
            .map(|device| device.connection)
            .ok_or_else(|| CommandFailure::new(format!("Cart {} is not connected", device_id), false))
    }

    pub async fn launch(
        &self,
        device_id: &str,
        request: LaunchRequest,
        policy: QueuePolicy,
    ) -> CommandResult<LaunchResult> {
        let connection = self.connection_for(device_id).await?;
        self.pipeline
            .execute(&connection, "LaunchFile", policy, move |session| {
                Box::pin(async move { commands::launch(session, &request).await })
            })
            .await
    }

    pub async fn transfer_files(
        &self,
        device_id: &str,
        files: Vec<FileTransferItem>,
        policy: QueuePolicy,
    ) -> CommandResult<TransferReport> {
        let connection = self.connection_for(device_id).await?;
        self.pipeline
            .execute(&connection, "SaveFiles", policy, move |session| {
                Box::pin(async move { commands::transfer_files(session, &files).await })
            })
            .await
    }

    pub async fn list_directory(
        &self,
        device_id: &str,
        request: DirectoryRequest,
        policy: QueuePolicy,
    ) -> CommandResult<DirectoryListing> {
        let connection = self.connection_for(device_id).await?;
        self.pipeline
            .execute(&connection, "GetDirectory", policy, move |session| {
                Box::pin(async move { commands::list_directory(session, &request).await })
            })
            .await
    }

    pub async fn delete_file(
        &self,
        device_id: &str,
        storage: StorageType,
        path: String,
        policy: QueuePolicy,
    ) -> CommandResult<()> {
        let connection = self.connection_for(device_id).await?;
        self.pipeline
            .execute(&connection, "DeleteFile", policy, move |session| {
                Box::pin(async move { commands::delete_file(session, storage, &path).await })
            })
            .await
    }

    /// Disposes every connection and forgets all carts.
    pub async fn shutdown(&self) {
        let devices: Vec<CartDevice> = {
            let mut available = self.available.write().await;
            let mut connected = self.connected.write().await;
            available.drain(..).chain(connected.drain(..)).collect()
        };
        for device in &devices {
            device.connection.dispose().await;
        }
        log::info!("Connection manager shut down");
    }
}
