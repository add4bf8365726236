use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::VersionCheck;

// Re-export serial protocol models
pub use crate::serial::commands::{LaunchOutcome, LaunchResult, TransferReport};
pub use crate::serial::protocol::{
    DirectoryItem, DirectoryListing, DirectoryRequest, FileItem, FileTransferItem, LaunchRequest,
    LaunchableKind, StorageType,
};

/// Availability of one storage backend on a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartStorage {
    pub storage_type: StorageType,
    pub available: bool,
    /// Id of the owning cart. During tagging, the id found on (or written
    /// to) this storage's tag file.
    pub device_id: Option<String>,
}

impl CartStorage {
    pub fn available(storage_type: StorageType, device_id: impl Into<String>) -> Self {
        Self {
            storage_type,
            available: true,
            device_id: Some(device_id.into()),
        }
    }

    pub fn unavailable(storage_type: StorageType) -> Self {
        Self {
            storage_type,
            available: false,
            device_id: None,
        }
    }
}

/// A cart found on a serial port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cart {
    /// Empty until the cart has been tagged.
    pub device_id: String,
    pub com_port: String,
    pub name: String,
    pub firmware_version: Option<String>,
    pub is_compatible: bool,
    pub sd: CartStorage,
    pub usb: CartStorage,
    pub last_seen: DateTime<Utc>,
}

impl Cart {
    pub fn discovered(com_port: &str, check: &VersionCheck) -> Self {
        Self {
            device_id: String::new(),
            com_port: com_port.to_string(),
            name: format!("Cart on {}", com_port),
            firmware_version: check.version.as_ref().map(|v| v.to_string()),
            is_compatible: check.is_compatible,
            sd: CartStorage::unavailable(StorageType::Sd),
            usb: CartStorage::unavailable(StorageType::Usb),
            last_seen: Utc::now(),
        }
    }

    /// Both storages point back at the cart's id, tagged or not.
    pub fn assign_identity(&mut self, device_id: &str, sd: CartStorage, usb: CartStorage) {
        self.device_id = device_id.to_string();
        self.sd = CartStorage {
            device_id: Some(device_id.to_string()),
            ..sd
        };
        self.usb = CartStorage {
            device_id: Some(device_id.to_string()),
            ..usb
        };
        self.last_seen = Utc::now();
    }

    pub fn storage(&self, storage_type: StorageType) -> &CartStorage {
        match storage_type {
            StorageType::Sd => &self.sd,
            StorageType::Usb => &self.usb,
        }
    }

    /// Carts that could not be tagged carry a synthetic `Unidentified[n]` id.
    pub fn is_identified(&self) -> bool {
        !self.device_id.is_empty() && !self.device_id.starts_with(super::UNIDENTIFIED_PREFIX)
    }
}

/// Contents of the tag file kept on each storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartTag {
    #[serde(rename = "DeviceId")]
    pub device_id: String,
}
