pub mod finder;
pub mod manager;
pub mod models;
pub mod tagger;
pub mod version;

pub use finder::CartFinder;
pub use manager::{CartDevice, DeviceConnectionManager};
pub use models::*;
pub use tagger::{generate_device_id, CartTagger, TAG_FILE_PATH};
pub use version::{check_version, VersionCheck};

/// Prefix of the synthetic id given to carts whose storages cannot be tagged.
pub const UNIDENTIFIED_PREFIX: &str = "Unidentified";

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Another command is already running")]
    Busy,

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

impl From<crate::serial::CommandFailure> for DeviceError {
    fn from(failure: crate::serial::CommandFailure) -> Self {
        if failure == crate::serial::CommandFailure::busy() {
            DeviceError::Busy
        } else {
            DeviceError::CommandFailed(failure.message)
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
