use serde::{Deserialize, Serialize};

use super::token::{checksum, validate_path};
use super::Result;
use super::SerialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Sd,
    Usb,
}

impl StorageType {
    /// Byte identifying the storage backend on the wire.
    pub fn token(self) -> u8 {
        match self {
            StorageType::Usb => 0,
            StorageType::Sd => 1,
        }
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Sd => write!(f, "SD"),
            StorageType::Usb => write!(f, "USB"),
        }
    }
}

/// Kind of launchable file. Decides how long the launch handler listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchableKind {
    Song,
    Game,
    Image,
    Hex,
}

impl LaunchableKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let extension = path.rsplit_once('.')?.1.to_ascii_lowercase();
        match extension.as_str() {
            "sid" => Some(LaunchableKind::Song),
            "prg" | "p00" | "crt" => Some(LaunchableKind::Game),
            "kla" | "koa" | "art" | "aas" | "hpi" => Some(LaunchableKind::Image),
            "hex" => Some(LaunchableKind::Hex),
            _ => None,
        }
    }

    /// Songs and games answer a launch with text worth waiting for.
    pub fn awaits_response(self) -> bool {
        matches!(self, LaunchableKind::Song | LaunchableKind::Game)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub storage: StorageType,
    pub path: String,
    pub kind: LaunchableKind,
    pub size: u64,
}

impl LaunchRequest {
    pub fn new(storage: StorageType, path: impl Into<String>, kind: LaunchableKind, size: u64) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self {
            storage,
            path,
            kind,
            size,
        })
    }

    /// Builds a request whose kind is taken from the file extension.
    pub fn for_path(storage: StorageType, path: impl Into<String>, size: u64) -> Result<Self> {
        let path = path.into();
        let kind = LaunchableKind::from_path(&path)
            .ok_or_else(|| SerialError::Validation(format!("not a launchable file: {}", path)))?;
        Self::new(storage, path, kind, size)
    }
}

/// A buffer headed for the cart. The checksum and length are fixed at construction.
#[derive(Debug, Clone)]
pub struct FileTransferItem {
    data: Vec<u8>,
    target_path: String,
    storage: StorageType,
    checksum: u16,
}

impl FileTransferItem {
    pub fn new(data: Vec<u8>, target_path: impl Into<String>, storage: StorageType) -> Result<Self> {
        let target_path = target_path.into();
        validate_path(&target_path)?;
        if data.is_empty() {
            return Err(SerialError::Validation(format!("{} has no content", target_path)));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(SerialError::Validation(format!("{} is too large", target_path)));
        }
        let checksum = checksum(&data);
        Ok(Self {
            data,
            target_path,
            storage,
            checksum,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn storage(&self) -> StorageType {
        self.storage
    }

    pub fn checksum(&self) -> u16 {
        self.checksum
    }

    pub fn stream_length(&self) -> u32 {
        self.data.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRequest {
    pub storage: StorageType,
    pub path: String,
    pub skip: u8,
    pub take: u8,
}

impl DirectoryRequest {
    pub fn new(storage: StorageType, path: impl Into<String>, skip: u8, take: u8) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self {
            storage,
            path,
            skip,
            take,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectoryItem {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileItem {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub directories: Vec<DirectoryItem>,
    pub files: Vec<FileItem>,
    /// False when the listing timed out before the end token arrived.
    pub complete: bool,
}
