//! Durable cart identity.
//!
//! Each storage keeps a small JSON tag file at its root. The first time a cart
//! is seen without one, a fresh id is generated and written there, so the same
//! cart is recognised on any port after any number of reconnects.

use log::Level;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::serial::commands::{get_file, ping, reset, transfer_files, FileFetch};
use crate::serial::{
    CommandPipeline, FileTransferItem, QueuePolicy, Result, SerialError, SerialStateContext, Session,
    StorageType,
};

use super::{CartStorage, CartTag};

pub const TAG_FILE_PATH: &str = "/cart-tag.txt";

const TAG_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const TAG_LENGTH: usize = 8;

/// Eight characters of base32 (RFC 4648 alphabet) taken from `digest`.
pub fn encode_tag(digest: &[u8]) -> String {
    let mut tag = String::with_capacity(TAG_LENGTH);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in digest {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 && tag.len() < TAG_LENGTH {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1F) as usize;
            tag.push(TAG_ALPHABET[index] as char);
        }
        buffer &= (1 << bits) - 1;
        if tag.len() == TAG_LENGTH {
            break;
        }
    }
    tag
}

/// A new filename-safe device id derived from a random UUID.
pub fn generate_device_id() -> String {
    let seed = Uuid::new_v4();
    let digest = Sha256::digest(seed.as_bytes());
    encode_tag(&digest)
}

/// Reads or creates the tag file on a cart's storages.
#[derive(Debug, Clone)]
pub struct CartTagger {
    pipeline: CommandPipeline,
}

impl CartTagger {
    pub fn new(pipeline: CommandPipeline) -> Self {
        Self { pipeline }
    }

    /// Never fails: any problem leaves the storage marked unavailable.
    ///
    /// An untagged storage receives `known_id` when one is given (the id
    /// already found on the cart's other storage), otherwise a fresh id.
    pub async fn ensure_tag(
        &self,
        connection: &SerialStateContext,
        storage: StorageType,
        known_id: Option<String>,
    ) -> CartStorage {
        let result = self
            .pipeline
            .execute(connection, "EnsureTag", QueuePolicy::Queue, move |session| {
                Box::pin(ensure_tag_on(session, storage, known_id))
            })
            .await;

        match result {
            Ok(storage) => storage,
            Err(failure) => {
                log::error!("Unable to tag {} storage: {}", storage, failure);
                CartStorage::unavailable(storage)
            }
        }
    }
}

async fn ensure_tag_on(
    session: &mut Session,
    storage: StorageType,
    known_id: Option<String>,
) -> Result<CartStorage> {
    let status = ping(session).await?;
    if status.busy {
        session.log(Level::Info, "Cart is busy, resetting it before tagging");
        reset(session).await?;
    }

    match get_file(session, storage, TAG_FILE_PATH).await {
        Ok(FileFetch::StorageUnavailable) => {
            session.log(Level::Info, format!("{} storage is unavailable", storage));
            return Ok(CartStorage::unavailable(storage));
        }
        Ok(FileFetch::Found(bytes)) => match serde_json::from_slice::<CartTag>(&bytes) {
            Ok(tag) if !tag.device_id.is_empty() => {
                session.log(Level::Info, format!("{} storage is tagged {}", storage, tag.device_id));
                return Ok(CartStorage::available(storage, tag.device_id));
            }
            _ => session.log(Level::Warn, format!("Tag file on {} storage is unreadable", storage)),
        },
        Ok(FileFetch::NotFound) => {
            session.log(Level::Info, format!("No tag file on {} storage", storage));
        }
        Err(e) if e.is_port_closed() => return Err(e),
        Err(e) => session.log(Level::Warn, format!("Reading the {} tag file failed: {}", storage, e)),
    }

    let device_id = known_id.unwrap_or_else(generate_device_id);
    let tag = CartTag {
        device_id: device_id.clone(),
    };
    let bytes = serde_json::to_vec(&tag).map_err(|e| SerialError::ProtocolError(e.to_string()))?;
    let item = FileTransferItem::new(bytes, TAG_FILE_PATH, storage)?;

    let report = transfer_files(session, &[item]).await?;
    if !report.is_success() {
        session.log(Level::Error, format!("Unable to write the tag file to {} storage", storage));
        return Ok(CartStorage::unavailable(storage));
    }

    session.log(Level::Info, format!("Tagged {} storage as {}", storage, device_id));
    Ok(CartStorage::available(storage, device_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_use_the_base32_alphabet() {
        for _ in 0..64 {
            let id = generate_device_id();
            assert_eq!(id.len(), TAG_LENGTH);
            assert!(id.bytes().all(|b| TAG_ALPHABET.contains(&b)), "{}", id);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(encode_tag(&[0u8; 32]), "AAAAAAAA");
        assert_eq!(encode_tag(&[0xFF; 32]), "77777777");
        // 0b00001_00010_00011_00100_00101_00110_00111_01000
        assert_eq!(encode_tag(&[0x08, 0x86, 0x42, 0x98, 0xE8]), "BCDEFGHI");
    }

    #[test]
    fn tag_file_shape() {
        let json = serde_json::to_string(&CartTag { device_id: "ABCDEFGH".into() }).unwrap();
        assert_eq!(json, r#"{"DeviceId":"ABCDEFGH"}"#);
    }
}
