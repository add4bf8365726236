use log::Level;

use crate::serial::protocol::StorageType;
use crate::serial::token::{checksum, decode_int, validate_path, Ack, Token};
use crate::serial::{Result, SerialError, Session};

/// Largest payload a cart is trusted to announce. Anything bigger is a
/// corrupt length field.
pub const MAX_FILE_LENGTH: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFetch {
    Found(Vec<u8>),
    NotFound,
    StorageUnavailable,
}

/// Reads a whole file off the cart.
///
/// `GetFile` → ack → storage byte → path → ack, then a 4-byte length, a
/// 2-byte checksum and the payload. A `Fail` at the second ack is followed by
/// text saying whether the storage or the file is missing.
pub async fn get_file(session: &mut Session, storage: StorageType, path: &str) -> Result<FileFetch> {
    validate_path(path)?;
    session.clear_buffers()?;
    session.send_token(Token::GetFile).await?;
    session.expect_ack().await?;
    session.send_byte(storage.token()).await?;
    session.send_path(path).await?;

    match session.read_ack().await? {
        Ack::Ack => {}
        Ack::Fail => {
            let window = session.settings().handshake_read();
            let detail = session.read_text_for(window).await.unwrap_or_default();
            session.log_device_bytes(detail.as_bytes());
            return Ok(classify_failure(&detail));
        }
        other => return Err(SerialError::UnexpectedToken(other.value())),
    }

    let limit = session.settings().ack_timeout();
    let length = decode_int(&session.read_exact(4, limit).await?) as usize;
    if length > MAX_FILE_LENGTH {
        return Err(SerialError::ProtocolError(format!(
            "{} announced {} bytes, more than the {} byte limit",
            path, length, MAX_FILE_LENGTH
        )));
    }
    let expected = decode_int(&session.read_exact(2, limit).await?) as u16;

    let limit = session.settings().directory_timeout();
    let payload = session.read_exact(length, limit).await?;
    let actual = checksum(&payload);
    if actual != expected {
        return Err(SerialError::ProtocolError(format!(
            "checksum mismatch for {}: expected 0x{:04X}, got 0x{:04X}",
            path, expected, actual
        )));
    }

    session.log(Level::Debug, format!("Read {} bytes from {} {}", length, storage, path));
    Ok(FileFetch::Found(payload))
}

fn classify_failure(detail: &str) -> FileFetch {
    let detail = detail.to_ascii_lowercase();
    let storage_missing = detail.contains("storage")
        && ["unavailable", "not available", "not present", "not found"]
            .iter()
            .any(|marker| detail.contains(marker));
    if storage_missing {
        FileFetch::StorageUnavailable
    } else {
        FileFetch::NotFound
    }
}
