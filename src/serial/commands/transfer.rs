//! Chunked file upload and deletion.
//!
//! Upload: `SendFile` → ack → 4-byte length → 2-byte checksum → storage byte →
//! path → ack → payload in chunks → ack. A file that already exists on the
//! cart is deleted and the copy is retried straight away. Any other failure
//! backs off linearly before the next attempt.

use log::Level;
use serde::Serialize;

use crate::serial::protocol::{FileTransferItem, StorageType};
use crate::serial::token::{validate_path, Token};
use crate::serial::{Result, SerialError, Session};

const FILE_EXISTS_MARKER: &str = "file already exists";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
}

impl TransferReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Copies every item, in order. One file failing never stops the rest.
pub async fn transfer_files(session: &mut Session, files: &[FileTransferItem]) -> Result<TransferReport> {
    let mut report = TransferReport::default();
    session.log(Level::Info, format!("Saving {} file(s) to the cart", files.len()));

    for file in files {
        if copy_with_retries(session, file).await {
            report.successful.push(file.target_path().to_string());
        } else {
            report.failed.push(file.target_path().to_string());
        }
    }

    if report.is_success() {
        session.log(Level::Info, format!("Saved {} file(s)", report.successful.len()));
    } else {
        session.log(
            Level::Error,
            format!("Failed to save {} of {} file(s)", report.failed.len(), files.len()),
        );
    }
    Ok(report)
}

async fn copy_with_retries(session: &mut Session, file: &FileTransferItem) -> bool {
    let attempts = session.settings().transfer_attempts.max(1);

    for attempt in 1..=attempts {
        let error = match send_file(session, file).await {
            Ok(()) => {
                session.log(Level::Info, format!("Saved {}", file.target_path()));
                return true;
            }
            Err(error) => error,
        };

        let text = failure_text(session, &error).await;
        if text.to_ascii_lowercase().contains(FILE_EXISTS_MARKER) {
            session.log(
                Level::Warn,
                format!("{} already exists on the cart, replacing it", file.target_path()),
            );
            if let Err(e) = delete_file(session, file.storage(), file.target_path()).await {
                session.log(Level::Error, format!("Delete of {} failed: {}", file.target_path(), e));
            }
            continue;
        }

        session.log(
            Level::Warn,
            format!(
                "Saving {} failed (attempt {} of {}): {}",
                file.target_path(),
                attempt,
                attempts,
                error
            ),
        );
        if attempt < attempts {
            tokio::time::sleep(session.settings().retry_backoff(attempt)).await;
        }
    }
    false
}

/// Everything the cart said about a failed step, including a consumed token.
async fn failure_text(session: &mut Session, error: &SerialError) -> String {
    let mut text = String::new();
    if let SerialError::UnexpectedToken(value) = error {
        text.push_str(&String::from_utf8_lossy(&value.to_le_bytes()));
    }
    let window = session.settings().duplicate_check();
    if let Ok(bytes) = session.read_for(window).await {
        session.log_device_bytes(&bytes);
        text.push_str(&String::from_utf8_lossy(&bytes));
    }
    text.push(' ');
    text.push_str(&error.to_string());
    text
}

async fn send_file(session: &mut Session, file: &FileTransferItem) -> Result<()> {
    session.clear_buffers()?;
    session.send_token(Token::SendFile).await?;
    session.expect_ack().await?;

    session.send_int(file.stream_length(), 4).await?;
    session.send_int(file.checksum() as u32, 2).await?;
    session.send_byte(file.storage().token()).await?;
    session.send_path(file.target_path()).await?;
    session.expect_ack().await?;

    session.clear_buffers()?;
    let chunk_size = session.settings().chunk_size.max(1);
    for chunk in file.data().chunks(chunk_size) {
        session.send_bytes(chunk).await?;
    }
    session.expect_ack().await
}

pub async fn delete_file(session: &mut Session, storage: StorageType, path: &str) -> Result<()> {
    validate_path(path)?;
    session.clear_buffers()?;
    session.send_token(Token::DeleteFile).await?;
    session.expect_ack().await?;
    session.send_byte(storage.token()).await?;
    session.send_path(path).await?;
    session.expect_ack().await?;
    session.log(Level::Info, format!("Deleted {} from {}", path, storage));
    Ok(())
}
