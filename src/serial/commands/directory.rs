use log::Level;
use tokio::time::Instant;

use crate::serial::protocol::{DirectoryItem, DirectoryListing, DirectoryRequest, FileItem};
use crate::serial::token::{trailing_token, validate_path, Ack, Token};
use crate::serial::{Result, SerialError, Session};

const DIR_OPEN: &str = "[Dir]";
const DIR_CLOSE: &str = "[/Dir]";
const FILE_OPEN: &str = "[File]";
const FILE_CLOSE: &str = "[/File]";

pub async fn list_directory(session: &mut Session, request: &DirectoryRequest) -> Result<DirectoryListing> {
    validate_path(&request.path)?;
    session.clear_buffers()?;
    session.send_token(Token::ListDirectory).await?;
    session.expect_ack().await?;

    session.send_byte(request.storage.token()).await?;
    session.send_byte(request.skip).await?;
    session.send_byte(request.take).await?;
    session.send_path(&request.path).await?;

    let limit = session.settings().ack_timeout();
    let start = session.read_token(limit).await?;
    if start != Token::StartDirectoryList.value() {
        let detail = trailing_text(session).await;
        return Err(match Ack::from(start) {
            Ack::Fail => SerialError::DeviceFailure(format!("directory listing refused: {}", detail)),
            _ => SerialError::ProtocolError(format!(
                "expected start of directory list, got 0x{:04X} {}",
                start, detail
            )),
        });
    }

    let (payload, complete) = receive_listing(session).await?;
    if !complete {
        session.log(
            Level::Warn,
            format!("Directory listing of {} timed out, returning what arrived", request.path),
        );
    }

    let text = String::from_utf8_lossy(&payload);
    let (directories, files) = parse_directory_listing(&text);
    Ok(DirectoryListing {
        path: request.path.clone(),
        directories,
        files,
        complete,
    })
}

/// Collects listing bytes one at a time until the end token, a `Fail`, or
/// the directory timeout. Returns the payload without the trailing token.
async fn receive_listing(session: &mut Session) -> Result<(Vec<u8>, bool)> {
    let deadline = Instant::now() + session.settings().directory_timeout();
    let mut received = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok((received, false));
        }
        match session.read_exact(1, remaining).await {
            Ok(byte) => received.extend_from_slice(&byte),
            Err(SerialError::Timeout) => return Ok((received, false)),
            Err(e) => return Err(e),
        }

        match trailing_token(&received) {
            Some(Token::EndDirectoryList) => {
                received.truncate(received.len() - 2);
                return Ok((received, true));
            }
            Some(Token::Fail) => {
                let detail = trailing_text(session).await;
                return Err(SerialError::DeviceFailure(format!("directory listing failed: {}", detail)));
            }
            _ => {}
        }
    }
}

async fn trailing_text(session: &mut Session) -> String {
    let window = session.settings().handshake_read();
    let text = session.read_text_for(window).await.unwrap_or_default();
    session.log_device_bytes(text.as_bytes());
    text.trim().to_string()
}

fn collapse_slashes(path: &str) -> String {
    let mut collapsed = path.to_string();
    while collapsed.contains("//") {
        collapsed = collapsed.replace("//", "/");
    }
    collapsed
}

fn next_open(text: &str) -> Option<(usize, bool)> {
    match (text.find(DIR_OPEN), text.find(FILE_OPEN)) {
        (Some(d), Some(f)) => Some(if d < f { (d, true) } else { (f, false) }),
        (Some(d), None) => Some((d, true)),
        (None, Some(f)) => Some((f, false)),
        (None, None) => None,
    }
}

/// Extracts every well-formed `[Dir]…[/Dir]` and `[File]…[/File]` record.
///
/// Truncated or malformed records are skipped; the rest still parse.
pub fn parse_directory_listing(text: &str) -> (Vec<DirectoryItem>, Vec<FileItem>) {
    let mut directories = Vec::new();
    let mut files = Vec::new();
    let mut rest = text;

    while let Some((start, is_dir)) = next_open(rest) {
        let (open, close) = if is_dir { (DIR_OPEN, DIR_CLOSE) } else { (FILE_OPEN, FILE_CLOSE) };
        let tail = &rest[start + open.len()..];

        let body_len = match (tail.find(close), next_open(tail).map(|(at, _)| at)) {
            (Some(end), Some(next)) if next < end => {
                log::debug!("Skipping unterminated directory record");
                rest = &tail[next..];
                continue;
            }
            (Some(end), _) => end,
            (None, Some(next)) => {
                log::debug!("Skipping unterminated directory record");
                rest = &tail[next..];
                continue;
            }
            (None, None) => {
                log::debug!("Dropping truncated directory record");
                break;
            }
        };
        let body = &tail[..body_len];
        rest = &tail[body_len + close.len()..];

        if is_dir {
            match serde_json::from_str::<DirectoryItem>(body) {
                Ok(mut item) => {
                    item.path = collapse_slashes(&item.path);
                    directories.push(item);
                }
                Err(e) => log::debug!("Skipping malformed directory record: {}", e),
            }
        } else {
            match serde_json::from_str::<FileItem>(body) {
                Ok(mut item) => {
                    item.path = collapse_slashes(&item.path);
                    files.push(item);
                }
                Err(e) => log::debug!("Skipping malformed file record: {}", e),
            }
        }
    }

    (directories, files)
}
