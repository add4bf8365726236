//! File launch.
//!
//! `LaunchFile` → ack → storage byte → path → ack. The second ack may be
//! `RetryLaunch`, in which case the cart is reconnected and the handshake is
//! attempted exactly once more. After a plain `Ack`, songs and games are
//! polled for the cart's verdict; images and hex files are done.

use log::Level;
use serde::Serialize;

use crate::serial::protocol::LaunchRequest;
use crate::serial::token::{find_tokens, validate_path, Ack, Token};
use crate::serial::{Result, Session};

const LOADING_MARKER: &str = "loading io handler:";
const PROGRAM_ERROR_MARKERS: [&str; 2] = ["not enough room", "unsupported hw type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LaunchOutcome {
    Success,
    /// The cart rejected the file for this hardware (bad SID).
    CompatibilityError,
    ProgramError,
    /// The cart refused the launch handshake itself.
    Rejected,
    NoResponse,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchResult {
    pub outcome: LaunchOutcome,
    pub is_success: bool,
    pub error: Option<String>,
}

impl LaunchResult {
    fn success() -> Self {
        Self {
            outcome: LaunchOutcome::Success,
            is_success: true,
            error: None,
        }
    }

    fn failed(outcome: LaunchOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            is_success: false,
            error: Some(message.into()),
        }
    }
}

/// Reads the cart's verdict out of whatever it printed after a launch.
pub fn classify_launch_response(bytes: &[u8]) -> LaunchOutcome {
    for token in find_tokens(bytes) {
        match token {
            Token::GoodSid => return LaunchOutcome::Success,
            Token::BadSid => return LaunchOutcome::CompatibilityError,
            _ => {}
        }
    }

    let text = String::from_utf8_lossy(bytes).to_ascii_lowercase();
    if text.contains(LOADING_MARKER) {
        return LaunchOutcome::Success;
    }
    if PROGRAM_ERROR_MARKERS.iter().any(|marker| text.contains(marker)) {
        return LaunchOutcome::ProgramError;
    }
    LaunchOutcome::NoResponse
}

pub async fn launch(session: &mut Session, request: &LaunchRequest) -> Result<LaunchResult> {
    validate_path(&request.path)?;
    match attempt_launch(session, request).await? {
        Ack::Ack => after_ack(session, request).await,
        Ack::RetryLaunch => {
            session.log(Level::Info, "Cart asked for a launch retry, reconnecting");
            session.reconnect().await?;
            match attempt_launch(session, request).await? {
                Ack::Ack => after_ack(session, request).await,
                other => Ok(rejected(other)),
            }
        }
        other => Ok(rejected(other)),
    }
}

fn rejected(ack: Ack) -> LaunchResult {
    LaunchResult::failed(
        LaunchOutcome::Rejected,
        format!("Failed to launch file (token 0x{:04X})", ack.value()),
    )
}

async fn attempt_launch(session: &mut Session, request: &LaunchRequest) -> Result<Ack> {
    session.clear_buffers()?;
    session.send_token(Token::LaunchFile).await?;
    let ack = session.read_ack().await?;
    if ack != Ack::Ack {
        return Ok(ack);
    }

    session.send_byte(request.storage.token()).await?;
    session.send_path(&request.path).await?;
    session.read_ack().await
}

async fn after_ack(session: &mut Session, request: &LaunchRequest) -> Result<LaunchResult> {
    if !request.kind.awaits_response() {
        return Ok(LaunchResult::success());
    }

    if request.size >= session.settings().large_file_threshold {
        session.log(Level::Info, "Large file launched, the cart will drop off the bus");
        session.reconnect().await?;
        let outcome = poll_launch(session).await?;
        return Ok(verdict(outcome));
    }

    let outcome = poll_launch(session).await?;
    if outcome != LaunchOutcome::Disconnected {
        return Ok(verdict(outcome));
    }

    session.log(Level::Warn, "Connection dropped during launch, reconnecting");
    session.reconnect().await?;
    let outcome = poll_launch(session).await?;
    Ok(verdict(outcome))
}

/// Listens in short bursts until the cart says something conclusive.
async fn poll_launch(session: &mut Session) -> Result<LaunchOutcome> {
    let burst = session.settings().launch_poll_burst();
    let iterations = session.settings().launch_poll_iterations;
    let mut received = Vec::new();

    for _ in 0..iterations {
        match session.read_for(burst).await {
            Ok(bytes) => received.extend_from_slice(&bytes),
            Err(e) if e.is_port_closed() => {
                session.log_device_bytes(&received);
                return Ok(LaunchOutcome::Disconnected);
            }
            Err(e) => return Err(e),
        }

        let outcome = classify_launch_response(&received);
        if outcome != LaunchOutcome::NoResponse {
            session.log_device_bytes(&received);
            return Ok(outcome);
        }
    }

    // A quiet cart is taken as a successful launch.
    session.log_device_bytes(&received);
    Ok(LaunchOutcome::Success)
}

/// Final result of a poll. A cart that drops off the bus again after the
/// reconnect has started the program, so only explicit errors fail.
fn verdict(outcome: LaunchOutcome) -> LaunchResult {
    match outcome {
        LaunchOutcome::Success | LaunchOutcome::NoResponse | LaunchOutcome::Disconnected => {
            LaunchResult::success()
        }
        LaunchOutcome::CompatibilityError => LaunchResult::failed(
            outcome,
            "This SID is not compatible with the cart's hardware",
        ),
        LaunchOutcome::ProgramError => LaunchResult::failed(outcome, "The cart could not start the program"),
        LaunchOutcome::Rejected => LaunchResult::failed(outcome, "Failed to launch file"),
    }
}
