use log::Level;
use serde::Serialize;

use crate::serial::token::{is_busy_response, is_cart_response, Token};
use crate::serial::{Result, Session};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingResult {
    /// The reply carried the cart signature.
    pub responded: bool,
    pub busy: bool,
    pub response: String,
}

pub async fn ping(session: &mut Session) -> Result<PingResult> {
    session.clear_buffers()?;
    session.send_token(Token::Ping).await?;
    let window = session.settings().handshake_read();
    let response = session.read_text_for(window).await?;
    session.log_device_bytes(response.as_bytes());

    let result = PingResult {
        responded: is_cart_response(&response),
        busy: is_busy_response(&response),
        response,
    };
    if !result.responded {
        session.log(Level::Warn, "Ping went unanswered");
    }
    Ok(result)
}

pub async fn reset(session: &mut Session) -> Result<()> {
    session.clear_buffers()?;
    session.send_token(Token::Reset).await?;
    let window = session.settings().handshake_read();
    let response = session.read_for(window).await?;
    session.log_device_bytes(&response);
    session.log(Level::Info, "Reset sent");
    Ok(())
}
