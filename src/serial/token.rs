//! Binary opcodes and integer framing used on the cart link.
//!
//! Multi-byte integers travel least-significant byte first. Every command and
//! acknowledgement is a 2-byte token encoded the same way.

use super::{Result, SerialError};

/// Single byte sent by the scanner to ask a port for its firmware banner.
pub const VERSION_CHECK: u8 = 0x55;

const DEVICE_SIGNATURE: &str = "teensyrom";
const BUSY_MARKER: &str = "busy";

/// True when a handshake or ping reply came from cart firmware.
pub fn is_cart_response(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains(DEVICE_SIGNATURE) || text.contains(BUSY_MARKER)
}

pub fn is_busy_response(text: &str) -> bool {
    text.to_ascii_lowercase().contains(BUSY_MARKER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    Ack,
    Fail,
    Ping,
    Reset,
    LaunchFile,
    SendFile,
    GetFile,
    DeleteFile,
    ListDirectory,
    StartDirectoryList,
    EndDirectoryList,
    RetryLaunch,
    GoodSid,
    BadSid,
}

const ALL_TOKENS: [Token; 14] = [
    Token::Ack,
    Token::Fail,
    Token::Ping,
    Token::Reset,
    Token::LaunchFile,
    Token::SendFile,
    Token::GetFile,
    Token::DeleteFile,
    Token::ListDirectory,
    Token::StartDirectoryList,
    Token::EndDirectoryList,
    Token::RetryLaunch,
    Token::GoodSid,
    Token::BadSid,
];

impl Token {
    pub const fn value(self) -> u16 {
        match self {
            Token::Ack => 0x64CC,
            Token::Fail => 0x9B7F,
            Token::Ping => 0x6455,
            Token::Reset => 0x64EE,
            Token::LaunchFile => 0x6444,
            Token::SendFile => 0x64BB,
            Token::GetFile => 0x64B0,
            Token::DeleteFile => 0x64CF,
            Token::ListDirectory => 0x64DD,
            Token::StartDirectoryList => 0x5A5A,
            Token::EndDirectoryList => 0xA5A5,
            Token::RetryLaunch => 0x9B7E,
            Token::GoodSid => 0x9B81,
            Token::BadSid => 0x9B80,
        }
    }

    pub fn from_value(value: u16) -> Option<Token> {
        ALL_TOKENS.iter().copied().find(|token| token.value() == value)
    }

    pub const fn to_wire(self) -> [u8; 2] {
        self.value().to_le_bytes()
    }
}

/// Classified acknowledgement read after a command step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    Fail,
    RetryLaunch,
    Unknown(u16),
}

impl From<u16> for Ack {
    fn from(value: u16) -> Self {
        match Token::from_value(value) {
            Some(Token::Ack) => Ack::Ack,
            Some(Token::Fail) => Ack::Fail,
            Some(Token::RetryLaunch) => Ack::RetryLaunch,
            _ => Ack::Unknown(value),
        }
    }
}

impl Ack {
    pub fn value(self) -> u16 {
        match self {
            Ack::Ack => Token::Ack.value(),
            Ack::Fail => Token::Fail.value(),
            Ack::RetryLaunch => Token::RetryLaunch.value(),
            Ack::Unknown(value) => value,
        }
    }
}

/// Little-endian encoding of the low `width` bytes of `value`.
pub fn encode_int(value: u32, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width.min(4)].to_vec()
}

pub fn decode_int(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .rev()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

pub fn decode_token(bytes: [u8; 2]) -> u16 {
    u16::from_le_bytes(bytes)
}

/// 16-bit wrapping sum of every byte.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// Cart paths are absolute, ASCII and free of control characters.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(SerialError::Validation("path is empty".to_string()));
    }
    if !path.starts_with('/') {
        return Err(SerialError::Validation(format!("path must start with '/': {}", path)));
    }
    if !path.is_ascii() {
        return Err(SerialError::Validation(format!("path must be ASCII: {}", path)));
    }
    if path.bytes().any(|b| b.is_ascii_control()) {
        return Err(SerialError::Validation(format!(
            "path contains control characters: {:?}",
            path
        )));
    }
    Ok(())
}

/// Validated path followed by the NUL terminator the firmware expects.
pub fn encode_path(path: &str) -> Result<Vec<u8>> {
    validate_path(path)?;
    let mut bytes = Vec::with_capacity(path.len() + 1);
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(0);
    Ok(bytes)
}

/// Every known token found at any byte offset of `bytes`.
pub fn find_tokens(bytes: &[u8]) -> Vec<Token> {
    bytes
        .windows(2)
        .filter_map(|pair| Token::from_value(decode_token([pair[0], pair[1]])))
        .collect()
}

/// The token formed by the last two bytes, if any.
pub fn trailing_token(bytes: &[u8]) -> Option<Token> {
    match bytes {
        [.., a, b] => Token::from_value(decode_token([*a, *b])),
        _ => None,
    }
}
