pub mod commands;
pub mod interface;
pub mod mock;
pub mod pipeline;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod state;
pub mod token;

pub use interface::{SerialBackend, SerialInterface, SerialPortIO, SystemSerialBackend};
pub use pipeline::{CommandFailure, CommandPipeline, CommandResult, QueuePolicy, TransactionLock};
pub use protocol::{
    DirectoryItem, DirectoryListing, DirectoryRequest, FileItem, FileTransferItem, LaunchRequest,
    LaunchableKind, StorageType,
};
pub use session::Session;
pub use state::{SerialState, SerialStateContext};
pub use token::{Ack, Token};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Port is closed")]
    PortClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected token 0x{0:04X}")]
    UnexpectedToken(u16),

    #[error("Device reported failure: {0}")]
    DeviceFailure(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Transport-level failures that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SerialError::PortNotFound(_)
                | SerialError::ConnectionFailed(_)
                | SerialError::Timeout
                | SerialError::PortClosed
                | SerialError::IoError(_)
                | SerialError::SerialportError(_)
        )
    }

    pub fn is_port_closed(&self) -> bool {
        match self {
            SerialError::PortClosed => true,
            SerialError::IoError(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::ConnectionAborted
            ),
            SerialError::SerialportError(e) => e.kind() == serialport::ErrorKind::NoDevice,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
