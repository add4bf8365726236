//! Discovery, connection supervision and the binary command protocol for
//! serial-attached carts.
//!
//! [`DeviceConnectionManager`] is the entry point: it scans ports, tags each
//! cart with a durable id, keeps one [`SerialStateContext`] per cart and runs
//! launch, transfer and directory operations through a shared
//! [`CommandPipeline`] so only one transaction is on the wire at a time.

pub mod device;
pub mod logging;
pub mod serial;
pub mod settings;

pub use device::{Cart, CartDevice, CartStorage, DeviceConnectionManager, DeviceError};
pub use logging::{LogLine, LogSink, LogSource};
pub use serial::{
    CommandFailure, CommandPipeline, CommandResult, QueuePolicy, SerialError, SerialState,
    SerialStateContext, SystemSerialBackend, TransactionLock,
};
pub use settings::Settings;
