//! Log-line notifications for hosts that display cart activity.
//!
//! Everything is also forwarded to the `log` facade, so a host that only
//! installs a logger still sees the same narration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::Level;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogSource {
    /// Narration produced by this crate.
    Internal,
    /// Text echoed by the cart itself.
    Device,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub level: Level,
    pub device_id: Option<String>,
    pub source: LogSource,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Sending half of the log-line channel. Cheap to clone, never blocks.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: Option<mpsc::Sender<LogLine>>,
    dropped: Arc<AtomicU64>,
}

impl LogSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LogLine>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// A sink that only forwards to the `log` facade.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn internal(&self, level: Level, device_id: Option<&str>, message: impl Into<String>) {
        self.emit(level, LogSource::Internal, device_id, message.into());
    }

    pub fn device(&self, device_id: Option<&str>, message: impl Into<String>) {
        self.emit(Level::Info, LogSource::Device, device_id, message.into());
    }

    /// Number of lines discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn emit(&self, level: Level, source: LogSource, device_id: Option<&str>, message: String) {
        let target = match source {
            LogSource::Internal => "cartlink",
            LogSource::Device => "cartlink::device",
        };
        match device_id {
            Some(id) => log::log!(target: target, level, "[{}] {}", id, message),
            None => log::log!(target: target, level, "{}", message),
        }

        let Some(tx) = &self.tx else { return };
        let line = LogLine {
            level,
            device_id: device_id.map(str::to_string),
            source,
            message,
            timestamp: Utc::now(),
        };
        match tx.try_send(line) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_carry_source_and_device() {
        let (sink, mut rx) = LogSink::channel(4);
        sink.device(Some("ABCDEFGH"), "Loading IO handler: TeensyROM");

        let line = rx.recv().await.unwrap();
        assert_eq!(line.source, LogSource::Device);
        assert_eq!(line.device_id.as_deref(), Some("ABCDEFGH"));
        assert_eq!(line.level, Level::Info);
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (sink, _rx) = LogSink::channel(1);
        sink.internal(Level::Info, None, "first");
        sink.internal(Level::Info, None, "second");
        sink.internal(Level::Warn, None, "third");

        assert_eq!(sink.dropped(), 2);
    }
}
