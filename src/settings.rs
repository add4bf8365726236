use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime tuning for discovery, connection supervision and the wire protocols.
///
/// Defaults match what the cart firmware expects. Hosts usually only override
/// the timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub baud_rate: u32,
    pub health_check_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub handshake_read_ms: u64,
    pub launch_poll_burst_ms: u64,
    pub launch_poll_iterations: u32,
    pub directory_timeout_ms: u64,
    pub duplicate_check_ms: u64,
    pub reconnect_delay_ms: u64,
    pub reconnect_attempts: u32,
    pub transfer_attempts: u32,
    pub retry_backoff_unit_ms: u64,
    pub drain_timeout_ms: u64,
    pub chunk_size: usize,
    pub large_file_threshold: u64,
    pub log_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            health_check_interval_ms: 3000,
            ack_timeout_ms: 500,
            handshake_read_ms: 200,
            launch_poll_burst_ms: 25,
            launch_poll_iterations: 40,
            directory_timeout_ms: 10_000,
            duplicate_check_ms: 500,
            reconnect_delay_ms: 4000,
            reconnect_attempts: 3,
            transfer_attempts: 3,
            retry_backoff_unit_ms: 1000,
            drain_timeout_ms: 50,
            chunk_size: 16 * 1024,
            large_file_threshold: 575_000,
            log_capacity: 256,
        }
    }
}

impl Settings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn handshake_read(&self) -> Duration {
        Duration::from_millis(self.handshake_read_ms)
    }

    pub fn launch_poll_burst(&self) -> Duration {
        Duration::from_millis(self.launch_poll_burst_ms)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn duplicate_check(&self) -> Duration {
        Duration::from_millis(self.duplicate_check_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Back-off before the given (1-based) transfer attempt is retried.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_unit_ms.saturating_mul(attempt as u64))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
