//! Background reader that echoes unsolicited cart output into the log.
//!
//! It holds the port lock only for one short read at a time and parks while a
//! command transaction has paused it, so it never splits a protocol frame.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;

use super::state::Link;
use super::SerialError;

const READ_BURST_MS: u64 = 25;
const IDLE: Duration = Duration::from_millis(100);

pub(crate) async fn read_loop(link: Weak<Link>, mut paused: watch::Receiver<bool>) {
    let mut buffer = [0u8; 512];

    loop {
        if paused.wait_for(|paused| !*paused).await.is_err() {
            break;
        }
        let Some(link) = link.upgrade() else { break };

        let outcome = {
            let mut io = link.io.lock().await;
            if *paused.borrow() || !io.is_open() {
                None
            } else {
                Some(io.read_data(&mut buffer, READ_BURST_MS).await)
            }
        };

        match outcome {
            Some(Ok(count)) => link.log_device_bytes(&buffer[..count]),
            Some(Err(SerialError::Timeout)) => {}
            Some(Err(e)) => {
                log::debug!("Background read stopped: {}", e);
                drop(link);
                tokio::time::sleep(IDLE).await;
            }
            None => {
                drop(link);
                tokio::time::sleep(IDLE).await;
            }
        }
    }
}
