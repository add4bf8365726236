//! Scripted serial double.
//!
//! A [`MockDevice`] plays the cart side of the link: it records every byte the
//! host writes and answers from two rule sets. Scripted rules fire once, in
//! order, when their trigger shows up in the bytes written since the previous
//! match. Standing rules fire whenever a single write equals their trigger.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::interface::{SerialBackend, SerialPortIO};
use super::token::{Token, VERSION_CHECK};
use super::{Result, SerialError};

#[derive(Debug, Clone)]
pub enum Reply {
    Bytes(Vec<u8>),
    /// Drop off the bus until the host reopens the port. Bytes already sent
    /// can still be read.
    Disconnect,
}

#[derive(Debug)]
struct Rule {
    trigger: Vec<u8>,
    replies: Vec<Reply>,
}

#[derive(Debug)]
struct DeviceState {
    written: Vec<u8>,
    pending: Vec<u8>,
    inbound: VecDeque<u8>,
    script: VecDeque<Rule>,
    standing: Vec<Rule>,
    held: bool,
    attached: bool,
    open_failures: usize,
    opens: usize,
}

impl DeviceState {
    fn apply(&mut self, replies: &[Reply]) {
        for reply in replies {
            match reply {
                Reply::Bytes(bytes) => self.inbound.extend(bytes.iter().copied()),
                Reply::Disconnect => self.attached = false,
            }
        }
    }

    fn on_write(&mut self, data: &[u8]) {
        self.written.extend_from_slice(data);
        self.pending.extend_from_slice(data);

        let scripted = self
            .script
            .front()
            .map(|rule| contains(&self.pending, &rule.trigger))
            .unwrap_or(false);
        if scripted {
            if let Some(rule) = self.script.pop_front() {
                self.pending.clear();
                self.apply(&rule.replies);
            }
            return;
        }

        let standing = self
            .standing
            .iter()
            .find(|rule| rule.trigger.as_slice() == data)
            .map(|rule| rule.replies.clone());
        if let Some(replies) = standing {
            self.pending.clear();
            self.apply(&replies);
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}

fn lock(state: &Mutex<DeviceState>) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cart side of one mock port.
#[derive(Debug, Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// A silent device. Writes are recorded, nothing is answered.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                written: Vec::new(),
                pending: Vec::new(),
                inbound: VecDeque::new(),
                script: VecDeque::new(),
                standing: Vec::new(),
                held: false,
                attached: true,
                open_failures: 0,
                opens: 0,
            })),
        }
    }

    /// A device answering the version check and pings like cart firmware.
    pub fn cart(version: &str) -> Self {
        let device = Self::new();
        device.on(vec![VERSION_CHECK], format!("TeensyROM v{}\r\n", version));
        device.on(Token::Ping.to_wire(), format!("TeensyROM v{} ready\r\n", version));
        device
    }

    /// Standing rule: answer `reply` whenever a write equals `trigger`.
    pub fn on(&self, trigger: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> &Self {
        lock(&self.state).standing.push(Rule {
            trigger: trigger.as_ref().to_vec(),
            replies: vec![Reply::Bytes(reply.as_ref().to_vec())],
        });
        self
    }

    /// Scripted rule: answer `reply` once `trigger` has been written.
    pub fn expect(&self, trigger: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> &Self {
        self.expect_replies(trigger, vec![Reply::Bytes(reply.as_ref().to_vec())])
    }

    pub fn expect_replies(&self, trigger: impl AsRef<[u8]>, replies: Vec<Reply>) -> &Self {
        lock(&self.state).script.push_back(Rule {
            trigger: trigger.as_ref().to_vec(),
            replies,
        });
        self
    }

    /// Bytes the device sends without being asked.
    pub fn push_inbound(&self, bytes: impl AsRef<[u8]>) {
        lock(&self.state).inbound.extend(bytes.as_ref().iter().copied());
    }

    pub fn fail_next_opens(&self, count: usize) {
        lock(&self.state).open_failures = count;
    }

    pub fn disconnect(&self) {
        lock(&self.state).apply(&[Reply::Disconnect]);
    }

    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn count_written(&self, pattern: &[u8]) -> usize {
        let state = lock(&self.state);
        if pattern.is_empty() {
            return 0;
        }
        state
            .written
            .windows(pattern.len())
            .filter(|window| *window == pattern)
            .count()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }

    /// Scripted rules that have not fired yet.
    pub fn pending_script(&self) -> usize {
        lock(&self.state).script.len()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn is_held(&self) -> bool {
        lock(&self.state).held
    }
}

/// Port enumeration over a set of mock devices.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    devices: Arc<Mutex<BTreeMap<String, MockDevice>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, port: &str, device: MockDevice) {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(port.to_string(), device);
    }

    pub fn detach(&self, port: &str) -> Option<MockDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(port)
    }

    fn device(&self, port: &str) -> Option<MockDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(port)
            .cloned()
    }
}

impl SerialBackend for MockBackend {
    fn list_ports(&self) -> Result<Vec<String>> {
        Ok(self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    fn create_port(&self) -> Box<dyn SerialPortIO> {
        Box::new(MockSerialPort {
            backend: self.clone(),
            current: None,
        })
    }
}

/// Host-side handle onto a [`MockDevice`]. Ports are exclusive, like real ones.
pub struct MockSerialPort {
    backend: MockBackend,
    current: Option<(String, MockDevice)>,
}

impl MockSerialPort {
    fn device(&self) -> Result<&MockDevice> {
        self.current
            .as_ref()
            .map(|(_, device)| device)
            .ok_or(SerialError::PortClosed)
    }

    fn take_inbound(device: &MockDevice, buffer: &mut [u8]) -> Result<Option<usize>> {
        let mut state = lock(&device.state);
        if state.inbound.is_empty() {
            return if state.attached {
                Ok(None)
            } else {
                Err(SerialError::PortClosed)
            };
        }
        let count = buffer.len().min(state.inbound.len());
        for (slot, byte) in buffer.iter_mut().zip(state.inbound.drain(..count)) {
            *slot = byte;
        }
        Ok(Some(count))
    }
}

#[async_trait]
impl SerialPortIO for MockSerialPort {
    fn open(&mut self, port_name: &str) -> Result<()> {
        self.close();
        let device = self
            .backend
            .device(port_name)
            .ok_or_else(|| SerialError::PortNotFound(port_name.to_string()))?;

        {
            let mut state = lock(&device.state);
            if state.open_failures > 0 {
                state.open_failures -= 1;
                return Err(SerialError::ConnectionFailed(format!("{}: device not ready", port_name)));
            }
            if state.held {
                return Err(SerialError::ConnectionFailed(format!("{}: access denied", port_name)));
            }
            state.held = true;
            state.attached = true;
            state.opens += 1;
            state.pending.clear();
            state.inbound.clear();
        }

        self.current = Some((port_name.to_string(), device));
        Ok(())
    }

    fn close(&mut self) {
        if let Some((_, device)) = self.current.take() {
            lock(&device.state).held = false;
        }
    }

    fn is_open(&self) -> bool {
        self.current
            .as_ref()
            .map(|(_, device)| lock(&device.state).attached)
            .unwrap_or(false)
    }

    fn port_name(&self) -> Option<String> {
        self.current.as_ref().map(|(name, _)| name.clone())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let device = self.device()?;
        lock(&device.state).inbound.clear();
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let device = self.device()?;
        let mut state = lock(&device.state);
        if !state.attached {
            return Err(SerialError::PortClosed);
        }
        state.on_write(data);
        Ok(())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let device = self.device()?.clone();
        if let Some(count) = Self::take_inbound(&device, buffer)? {
            return Ok(count);
        }
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        match Self::take_inbound(&device, buffer)? {
            Some(count) => Ok(count),
            None => Err(SerialError::Timeout),
        }
    }
}

impl Drop for MockSerialPort {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn scripted_rules_fire_in_order() {
        let backend = MockBackend::new();
        let device = MockDevice::new();
        device.expect(b"one", b"1").expect(b"two", b"2");
        backend.attach("COM1", device.clone());

        let mut port = backend.create_port();
        port.open("COM1").unwrap();
        port.send_data(b"two").await.unwrap();
        port.send_data(b"one").await.unwrap();

        let mut buffer = [0u8; 8];
        let n = port.read_data(&mut buffer, 10).await.unwrap();
        assert_eq!(&buffer[..n], b"1");
        assert_eq!(device.pending_script(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ports_are_exclusive() {
        let backend = MockBackend::new();
        backend.attach("COM1", MockDevice::new());

        let mut first = backend.create_port();
        let mut second = backend.create_port();
        first.open("COM1").unwrap();
        assert!(second.open("COM1").is_err());
        first.close();
        assert!(second.open("COM1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_the_link() {
        let backend = MockBackend::new();
        let device = MockDevice::new();
        backend.attach("COM1", device.clone());

        let mut port = backend.create_port();
        port.open("COM1").unwrap();
        device.disconnect();

        assert!(!port.is_open());
        let mut buffer = [0u8; 4];
        assert!(matches!(port.read_data(&mut buffer, 10).await, Err(SerialError::PortClosed)));
        port.open("COM1").unwrap();
        assert!(port.is_open());
    }
}
