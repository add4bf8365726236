use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};
use std::time::Duration;

use log::Level;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::interface::{read_for, SerialBackend, SerialPortIO};
use super::reader;
use super::session::Session;
use super::token::{is_busy_response, is_cart_response, Token};
use super::{Result, SerialError};
use crate::logging::LogSink;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialState {
    /// No port selected yet.
    Start,
    /// Port selected but not open.
    Connectable,
    Connected,
    /// A command transaction owns the link.
    Busy,
    ConnectionLost,
}

impl SerialState {
    pub fn can_transition_to(self, next: SerialState) -> bool {
        use SerialState::*;
        matches!(
            (self, next),
            (Start, Connectable)
                | (Connectable, Connected)
                | (Connectable, Busy)
                | (Connected, Connectable)
                | (Connected, Busy)
                | (Connected, ConnectionLost)
                | (Busy, Connected)
                | (Busy, ConnectionLost)
                | (ConnectionLost, Connected)
        )
    }
}

#[derive(Default)]
struct Tasks {
    health: Option<JoinHandle<()>>,
    port_poll: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [self.health.take(), self.port_poll.take(), self.reader.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

fn guard<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between a connection, its background tasks and open sessions.
pub(crate) struct Link {
    pub(crate) io: Arc<Mutex<Box<dyn SerialPortIO>>>,
    pub(crate) backend: Arc<dyn SerialBackend>,
    pub(crate) settings: Settings,
    pub(crate) logs: LogSink,
    pub(crate) reader_paused: watch::Sender<bool>,
    state: watch::Sender<SerialState>,
    ports: watch::Sender<Vec<String>>,
    port: StdMutex<Option<String>>,
    device_id: StdMutex<Option<String>>,
    supervised: AtomicBool,
    tasks: StdMutex<Tasks>,
}

impl Link {
    pub(crate) fn state(&self) -> SerialState {
        *self.state.borrow()
    }

    pub(crate) fn transition_to(&self, next: SerialState) -> bool {
        let mut rejected = None;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                rejected = Some(*current);
                false
            }
        });

        if let Some(from) = rejected {
            self.log(Level::Error, format!("Invalid state transition from {:?} to {:?}", from, next));
            return false;
        }
        if changed {
            log::debug!("{}: state is now {:?}", self.label(), next);
        }
        true
    }

    pub(crate) fn port(&self) -> Option<String> {
        guard(&self.port).clone()
    }

    pub(crate) fn device_id(&self) -> Option<String> {
        guard(&self.device_id).clone()
    }

    pub(crate) fn log(&self, level: Level, message: impl Into<String>) {
        self.logs.internal(level, self.device_id().as_deref(), message);
    }

    pub(crate) fn log_device_bytes(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim();
        if !text.is_empty() {
            self.logs.device(self.device_id().as_deref(), text);
        }
    }

    fn label(&self) -> String {
        self.device_id()
            .or_else(|| self.port())
            .unwrap_or_else(|| "serial".to_string())
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        guard(&self.tasks).abort_all();
    }
}

/// Makes sure the handle is open on a port with a cart behind it.
///
/// The last known port is tried first, then every other enumerable port. A
/// candidate is kept only when it answers a ping with the cart signature.
pub(crate) async fn ensure_connection(
    io: &mut dyn SerialPortIO,
    link: &Link,
    wait: Duration,
) -> Result<String> {
    if io.is_open() {
        if let Some(name) = io.port_name() {
            return Ok(name);
        }
    }

    let mut candidates = link.backend.list_ports()?;
    candidates.sort();
    if let Some(preferred) = link.port() {
        if let Some(position) = candidates.iter().position(|port| *port == preferred) {
            let port = candidates.remove(position);
            candidates.insert(0, port);
        }
    }
    if candidates.is_empty() {
        io.close();
        return Err(SerialError::PortNotFound("no serial ports available".to_string()));
    }

    for port in candidates {
        io.close();
        if let Err(e) = io.open(&port) {
            log::debug!("Unable to open {}: {}", port, e);
            continue;
        }

        let response = match io.send_data(&Token::Ping.to_wire()).await {
            Ok(()) => read_for(io, wait).await.unwrap_or_default(),
            Err(e) => {
                log::debug!("Ping on {} failed: {}", port, e);
                io.close();
                continue;
            }
        };
        let text = String::from_utf8_lossy(&response).to_string();
        if !is_cart_response(&text) {
            log::debug!("No cart answered on {}", port);
            io.close();
            continue;
        }

        link.log_device_bytes(&response);
        let stale = read_for(io, link.settings.drain_timeout()).await.unwrap_or_default();
        link.log_device_bytes(&stale);

        *guard(&link.port) = Some(port.clone());
        if is_busy_response(&text) {
            link.log(Level::Warn, format!("Connected to {} while the cart reports busy", port));
        } else {
            link.log(Level::Info, format!("Connected to {}", port));
        }
        return Ok(port);
    }

    io.close();
    Err(SerialError::ConnectionFailed(format!(
        "no cart answered on any port, retrying in {}ms",
        link.settings.health_check_interval_ms
    )))
}

/// Lifecycle of one serial connection to a cart.
///
/// Owns the handle, the background reader, the port poll and, once opened,
/// the health check. Command transactions borrow the handle through
/// [`Session`] while the connection sits in [`SerialState::Busy`].
pub struct SerialStateContext {
    link: Arc<Link>,
}

impl SerialStateContext {
    /// Must be called from inside a Tokio runtime; background tasks start here.
    pub fn new(backend: Arc<dyn SerialBackend>, settings: Settings, logs: LogSink) -> Self {
        let io = backend.create_port();
        let initial_ports = backend.list_ports().unwrap_or_default();
        let (state, _) = watch::channel(SerialState::Start);
        let (ports, _) = watch::channel(initial_ports);
        let (reader_paused, _) = watch::channel(false);

        let link = Arc::new(Link {
            io: Arc::new(Mutex::new(io)),
            backend,
            settings,
            logs,
            reader_paused,
            state,
            ports,
            port: StdMutex::new(None),
            device_id: StdMutex::new(None),
            supervised: AtomicBool::new(false),
            tasks: StdMutex::new(Tasks::default()),
        });

        {
            let mut tasks = guard(&link.tasks);
            tasks.reader = Some(tokio::spawn(reader::read_loop(
                Arc::downgrade(&link),
                link.reader_paused.subscribe(),
            )));
            tasks.port_poll = Some(tokio::spawn(port_poll_loop(Arc::downgrade(&link))));
        }

        Self { link }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SerialState {
        self.link.state()
    }

    /// Sees every state change from now on.
    pub fn subscribe_state(&self) -> watch::Receiver<SerialState> {
        self.link.state.subscribe()
    }

    /// Ports seen by the most recent enumeration.
    pub fn subscribe_ports(&self) -> watch::Receiver<Vec<String>> {
        self.link.ports.subscribe()
    }

    /// Port selected for this connection. May change when the cart moves.
    pub fn port(&self) -> Option<String> {
        self.link.port()
    }

    pub fn device_id(&self) -> Option<String> {
        self.link.device_id()
    }

    /// Tags log lines from this connection with `device_id`.
    pub fn set_device_id(&self, device_id: &str) {
        *guard(&self.link.device_id) = Some(device_id.to_string());
    }

    /// Moves to `next` if the transition table allows it. Returns whether it did.
    pub fn transition_to(&self, next: SerialState) -> bool {
        self.link.transition_to(next)
    }

    /// Selects the port to open. Leaves `Start` for `Connectable`.
    pub fn set_port(&self, port: &str) -> Result<()> {
        if port.trim().is_empty() {
            return Err(SerialError::Validation("port name is empty".to_string()));
        }
        *guard(&self.link.port) = Some(port.to_string());
        if self.state() == SerialState::Start {
            self.transition_to(SerialState::Connectable);
        }
        self.link.log(Level::Info, format!("Port set to {}", port));
        Ok(())
    }

    /// Opens the selected port and starts supervising it.
    pub async fn open_port(&self) -> Result<String> {
        if self.state() == SerialState::Start {
            return Err(SerialError::ConnectionFailed("set a port before connecting".to_string()));
        }

        let port = {
            let mut io = self.link.io.lock().await;
            ensure_connection(&mut **io, &self.link, self.link.settings.handshake_read()).await?
        };
        self.transition_to(SerialState::Connected);
        self.link.supervised.store(true, Ordering::SeqCst);
        self.start_health_check();
        Ok(port)
    }

    /// Stops supervision and closes the port; the connection stays `Connectable`.
    pub async fn close_port(&self) {
        self.link.supervised.store(false, Ordering::SeqCst);
        self.stop_health_check();
        {
            let mut io = self.link.io.lock().await;
            io.close();
        }
        self.transition_to(SerialState::Connectable);
        self.link.log(Level::Info, "Port closed");
    }

    pub async fn is_open(&self) -> bool {
        self.link.io.lock().await.is_open()
    }

    /// Reopens the port if it is closed, rescanning when the cart moved.
    pub async fn ensure_connection(&self) -> Result<String> {
        let mut io = self.link.io.lock().await;
        ensure_connection(&mut **io, &self.link, self.link.settings.handshake_read()).await
    }

    /// Restarts the periodic liveness check, replacing any running one.
    pub fn start_health_check(&self) {
        let mut tasks = guard(&self.link.tasks);
        if let Some(handle) = tasks.health.take() {
            handle.abort();
        }
        tasks.health = Some(tokio::spawn(health_check_loop(Arc::downgrade(&self.link))));
    }

    pub fn stop_health_check(&self) {
        if let Some(handle) = guard(&self.link.tasks).health.take() {
            handle.abort();
        }
    }

    /// Quiets the link and hands the handle to a command transaction.
    ///
    /// Nothing changes until the handle is ours, so a caller dropped while
    /// waiting leaves the link as it was.
    pub(crate) async fn begin_transaction(&self) -> Session {
        let io = self.link.io.clone().lock_owned().await;
        self.link.reader_paused.send_replace(true);
        self.stop_health_check();
        self.transition_to(SerialState::Busy);
        Session::new(io, self.link.clone())
    }

    /// Undoes [`begin_transaction`](Self::begin_transaction). `open` is
    /// whether the port survived the transaction.
    pub(crate) fn end_transaction(&self, open: bool) {
        if open {
            self.transition_to(SerialState::Connected);
        } else {
            self.transition_to(SerialState::ConnectionLost);
        }
        self.link.reader_paused.send_replace(false);
        if self.link.supervised.load(Ordering::SeqCst) {
            self.start_health_check();
        }
    }

    /// Stops every background task and closes the port.
    pub async fn dispose(&self) {
        self.link.supervised.store(false, Ordering::SeqCst);
        guard(&self.link.tasks).abort_all();
        let mut io = self.link.io.lock().await;
        io.close();
    }
}

async fn health_check_loop(link: Weak<Link>) {
    loop {
        let interval = match link.upgrade() {
            Some(link) => link.settings.health_check_interval(),
            None => break,
        };
        tokio::time::sleep(interval).await;

        let Some(link) = link.upgrade() else { break };
        if link.state() == SerialState::Busy {
            continue;
        }
        let Ok(mut io) = link.io.clone().try_lock_owned() else {
            continue;
        };

        if io.is_open() {
            link.transition_to(SerialState::Connected);
            continue;
        }

        if link.state() != SerialState::ConnectionLost {
            link.log(Level::Warn, "Connection lost, attempting to reconnect");
        }
        link.transition_to(SerialState::ConnectionLost);

        match ensure_connection(&mut **io, &link, link.settings.handshake_read()).await {
            Ok(port) => {
                link.transition_to(SerialState::Connected);
                link.log(Level::Info, format!("Connection restored on {}", port));
            }
            Err(e) => link.log(Level::Error, format!("Reconnect failed: {}", e)),
        }
    }
}

async fn port_poll_loop(link: Weak<Link>) {
    let mut had_ports = match link.upgrade() {
        Some(link) => !link.ports.borrow().is_empty(),
        None => return,
    };

    loop {
        let interval = match link.upgrade() {
            Some(link) => link.settings.health_check_interval(),
            None => break,
        };
        tokio::time::sleep(interval).await;

        let Some(link) = link.upgrade() else { break };
        let ports = match link.backend.list_ports() {
            Ok(ports) => ports,
            Err(e) => {
                log::debug!("Port enumeration failed: {}", e);
                continue;
            }
        };

        if !had_ports && !ports.is_empty() {
            link.log(Level::Info, "Successfully located connectable ports");
        }
        had_ports = !ports.is_empty();
        link.ports.send_if_modified(|current| {
            if *current == ports {
                false
            } else {
                *current = ports;
                true
            }
        });
    }
}
