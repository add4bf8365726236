use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use log::Level;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

use super::session::Session;
use super::state::SerialStateContext;
use super::SerialError;

/// The single "one transaction at a time" lock.
///
/// Owned by whoever creates the pipelines (normally the connection manager)
/// and shared by every pipeline that must not overlap.
#[derive(Debug, Clone, Default)]
pub struct TransactionLock {
    inner: Arc<Mutex<()>>,
}

impl TransactionLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// What to do when another transaction already holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueuePolicy {
    Queue,
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct CommandFailure {
    pub message: String,
    /// The same request may succeed if retried later.
    pub transient: bool,
}

impl CommandFailure {
    pub fn new(message: impl Into<String>, transient: bool) -> Self {
        Self {
            message: message.into(),
            transient,
        }
    }

    pub fn busy() -> Self {
        Self::new("Another command is already running", true)
    }
}

impl From<SerialError> for CommandFailure {
    fn from(error: SerialError) -> Self {
        let transient = error.is_transient();
        Self::new(error.to_string(), transient)
    }
}

pub type CommandResult<T> = std::result::Result<T, CommandFailure>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "command panicked".to_string()
    }
}

/// A session checked out of a connection. Dropping it hands the connection
/// back, also when the caller drops the command future part way through.
struct Transaction<'a> {
    connection: &'a SerialStateContext,
    session: Session,
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.connection.end_transaction(self.session.is_open());
    }
}

/// Runs protocol transactions one at a time.
///
/// Each run takes the lock, quiets the connection (reader paused, health
/// check stopped, state `Busy`), executes the body, drains trailing output
/// and puts the connection back the way it was, whatever the body did.
#[derive(Debug, Clone, Default)]
pub struct CommandPipeline {
    lock: TransactionLock,
}

impl CommandPipeline {
    pub fn new(lock: TransactionLock) -> Self {
        Self { lock }
    }

    pub fn lock(&self) -> &TransactionLock {
        &self.lock
    }

    async fn acquire(&self, policy: QueuePolicy) -> CommandResult<MutexGuard<'_, ()>> {
        match policy {
            QueuePolicy::Queue => Ok(self.lock.inner.lock().await),
            QueuePolicy::FailFast => self.lock.inner.try_lock().map_err(|_| CommandFailure::busy()),
        }
    }

    pub async fn execute<R, F>(
        &self,
        connection: &SerialStateContext,
        name: &str,
        policy: QueuePolicy,
        body: F,
    ) -> CommandResult<R>
    where
        R: Send,
        F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, Result<R, SerialError>> + Send,
    {
        let _permit = match self.acquire(policy).await {
            Ok(permit) => permit,
            Err(failure) => {
                log::debug!("{} rejected: {}", name, failure);
                return Err(failure);
            }
        };

        let mut transaction = Transaction {
            connection,
            session: connection.begin_transaction().await,
        };
        let session = &mut transaction.session;
        session.log(Level::Info, format!("{} Started", name));
        let started = Instant::now();

        let outcome = AssertUnwindSafe(body(&mut *session)).catch_unwind().await;
        session.drain().await;

        let elapsed = started.elapsed().as_millis();
        match outcome {
            Ok(Ok(value)) => {
                session.log(Level::Info, format!("{} Completed in {}ms (Success)", name, elapsed));
                Ok(value)
            }
            Ok(Err(error)) => {
                let failure = CommandFailure::from(error);
                session.log(
                    Level::Error,
                    format!("{} Completed in {}ms (Failure) => {}", name, elapsed, failure),
                );
                Err(failure)
            }
            Err(payload) => {
                let failure = CommandFailure::new(panic_message(payload.as_ref()), false);
                session.log(
                    Level::Error,
                    format!("{} Completed in {}ms (Failure) => {}", name, elapsed, failure),
                );
                Err(failure)
            }
        }
    }
}
