mod common;

use std::time::Duration;

use cartlink::serial::mock::MockBackend;
use cartlink::serial::SerialError;
use cartlink::{
    CommandFailure, CommandPipeline, CommandResult, LogSink, QueuePolicy, SerialState, TransactionLock,
};

use common::{cart_on, open_connection};

#[tokio::test(start_paused = true)]
async fn test_queued_transactions_never_interleave() {
    common::init_logger();
    let backend = MockBackend::new();
    let device = cart_on(&backend, "COM1");
    let connection = open_connection(&backend, "COM1", LogSink::disabled()).await;
    let pipeline = CommandPipeline::new(TransactionLock::new());
    device.clear_written();

    let (first, second) = tokio::join!(
        pipeline.execute(&connection, "First", QueuePolicy::Queue, |session| {
            Box::pin(async move {
                session.send_bytes(b"A").await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.send_bytes(b"A").await
            })
        }),
        pipeline.execute(&connection, "Second", QueuePolicy::Queue, |session| {
            Box::pin(async move {
                session.send_bytes(b"B").await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
                session.send_bytes(b"B").await
            })
        }),
    );

    assert!(first.is_ok() && second.is_ok());
    let written = device.written();
    assert!(
        written == b"AABB" || written == b"BBAA",
        "Transactions interleaved: {:?}",
        String::from_utf8_lossy(&written)
    );
    assert_eq!(connection.state(), SerialState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_reports_busy_across_connections() {
    let backend = MockBackend::new();
    cart_on(&backend, "COM1");
    cart_on(&backend, "COM2");
    let first = open_connection(&backend, "COM1", LogSink::disabled()).await;
    let second = open_connection(&backend, "COM2", LogSink::disabled()).await;
    let pipeline = CommandPipeline::new(TransactionLock::new());

    let (held, rejected) = tokio::join!(
        pipeline.execute(&first, "Slow", QueuePolicy::Queue, |_session| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, SerialError>(())
            })
        }),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            pipeline
                .execute(&second, "Impatient", QueuePolicy::FailFast, |_session| {
                    Box::pin(async move { Ok::<_, SerialError>(()) })
                })
                .await
        },
    );

    assert!(held.is_ok());
    let failure = rejected.expect_err("Second transaction should be rejected");
    assert_eq!(failure, CommandFailure::busy());
    assert!(failure.transient, "Busy is worth retrying");
    assert!(!pipeline.lock().is_held(), "Lock must be released afterwards");
    assert_eq!(second.state(), SerialState::Connected, "Rejected connection is untouched");
}

#[tokio::test(start_paused = true)]
async fn test_connection_is_busy_during_transaction() {
    let backend = MockBackend::new();
    cart_on(&backend, "COM1");
    let connection = open_connection(&backend, "COM1", LogSink::disabled()).await;
    let pipeline = CommandPipeline::new(TransactionLock::new());
    let state = connection.subscribe_state();

    let observed = pipeline
        .execute(&connection, "Observe", QueuePolicy::Queue, move |_session| {
            Box::pin(async move {
                let current = *state.borrow();
                Ok::<_, SerialError>(current)
            })
        })
        .await;

    assert_eq!(observed, Ok(SerialState::Busy));
    assert_eq!(connection.state(), SerialState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_body_becomes_failure() {
    let backend = MockBackend::new();
    cart_on(&backend, "COM1");
    let connection = open_connection(&backend, "COM1", LogSink::disabled()).await;
    let pipeline = CommandPipeline::new(TransactionLock::new());

    let result: CommandResult<()> = pipeline
        .execute(&connection, "Explode", QueuePolicy::Queue, |session| {
            Box::pin(async move {
                session.send_bytes(b"X").await?;
                if session.is_open() {
                    panic!("command body blew up");
                }
                Ok::<_, SerialError>(())
            })
        })
        .await;

    let failure = result.expect_err("Panic should surface as a failure");
    assert_eq!(failure.message, "command body blew up");
    assert!(!failure.transient);
    assert_eq!(connection.state(), SerialState::Connected);
    assert!(!pipeline.lock().is_held());

    let next = pipeline
        .execute(&connection, "After", QueuePolicy::FailFast, |session| {
            Box::pin(async move { session.send_bytes(b"Y").await })
        })
        .await;
    assert!(next.is_ok(), "Pipeline should keep working after a panic");
}

#[tokio::test(start_paused = true)]
async fn test_transactions_are_narrated() {
    let backend = MockBackend::new();
    cart_on(&backend, "COM1");
    let (logs, mut rx) = LogSink::channel(64);
    let connection = open_connection(&backend, "COM1", logs).await;
    connection.set_device_id("ABCDEFGH");
    let pipeline = CommandPipeline::new(TransactionLock::new());

    let _ = pipeline
        .execute(&connection, "Quick", QueuePolicy::Queue, |_session| {
            Box::pin(async move { Ok::<_, SerialError>(()) })
        })
        .await;
    let _ = pipeline
        .execute(&connection, "Broken", QueuePolicy::Queue, |_session| {
            Box::pin(async move { Err::<(), _>(SerialError::Timeout) })
        })
        .await;

    let mut messages = Vec::new();
    while let Ok(line) = rx.try_recv() {
        if line.device_id.as_deref() == Some("ABCDEFGH") {
            messages.push(line.message);
        }
    }
    assert!(messages.iter().any(|m| m == "Quick Started"));
    assert!(messages
        .iter()
        .any(|m| m.starts_with("Quick Completed in") && m.ends_with("(Success)")));
    assert!(messages
        .iter()
        .any(|m| m.starts_with("Broken Completed in") && m.contains("(Failure) => Communication timeout")));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_transaction_restores_connection() {
    let backend = MockBackend::new();
    let device = cart_on(&backend, "COM1");
    let connection = open_connection(&backend, "COM1", LogSink::disabled()).await;
    let pipeline = CommandPipeline::new(TransactionLock::new());

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        pipeline.execute(&connection, "Stuck", QueuePolicy::Queue, |_session| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SerialError>(())
            })
        }),
    )
    .await;

    assert!(cancelled.is_err(), "Caller gave up on the transaction");
    assert_eq!(connection.state(), SerialState::Connected);
    assert!(!pipeline.lock().is_held());

    device.clear_written();
    let next = pipeline
        .execute(&connection, "After", QueuePolicy::FailFast, |session| {
            Box::pin(async move { session.send_bytes(b"Z").await })
        })
        .await;
    assert!(next.is_ok(), "Pipeline should keep working after a dropped transaction");
    assert_eq!(device.written(), b"Z");
}
