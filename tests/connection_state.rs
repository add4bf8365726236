mod common;

use std::time::Duration;

use cartlink::serial::mock::{MockBackend, MockDevice};
use cartlink::{LogSink, LogSource, SerialState, SerialStateContext};

use common::{cart_on, open_connection, settings};

#[tokio::test(start_paused = true)]
async fn test_lifecycle_follows_transition_table() {
    common::init_logger();
    let backend = MockBackend::new();
    cart_on(&backend, "COM1");

    let connection = SerialStateContext::new(backend.clone(), settings(), LogSink::disabled());
    assert_eq!(connection.state(), SerialState::Start);
    assert!(connection.open_port().await.is_err(), "Opening without a port must fail");

    connection.set_port("COM1").unwrap();
    assert_eq!(connection.state(), SerialState::Connectable);

    let port = connection.open_port().await.unwrap();
    assert_eq!(port, "COM1");
    assert_eq!(connection.state(), SerialState::Connected);
    assert!(connection.is_open().await);

    connection.close_port().await;
    assert_eq!(connection.state(), SerialState::Connectable);
    assert!(!connection.is_open().await);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_transition_keeps_state() {
    let backend = MockBackend::new();
    let connection = SerialStateContext::new(backend.clone(), settings(), LogSink::disabled());

    assert!(!connection.transition_to(SerialState::Busy));
    assert_eq!(connection.state(), SerialState::Start);
}

#[tokio::test(start_paused = true)]
async fn test_open_rescans_when_cart_moved_ports() {
    let backend = MockBackend::new();
    backend.attach("COM1", MockDevice::new());
    cart_on(&backend, "COM2");

    let connection = SerialStateContext::new(backend.clone(), settings(), LogSink::disabled());
    connection.set_port("COM1").unwrap();
    let port = connection.open_port().await.unwrap();

    assert_eq!(port, "COM2", "The silent port must be skipped");
    assert_eq!(connection.port().as_deref(), Some("COM2"));
}

#[tokio::test(start_paused = true)]
async fn test_health_check_recovers_lost_connection() {
    let backend = MockBackend::new();
    let device = cart_on(&backend, "COM1");
    let connection = open_connection(&backend, "COM1", LogSink::disabled()).await;
    assert_eq!(device.opens(), 1);

    device.disconnect();
    device.fail_next_opens(1);

    tokio::time::sleep(Duration::from_millis(3100)).await;
    assert_eq!(connection.state(), SerialState::ConnectionLost);

    // Next tick reopens the port and waits out the handshake.
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(connection.state(), SerialState::Connected);
    assert_eq!(device.opens(), 2, "Recovery reopens the port exactly once");
}

#[tokio::test(start_paused = true)]
async fn test_port_poll_reports_recovery_from_no_ports() {
    let backend = MockBackend::new();
    let (logs, mut rx) = LogSink::channel(32);
    let connection = SerialStateContext::new(backend.clone(), settings(), logs);
    let ports = connection.subscribe_ports();
    assert!(ports.borrow().is_empty());

    cart_on(&backend, "COM7");
    tokio::time::sleep(Duration::from_millis(3100)).await;

    assert_eq!(*ports.borrow(), vec!["COM7".to_string()]);
    let mut recovered = false;
    while let Ok(line) = rx.try_recv() {
        if line.source == LogSource::Internal && line.message.contains("connectable ports") {
            recovered = true;
        }
    }
    assert!(recovered, "Recovery from zero ports should be logged");
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_output_is_logged_as_device_text() {
    let backend = MockBackend::new();
    let device = cart_on(&backend, "COM1");
    let (logs, mut rx) = LogSink::channel(64);
    let _connection = open_connection(&backend, "COM1", logs).await;

    device.push_inbound(b"Hello from the cart\r\n");

    let line = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let line = rx.recv().await.expect("sink open");
            if line.source == LogSource::Device && line.message.contains("Hello from the cart") {
                return line;
            }
        }
    })
    .await
    .expect("Reader should forward device output");
    assert_eq!(line.message, "Hello from the cart");
}
