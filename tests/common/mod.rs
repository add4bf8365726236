#![allow(dead_code)]

use std::sync::Arc;

use cartlink::serial::mock::{MockBackend, MockDevice};
use cartlink::serial::token::{checksum, encode_int};
use cartlink::serial::{SerialStateContext, Token};
use cartlink::{LogSink, Settings};

pub const FIRMWARE: &str = "0.6.7";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn settings() -> Settings {
    Settings {
        retry_backoff_unit_ms: 10,
        ..Settings::default()
    }
}

pub fn token(token: Token) -> Vec<u8> {
    token.to_wire().to_vec()
}

pub fn path(path: &str) -> Vec<u8> {
    let mut bytes = path.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

pub fn frame(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

/// Reply to a get-file request: ack, length, checksum, payload.
pub fn file_reply(payload: &[u8]) -> Vec<u8> {
    frame(&[
        &token(Token::Ack),
        &encode_int(payload.len() as u32, 4),
        &encode_int(checksum(payload) as u32, 2),
        payload,
    ])
}

pub fn cart_on(backend: &MockBackend, port: &str) -> MockDevice {
    let device = MockDevice::cart(FIRMWARE);
    backend.attach(port, device.clone());
    device
}

pub async fn open_connection(backend: &Arc<MockBackend>, port: &str, logs: LogSink) -> SerialStateContext {
    let connection = SerialStateContext::new(backend.clone(), settings(), logs);
    connection.set_port(port).expect("valid port");
    connection.open_port().await.expect("cart answers");
    connection
}
