mod common;

use cartlink::serial::commands;
use cartlink::serial::mock::{MockBackend, MockDevice};
use cartlink::serial::{DirectoryListing, DirectoryRequest, SerialStateContext, StorageType, Token};
use cartlink::{CommandPipeline, CommandResult, LogSink, QueuePolicy, TransactionLock};

use common::{cart_on, frame, open_connection, path, token};

const GAMES: &[u8] = concat!(
    r#"[Dir]{"Name":"demos","Path":"/games//demos"}[/Dir]"#,
    r#"[File]{"Name":"jupiter.prg","Path":"/games/jupiter.prg","Size":15600}[/File]"#,
    r#"[File]{"Name":"elite.crt","Path":"/games/elite.crt","Size":65536}[/File]"#,
)
.as_bytes();

async fn connected_cart() -> (MockDevice, SerialStateContext) {
    let backend = MockBackend::new();
    let device = cart_on(&backend, "COM1");
    let connection = open_connection(&backend, "COM1", LogSink::disabled()).await;
    device.clear_written();
    (device, connection)
}

async fn list(connection: &SerialStateContext, dir: &str) -> CommandResult<DirectoryListing> {
    // 0x55 is the version-check byte, keep `take` clear of it.
    let request = DirectoryRequest::new(StorageType::Sd, dir, 0, 20).expect("valid request");
    run(connection, request).await
}

async fn run(connection: &SerialStateContext, request: DirectoryRequest) -> CommandResult<DirectoryListing> {
    CommandPipeline::new(TransactionLock::new())
        .execute(connection, "GetDirectory", QueuePolicy::Queue, move |session| {
            Box::pin(async move { commands::list_directory(session, &request).await })
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_list_directory() {
    common::init_logger();
    let (device, connection) = connected_cart().await;
    device
        .expect(token(Token::ListDirectory), token(Token::Ack))
        .expect(
            path("/games"),
            frame(&[&token(Token::StartDirectoryList), GAMES, &token(Token::EndDirectoryList)]),
        );

    let listing = list(&connection, "/games").await.unwrap();

    assert!(listing.complete);
    assert_eq!(listing.path, "/games");
    assert_eq!(listing.directories.len(), 1);
    assert_eq!(listing.directories[0].path, "/games/demos", "Doubled slashes are collapsed");
    assert_eq!(listing.files.len(), 2);
    assert_eq!(listing.files[1].name, "elite.crt");
    assert_eq!(listing.files[1].size, 65536);

    assert_eq!(
        device.written(),
        frame(&[
            &token(Token::ListDirectory),
            &[StorageType::Sd.token(), 0, 20],
            &path("/games"),
        ])
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_directory() {
    let (device, connection) = connected_cart().await;
    device
        .expect(token(Token::ListDirectory), token(Token::Ack))
        .expect(
            path("/empty"),
            frame(&[&token(Token::StartDirectoryList), &token(Token::EndDirectoryList)]),
        );

    let listing = list(&connection, "/empty").await.unwrap();

    assert!(listing.complete);
    assert!(listing.directories.is_empty() && listing.files.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refused_listing_is_an_error() {
    let (device, connection) = connected_cart().await;
    device
        .expect(token(Token::ListDirectory), token(Token::Ack))
        .expect(path("/missing"), frame(&[&token(Token::Fail), b"Path not found\r\n"]));

    let failure = list(&connection, "/missing").await.expect_err("Fail token ends the listing");

    assert!(failure.message.contains("Path not found"), "{}", failure.message);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_returns_partial_listing() {
    let (device, connection) = connected_cart().await;
    device
        .expect(token(Token::ListDirectory), token(Token::Ack))
        .expect(
            path("/games"),
            frame(&[
                &token(Token::StartDirectoryList),
                br#"[File]{"Name":"one.prg","Path":"/games/one.prg","Size":1}[/File]"#,
                br#"[File]{"Name":"two.prg","Pa"#,
            ]),
        );

    let listing = list(&connection, "/games").await.unwrap();

    assert!(!listing.complete, "No end token, listing is partial");
    assert_eq!(listing.files.len(), 1);
    assert_eq!(listing.files[0].name, "one.prg");
}

#[tokio::test(start_paused = true)]
async fn test_invalid_path_is_rejected_before_sending() {
    assert!(DirectoryRequest::new(StorageType::Sd, "games", 0, 20).is_err());
    assert!(DirectoryRequest::new(StorageType::Sd, "", 0, 20).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_hand_built_request_is_validated_too() {
    let (device, connection) = connected_cart().await;
    let request = DirectoryRequest {
        storage: StorageType::Sd,
        path: "games".into(),
        skip: 0,
        take: 20,
    };

    let failure = run(&connection, request).await.expect_err("Relative paths are refused");

    assert!(!failure.transient);
    assert!(device.written().is_empty(), "Nothing may be sent for an invalid path");
}

#[tokio::test(start_paused = true)]
async fn test_fail_in_the_middle_of_a_listing() {
    let (device, connection) = connected_cart().await;
    device
        .expect(token(Token::ListDirectory), token(Token::Ack))
        .expect(
            path("/games"),
            frame(&[
                &token(Token::StartDirectoryList),
                br#"[File]{"Name":"one.prg","Path":"/games/one.prg","Size":1}[/File]"#,
                &token(Token::Fail),
                b"SD card removed\r\n",
            ]),
        );

    let failure = list(&connection, "/games").await.expect_err("Fail token aborts the listing");

    assert!(failure.message.contains("directory listing failed"), "{}", failure.message);
    assert!(failure.message.contains("SD card removed"), "{}", failure.message);
}
