//! Encryption handshakes in both dialects, end to end and on the wire.

use mcws_client::{ClientConfig, ClientEvent, ClientSession};
use mcws_core::crypto::{self, EncryptionMode};
use mcws_core::frame::Frame;
use mcws_core::purpose::Purpose;
use mcws_core::transport::{MemoryTransport, MessageTransport, WireMessage};
use mcws_core::version::ProtocolVersion;
use mcws_server::ServerSession;
use serde_json::json;
use std::time::Duration;

/// Drives the client side of either handshake dialect, then answers one
/// encrypted command.
async fn game_side(mut client: ClientSession) -> ClientSession {
    let mut encrypted = false;
    while let Some(event) = client.recv().await {
        match event {
            ClientEvent::Command(command) => {
                if command.handle_encryption_handshake().unwrap() {
                    continue;
                }
                assert!(encrypted, "command arrived before encryption");
                assert_eq!(command.command_line, "/say This message is encrypted!");
                command.respond(json!({"echo": true})).unwrap();
                return client;
            }
            ClientEvent::EncryptRequest(request) => {
                assert_eq!(request.mode, "cfb8");
                assert!(!request.public_key.is_empty());
                assert!(!request.salt.is_empty());
                request.accept().unwrap();
            }
            ClientEvent::EncryptionEnabled => {
                encrypted = true;
            }
            _ => {}
        }
    }
    panic!("client closed before the encrypted command");
}

#[tokio::test]
async fn legacy_dialect_round_trip() {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();
    let client = ClientSession::new(client_transport, ClientConfig::default()).unwrap();
    let client_task = tokio::spawn(game_side(client));

    // Session version is below 1.0.0, so the command dialect is used.
    assert!(server.version() < ProtocolVersion::V1_0_0.as_u32());
    let enabled = tokio::time::timeout(Duration::from_secs(5), server.enable_encryption(None))
        .await
        .unwrap()
        .unwrap();
    assert!(enabled);
    assert!(server.session().is_encrypted());

    let response = server
        .command_timeout("/say This message is encrypted!", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"echo": true}));
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn v2_dialect_round_trip() {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let mut server = ServerSession::new(server_transport).unwrap();
    let client = ClientSession::new(
        client_transport,
        ClientConfig {
            version: ProtocolVersion::V1_0_0,
            ..ClientConfig::default()
        },
    )
    .unwrap();

    // The client advertises its version with a frame before the handshake.
    client.send_event("Ready", json!({})).unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), server.recv())
            .await
            .unwrap()
        {
            Some(mcws_server::ServerEvent::Event(_)) => break,
            Some(_) => continue,
            None => panic!("server closed early"),
        }
    }
    assert_eq!(server.version(), ProtocolVersion::V1_0_0.as_u32());

    let client_task = tokio::spawn(game_side(client));

    let enabled = tokio::time::timeout(Duration::from_secs(5), server.enable_encryption(None))
        .await
        .unwrap()
        .unwrap();
    assert!(enabled);

    let response = server
        .command_timeout("/say This message is encrypted!", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(response.body, json!({"echo": true}));
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn second_handshake_reports_false() {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();
    let client = ClientSession::new(client_transport, ClientConfig::default()).unwrap();
    let client_task = tokio::spawn(game_side(client));

    assert!(server.enable_encryption(None).await.unwrap());
    // Monotonic: a second handshake cannot start.
    assert!(!server.enable_encryption(None).await.unwrap());
    assert!(!server
        .enable_encryption_with(Some(EncryptionMode::Cfb), |_| {})
        .unwrap());

    server
        .command_timeout("/say This message is encrypted!", Duration::from_secs(5))
        .await
        .unwrap();
    let _client = client_task.await.unwrap();
}

/// Legacy handshake against a hand-rolled peer, asserting what is actually
/// on the wire: the handshake command shape, and that post-activation
/// traffic is ciphertext that decrypts under `SHA-256(salt ‖ shared)`.
#[tokio::test]
async fn legacy_wire_format_and_ciphertext() {
    let (server_transport, mut far) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();

    let enable = {
        let handle = server.handle().clone();
        tokio::spawn(async move { handle.enable_encryption(None).await })
    };

    // One commandRequest whose line carries the handshake.
    let frame = match tokio::time::timeout(Duration::from_secs(5), far.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        WireMessage::Text(text) => Frame::decode(&text).unwrap(),
        other => panic!("expected plaintext handshake, got {other:?}"),
    };
    assert_eq!(frame.purpose, Purpose::CommandRequest);
    let line = frame.body["commandLine"].as_str().unwrap();
    let args = line.strip_prefix("enableencryption ").unwrap();
    let mut tokens = args.split_whitespace();
    let peer_public: String =
        serde_json::from_str(tokens.next().unwrap()).unwrap();
    let salt: String = serde_json::from_str(tokens.next().unwrap()).unwrap();
    let mode: String = serde_json::from_str(tokens.next().unwrap()).unwrap();
    assert_eq!(mode, "cfb8");

    // Answer like the game would and keep our cipher pair.
    let (own_public, mut pair) =
        crypto::respond(EncryptionMode::Cfb8, &peer_public, &salt).unwrap();
    let response = Frame::response(
        frame.version,
        Purpose::CommandResponse,
        frame.request_id,
        json!({"publicKey": own_public, "statusCode": 0}),
    );
    far.send(WireMessage::Text(response.encode().unwrap()))
        .await
        .unwrap();

    assert!(tokio::time::timeout(Duration::from_secs(5), enable)
        .await
        .unwrap()
        .unwrap()
        .unwrap());

    // The next outbound frame must not contain plaintext JSON, and must
    // decrypt to the exact envelope.
    server
        .send_command("/say This message is encrypted!", |_| {
            mcws_core::session::HandlerOutcome::Consume
        })
        .unwrap();
    let mut bytes = match tokio::time::timeout(Duration::from_secs(5), far.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        WireMessage::Binary(bytes) => bytes,
        WireMessage::Text(text) => panic!("command leaked as plaintext: {text}"),
        other => panic!("unexpected message: {other:?}"),
    };
    assert_ne!(bytes.first(), Some(&b'{'));
    pair.decrypt(&mut bytes);
    let decrypted = Frame::decode(std::str::from_utf8(&bytes).unwrap()).unwrap();
    assert_eq!(
        decrypted.body["commandLine"],
        json!("/say This message is encrypted!")
    );
}

#[tokio::test]
async fn cancelled_v2_request_stays_plaintext() {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();
    let mut client = ClientSession::new(
        client_transport,
        ClientConfig {
            version: ProtocolVersion::V1_0_0,
            ..ClientConfig::default()
        },
    )
    .unwrap();

    client.send_event("Ready", json!({})).unwrap();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            match event {
                ClientEvent::EncryptRequest(request) => {
                    request.cancel();
                }
                ClientEvent::Command(command) => {
                    assert_eq!(command.command_line, "/say still plain");
                    command.respond(json!({})).unwrap();
                    return client;
                }
                _ => {}
            }
        }
        panic!("client closed early");
    });

    let handle = server.handle().clone();
    let enable = tokio::spawn(async move { handle.enable_encryption(None).await });

    // The handshake never resolves; plaintext traffic keeps working.
    server
        .command_timeout("/say still plain", Duration::from_secs(5))
        .await
        .unwrap();
    let client = client_task.await.unwrap();
    assert!(!client.session().is_encrypted());
    assert!(!server.session().is_encrypted());
    enable.abort();
}
