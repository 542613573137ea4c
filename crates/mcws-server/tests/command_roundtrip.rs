//! Command round trips between the two roles over the in-memory transport.

use mcws_client::{ClientConfig, ClientEvent, ClientSession};
use mcws_core::error::CoreError;
use mcws_core::session::HandlerOutcome;
use mcws_core::transport::MemoryTransport;
use mcws_server::{ServerEvent, ServerSession};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn pair() -> (ServerSession, ClientSession) {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();
    let client = ClientSession::new(client_transport, ClientConfig::default()).unwrap();
    (server, client)
}

#[tokio::test]
async fn command_round_trip() {
    let (server, mut client) = pair();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::Command(command) = event {
                assert_eq!(command.command_line, "/say Hi, there!");
                assert_ne!(command.request_id, Uuid::nil());
                assert_eq!(command.frame.body["origin"]["type"], json!("player"));
                command
                    .respond(json!({"message": "Yes! I am here!"}))
                    .unwrap();
                return client;
            }
        }
        panic!("client never saw the command");
    });

    let pending = server.command("/say Hi, there!").unwrap();
    let request_id = pending.request_id();
    let response = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.request_id, request_id);
    assert_eq!(response.body, json!({"message": "Yes! I am here!"}));

    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn token_array_commands_are_joined() {
    let (server, mut client) = pair();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::Command(command) = event {
                command.respond(json!({})).unwrap();
                return (client, command.command_line);
            }
        }
        panic!("client never saw the command");
    });

    server
        .command(vec!["say", "Hi,", "there!"])
        .unwrap()
        .await
        .unwrap();
    let (_client, line) = client_task.await.unwrap();
    assert_eq!(line, "say Hi, there!");
}

#[tokio::test]
async fn responder_runs_exactly_once() {
    let (server, mut client) = pair();
    let calls = Arc::new(AtomicUsize::new(0));

    let client_task = tokio::spawn(async move {
        let mut answered = 0;
        while let Some(event) = client.recv().await {
            if let ClientEvent::Command(command) = event {
                // Answer the same request twice; the responder is one-shot.
                command.respond(json!({"n": 1})).unwrap();
                command.respond(json!({"n": 2})).unwrap();
                answered += 1;
                if answered == 2 {
                    return client;
                }
            }
        }
        panic!("client never saw both commands");
    });

    let counter = calls.clone();
    server
        .send_command("/first", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Consume
        })
        .unwrap();

    // A second command acts as an ordering barrier.
    server
        .command_timeout("/second", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn failed_status_rejects_the_await() {
    let (server, mut client) = pair();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::Command(command) = event {
                command
                    .respond(json!({
                        "statusCode": -2147483648i64,
                        "statusMessage": "Syntax error",
                    }))
                    .unwrap();
                return client;
            }
        }
        panic!("client never saw the command");
    });

    let err = server.command("/bogus").unwrap().await.unwrap_err();
    match err {
        CoreError::CommandFailed {
            status_code,
            status_message,
        } => {
            assert_eq!(status_code, -2147483648);
            assert_eq!(status_message, "Syntax error");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn peer_error_frame_rejects_in_flight_commands() {
    let (mut server, mut client) = pair();

    let pending = server.command("/will-never-finish").unwrap();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::Command(_) = event {
                // Do not answer; raise a protocol error on an unrelated id.
                client
                    .send(&mcws_core::Frame::response(
                        client.version(),
                        mcws_core::Purpose::Error,
                        Uuid::new_v4(),
                        json!({"statusCode": 10001, "statusMessage": "test"}),
                    ))
                    .unwrap();
                return client;
            }
        }
        panic!("client never saw the command");
    });

    let err = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap_err();
    match err {
        CoreError::CommandFailed {
            status_code,
            status_message,
        } => {
            assert_eq!(status_code, 10001);
            assert_eq!(status_message, "test");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The session also surfaces the clientError event.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), server.recv())
            .await
            .unwrap()
        {
            Some(ServerEvent::ClientError {
                status_code,
                status_message,
                ..
            }) => {
                assert_eq!(status_code, 10001);
                assert_eq!(status_message, "test");
                break;
            }
            Some(_) => continue,
            None => panic!("session ended before clientError"),
        }
    }
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn cancelled_command_drops_the_late_response() {
    let (mut server, mut client) = pair();

    let pending = server.command("/slow").unwrap();
    let request_id = pending.request_id();
    pending.cancel();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::Command(command) = event {
                command.respond(json!({"late": true})).unwrap();
                return client;
            }
        }
        panic!("client never saw the command");
    });

    // The late response has no responder left, so it falls through to the
    // fallback channel instead of invoking anything.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), server.recv())
            .await
            .unwrap()
        {
            Some(ServerEvent::CustomFrame(frame)) => {
                assert_eq!(frame.request_id, request_id);
                assert_eq!(frame.body, json!({"late": true}));
                break;
            }
            Some(_) => continue,
            None => panic!("session ended before the late response"),
        }
    }
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn command_timeout_cancels() {
    let (server, mut client) = pair();

    let client_task = tokio::spawn(async move {
        // Swallow the command without answering.
        while let Some(event) = client.recv().await {
            if matches!(event, ClientEvent::Command(_)) {
                return client;
            }
        }
        panic!("client never saw the command");
    });

    let err = server
        .command_timeout("/never", Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout));
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn legacy_command_shape() {
    let (server, mut client) = pair();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::CommandLegacy(command) = event {
                assert_eq!(command.name, "say");
                assert_eq!(command.overload, "default");
                assert_eq!(command.input, json!({"text": "hello"}));
                assert!(!command.handle_encryption_handshake().unwrap());
                command.respond(json!({"statusCode": 0})).unwrap();
                return client;
            }
        }
        panic!("client never saw the legacy command");
    });

    let response = server
        .command_legacy("say", "default", json!({"text": "hello"}))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(response.body["statusCode"], json!(0));
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn agent_command_round_trip() {
    let (server, mut client) = pair();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::AgentAction(action) = event {
                assert_eq!(action.command_line, "agent move forward");
                action
                    .respond_agent_action(json!(1), "move", json!({"result": "ok"}))
                    .unwrap();
                return client;
            }
        }
        panic!("client never saw the agent action");
    });

    let (tx, rx) = tokio::sync::oneshot::channel();
    let mut tx = Some(tx);
    server
        .send_agent_command("agent move forward", move |frame| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(frame.clone());
            }
            HandlerOutcome::Consume
        })
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.extra.action_name.as_deref(), Some("move"));
    assert_eq!(frame.extra.action, Some(json!(1)));
    assert_eq!(frame.body, json!({"result": "ok"}));
    let _client = client_task.await.unwrap();
}

#[tokio::test]
async fn graceful_disconnect_asks_the_game() {
    let (server, mut client) = pair();

    server.disconnect(false).unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
        {
            Some(ClientEvent::Command(command)) => {
                assert_eq!(command.command_line, "closewebsocket");
                break;
            }
            Some(_) => continue,
            None => panic!("client closed before seeing the command"),
        }
    }
}

#[tokio::test]
async fn forced_disconnect_closes_the_socket() {
    let (server, mut client) = pair();

    server.disconnect(true).unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
        {
            Some(ClientEvent::Disconnected) | None => break,
            Some(_) => continue,
        }
    }
}
