//! Filtered chat subscriptions.

use mcws_client::{ClientConfig, ClientEvent, ClientSession};
use mcws_core::transport::MemoryTransport;
use mcws_server::ServerSession;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn chat_subscribe_roundtrip_and_teardown() {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();
    let mut client = ClientSession::new(client_transport, ClientConfig::default()).unwrap();

    let (chat_tx, mut chat_rx) = tokio::sync::mpsc::unbounded_channel();
    let subscription = server
        .subscribe_chat(
            Some("Steve".into()),
            Some("Alex".into()),
            Some("hello".into()),
            move |chat| {
                let _ = chat_tx.send(chat.clone());
            },
        )
        .unwrap();
    assert_ne!(subscription, Uuid::nil());

    let client_task = tokio::spawn(async move {
        let mut teardowns = Vec::new();
        while let Some(event) = client.recv().await {
            match event {
                ClientEvent::ChatSubscribe(request) => {
                    assert_eq!(request.sender.as_deref(), Some("Steve"));
                    assert_eq!(request.receiver.as_deref(), Some("Alex"));
                    assert_eq!(request.message.as_deref(), Some("hello"));
                    client
                        .send_chat(request.request_id, "Steve", "Alex", "hello", "chat")
                        .unwrap();
                }
                ClientEvent::ChatUnsubscribe { request_id } => {
                    teardowns.push(request_id);
                    if teardowns.len() == 2 {
                        return (client, teardowns);
                    }
                }
                _ => {}
            }
        }
        panic!("client closed early");
    });

    let chat = tokio::time::timeout(Duration::from_secs(5), chat_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.sender.as_deref(), Some("Steve"));
    assert_eq!(chat.receiver.as_deref(), Some("Alex"));
    assert_eq!(chat.chat_message.as_deref(), Some("hello"));
    assert_eq!(chat.chat_type.as_deref(), Some("chat"));
    assert_eq!(chat.frame.request_id, subscription);

    // Single teardown names the subscription; tear-down-all sends the
    // empty form.
    assert!(server.unsubscribe_chat(subscription).unwrap());
    assert!(!server.unsubscribe_chat(subscription).unwrap());
    server.unsubscribe_chat_all().unwrap();

    let (_client, teardowns) = client_task.await.unwrap();
    assert_eq!(teardowns, vec![Some(subscription), None]);
}

#[tokio::test]
async fn chat_responder_survives_multiple_messages() {
    let (server_transport, client_transport) = MemoryTransport::pair();
    let server = ServerSession::new(server_transport).unwrap();
    let mut client = ClientSession::new(client_transport, ClientConfig::default()).unwrap();

    let (chat_tx, mut chat_rx) = tokio::sync::mpsc::unbounded_channel();
    server
        .subscribe_chat(None, None, None, move |chat| {
            let _ = chat_tx.send(chat.chat_message.clone());
        })
        .unwrap();

    let client_task = tokio::spawn(async move {
        while let Some(event) = client.recv().await {
            if let ClientEvent::ChatSubscribe(request) = event {
                for text in ["one", "two", "three"] {
                    client
                        .send_chat(request.request_id, "Steve", "Alex", text, "chat")
                        .unwrap();
                }
                return client;
            }
        }
        panic!("client closed early");
    });

    for expected in ["one", "two", "three"] {
        let received = tokio::time::timeout(Duration::from_secs(5), chat_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.as_deref(), Some(expected));
    }
    let _client = client_task.await.unwrap();
}
