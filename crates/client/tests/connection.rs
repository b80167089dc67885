//! Integration tests for the push-channel connection manager, driven
//! against a real in-process WebSocket server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use jamroom_client::client::register_push_handlers;
use jamroom_client::{
    Client, ClientConfig, Connection, ConnectionStatus, ReconnectConfig, StatusEvent, Store, Topic,
};

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        base_delay_ms: 10,
    }
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn push_updates_store_and_notifies_subscribers_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"transport","payload":{"isPlaying":true}}"#.into(),
        ))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    let store = Store::new();
    let connection = Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(1), || {
        Some("secret".to_string())
    });
    let _push = register_push_handlers(&connection, &store);

    let notifications = Arc::new(AtomicUsize::new(0));
    let _sub = store.subscribe({
        let notifications = notifications.clone();
        move |_| {
            notifications.fetch_add(1, Ordering::SeqCst);
        }
    });

    connection.connect();
    wait_for("transport push", || store.snapshot().transport.is_playing).await;
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    connection.disconnect();
}

#[tokio::test]
async fn undecodable_frames_are_dropped_without_breaking_the_channel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text("not json at all".into())).await.unwrap();
        ws.send(Message::Text(r#"{"payload":{"stray":1}}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Text(
            r#"{"type":"transport","payload":{"bpm":90.0}}"#.into(),
        ))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    let store = Store::new();
    let connection = Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(1), || {
        Some("secret".to_string())
    });
    let _push = register_push_handlers(&connection, &store);

    let decode_errors = Arc::new(AtomicUsize::new(0));
    let untyped = Arc::new(AtomicUsize::new(0));
    let _err_sub = connection.subscribe(Topic::MessageError, {
        let decode_errors = decode_errors.clone();
        move |_| {
            decode_errors.fetch_add(1, Ordering::SeqCst);
        }
    });
    let _untyped_sub = connection.subscribe(Topic::Untyped, {
        let untyped = untyped.clone();
        move |_| {
            untyped.fetch_add(1, Ordering::SeqCst);
        }
    });

    connection.connect();
    // The good frame after the bad ones still lands.
    wait_for("bpm push", || store.snapshot().transport.bpm == 90.0).await;
    assert_eq!(decode_errors.load(Ordering::SeqCst), 1);
    assert_eq!(untyped.load(Ordering::SeqCst), 1);
    assert_eq!(connection.status(), ConnectionStatus::Connected);

    connection.disconnect();
}

#[tokio::test]
async fn reconnects_after_unexpected_close_and_resets_the_counter() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = accepted.clone();
        async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let sessions = accepted.fetch_add(1, Ordering::SeqCst) + 1;
                let mut ws = accept_async(stream).await.unwrap();
                if sessions == 1 {
                    // Drop the first session without a close frame.
                    continue;
                }
                while ws.next().await.is_some() {}
            }
        }
    });

    let connection = Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(5), || {
        Some("secret".to_string())
    });
    connection.connect();

    wait_for("second session", || accepted.load(Ordering::SeqCst) >= 2).await;
    wait_for("reconnected", || {
        connection.status() == ConnectionStatus::Connected
    })
    .await;
    // A successful open resets the attempt counter.
    assert_eq!(connection.reconnect_attempts(), 0);

    connection.disconnect();
}

#[tokio::test]
async fn explicit_disconnect_suppresses_reconnection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = accepted.clone();
        async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                accepted.fetch_add(1, Ordering::SeqCst);
                let mut ws = accept_async(stream).await.unwrap();
                while ws.next().await.is_some() {}
            }
        }
    });

    let connection = Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(5), || {
        Some("secret".to_string())
    });
    connection.connect();
    wait_for("connected", || {
        connection.status() == ConnectionStatus::Connected
    })
    .await;

    connection.disconnect();
    wait_for("disconnected", || {
        connection.status() == ConnectionStatus::Disconnected
    })
    .await;

    // Long enough for several backoff periods at 10ms base.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn missing_credential_is_fatal_and_never_dials() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    tokio::spawn({
        let accepted = accepted.clone();
        async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                accepted.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        }
    });

    let connection =
        Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(5), || None);

    let events: Arc<Mutex<Vec<StatusEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let _sub = connection.subscribe(Topic::Status, {
        let events = events.clone();
        move |payload| {
            if let Ok(event) = serde_json::from_value::<StatusEvent>(payload.clone()) {
                events.lock().unwrap().push(event);
            }
        }
    });

    connection.connect();
    // The failure is synchronous: no dial is even attempted.
    assert_eq!(connection.status(), ConnectionStatus::Error);
    let recorded = events.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].status, ConnectionStatus::Error);
    assert!(recorded[0].terminal);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gives_up_after_exhausting_reconnect_attempts() {
    // Bind then drop to get a port that refuses connections.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let connection = Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(3), || {
        Some("secret".to_string())
    });

    let events: Arc<Mutex<Vec<StatusEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let _sub = connection.subscribe(Topic::Status, {
        let events = events.clone();
        move |payload| {
            if let Ok(event) = serde_json::from_value::<StatusEvent>(payload.clone()) {
                events.lock().unwrap().push(event);
            }
        }
    });

    connection.connect();
    wait_for("terminal status event", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.terminal && e.status == ConnectionStatus::Disconnected)
    })
    .await;

    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    let recorded = events.lock().unwrap().clone();
    // One failed dial per attempt: the initial connect plus three
    // scheduled reconnects.
    let dial_failures = recorded
        .iter()
        .filter(|e| e.status == ConnectionStatus::Error)
        .count();
    assert_eq!(dial_failures, 4);
    // Reconnect transitions carry their attempt number.
    let attempts: Vec<u32> = recorded.iter().filter_map(|e| e.attempt).collect();
    assert_eq!(attempts, [1, 2, 3]);
}

#[tokio::test]
async fn client_lifecycle_wires_push_into_the_store() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"transport","payload":{"bpm":174.0}}"#.into(),
        ))
        .await
        .unwrap();
        while ws.next().await.is_some() {}
    });

    let mut config = ClientConfig::default();
    config.server_url = format!("http://{addr}");
    config.token = Some("secret".to_string());
    config.reconnect = fast_reconnect(1);

    let client = Client::new(config);
    client.start();
    wait_for("push through the client", || {
        client.store().snapshot().transport.bpm == 174.0
    })
    .await;
    assert!(client.connection().status().is_connected());

    client.stop();
    wait_for("client disconnected", || {
        client.connection().status() == ConnectionStatus::Disconnected
    })
    .await;
    assert!(client.scope().is_closed());
}

#[tokio::test]
async fn send_transmits_only_while_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let _ = frames_tx.send(text.to_string());
            }
        }
    });

    let connection = Connection::new(format!("ws://{addr}/api/ws"), fast_reconnect(1), || {
        Some("secret".to_string())
    });

    // Not connected yet: refused without panicking.
    assert!(!connection.send("chat", serde_json::json!({"body": "early"})));

    connection.connect();
    wait_for("connected", || {
        connection.status() == ConnectionStatus::Connected
    })
    .await;

    assert!(connection.send("chat", serde_json::json!({"body": "hello"})));
    let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .expect("frame within deadline")
        .expect("channel open");
    assert_eq!(
        frame,
        r#"{"type":"chat","payload":{"body":"hello"}}"#
    );

    connection.disconnect();
    wait_for("disconnected", || {
        connection.status() == ConnectionStatus::Disconnected
    })
    .await;
    assert!(!connection.send("chat", serde_json::json!({"body": "late"})));
}
