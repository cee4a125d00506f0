//! Integration tests for the WebSocket transport: a session talking to a minimal
//! in-process WebSocket server.

use std::time::Duration;

use chat_stream_client::session::CONNECTION_LOST;
use chat_stream_client::{
    BackoffPolicy, ConnectionState, RequestOptions, Role, SessionConfig, SessionController,
    WebSocketConnector,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

fn fast_backoff() -> SessionConfig {
    SessionConfig {
        backoff: BackoffPolicy {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_attempts: 5,
        },
        ..SessionConfig::default()
    }
}

async fn wait_for_log_len(session: &SessionController, len: usize) {
    tokio::time::timeout(
        Duration::from_secs(5),
        session.conversation().wait_for(|log| log.len() >= len),
    )
    .await
    .expect("log did not grow in time")
    .expect("session task running");
}

#[tokio::test]
async fn prompt_round_trip_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = tokio::spawn(async move {
        let (tcp_stream, _) = listener.accept().await.unwrap();
        let ws_stream = accept_async(tcp_stream).await.unwrap();
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(
                r#"{"type":"status","content":"connected","connection_id":"c1"}"#.into(),
            ))
            .await
            .unwrap();

        let request = loop {
            match read.next().await.unwrap().unwrap() {
                Message::Text(text) => break text,
                _ => continue,
            }
        };

        for frame in [
            r#"{"id":"r1","type":"metadata","metadata":{"model":"test"}}"#,
            r#"{"type":"token","content":"Hello"}"#,
            r#"{"type":"token","content":", world"}"#,
            r#"{"type":"complete","metadata":{"tokens":2}}"#,
        ] {
            write.send(Message::Text(frame.into())).await.unwrap();
        }
        // Keep the socket open until the client closes it.
        while let Some(Ok(_)) = read.next().await {}
        request
    });

    let url = format!("ws://127.0.0.1:{}", port);
    let session = SessionController::spawn(SessionConfig::default(), WebSocketConnector::new(url));
    assert_eq!(session.connect().await.unwrap(), ConnectionState::Open);

    session
        .send_prompt("What is the answer?", RequestOptions::default())
        .await
        .unwrap();
    wait_for_log_len(&session, 2).await;

    let log = session.messages();
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[0].content, "What is the answer?");
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[1].id, "r1");
    assert_eq!(log[1].content, "Hello, world");
    assert_eq!(log[1].metadata["model"], "test");
    assert_eq!(log[1].metadata["tokens"], 2);

    session.close().await.unwrap();
    let request = server.await.unwrap();
    let request: serde_json::Value = serde_json::from_str(&request).unwrap();
    assert_eq!(request["type"], "stream_request");
    assert_eq!(request["prompt"], "What is the answer?");
}

#[tokio::test]
async fn server_drop_mid_stream_finalizes_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        // First connection: start a response, then vanish.
        let (tcp_stream, _) = listener.accept().await.unwrap();
        let ws_stream = accept_async(tcp_stream).await.unwrap();
        let (mut write, _read) = ws_stream.split();
        write
            .send(Message::Text(r#"{"type":"metadata"}"#.into()))
            .await
            .unwrap();
        write
            .send(Message::Text(r#"{"type":"token","content":"partial"}"#.into()))
            .await
            .unwrap();
        let _ = write.close().await;

        // Second connection: stay up.
        let (tcp_stream, _) = listener.accept().await.unwrap();
        let ws_stream = accept_async(tcp_stream).await.unwrap();
        let (_write, mut read) = ws_stream.split();
        while let Some(Ok(_)) = read.next().await {}
    });

    let url = format!("ws://127.0.0.1:{}", port);
    let session = SessionController::spawn(fast_backoff(), WebSocketConnector::new(url));
    assert_eq!(session.connect().await.unwrap(), ConnectionState::Open);

    wait_for_log_len(&session, 1).await;
    let log = session.messages();
    assert_eq!(log[0].content, CONNECTION_LOST);
    assert!(!log[0].streaming);

    let mut state = session.connection_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Open),
    )
    .await
    .expect("did not reconnect in time")
    .unwrap();
    assert_eq!(session.reconnect_status().borrow().attempt, 0);
}

#[tokio::test]
async fn absent_server_schedules_reconnect() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("ws://127.0.0.1:{}", port);
    let config = SessionConfig {
        backoff: BackoffPolicy {
            base_delay: Duration::from_secs(5),
            ..BackoffPolicy::default()
        },
        ..SessionConfig::default()
    };
    let session = SessionController::spawn(config, WebSocketConnector::new(url));

    assert_eq!(
        session.connect().await.unwrap(),
        ConnectionState::Disconnected
    );
    let status = session.reconnect_status().borrow().clone();
    assert_eq!(status.attempt, 1);
    assert_eq!(status.next_delay, Some(Duration::from_secs(5)));

    session.close().await.unwrap();
    assert_eq!(session.reconnect_status().borrow().next_delay, None);
}
