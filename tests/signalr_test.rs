//! SignalR client against a scripted in-process WebSocket hub.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use notification_sync::transport::{ChannelEvent, Connection, TransportError};
use notification_sync::{SignalRTransport, Transport};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const RS: char = '\u{1e}';

type Hub = WebSocketStream<TcpStream>;

/// What the client sent in its upgrade request.
#[derive(Debug, Default, Clone)]
struct Upgrade {
    uri: String,
    authorization: Option<String>,
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/notificationsHub", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener, seen: Arc<Mutex<Upgrade>>) -> Hub {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        *seen.lock().unwrap() = Upgrade {
            uri: req.uri().to_string(),
            authorization: req
                .headers()
                .get("authorization")
                .map(|v| v.to_str().unwrap().to_string()),
        };
        Ok(resp)
    })
    .await
    .unwrap()
}

/// Read one text frame and parse its single record.
async fn read_record(hub: &mut Hub) -> serde_json::Value {
    loop {
        match hub.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let text = text.trim_end_matches(RS);
                return serde_json::from_str(text).unwrap();
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_records(hub: &mut Hub, records: &[serde_json::Value]) {
    let text: String = records.iter().map(|r| format!("{r}{RS}")).collect();
    hub.send(Message::Text(text)).await.unwrap();
}

/// Complete the hub handshake from the server side.
async fn handshake(hub: &mut Hub) {
    let request = read_record(hub).await;
    assert_eq!(request, serde_json::json!({"protocol": "json", "version": 1}));
    send_records(hub, &[serde_json::json!({})]).await;
}

async fn drain(mut hub: Hub) {
    while let Some(Ok(_)) = hub.next().await {}
}

#[tokio::test]
async fn test_join_push_and_server_close() {
    let (listener, url) = listen().await;
    let seen = Arc::new(Mutex::new(Upgrade::default()));

    let server = tokio::spawn({
        let seen = Arc::clone(&seen);
        async move {
            let mut hub = accept(&listener, seen).await;
            handshake(&mut hub).await;

            let join = read_record(&mut hub).await;
            assert_eq!(join["type"], 1);
            assert_eq!(join["target"], "JoinNotificationGroup");
            assert_eq!(join["arguments"], serde_json::json!(["user-1"]));

            // Completion and a push in one frame.
            send_records(
                &mut hub,
                &[
                    serde_json::json!({"type": 3, "invocationId": join["invocationId"], "result": null}),
                    serde_json::json!({
                        "type": 1,
                        "target": "ReceiveNotification",
                        "arguments": ["{\"id\":\"n-1\"}"]
                    }),
                ],
            )
            .await;

            hub.close(None).await.unwrap();
            drain(hub).await;
        }
    });

    let Connection { handle, mut events } =
        SignalRTransport::new().connect(&url, "secret").await.unwrap();

    let result = handle
        .invoke("JoinNotificationGroup", vec![serde_json::json!("user-1")])
        .await
        .unwrap();
    assert_eq!(result, serde_json::Value::Null);

    assert_eq!(
        events.recv().await,
        Some(ChannelEvent::Invocation {
            target: "ReceiveNotification".to_string(),
            arguments: vec![serde_json::json!("{\"id\":\"n-1\"}")],
        })
    );
    assert!(matches!(
        events.recv().await,
        Some(ChannelEvent::Closed { error: Some(_) })
    ));
    assert_eq!(events.recv().await, None);

    server.await.unwrap();
    let upgrade = seen.lock().unwrap().clone();
    assert_eq!(upgrade.uri, "/notificationsHub?access_token=secret");
    assert_eq!(upgrade.authorization.as_deref(), Some("Bearer secret"));
}

#[tokio::test]
async fn test_invocation_error_is_reported() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut hub = accept(&listener, Arc::default()).await;
        handshake(&mut hub).await;
        let join = read_record(&mut hub).await;
        send_records(
            &mut hub,
            &[serde_json::json!({
                "type": 3,
                "invocationId": join["invocationId"],
                "error": "not allowed"
            })],
        )
        .await;
        drain(hub).await;
    });

    let connection = SignalRTransport::new().connect(&url, "secret").await.unwrap();
    let err = connection
        .handle
        .invoke("JoinNotificationGroup", vec![serde_json::json!("user-1")])
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Invoke("not allowed".to_string()));

    connection.handle.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_client_close_sends_close_record() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut hub = accept(&listener, Arc::default()).await;
        handshake(&mut hub).await;
        let close = read_record(&mut hub).await;
        assert_eq!(close, serde_json::json!({"type": 7}));
        drain(hub).await;
    });

    let Connection { handle, mut events } =
        SignalRTransport::new().connect(&url, "secret").await.unwrap();
    handle.close().await;

    assert_eq!(events.recv().await, Some(ChannelEvent::Closed { error: None }));
    assert_eq!(
        handle.invoke("JoinNotificationGroup", Vec::new()).await,
        Err(TransportError::Closed)
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_handshake_error_fails_connect() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut hub = accept(&listener, Arc::default()).await;
        let _ = read_record(&mut hub).await;
        send_records(
            &mut hub,
            &[serde_json::json!({"error": "Requested protocol 'json' is not available."})],
        )
        .await;
        drain(hub).await;
    });

    let err = SignalRTransport::new()
        .connect(&url, "secret")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, TransportError::Handshake(msg) if msg.contains("not available")),
        "{err:?}"
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_upgrade_is_unauthorized() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let rejected = tokio_tungstenite::accept_hdr_async(stream, |_: &Request, _: Response| {
            let mut response = ErrorResponse::new(Some("invalid token".to_string()));
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            Err(response)
        })
        .await;
        assert!(rejected.is_err());
    });

    let err = SignalRTransport::new()
        .connect(&url, "expired")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Unauthorized(_)), "{err:?}");
    server.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_hub_is_connect_error() {
    let (listener, url) = listen().await;
    drop(listener);

    let err = SignalRTransport::new()
        .connect(&url, "secret")
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
}

#[tokio::test]
async fn test_keepalive_pings_at_configured_interval() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut hub = accept(&listener, Arc::default()).await;
        handshake(&mut hub).await;
        let started = tokio::time::Instant::now();
        for _ in 0..2 {
            assert_eq!(read_record(&mut hub).await, serde_json::json!({"type": 6}));
        }
        let elapsed = started.elapsed();
        hub.close(None).await.unwrap();
        drain(hub).await;
        elapsed
    });

    let Connection { handle: _handle, mut events } = SignalRTransport::new()
        .keepalive_interval(Duration::from_millis(50))
        .server_timeout(Duration::from_secs(10))
        .connect(&url, "secret")
        .await
        .unwrap();

    assert!(matches!(
        events.recv().await,
        Some(ChannelEvent::Closed { error: Some(_) })
    ));
    let elapsed = server.await.unwrap();
    assert!(elapsed >= Duration::from_millis(90), "second ping after {elapsed:?}");
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut hub = accept(&listener, Arc::default()).await;
        handshake(&mut hub).await;
        // Read and never answer.
        drain(hub).await;
    });

    let Connection { handle, mut events } = SignalRTransport::new()
        .keepalive_interval(Duration::from_secs(10))
        .server_timeout(Duration::from_millis(200))
        .connect(&url, "secret")
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap();
    assert_eq!(
        closed,
        Some(ChannelEvent::Closed {
            error: Some("server timeout".to_string())
        })
    );
    assert_eq!(
        handle.invoke("JoinNotificationGroup", Vec::new()).await,
        Err(TransportError::Closed)
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_unread_events_do_not_stall_completions() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut hub = accept(&listener, Arc::default()).await;
        handshake(&mut hub).await;
        let join = read_record(&mut hub).await;
        for i in 0..300 {
            send_records(
                &mut hub,
                &[serde_json::json!({
                    "type": 1,
                    "target": "ReceiveNotification",
                    "arguments": [format!("{{\"id\":\"n-{i}\"}}")]
                })],
            )
            .await;
        }
        send_records(
            &mut hub,
            &[serde_json::json!({"type": 3, "invocationId": join["invocationId"], "result": null})],
        )
        .await;
        drain(hub).await;
    });

    let Connection { handle, mut events } = SignalRTransport::new()
        .invoke_timeout(Duration::from_secs(5))
        .connect(&url, "secret")
        .await
        .unwrap();

    // Nothing reads `events` until the join has completed.
    let result = handle
        .invoke("JoinNotificationGroup", vec![serde_json::json!("user-1")])
        .await;
    assert_eq!(result, Ok(serde_json::Value::Null));

    for i in 0..300 {
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Invocation {
                target: "ReceiveNotification".to_string(),
                arguments: vec![serde_json::json!(format!("{{\"id\":\"n-{i}\"}}"))],
            })
        );
    }

    handle.close().await;
    assert_eq!(events.recv().await, Some(ChannelEvent::Closed { error: None }));
    server.await.unwrap();
}
