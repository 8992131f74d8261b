//! End-to-end session tests against an in-process WebSocket server.

use chrono::Utc;
use console::alerts::AlertQueue;
use console::dispatch::{DispatchEvent, EventDispatcher, Topic};
use console::session::{SessionDeps, SessionError, open_session, run_session_loop};
use console::store::ReconciliationStore;
use futures_util::{SinkExt, StreamExt};
use mw_protocol::{Authenticate, ClientMessage, GeoPoint, ServerMessage};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, connect_async};

async fn run_raw_ws_server_once<H, Fut>(handler: H) -> (std::net::SocketAddr, JoinHandle<()>)
where
    H: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = accept_async(stream).await.expect("ws accept");
        handler(ws).await;
    });
    (addr, task)
}

fn credentials() -> Authenticate {
    Authenticate {
        token: "secret-token".to_owned(),
        user: "ops-1".to_owned(),
    }
}

/// Wire a dispatcher the way the binary does: every stream frame lands in
/// the store, qualifying incidents land in the alert queue too.
fn wire(dispatcher: &EventDispatcher, store: &ReconciliationStore, alerts: &AlertQueue) {
    const TOPICS: [Topic; 10] = [
        Topic::Weather,
        Topic::UserStats,
        Topic::TodaysIncidents,
        Topic::Traffic,
        Topic::CriticalIncidents,
        Topic::IncidentLocations,
        Topic::NewAlert,
        Topic::EventLog,
        Topic::Counter,
        Topic::Presence,
    ];
    for topic in TOPICS {
        let store = store.clone();
        dispatcher.subscribe(topic, move |event| {
            if let DispatchEvent::Stream(msg) = event {
                store.apply_stream_message(msg, Utc::now());
            }
        });
    }
    let alerts = alerts.clone();
    dispatcher.subscribe(Topic::NewAlert, move |event| {
        if let DispatchEvent::Stream(msg) = event
            && let ServerMessage::NewAlert(incident) = msg.as_ref()
        {
            alerts.ingest(incident, Utc::now());
        }
    });
}

fn deps(dispatcher: EventDispatcher) -> (SessionDeps, mpsc::UnboundedSender<ClientMessage>, watch::Sender<bool>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    (
        SessionDeps {
            dispatcher,
            commands: command_rx,
            shutdown: shutdown_rx,
        },
        command_tx,
        shutdown_tx,
    )
}

#[tokio::test]
async fn open_session_sends_auth_then_resync_then_location() {
    let (addr, task) = run_raw_ws_server_once(|mut ws| async move {
        let mut kinds = Vec::new();
        for _ in 0..3 {
            let frame = ws.next().await.expect("frame").expect("ws");
            let text = match frame {
                Message::Text(t) => t,
                other => panic!("expected text frame, got {other:?}"),
            };
            let value: serde_json::Value = serde_json::from_str(&text).expect("json");
            kinds.push(value["kind"].as_str().expect("kind").to_owned());
            if value["kind"] == "authenticate" {
                assert_eq!(value["token"], "secret-token");
                assert_eq!(value["user"], "ops-1");
            }
        }
        assert_eq!(kinds, vec!["authenticate", "request-stats", "new-location"]);
    })
    .await;

    let (mut ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    open_session(
        &mut ws,
        credentials(),
        Some(GeoPoint { lat: 51.5, lon: -0.12 }),
    )
    .await
    .expect("open session");

    task.await.expect("server assertions");
}

#[tokio::test]
async fn inbound_frames_reach_store_and_alert_queue_in_order() {
    let (addr, task) = run_raw_ws_server_once(|mut ws| async move {
        let frames = [
            r#"{"kind":"newAlert","id":"7","severity":"low","location":"Dockside"}"#,
            r#"{"kind":"newAlert","id":"7","severity":"high","location":"Dockside"}"#,
            r#"{"kind":"weatherUpdate","reports":[{"location":"Harbor","conditions":"fog"}]}"#,
            r#"{"kind":"amt-users-online","amount":23}"#,
        ];
        for frame in frames {
            ws.send(Message::Text(frame.into())).await.expect("send");
        }
        ws.send(Message::Close(None)).await.ok();
    })
    .await;

    let store = ReconciliationStore::new(Utc::now());
    let alerts = AlertQueue::new(50, Duration::from_secs(3600));
    let dispatcher = EventDispatcher::new();
    wire(&dispatcher, &store, &alerts);

    let (ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    let (session_deps, _command_tx, _shutdown_tx) = deps(dispatcher);
    let result = run_session_loop(ws, session_deps).await;
    assert!(matches!(result, Err(SessionError::ConnectionClosed)));

    // The later event replaced the earlier one — one entry, severity high.
    let incidents = store.incidents();
    assert_eq!(incidents.items.len(), 1);
    assert_eq!(incidents.items["7"].severity, mw_protocol::Severity::High);

    assert!(store.weather().items.contains_key("Harbor"));
    assert_eq!(store.gauges().online_users, 23);

    // Redelivery of the same incident produced exactly one alert.
    assert_eq!(alerts.alerts().len(), 1);
    assert_eq!(alerts.unread_count(), 1);

    task.await.expect("server");
}

#[tokio::test]
async fn malformed_frame_is_skipped_and_session_continues() {
    let (addr, task) = run_raw_ws_server_once(|mut ws| async move {
        ws.send(Message::Text("{definitely not json".into()))
            .await
            .expect("send garbage");
        ws.send(Message::Text(r#"{"kind":"amt-users-online","amount":5}"#.into()))
            .await
            .expect("send valid");
        ws.send(Message::Close(None)).await.ok();
    })
    .await;

    let store = ReconciliationStore::new(Utc::now());
    let alerts = AlertQueue::new(50, Duration::from_secs(3600));
    let dispatcher = EventDispatcher::new();
    wire(&dispatcher, &store, &alerts);

    let (ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    let (session_deps, _command_tx, _shutdown_tx) = deps(dispatcher);
    let _ = run_session_loop(ws, session_deps).await;

    assert_eq!(store.gauges().online_users, 5);
    task.await.expect("server");
}

#[tokio::test]
async fn non_retryable_auth_error_is_terminal() {
    let (addr, task) = run_raw_ws_server_once(|mut ws| async move {
        ws.send(Message::Text(
            r#"{"kind":"error","code":"INVALID_TOKEN","message":"expired","retryable":false}"#
                .into(),
        ))
        .await
        .expect("send error");
        // Keep the socket open; the client must bail on its own.
        let _ = ws.next().await;
    })
    .await;

    let (ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    let (session_deps, _command_tx, _shutdown_tx) = deps(EventDispatcher::new());
    let result = run_session_loop(ws, session_deps).await;
    assert!(matches!(result, Err(SessionError::AuthRejected(m)) if m == "expired"));

    task.await.expect("server");
}

#[tokio::test]
async fn queued_commands_are_written_to_the_socket() {
    let (addr, task) = run_raw_ws_server_once(|mut ws| async move {
        let frame = ws.next().await.expect("frame").expect("ws");
        let text = match frame {
            Message::Text(t) => t,
            other => panic!("expected text, got {other:?}"),
        };
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["kind"], "request-stats");
        ws.send(Message::Close(None)).await.ok();
    })
    .await;

    let (ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    let (session_deps, command_tx, _shutdown_tx) = deps(EventDispatcher::new());
    command_tx.send(ClientMessage::RequestStats).expect("queue");
    let _ = run_session_loop(ws, session_deps).await;

    task.await.expect("server");
}

#[tokio::test]
async fn shutdown_signal_ends_the_session_cleanly() {
    let (addr, task) = run_raw_ws_server_once(|mut ws| async move {
        // Hold the connection open until the client goes away.
        let _ = ws.next().await;
    })
    .await;

    let (ws, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    let (session_deps, _command_tx, shutdown_tx) = deps(EventDispatcher::new());

    let loop_task = tokio::spawn(run_session_loop(ws, session_deps));
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).expect("signal");

    let result = tokio::time::timeout(Duration::from_secs(2), loop_task)
        .await
        .expect("session exits promptly")
        .expect("no panic");
    assert!(result.is_ok(), "clean shutdown is not an error");

    task.await.expect("server");
}
