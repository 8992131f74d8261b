//! Stream session: the read/write loop over one established WebSocket.
//!
//! # Protocol
//! 1. Connect to the stream URL (authenticated upgrade request)
//! 2. Send `authenticate`, then `request-stats` — the stream never replays
//!    history, so every new session starts with an explicit resync
//! 3. Send `new-location` once when a client position is known
//! 4. Read frames until shutdown/close; parsed frames go to the dispatcher
//!
//! Malformed frames are dropped with a warning; the session keeps going.
//! A non-retryable `error` frame for the credential is terminal and
//! surfaces as [`SessionError::AuthRejected`].

use crate::dispatch::EventDispatcher;
use futures_util::{SinkExt, StreamExt};
use mw_protocol::{Authenticate, ClientMessage, GeoPoint, LocationReport, ServerMessage, error_codes};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connect: {0}")]
    Connect(String),
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ConnectionClosed")]
    ConnectionClosed,
    #[error("AuthRejected: {0}")]
    AuthRejected(String),
}

/// Build the WebSocket upgrade request with the Bearer token attached.
///
/// `IntoClientRequest` populates the upgrade headers
/// (`Sec-WebSocket-Key`, `Upgrade`) that a bare `Request::builder()` would
/// miss.
pub fn build_authenticated_request(
    url: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SessionError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url.into_client_request()?;
    let value = format!("Bearer {token}").parse().map_err(
        |e: tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue| {
            SessionError::Connect(format!("invalid auth header: {e}"))
        },
    )?;
    request.headers_mut().insert("Authorization", value);
    Ok(request)
}

/// Everything the session loop needs besides the socket.
pub struct SessionDeps {
    pub dispatcher: EventDispatcher,
    /// Outbound control messages (keep-alive resyncs, manual requests).
    pub commands: mpsc::UnboundedReceiver<ClientMessage>,
    pub shutdown: watch::Receiver<bool>,
}

/// Send the session-opening control messages.
pub async fn open_session<S>(
    ws: &mut S,
    credentials: Authenticate,
    client_position: Option<GeoPoint>,
) -> Result<(), SessionError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    send_client_message(ws, &ClientMessage::Authenticate(credentials)).await?;
    send_client_message(ws, &ClientMessage::RequestStats).await?;
    if let Some(point) = client_position {
        send_client_message(ws, &ClientMessage::NewLocation(LocationReport { point })).await?;
    }
    Ok(())
}

async fn send_client_message<S>(ws: &mut S, msg: &ClientMessage) -> Result<(), SessionError>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    ws.send(Message::Text(serde_json::to_string(msg)?.into()))
        .await?;
    Ok(())
}

/// Run the session until shutdown (Ok) or failure (Err — the connection
/// manager decides whether to retry).
pub async fn run_session_loop<S>(mut ws: S, mut deps: SessionDeps) -> Result<(), SessionError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let mut commands_open = true;
    loop {
        tokio::select! {
            biased;
            result = deps.shutdown.changed() => {
                if result.is_err() || *deps.shutdown.borrow() {
                    break;
                }
            }
            cmd = deps.commands.recv(), if commands_open => {
                match cmd {
                    Some(msg) => send_client_message(&mut ws, &msg).await?,
                    None => commands_open = false,
                }
            }
            msg = ws.next() => {
                match msg {
                    None => return Err(SessionError::ConnectionClosed),
                    Some(Err(e)) => return Err(SessionError::Ws(e)),
                    Some(Ok(Message::Text(t))) => handle_frame(&t, &deps.dispatcher)?,
                    Some(Ok(Message::Close(_))) => return Err(SessionError::ConnectionClosed),
                    Some(Ok(Message::Ping(d))) => { let _ = ws.send(Message::Pong(d)).await; }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    Ok(())
}

fn handle_frame(text: &str, dispatcher: &EventDispatcher) -> Result<(), SessionError> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Error(err)) => {
            if err.code == error_codes::INVALID_TOKEN && !err.retryable {
                return Err(SessionError::AuthRejected(err.message));
            }
            // Server-reported but survivable; the keep-alive resync covers
            // whatever was lost.
            warn!(code = %err.code, retryable = err.retryable, "server error frame");
            Ok(())
        }
        Ok(msg) => {
            debug!(?msg, "frame");
            dispatcher.dispatch_message(msg);
            Ok(())
        }
        Err(e) => {
            // Isolation, not crash: one bad frame never takes the session down.
            warn!(error = %e, "malformed frame dropped");
            Ok(())
        }
    }
}
