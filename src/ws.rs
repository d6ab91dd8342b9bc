//! WebSocket plumbing for the hub client.
//!
//! Splits a `tokio-tungstenite` stream into a [`WsWriter`] and a
//! [`WsReader`] so the SignalR I/O task can drive both halves from one
//! `select!` loop. The JSON hub protocol only cares about text, ping and
//! close frames; [`WsReader::recv`] skips everything else.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, http::StatusCode, Message};

type HubSocket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Close code reported when the peer's close frame carried none.
const NO_STATUS_CODE: u16 = 1005;

/// A frame the hub client acts on.
#[derive(Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// Text frame; holds one or more protocol records.
    Text(String),
    /// Ping to be answered with a pong carrying the same payload.
    Ping(Vec<u8>),
    /// The peer closed the socket.
    Close {
        /// Close code (1005 when absent).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl WsMessage {
    /// Map a tungstenite message, or `None` for frames the hub client ignores.
    fn from_frame(message: Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text)),
            Message::Ping(data) => Some(Self::Ping(data)),
            Message::Close(frame) => Some(match frame {
                Some(frame) => Self::Close {
                    code: frame.code.into(),
                    reason: frame.reason.into_owned(),
                },
                None => Self::Close {
                    code: NO_STATUS_CODE,
                    reason: String::new(),
                },
            }),
            Message::Binary(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }
}

/// Outbound half.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<HubSocket, Message>,
}

impl WsWriter {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Fails once the socket is closed or on I/O error.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_owned()))
            .await
            .context("failed to send text frame")
    }

    /// Answer a ping.
    ///
    /// # Errors
    ///
    /// Fails once the socket is closed or on I/O error.
    pub async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Pong(payload))
            .await
            .context("failed to send pong")
    }

    /// Start the closing handshake and flush.
    ///
    /// # Errors
    ///
    /// Fails if the socket was already gone.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("failed to close socket")
    }
}

/// Inbound half.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<HubSocket>,
}

impl WsReader {
    /// Next text, ping or close frame. `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(message) => {
                    if let Some(message) = WsMessage::from_frame(message) {
                        return Some(Ok(message));
                    }
                }
                Err(e) => return Some(Err(anyhow::Error::new(e).context("socket read failed"))),
            }
        }
        None
    }
}

/// Open a socket to `url`, adding `headers` to the upgrade request.
///
/// # Errors
///
/// Fails on a malformed URL or header, a network error, or a refused
/// upgrade. [`is_unauthorized`] tells a refused credential apart.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid socket URL: {url}"))?;
    for &(name, value) in headers {
        request.headers_mut().insert(
            tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name: {name}"))?,
            tungstenite::http::HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?,
        );
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("socket upgrade failed")?;
    let (sink, stream) = socket.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Whether a [`connect`] error is the server refusing the credentials
/// (HTTP 401 or 403 on the upgrade).
#[must_use]
pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<tungstenite::Error>(),
            Some(tungstenite::Error::Http(response))
                if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        )
    })
}

/// Rewrite an `http(s)://` hub URL to `ws(s)://`. Other schemes pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}
