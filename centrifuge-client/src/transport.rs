//! Transport abstraction and the default WebSocket transport.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

use crate::Error;

/// Sender half the session hands to the transport on each connect.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Data(Vec<u8>),
    /// Final event of a connection attempt. `None` when no close frame was
    /// received (I/O error, failed dial, local close).
    Disconnected(Option<CloseInfo>),
}

/// Close frame received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub headers: HashMap<String, String>,
    pub tls_skip_verify: bool,
}

/// Byte transport driven by the session task.
///
/// Every `connect` must be followed, eventually, by exactly one
/// [`TransportEvent::Disconnected`] on the supplied channel, including when
/// the dial fails or `disconnect` is called before the dial completes.
/// Methods must not block.
pub trait Transport: Send + 'static {
    fn connect(&mut self, options: &ConnectOptions, events: TransportEvents);
    fn disconnect(&mut self);
    fn write(&mut self, data: Vec<u8>) -> Result<(), Error>;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

enum SocketCommand {
    Write(Vec<u8>),
    Close,
}

/// WebSocket transport over tokio-tungstenite.
pub struct WsTransport {
    url: String,
    binary: bool,
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
}

impl WsTransport {
    /// Transport for `url` (`ws://` or `wss://`), sending text frames.
    pub fn new(url: &str) -> Result<Self, Error> {
        let parsed = url::Url::parse(url)?;
        match parsed.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported URL scheme {other:?}, expected ws or wss"
                )));
            }
        }
        Ok(Self {
            url: parsed.to_string(),
            binary: false,
            commands: None,
        })
    }

    /// Send binary frames instead of text frames.
    pub fn with_binary_frames(mut self) -> Self {
        self.binary = true;
        self
    }
}

impl Transport for WsTransport {
    fn connect(&mut self, options: &ConnectOptions, events: TransportEvents) {
        self.disconnect();
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(tx);
        tokio::spawn(run_socket(
            self.url.clone(),
            options.clone(),
            self.binary,
            rx,
            events,
        ));
    }

    fn disconnect(&mut self) {
        if let Some(tx) = self.commands.take() {
            // The socket task sends the close frame and exits.
            let _ = tx.send(SocketCommand::Close);
        }
    }

    fn write(&mut self, data: Vec<u8>) -> Result<(), Error> {
        let tx = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::Transport("not connected".into()))?;
        tx.send(SocketCommand::Write(data))
            .map_err(|_| Error::Transport("connection closed".into()))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn run_socket(
    url: String,
    options: ConnectOptions,
    binary: bool,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    events: TransportEvents,
) {
    let close = tokio::select! {
        dialed = dial(&url, &options) => match dialed {
            Ok(ws) => {
                let _ = events.send(TransportEvent::Connected);
                pump(ws, binary, &mut commands, &events).await
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "WebSocket connect failed");
                None
            }
        },
        () = wait_for_close(&mut commands) => {
            tracing::debug!("close requested while dialing");
            None
        }
    };
    let _ = events.send(TransportEvent::Disconnected(close));
}

async fn dial(url: &str, options: &ConnectOptions) -> Result<WsStream, Error> {
    let mut request = url.into_client_request()?;
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid header value for {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    let connector = if options.tls_skip_verify {
        Some(tokio_tungstenite::Connector::Rustls(Arc::new(
            crate::tls::insecure_client_config()?,
        )))
    } else {
        None
    };
    let (ws, _resp) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector).await?;
    Ok(ws)
}

/// Discard writes issued before the socket is open; return on close.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<SocketCommand>) {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            SocketCommand::Write(_) => tracing::debug!("dropping write before connect"),
            SocketCommand::Close => return,
        }
    }
}

async fn pump(
    ws: WsStream,
    binary: bool,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    events: &TransportEvents,
) -> Option<CloseInfo> {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Data(text.as_bytes().to_vec()));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    let _ = events.send(TransportEvent::Data(data.to_vec()));
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    tracing::info!(?frame, "WebSocket closed by server");
                    return frame.map(|f| CloseInfo {
                        code: u16::from(f.code),
                        reason: f.reason.as_str().to_owned(),
                    });
                }
                Some(Ok(_)) => {
                    // Ping/pong frames are answered by tungstenite.
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {e}");
                    return None;
                }
                None => {
                    tracing::info!("WebSocket stream ended");
                    return None;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Write(data)) => {
                    let msg = if binary {
                        tungstenite::Message::Binary(data.into())
                    } else {
                        match String::from_utf8(data) {
                            Ok(text) => tungstenite::Message::Text(text.into()),
                            Err(e) => {
                                tracing::warn!("dropping non-UTF-8 frame on text transport: {e}");
                                continue;
                            }
                        }
                    };
                    if let Err(e) = write.send(msg).await {
                        tracing::warn!("WebSocket write failed: {e}");
                        return None;
                    }
                }
                Some(SocketCommand::Close) | None => {
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    return None;
                }
            }
        }
    }
}
