//! Public types for the centrifuge-client crate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::protocol::{ClientInfo, Publication, StreamPosition};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(20);
pub(crate) const DEFAULT_MAX_SERVER_PING_DELAY: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_PRIVATE_CHANNEL_PREFIX: &str = "$";
pub(crate) const DEFAULT_NAME: &str = "rust";

// ---------------------------------------------------------------------------
// Token callbacks
// ---------------------------------------------------------------------------

/// A future that resolves to a fresh token.
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, BoxError>> + Send>>;

/// A boxed error type for token callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Callback producing a connection token for refresh.
pub type GetToken = Box<dyn Fn() -> TokenFuture + Send + Sync>;

/// Callback producing a subscription token for a private channel.
pub type GetSubscriptionToken = Box<dyn Fn(SubscriptionTokenRequest) -> TokenFuture + Send + Sync>;

/// Context handed to [`ClientConfig::get_subscription_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTokenRequest {
    /// Client id assigned by the server for the current connection.
    pub client_id: String,
    pub channel: String,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for [`Client`](crate::Client).
pub struct ClientConfig {
    /// How long a command waits for its reply, and how long a call made
    /// while disconnected waits for the connection.
    pub timeout: Duration,
    /// Base of the reconnect backoff.
    pub min_reconnect_delay: Duration,
    /// Upper bound of the reconnect backoff.
    pub max_reconnect_delay: Duration,
    /// Grace period on top of the server's declared ping interval.
    pub max_server_ping_delay: Duration,
    /// Extra headers sent with the transport handshake.
    pub headers: HashMap<String, String>,
    /// Skip TLS certificate verification. Testing only.
    pub tls_skip_verify: bool,
    /// Client name reported in the connect command.
    pub name: String,
    /// Client version reported in the connect command.
    pub version: String,
    /// Initial connection token.
    pub token: Option<String>,
    /// Opaque payload sent with the connect command.
    pub data: Option<Value>,
    /// Channels with this prefix request a token via `get_subscription_token`.
    pub private_channel_prefix: String,
    /// Called when the connection token must be refreshed.
    pub get_token: Option<GetToken>,
    /// Called before subscribing to a private channel.
    pub get_subscription_token: Option<GetSubscriptionToken>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            min_reconnect_delay: DEFAULT_MIN_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            max_server_ping_delay: DEFAULT_MAX_SERVER_PING_DELAY,
            headers: HashMap::new(),
            tls_skip_verify: false,
            name: DEFAULT_NAME.to_string(),
            version: String::new(),
            token: None,
            data: None,
            private_channel_prefix: DEFAULT_PRIVATE_CHANNEL_PREFIX.to_string(),
            get_token: None,
            get_subscription_token: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be positive".into()));
        }
        if self.max_reconnect_delay < self.min_reconnect_delay {
            return Err(Error::Config(format!(
                "max_reconnect_delay ({:?}) is below min_reconnect_delay ({:?})",
                self.max_reconnect_delay, self.min_reconnect_delay
            )));
        }
        Ok(())
    }

    pub(crate) fn is_private_channel(&self, channel: &str) -> bool {
        !self.private_channel_prefix.is_empty() && channel.starts_with(&self.private_channel_prefix)
    }
}

/// Configuration for a single channel subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionConfig {
    /// Token used instead of asking `get_subscription_token`.
    pub token: Option<String>,
    /// Opaque payload sent with the subscribe command.
    pub data: Option<Value>,
    /// Stream position to recover from on the first subscribe.
    pub since: Option<StreamPosition>,
}

/// Options for history requests.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    pub limit: Option<i32>,
    pub since: Option<StreamPosition>,
    pub reverse: bool,
}

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClientState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Terminal; only reached when the session task has exited.
    Failed,
}

/// Per-channel subscription state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Events emitted to the owner of a [`Client`](crate::Client).
#[derive(Debug)]
pub enum ClientEvent {
    Connecting {
        code: u32,
        reason: String,
    },
    Connected {
        client_id: String,
    },
    Disconnected {
        code: u32,
        reason: String,
        reconnect: bool,
    },
    Error(Error),
    /// Asynchronous message sent by the server with no channel.
    Message {
        data: Value,
    },
    ServerSubscribed {
        channel: String,
        resubscribe: bool,
        recovered: bool,
    },
    ServerUnsubscribed {
        channel: String,
    },
    ServerPublication {
        channel: String,
        publication: Publication,
    },
    ServerJoin {
        channel: String,
        info: ClientInfo,
    },
    ServerLeave {
        channel: String,
        info: ClientInfo,
    },
}

/// Events emitted by a [`Subscription`](crate::Subscription).
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Subscribing,
    Subscribed { resubscribe: bool, recovered: bool },
    SubscribeError { code: u32, message: String },
    Unsubscribed,
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
}

/// Ordered event stream. Events are buffered without bound so a slow
/// consumer never stalls protocol processing.
#[derive(Debug)]
pub struct Events<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Events<E> {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<E>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next event. Returns `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Client-side error codes, reported in subscribe-error events for
/// failures that did not come from the server.
pub mod client_error_code {
    pub const TIMEOUT: u32 = 1;
    pub const TRANSPORT: u32 = 2;
    pub const CLIENT_DISCONNECTED: u32 = 3;
    /// Same value as the refresh-error disconnect code.
    pub const CONNECTION_TOKEN: u32 = 7;
    pub const SUBSCRIPTION_TOKEN: u32 = 8;
    pub const BAD_PROTOCOL: u32 = 12;
    pub const OTHER: u32 = 99;
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("timeout")]
    Timeout,

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("subscription to channel {0} already exists")]
    DuplicateSubscription(String),

    #[error("subscription is unsubscribed")]
    SubscriptionUnsubscribed,

    #[error("subscription failed: code={code}, {message}")]
    SubscriptionFailed { code: u32, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("server error: code={code}, {message}")]
    Reply { code: u32, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encode error: {0}")]
    Encode(serde_json::Error),

    #[error("decode error: {0}")]
    Decode(serde_json::Error),

    /// `get_token` failed or timed out.
    #[error("token fetch failed: {0}")]
    TokenFetch(BoxError),

    /// `get_subscription_token` failed or timed out.
    #[error("subscription token fetch failed: {0}")]
    SubscriptionToken(BoxError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl Error {
    /// Numeric code for this error: the server's code for replies, a
    /// [`client_error_code`] otherwise.
    pub fn code(&self) -> u32 {
        match self {
            Error::Reply { code, .. } | Error::SubscriptionFailed { code, .. } => *code,
            Error::Timeout => client_error_code::TIMEOUT,
            Error::Transport(_) | Error::WebSocket(_) => client_error_code::TRANSPORT,
            Error::ClientDisconnected => client_error_code::CLIENT_DISCONNECTED,
            Error::TokenFetch(_) => client_error_code::CONNECTION_TOKEN,
            Error::SubscriptionToken(_) => client_error_code::SUBSCRIPTION_TOKEN,
            Error::Protocol(_) | Error::Decode(_) => client_error_code::BAD_PROTOCOL,
            Error::DuplicateSubscription(_)
            | Error::SubscriptionUnsubscribed
            | Error::Encode(_)
            | Error::Config(_)
            | Error::Url(_) => client_error_code::OTHER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(20));
        assert_eq!(config.private_channel_prefix, "$");
    }

    #[test]
    fn config_rejects_inverted_delays() {
        let config = ClientConfig {
            min_reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let config = ClientConfig {
            timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn private_channel_detection() {
        let mut config = ClientConfig::default();
        assert!(config.is_private_channel("$secret"));
        assert!(!config.is_private_channel("public"));
        config.private_channel_prefix.clear();
        assert!(!config.is_private_channel("$secret"));
    }

    #[test]
    fn error_codes() {
        let reply = Error::Reply {
            code: 103,
            message: "permission denied".into(),
        };
        assert_eq!(reply.code(), 103);
        assert_eq!(Error::Timeout.code(), client_error_code::TIMEOUT);
        assert_eq!(
            Error::ClientDisconnected.code(),
            client_error_code::CLIENT_DISCONNECTED
        );
    }

    #[test]
    fn token_errors_report_their_source() {
        assert_eq!(Error::TokenFetch("no token".into()).code(), 7);
        assert_eq!(Error::SubscriptionToken("no token".into()).code(), 8);
    }

    #[tokio::test]
    async fn events_preserve_order() {
        let (tx, mut events) = Events::channel();
        for i in 0..3 {
            tx.send(i).unwrap();
        }
        assert_eq!(events.try_next(), Some(0));
        assert_eq!(events.next().await, Some(1));
        assert_eq!(events.next().await, Some(2));
        drop(tx);
        assert_eq!(events.next().await, None);
    }
}
