//! Client for Centrifugo-style real-time messaging servers.
//!
//! Maintains one logical session over a reconnecting transport: command
//! correlation with timeouts, exponential-backoff reconnects, token
//! refresh, server ping monitoring, client-side channel subscriptions with
//! stream recovery, and server-side subscriptions.
//!
//! # Features
//! - JSON protocol over WebSocket (tokio-tungstenite), or any
//!   [`Transport`]/[`Codec`] pair
//! - Automatic resubscribe and publication recovery after reconnects
//! - Token refresh through async callbacks
//! - Optional pause/resume policy for application lifecycle signals
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), centrifuge_client::Error> {
//! use centrifuge_client::{Client, ClientConfig, SubscriptionConfig, SubscriptionEvent};
//!
//! let (client, _events) = Client::websocket(
//!     "ws://localhost:8000/connection/websocket",
//!     ClientConfig::default(),
//! )?;
//! let (sub, mut sub_events) = client.new_subscription("news", SubscriptionConfig::default())?;
//! sub.subscribe();
//! client.connect();
//!
//! while let Some(event) = sub_events.next().await {
//!     match event {
//!         SubscriptionEvent::Publication(p) => println!("got {} at {}", p.data, p.offset),
//!         SubscriptionEvent::Subscribed { recovered, .. } => println!("subscribed, recovered={recovered}"),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod connection;
mod correlator;
mod pause;
pub mod protocol;
mod server_subs;
mod subscription;
mod tls;
mod transport;
mod types;

pub use client::Client;
pub use pause::{PausableClient, PauseState};
pub use protocol::{
    ClientInfo, Codec, HistoryResult, JsonCodec, PresenceResult, PresenceStatsResult, Publication,
    PublishResult, RpcResult, StreamPosition,
};
pub use subscription::Subscription;
pub use transport::{
    CloseInfo, ConnectOptions, Transport, TransportEvent, TransportEvents, WsTransport,
};
pub use types::{
    BoxError, ClientConfig, ClientEvent, ClientState, Error, Events, GetSubscriptionToken,
    GetToken, HistoryOptions, SubscriptionConfig, SubscriptionEvent, SubscriptionState,
    SubscriptionTokenRequest, TokenFuture, client_error_code,
};
