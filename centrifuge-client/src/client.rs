//! Public client handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::watch;

use crate::Error;
use crate::connection::{self, Msg, SessionHandle};
use crate::protocol::{
    Codec, HistoryResult, JsonCodec, PresenceResult, PresenceStatsResult, PublishResult,
    RpcResult,
};
use crate::subscription::{Registry, Subscription, SubscriptionInner};
use crate::transport::{Transport, WsTransport};
use crate::types::{
    ClientConfig, ClientEvent, ClientState, Events, HistoryOptions, SubscriptionConfig,
    SubscriptionEvent,
};

/// Handle to a client session. Cheap to clone; the session stops when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Client {
    session: SessionHandle,
    state: watch::Receiver<ClientState>,
    registry: Registry,
    next_subscription_id: Arc<AtomicU64>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client over a custom transport and codec. The client starts
    /// disconnected; call [`connect`](Self::connect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<T, C>(
        config: ClientConfig,
        transport: T,
        codec: C,
    ) -> Result<(Self, Events<ClientEvent>), Error>
    where
        T: Transport,
        C: Codec,
    {
        config.validate()?;
        let registry = Registry::default();
        let (session, state, events) = connection::spawn(
            config,
            Box::new(transport),
            Box::new(codec),
            registry.clone(),
        );
        let client = Self {
            session,
            state,
            registry,
            next_subscription_id: Arc::new(AtomicU64::new(1)),
        };
        Ok((client, events))
    }

    /// Create a client speaking JSON over a WebSocket at `url`.
    pub fn websocket(url: &str, config: ClientConfig) -> Result<(Self, Events<ClientEvent>), Error> {
        Self::new(config, WsTransport::new(url)?, JsonCodec)
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn state_changes(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// Start connecting. No-op while connecting or connected.
    pub fn connect(&self) {
        self.session.post(Msg::Connect);
    }

    /// Close the connection and stop reconnecting. Pending calls fail with
    /// [`Error::ClientDisconnected`].
    pub fn disconnect(&self) {
        self.session.post(Msg::Disconnect);
    }

    /// Reset the backoff, and if a reconnect is waiting, attempt it now.
    pub fn reset_reconnect_state(&self) {
        self.session.post(Msg::ResetReconnect);
    }

    /// Replace the token used by the next connect.
    pub fn set_token(&self, token: impl Into<String>) {
        self.session.post(Msg::SetToken(token.into()));
    }

    /// Store `token` and, if connected, send it to the server now.
    pub fn refresh_token(&self, token: impl Into<String>) {
        self.session.post(Msg::Refresh(token.into()));
    }

    pub async fn publish(&self, channel: &str, data: Value) -> Result<PublishResult, Error> {
        self.session.publish(channel, data).await
    }

    pub async fn rpc(&self, method: &str, data: Value) -> Result<RpcResult, Error> {
        self.session.rpc(method, data).await
    }

    /// Send an asynchronous message to the server. No reply is expected.
    pub async fn send(&self, data: Value) -> Result<(), Error> {
        self.session.send(data).await
    }

    pub async fn presence(&self, channel: &str) -> Result<PresenceResult, Error> {
        self.session.presence(channel).await
    }

    pub async fn presence_stats(&self, channel: &str) -> Result<PresenceStatsResult, Error> {
        self.session.presence_stats(channel).await
    }

    pub async fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> Result<HistoryResult, Error> {
        self.session.history(channel, options).await
    }

    /// Register a subscription to `channel`. It starts unsubscribed; call
    /// [`Subscription::subscribe`].
    pub fn new_subscription(
        &self,
        channel: &str,
        config: SubscriptionConfig,
    ) -> Result<(Subscription, Events<SubscriptionEvent>), Error> {
        if channel.is_empty() {
            return Err(Error::Config("channel must not be empty".into()));
        }
        let (tx, events) = Events::channel();
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(SubscriptionInner::new(
            id,
            channel.to_string(),
            config,
            tx,
            self.session.downgrade(),
        ));
        self.registry.insert(inner.clone())?;
        tracing::debug!(channel, "subscription registered");
        Ok((Subscription::from_inner(inner), events))
    }

    pub fn get_subscription(&self, channel: &str) -> Option<Subscription> {
        self.registry.get(channel).map(Subscription::from_inner)
    }

    /// Unsubscribe `sub` and forget it. No-op if it is not registered with
    /// this client.
    pub fn remove_subscription(&self, sub: &Subscription) {
        if !self.registry.contains(sub.inner()) {
            return;
        }
        self.session.post(Msg::Unsubscribe(sub.inner().clone()));
        self.registry.remove(sub.inner());
    }

    /// Registered subscriptions by channel.
    pub fn subscriptions(&self) -> HashMap<String, Subscription> {
        self.registry
            .snapshot()
            .into_iter()
            .map(|inner| (inner.channel.clone(), Subscription::from_inner(inner)))
            .collect()
    }
}
