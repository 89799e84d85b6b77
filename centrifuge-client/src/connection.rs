//! Session task: connection lifecycle, command correlation, reconnects,
//! token refresh, ping monitoring and push dispatch.
//!
//! All session state lives in [`Session`] and is only touched from its
//! task. Application handles talk to it through [`Msg`]s.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::Error;
use crate::backoff::reconnect_delay;
use crate::correlator::Correlator;
use crate::protocol::{
    Codec, Command, ConnectRequest, ConnectResult, HistoryRequest, HistoryResult, PresenceRequest,
    PresenceResult, PresenceStatsRequest, PresenceStatsResult, PublishRequest, PublishResult,
    Push, PushKind, RefreshRequest, Reply, Request, RpcRequest, RpcResult, SendRequest,
    UnsubscribeRequest, disconnect_code, error_code,
};
use crate::server_subs::ServerSubscriptions;
use crate::subscription::{Registry, SubscriptionInner};
use crate::transport::{CloseInfo, ConnectOptions, Transport, TransportEvent};
use crate::types::{
    BoxError, ClientConfig, ClientEvent, ClientState, Events, HistoryOptions, SubscriptionEvent,
    SubscriptionState, SubscriptionTokenRequest, TokenFuture,
};

type TokenSource = Arc<dyn Fn() -> TokenFuture + Send + Sync>;
type SubscriptionTokenSource = Arc<dyn Fn(SubscriptionTokenRequest) -> TokenFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const TOKEN_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_CALLED: &str = "connect called";
const CLEAN_DISCONNECT: &str = "clean disconnect";
const CONNECTION_CLOSED: &str = "connection closed";

// ---------------------------------------------------------------------------
// Disconnect descriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Disconnect {
    pub code: u32,
    pub reason: String,
    pub reconnect: bool,
}

impl Disconnect {
    pub(crate) fn new(code: u32, reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            code,
            reason: reason.into(),
            reconnect,
        }
    }

    pub(crate) fn clean() -> Self {
        Self::new(disconnect_code::CLEAN, CLEAN_DISCONNECT, false)
    }

    /// Descriptor for a close code sent by the server, in a WebSocket close
    /// frame or a disconnect push. 3500-3999 and 4500-4999 are terminal.
    pub(crate) fn from_code(code: u32, reason: &str) -> Self {
        let reconnect = code < 3500 || code >= 5000 || (4000..4500).contains(&code);
        if code < 3000 {
            return Self::new(disconnect_code::CONNECTION_CLOSED, CONNECTION_CLOSED, reconnect);
        }
        Self::new(code, reason, reconnect)
    }

    pub(crate) fn from_transport(close: Option<&CloseInfo>) -> Self {
        match close {
            Some(c) => Self::from_code(u32::from(c.code), &c.reason),
            None => Self::new(disconnect_code::CONNECTION_CLOSED, CONNECTION_CLOSED, true),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages and handles
// ---------------------------------------------------------------------------

pub(crate) enum Msg {
    Connect,
    Disconnect,
    ResetReconnect,
    SetToken(String),
    Refresh(String),
    Call {
        request: Request,
        reply: oneshot::Sender<Result<Reply, Error>>,
    },
    Send {
        data: Value,
        done: oneshot::Sender<Result<(), Error>>,
    },
    Subscribe(Arc<SubscriptionInner>),
    Unsubscribe(Arc<SubscriptionInner>),
    TokenFetched {
        purpose: TokenPurpose,
        result: Result<String, BoxError>,
    },
}

pub(crate) enum TokenPurpose {
    /// The connect reply of transport attempt `attempt` said the token
    /// expired.
    Handshake { attempt: u64 },
    /// The refresh timer fired.
    Refresh,
    Subscription {
        sub: Arc<SubscriptionInner>,
        client_id: String,
    },
}

/// Strong handle to the session task. The task stops once every strong
/// handle is dropped.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<Msg>,
}

impl SessionHandle {
    pub(crate) fn post(&self, msg: Msg) {
        if self.tx.send(msg).is_err() {
            tracing::debug!("session task has exited");
        }
    }

    pub(crate) fn downgrade(&self) -> WeakSessionHandle {
        WeakSessionHandle {
            tx: self.tx.downgrade(),
        }
    }

    pub(crate) async fn call(&self, request: Request) -> Result<Reply, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Call { request, reply })
            .map_err(|_| Error::ClientDisconnected)?;
        rx.await.map_err(|_| Error::ClientDisconnected)?
    }

    pub(crate) async fn send(&self, data: Value) -> Result<(), Error> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Msg::Send { data, done })
            .map_err(|_| Error::ClientDisconnected)?;
        rx.await.map_err(|_| Error::ClientDisconnected)?
    }

    pub(crate) async fn publish(&self, channel: &str, data: Value) -> Result<PublishResult, Error> {
        let reply = self
            .call(Request::Publish(PublishRequest {
                channel: channel.to_string(),
                data,
            }))
            .await?;
        Ok(reply.publish.unwrap_or_default())
    }

    pub(crate) async fn rpc(&self, method: &str, data: Value) -> Result<RpcResult, Error> {
        let reply = self
            .call(Request::Rpc(RpcRequest {
                method: method.to_string(),
                data,
            }))
            .await?;
        Ok(reply.rpc.unwrap_or_default())
    }

    pub(crate) async fn presence(&self, channel: &str) -> Result<PresenceResult, Error> {
        let reply = self
            .call(Request::Presence(PresenceRequest {
                channel: channel.to_string(),
            }))
            .await?;
        Ok(reply.presence.unwrap_or_default())
    }

    pub(crate) async fn presence_stats(&self, channel: &str) -> Result<PresenceStatsResult, Error> {
        let reply = self
            .call(Request::PresenceStats(PresenceStatsRequest {
                channel: channel.to_string(),
            }))
            .await?;
        Ok(reply.presence_stats.unwrap_or_default())
    }

    pub(crate) async fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> Result<HistoryResult, Error> {
        let reply = self
            .call(Request::History(HistoryRequest {
                channel: channel.to_string(),
                limit: options.limit,
                since: options.since,
                reverse: options.reverse,
            }))
            .await?;
        Ok(reply.history.unwrap_or_default())
    }
}

/// Non-owning handle held by subscriptions and background token fetches.
#[derive(Clone)]
pub(crate) struct WeakSessionHandle {
    tx: mpsc::WeakUnboundedSender<Msg>,
}

impl WeakSessionHandle {
    pub(crate) fn upgrade(&self) -> Option<SessionHandle> {
        self.tx.upgrade().map(|tx| SessionHandle { tx })
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx: tx.downgrade() }
    }
}

/// A request parked until the session connects.
enum Waiter {
    Call {
        request: Request,
        reply: oneshot::Sender<Result<Reply, Error>>,
    },
    Send {
        data: Value,
        done: oneshot::Sender<Result<(), Error>>,
    },
}

impl Waiter {
    fn fail(self, error: Error) {
        match self {
            Waiter::Call { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Waiter::Send { done, .. } => {
                let _ = done.send(Err(error));
            }
        }
    }
}

/// What to do when a command's reply (or its failure) arrives.
enum Pending {
    Call(oneshot::Sender<Result<Reply, Error>>),
    Connect,
    Subscribe(Arc<SubscriptionInner>),
    Unsubscribe(String),
    Refresh,
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

pub(crate) struct Session {
    config: ClientConfig,
    get_token: Option<TokenSource>,
    get_subscription_token: Option<SubscriptionTokenSource>,
    transport: Box<dyn Transport>,
    codec: Box<dyn Codec>,
    registry: Registry,
    server_subs: ServerSubscriptions,
    commands: Correlator<Pending>,
    waiters: Correlator<Waiter>,
    state: watch::Sender<ClientState>,
    events: mpsc::UnboundedSender<ClientEvent>,
    handle: WeakSessionHandle,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    token: String,
    client_id: Option<String>,
    need_reconnect: bool,
    transport_open: bool,
    /// Bumped on every transport dial.
    transport_attempt: u64,
    connect_after_close: bool,
    close_reason: Option<Disconnect>,
    reconnect_attempts: u32,
    reconnect_at: Option<Instant>,
    refresh_at: Option<Instant>,
    ping_interval: Option<Duration>,
    ping_deadline: Option<Instant>,
    send_pong: bool,
}

/// Start a session task. Must be called within a tokio runtime.
pub(crate) fn spawn(
    mut config: ClientConfig,
    transport: Box<dyn Transport>,
    codec: Box<dyn Codec>,
    registry: Registry,
) -> (SessionHandle, watch::Receiver<ClientState>, Events<ClientEvent>) {
    let (tx, msgs) = mpsc::unbounded_channel();
    let handle = SessionHandle { tx };
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (state, state_rx) = watch::channel(ClientState::Disconnected);
    let (events, client_events) = Events::channel();

    let session = Session {
        token: config.token.clone().unwrap_or_default(),
        get_token: config.get_token.take().map(Arc::from),
        get_subscription_token: config.get_subscription_token.take().map(Arc::from),
        commands: Correlator::new(config.timeout),
        waiters: Correlator::new(config.timeout),
        config,
        transport,
        codec,
        registry,
        server_subs: ServerSubscriptions::default(),
        state,
        events,
        handle: handle.downgrade(),
        transport_tx,
        client_id: None,
        need_reconnect: true,
        transport_open: false,
        transport_attempt: 0,
        connect_after_close: false,
        close_reason: None,
        reconnect_attempts: 0,
        reconnect_at: None,
        refresh_at: None,
        ping_interval: None,
        ping_deadline: None,
        send_pong: false,
    };
    tokio::spawn(session.run(msgs, transport_rx));
    (handle, state_rx, client_events)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Session {
    async fn run(
        mut self,
        mut msgs: mpsc::UnboundedReceiver<Msg>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            let reconnect_at = self.reconnect_at;
            let refresh_at = self.refresh_at;
            let ping_deadline = self.ping_deadline;

            tokio::select! {
                msg = msgs.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                },

                Some(event) = transport_rx.recv() => self.handle_transport_event(event),

                (id, pending) = self.commands.next_expired() => {
                    tracing::debug!(id, "command timed out");
                    self.resolve(pending, Err(Error::Timeout));
                }

                (_, waiter) = self.waiters.next_expired() => {
                    tracing::debug!("timed out waiting for connection");
                    waiter.fail(Error::Timeout);
                }

                () = sleep_until(reconnect_at) => self.on_reconnect_timer(),

                () = sleep_until(refresh_at) => self.on_refresh_timer(),

                () = sleep_until(ping_deadline) => self.on_ping_timeout(),
            }
        }
        self.shutdown();
    }

    fn handle_msg(&mut self, msg: Msg) {
        match msg {
            Msg::Connect => self.connect(),
            Msg::Disconnect => self.disconnect(),
            Msg::ResetReconnect => self.reset_reconnect_state(),
            Msg::SetToken(token) => self.token = token,
            Msg::Refresh(token) => self.refresh_with_token(token),
            Msg::Call { request, reply } => self.call(Waiter::Call { request, reply }),
            Msg::Send { data, done } => self.call(Waiter::Send { data, done }),
            Msg::Subscribe(sub) => self.subscribe(sub),
            Msg::Unsubscribe(sub) => self.unsubscribe(&sub),
            Msg::TokenFetched { purpose, result } => self.on_token(purpose, result),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => self.on_transport_open(),
            TransportEvent::Data(data) => self.on_data(&data),
            TransportEvent::Disconnected(close) => self.on_transport_closed(close),
        }
    }

    fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "state changed");
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("client event receiver dropped");
        }
    }

    // -- Lifecycle ---------------------------------------------------------

    fn connect(&mut self) {
        self.need_reconnect = true;
        match self.state() {
            ClientState::Connected | ClientState::Connecting => {
                if self.transport_open && self.close_reason.as_ref().is_some_and(|d| !d.reconnect)
                {
                    // A user disconnect is still closing the transport.
                    self.connect_after_close = true;
                }
            }
            ClientState::Disconnected | ClientState::Failed => {
                self.set_state(ClientState::Connecting);
                self.emit(ClientEvent::Connecting {
                    code: disconnect_code::CLEAN,
                    reason: CONNECT_CALLED.to_string(),
                });
                self.open_transport();
            }
        }
    }

    fn disconnect(&mut self) {
        self.need_reconnect = false;
        self.connect_after_close = false;
        if self.transport_open {
            self.close(Disconnect::clean());
        } else {
            self.reconnect_at = None;
            self.teardown(Disconnect::clean());
        }
    }

    fn reset_reconnect_state(&mut self) {
        self.reconnect_attempts = 0;
        if self.reconnect_at.is_some() {
            tracing::debug!("reconnecting immediately");
            self.on_reconnect_timer();
        }
    }

    fn open_transport(&mut self) {
        let options = ConnectOptions {
            headers: self.config.headers.clone(),
            tls_skip_verify: self.config.tls_skip_verify,
        };
        self.transport_open = true;
        self.transport_attempt = self.transport_attempt.wrapping_add(1);
        self.close_reason = None;
        self.transport.connect(&options, self.transport_tx.clone());
    }

    /// Ask the transport to close. Teardown happens when it reports the
    /// disconnect. A non-reconnecting reason already set is kept.
    fn close(&mut self, disconnect: Disconnect) {
        if !self.transport_open {
            return;
        }
        tracing::debug!(
            code = disconnect.code,
            reason = %disconnect.reason,
            reconnect = disconnect.reconnect,
            "closing transport"
        );
        match &self.close_reason {
            Some(existing) if !existing.reconnect => {}
            _ => self.close_reason = Some(disconnect),
        }
        self.transport.disconnect();
    }

    fn on_transport_open(&mut self) {
        if !self.transport_open {
            tracing::debug!("ignoring connect from a closed transport");
            return;
        }
        let request = ConnectRequest {
            token: self.token.clone(),
            data: self.config.data.clone().unwrap_or(Value::Null),
            subs: self.server_subs.recovery_requests(),
            name: self.config.name.clone(),
            version: self.config.version.clone(),
        };
        tracing::debug!(recover = request.subs.len(), "transport open, sending connect");
        self.send_command(Request::Connect(request), Pending::Connect);
    }

    fn on_transport_closed(&mut self, close: Option<CloseInfo>) {
        if !self.transport_open {
            tracing::debug!("ignoring disconnect from a closed transport");
            return;
        }
        self.transport_open = false;
        let mut disconnect = self
            .close_reason
            .take()
            .unwrap_or_else(|| Disconnect::from_transport(close.as_ref()));
        if !self.need_reconnect {
            disconnect.reconnect = false;
        }
        tracing::info!(
            code = disconnect.code,
            reason = %disconnect.reason,
            reconnect = disconnect.reconnect,
            "disconnected"
        );
        self.teardown(disconnect);
        if std::mem::take(&mut self.connect_after_close) {
            self.connect();
        }
    }

    /// Fail everything outstanding and drop to disconnected (or connecting,
    /// when a reconnect gets scheduled).
    fn teardown(&mut self, disconnect: Disconnect) {
        let previous = self.state();
        self.client_id = None;

        if !self.commands.is_empty() || !self.waiters.is_empty() {
            tracing::debug!(
                pending = self.commands.len(),
                waiting = self.waiters.len(),
                "failing outstanding requests"
            );
        }
        for (_, pending) in self.commands.drain() {
            self.resolve(pending, Err(Error::ClientDisconnected));
        }
        for (_, waiter) in self.waiters.drain() {
            waiter.fail(Error::ClientDisconnected);
        }

        for sub in self.registry.snapshot() {
            let changed = {
                let mut core = sub.core();
                if !disconnect.reconnect {
                    core.need_recover = false;
                }
                core.reset()
            };
            if changed {
                sub.emit(SubscriptionEvent::Unsubscribed);
            }
        }

        self.ping_interval = None;
        self.ping_deadline = None;
        self.refresh_at = None;

        if previous == ClientState::Connected {
            for channel in self.server_subs.channels() {
                self.emit(ClientEvent::ServerUnsubscribed { channel });
            }
        }

        let reconnect = disconnect.reconnect && self.need_reconnect;
        if !reconnect {
            self.reconnect_at = None;
            self.set_state(ClientState::Disconnected);
        }
        if (reconnect && previous == ClientState::Connected)
            || (!reconnect && previous != ClientState::Disconnected)
        {
            self.emit(ClientEvent::Disconnected {
                code: disconnect.code,
                reason: disconnect.reason.clone(),
                reconnect,
            });
        }
        if reconnect {
            self.schedule_reconnect(&disconnect);
        }
    }

    fn schedule_reconnect(&mut self, disconnect: &Disconnect) {
        let delay = reconnect_delay(
            self.reconnect_attempts,
            self.config.min_reconnect_delay,
            self.config.max_reconnect_delay,
            &mut rand::rng(),
        );
        tracing::info!(attempt = self.reconnect_attempts, ?delay, "scheduling reconnect");
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.reconnect_at = Some(Instant::now() + delay);
        if self.state() != ClientState::Connecting {
            self.set_state(ClientState::Connecting);
            self.emit(ClientEvent::Connecting {
                code: disconnect.code,
                reason: disconnect.reason.clone(),
            });
        }
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if self.need_reconnect && !self.transport_open {
            self.open_transport();
        }
    }

    fn shutdown(&mut self) {
        tracing::debug!("all client handles dropped, stopping session");
        self.need_reconnect = false;
        if self.transport_open {
            self.transport.disconnect();
            self.transport_open = false;
        }
        self.teardown(Disconnect::clean());
        self.set_state(ClientState::Failed);
    }

    // -- Commands ----------------------------------------------------------

    fn write(&mut self, commands: &[Command]) -> Result<(), Error> {
        let data = self.codec.encode(commands)?;
        self.transport.write(data)
    }

    fn send_command(&mut self, request: Request, pending: Pending) {
        let id = self.commands.next_id();
        match self.write(&[Command::new(id, request)]) {
            Ok(()) => self.commands.register(id, pending),
            Err(e) => {
                tracing::warn!(id, error = %e, "failed to write command");
                self.resolve(pending, Err(e));
                self.close(Disconnect::new(
                    disconnect_code::CONNECTION_CLOSED,
                    "write error",
                    true,
                ));
            }
        }
    }

    /// Run `waiter` now if connected, otherwise park it until connected.
    fn call(&mut self, waiter: Waiter) {
        if self.state() == ClientState::Connected {
            self.dispatch(waiter);
        } else if !self.need_reconnect {
            waiter.fail(Error::ClientDisconnected);
        } else {
            let id = self.waiters.next_id();
            self.waiters.register(id, waiter);
        }
    }

    fn dispatch(&mut self, waiter: Waiter) {
        match waiter {
            Waiter::Call { request, reply } => self.send_command(request, Pending::Call(reply)),
            Waiter::Send { data, done } => {
                let result = self.write(&[Command::new(0, Request::Send(SendRequest { data }))]);
                let _ = done.send(result);
            }
        }
    }

    fn resolve(&mut self, pending: Pending, result: Result<Reply, Error>) {
        match pending {
            Pending::Call(reply) => {
                let _ = reply.send(result);
            }
            Pending::Connect => self.on_connect_reply(result),
            Pending::Subscribe(sub) => self.on_subscribe_reply(&sub, result),
            Pending::Unsubscribe(channel) => self.on_unsubscribe_reply(&channel, result),
            Pending::Refresh => self.on_refresh_reply(result),
        }
    }

    // -- Handshake and refresh ----------------------------------------------

    fn on_connect_reply(&mut self, result: Result<Reply, Error>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(Error::ClientDisconnected) => return,
            Err(Error::Reply { code, .. }) if code == error_code::TOKEN_EXPIRED => {
                tracing::info!("connection token expired, refreshing");
                self.fetch_token(TokenPurpose::Handshake {
                    attempt: self.transport_attempt,
                });
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "connect failed");
                self.emit(ClientEvent::Error(e));
                self.close(Disconnect::new(
                    disconnect_code::CONNECT_ERROR,
                    "connect error",
                    true,
                ));
                return;
            }
        };
        match reply.connect {
            Some(result) => self.on_connected(result),
            None => {
                tracing::warn!("connect reply without result");
                self.close(Disconnect::new(
                    disconnect_code::BAD_PROTOCOL,
                    "bad protocol",
                    true,
                ));
            }
        }
    }

    fn on_connected(&mut self, result: ConnectResult) {
        self.reconnect_attempts = 0;
        self.client_id = Some(result.client.clone());
        self.set_state(ClientState::Connected);
        tracing::info!(client_id = %result.client, "connected");
        self.emit(ClientEvent::Connected {
            client_id: result.client.clone(),
        });

        for (_, waiter) in self.waiters.drain() {
            self.dispatch(waiter);
        }

        for event in self.server_subs.reconcile(result.subs) {
            self.emit(event);
        }
        self.resubscribe();

        self.ping_interval = (result.ping > 0)
            .then(|| Duration::from_secs(u64::from(result.ping)) + self.config.max_server_ping_delay);
        self.ping_deadline = self.ping_interval.map(|interval| Instant::now() + interval);
        self.send_pong = result.pong;
        self.refresh_at = result
            .expires
            .then(|| Instant::now() + Duration::from_secs(u64::from(result.ttl)));
    }

    fn on_refresh_timer(&mut self) {
        self.refresh_at = None;
        tracing::debug!("connection token due for refresh");
        self.fetch_token(TokenPurpose::Refresh);
    }

    fn refresh_with_token(&mut self, token: String) {
        self.token = token.clone();
        if self.state() == ClientState::Connected {
            self.send_command(Request::Refresh(RefreshRequest { token }), Pending::Refresh);
        }
    }

    fn on_refresh_reply(&mut self, result: Result<Reply, Error>) {
        match result {
            Ok(reply) => {
                let refreshed = reply.refresh.unwrap_or_default();
                tracing::debug!(expires = refreshed.expires, ttl = refreshed.ttl, "token refreshed");
                self.refresh_at = refreshed
                    .expires
                    .then(|| Instant::now() + Duration::from_secs(u64::from(refreshed.ttl)));
            }
            Err(Error::ClientDisconnected) => {}
            Err(e) => {
                tracing::warn!(error = %e, "refresh failed");
                self.emit(ClientEvent::Error(e));
                self.close(Disconnect::new(
                    disconnect_code::REFRESH_ERROR,
                    "refresh error",
                    true,
                ));
            }
        }
    }

    fn fetch_token(&mut self, purpose: TokenPurpose) {
        match self.get_token.clone() {
            Some(get_token) => self.spawn_token_fetch(move || get_token(), purpose),
            None => self.on_token(purpose, Err("no get_token callback configured".into())),
        }
    }

    fn fetch_subscription_token(&mut self, sub: Arc<SubscriptionInner>, client_id: String) {
        match self.get_subscription_token.clone() {
            Some(get_token) => {
                let request = SubscriptionTokenRequest {
                    client_id: client_id.clone(),
                    channel: sub.channel.clone(),
                };
                self.spawn_token_fetch(
                    move || get_token(request),
                    TokenPurpose::Subscription { sub, client_id },
                );
            }
            None => self.on_token(
                TokenPurpose::Subscription { sub, client_id },
                Err("no get_subscription_token callback configured".into()),
            ),
        }
    }

    /// Run the application's token callback on its own task. The callback
    /// may call back into the client, so it never runs on the session task.
    fn spawn_token_fetch<F>(&self, fetch: F, purpose: TokenPurpose)
    where
        F: FnOnce() -> TokenFuture + Send + 'static,
    {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(TOKEN_FETCH_TIMEOUT, fetch()).await {
                Ok(result) => result,
                Err(_) => Err("token fetch timed out".into()),
            };
            if let Some(session) = handle.upgrade() {
                session.post(Msg::TokenFetched { purpose, result });
            }
        });
    }

    fn on_token(&mut self, purpose: TokenPurpose, result: Result<String, BoxError>) {
        match purpose {
            TokenPurpose::Handshake { attempt } => {
                match result {
                    Ok(token) if !token.is_empty() => self.token = token,
                    Ok(_) => tracing::debug!("token callback returned an empty token"),
                    Err(e) => {
                        tracing::warn!(error = %e, "token fetch failed");
                        self.emit(ClientEvent::Error(Error::TokenFetch(e)));
                    }
                }
                if attempt != self.transport_attempt {
                    tracing::debug!(attempt, "token arrived after its connection was replaced");
                    return;
                }
                self.close(Disconnect::new(
                    disconnect_code::REFRESH_ERROR,
                    "token expired",
                    true,
                ));
            }
            TokenPurpose::Refresh => match result {
                Ok(token) if !token.is_empty() => self.refresh_with_token(token),
                Ok(_) => tracing::debug!("token callback returned an empty token, not refreshing"),
                Err(e) => {
                    tracing::warn!(error = %e, "token fetch failed");
                    self.emit(ClientEvent::Error(Error::TokenFetch(e)));
                }
            },
            TokenPurpose::Subscription { sub, client_id } => {
                let current = self.client_id.as_deref() == Some(client_id.as_str());
                if !current || sub.state() != SubscriptionState::Subscribing {
                    tracing::debug!(channel = %sub.channel, "discarding stale subscription token");
                    return;
                }
                match result {
                    Ok(token) => self.send_subscribe_command(sub, token),
                    Err(e) => fail_subscribe(&sub, &Error::SubscriptionToken(e)),
                }
            }
        }
    }

    // -- Subscriptions -----------------------------------------------------

    fn subscribe(&mut self, sub: Arc<SubscriptionInner>) {
        if !self.registry.contains(&sub) {
            tracing::debug!(channel = %sub.channel, "subscribe on a removed subscription");
            return;
        }
        sub.core().wanted = true;
        if self.state() == ClientState::Connected {
            self.send_subscribe(sub);
        }
    }

    /// Subscribe every wanted channel that is still unsubscribed, in
    /// channel order. The registry lock is released before any subscribe
    /// goes out.
    fn resubscribe(&mut self) {
        let todo: Vec<Arc<SubscriptionInner>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|sub| {
                let core = sub.core();
                core.wanted && core.state == SubscriptionState::Unsubscribed
            })
            .collect();
        for sub in todo {
            self.send_subscribe(sub);
        }
    }

    fn send_subscribe(&mut self, sub: Arc<SubscriptionInner>) {
        {
            let mut core = sub.core();
            if core.state != SubscriptionState::Unsubscribed {
                return;
            }
            core.state = SubscriptionState::Subscribing;
        }
        sub.emit(SubscriptionEvent::Subscribing);

        match sub.config.token.clone() {
            Some(token) => self.send_subscribe_command(sub, token),
            None if self.config.is_private_channel(&sub.channel) => {
                let client_id = self.client_id.clone().unwrap_or_default();
                self.fetch_subscription_token(sub, client_id);
            }
            None => self.send_subscribe_command(sub, String::new()),
        }
    }

    fn send_subscribe_command(&mut self, sub: Arc<SubscriptionInner>, token: String) {
        let data = sub.config.data.clone().unwrap_or(Value::Null);
        let request = sub.core().subscribe_request(&sub.channel, token, data);
        tracing::debug!(
            channel = %sub.channel,
            recover = request.recover,
            offset = request.offset,
            "subscribing"
        );
        self.send_command(Request::Subscribe(request), Pending::Subscribe(sub));
    }

    fn on_subscribe_reply(&mut self, sub: &SubscriptionInner, result: Result<Reply, Error>) {
        let result = result.and_then(|reply| {
            reply
                .subscribe
                .ok_or_else(|| Error::Protocol("subscribe reply without result".into()))
        });
        let res = match result {
            Ok(res) => res,
            Err(Error::ClientDisconnected) => return,
            Err(e) => {
                fail_subscribe(sub, &e);
                return;
            }
        };

        let recovered = res.recovered;
        let (resubscribe, publications) = {
            let mut core = sub.core();
            if core.state != SubscriptionState::Subscribing {
                tracing::debug!(channel = %sub.channel, "ignoring stale subscribe reply");
                return;
            }
            let resubscribe = core.apply_subscribed(&res);
            let mut publications = res.publications;
            publications.sort_by_key(|p| p.offset);
            for p in &publications {
                core.advance(p.offset);
            }
            (resubscribe, publications)
        };

        tracing::info!(
            channel = %sub.channel,
            resubscribe,
            recovered,
            replayed = publications.len(),
            "subscribed"
        );
        for publication in publications {
            sub.emit(SubscriptionEvent::Publication(publication));
        }
        sub.emit(SubscriptionEvent::Subscribed {
            resubscribe,
            recovered,
        });
    }

    fn unsubscribe(&mut self, sub: &SubscriptionInner) {
        let previous = {
            let mut core = sub.core();
            core.wanted = false;
            let previous = core.state;
            core.reset();
            previous
        };
        if previous == SubscriptionState::Unsubscribed {
            return;
        }
        if self.state() == ClientState::Connected {
            self.send_command(
                Request::Unsubscribe(UnsubscribeRequest {
                    channel: sub.channel.clone(),
                }),
                Pending::Unsubscribe(sub.channel.clone()),
            );
        }
        sub.emit(SubscriptionEvent::Unsubscribed);
    }

    fn on_unsubscribe_reply(&mut self, channel: &str, result: Result<Reply, Error>) {
        match result {
            Ok(_) | Err(Error::ClientDisconnected) => {}
            Err(e) => {
                tracing::warn!(channel, error = %e, "unsubscribe failed, reconnecting");
                self.close(Disconnect::new(
                    disconnect_code::UNSUBSCRIBE_ERROR,
                    "unsubscribe error",
                    true,
                ));
            }
        }
    }

    // -- Incoming data -----------------------------------------------------

    fn on_data(&mut self, data: &[u8]) {
        let replies = match self.codec.decode(data) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(len = data.len(), error = %e, "dropping undecodable frame");
                return;
            }
        };
        for reply in replies {
            if reply.id > 0 {
                match self.commands.take(reply.id) {
                    Some(pending) => self.resolve(pending, reply.into_result()),
                    None => tracing::debug!(id = reply.id, "reply for unknown or expired command"),
                }
            } else if reply.is_ping() {
                self.on_server_ping();
            } else if let Some(push) = reply.push {
                self.on_push(push);
            } else {
                tracing::debug!("ignoring reply without id or push");
            }
        }
    }

    fn on_server_ping(&mut self) {
        if self.state() != ClientState::Connected {
            return;
        }
        tracing::trace!("server ping");
        if let Some(interval) = self.ping_interval {
            self.ping_deadline = Some(Instant::now() + interval);
        }
        if !self.send_pong {
            return;
        }
        if let Err(e) = self.write(&[Command::pong()]) {
            tracing::warn!(error = %e, "failed to send pong");
        }
    }

    fn on_ping_timeout(&mut self) {
        self.ping_deadline = None;
        tracing::warn!("no ping from server");
        self.close(Disconnect::new(disconnect_code::NO_PING, "no ping", true));
    }

    fn on_push(&mut self, push: Push) {
        let (channel, kind) = push.into_kind();
        match kind {
            PushKind::Message(data) => self.emit(ClientEvent::Message { data }),
            PushKind::Disconnect(d) => {
                tracing::info!(code = d.code, reason = %d.reason, "server requested disconnect");
                self.close(Disconnect::from_code(d.code, &d.reason));
            }
            PushKind::Subscribe(s) => {
                self.server_subs.subscribe(&channel, &s);
                self.emit(ClientEvent::ServerSubscribed {
                    channel,
                    resubscribe: false,
                    recovered: false,
                });
            }
            PushKind::Unknown => tracing::debug!(channel = %channel, "ignoring unknown push"),
            kind => match self.registry.get(&channel) {
                Some(sub) => on_subscription_push(&sub, kind),
                None => self.on_server_push(channel, kind),
            },
        }
    }

    fn on_server_push(&mut self, channel: String, kind: PushKind) {
        if !self.server_subs.contains(&channel) {
            tracing::debug!(channel = %channel, "push for unknown channel");
            return;
        }
        match kind {
            PushKind::Publication(publication) => {
                self.server_subs.advance(&channel, publication.offset);
                self.emit(ClientEvent::ServerPublication {
                    channel,
                    publication,
                });
            }
            PushKind::Join(info) => self.emit(ClientEvent::ServerJoin { channel, info }),
            PushKind::Leave(info) => self.emit(ClientEvent::ServerLeave { channel, info }),
            PushKind::Unsubscribe(_) => {
                self.server_subs.remove(&channel);
                self.emit(ClientEvent::ServerUnsubscribed { channel });
            }
            PushKind::Subscribe(_)
            | PushKind::Message(_)
            | PushKind::Disconnect(_)
            | PushKind::Unknown => {}
        }
    }
}

fn on_subscription_push(sub: &SubscriptionInner, kind: PushKind) {
    match kind {
        PushKind::Publication(publication) => {
            {
                let mut core = sub.core();
                if core.state != SubscriptionState::Subscribed {
                    tracing::trace!(channel = %sub.channel, "dropping publication for inactive subscription");
                    return;
                }
                core.advance(publication.offset);
            }
            sub.emit(SubscriptionEvent::Publication(publication));
        }
        PushKind::Join(info) => sub.emit(SubscriptionEvent::Join(info)),
        PushKind::Leave(info) => sub.emit(SubscriptionEvent::Leave(info)),
        PushKind::Unsubscribe(u) => {
            tracing::info!(channel = %sub.channel, code = u.code, reason = %u.reason, "server unsubscribed channel");
            let changed = {
                let mut core = sub.core();
                core.wanted = false;
                core.reset()
            };
            if changed {
                sub.emit(SubscriptionEvent::Unsubscribed);
            }
        }
        PushKind::Subscribe(_) | PushKind::Message(_) | PushKind::Disconnect(_) | PushKind::Unknown => {}
    }
}

fn fail_subscribe(sub: &SubscriptionInner, error: &Error) {
    let (code, message) = match error {
        Error::Reply { code, message } => (*code, message.clone()),
        other => (other.code(), other.to_string()),
    };
    {
        let mut core = sub.core();
        if core.state != SubscriptionState::Subscribing {
            return;
        }
        core.state = SubscriptionState::Unsubscribed;
        core.last_error = Some((code, message.clone()));
    }
    tracing::warn!(channel = %sub.channel, code, message = %message, "subscribe failed");
    sub.emit(SubscriptionEvent::SubscribeError { code, message });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_disconnect_does_not_reconnect() {
        let d = Disconnect::clean();
        assert_eq!(d.code, 0);
        assert_eq!(d.reason, "clean disconnect");
        assert!(!d.reconnect);
    }

    #[test]
    fn missing_close_frame_reconnects() {
        let d = Disconnect::from_transport(None);
        assert_eq!(d, Disconnect::new(4, "connection closed", true));
    }

    #[test]
    fn low_codes_map_to_connection_closed() {
        let d = Disconnect::from_transport(Some(&CloseInfo {
            code: 1006,
            reason: "abnormal".into(),
        }));
        assert_eq!(d.code, disconnect_code::CONNECTION_CLOSED);
        assert!(d.reconnect);
    }

    #[test]
    fn close_code_ranges() {
        let reconnects = |code| Disconnect::from_code(code, "x").reconnect;
        assert!(reconnects(3000));
        assert!(reconnects(3499));
        assert!(!reconnects(3500));
        assert!(!reconnects(3999));
        assert!(reconnects(4000));
        assert!(reconnects(4499));
        assert!(!reconnects(4500));
        assert!(!reconnects(4999));
        assert!(reconnects(5000));
    }

    #[test]
    fn server_codes_are_kept() {
        let d = Disconnect::from_code(3501, "bad request");
        assert_eq!(d, Disconnect::new(3501, "bad request", false));
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_session_alive() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let handle = SessionHandle { tx };
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some());
        drop(handle);
        assert!(weak.upgrade().is_none());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn call_on_stopped_session_fails() {
        let (tx, rx) = mpsc::unbounded_channel::<Msg>();
        drop(rx);
        let handle = SessionHandle { tx };
        let err = handle.rpc("m", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::ClientDisconnected));
    }
}
