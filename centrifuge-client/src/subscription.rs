//! Client-side channel subscriptions and the registry holding them.
//!
//! Subscription state is only mutated by the session task; application
//! code reads it through short locks. The registry lock guards structural
//! changes (add/remove) and is never held while a subscription lock is
//! taken from the outside, so lock order is always registry → core.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::Error;
use crate::connection::{Msg, SessionHandle, WeakSessionHandle};
use crate::protocol::{
    HistoryResult, PresenceResult, PresenceStatsResult, PublishResult, StreamPosition,
    SubscribeRequest, SubscribeResult,
};
use crate::types::{HistoryOptions, SubscriptionConfig, SubscriptionEvent, SubscriptionState};

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct SubscriptionCore {
    pub state: SubscriptionState,
    /// The owner asked for this subscription; reconnects resubscribe it.
    pub wanted: bool,
    pub recoverable: bool,
    pub offset: u64,
    pub epoch: String,
    /// Cleared by a non-reconnecting disconnect.
    pub need_recover: bool,
    pub subscribed_before: bool,
    pub last_error: Option<(u32, String)>,
}

impl SubscriptionCore {
    fn new(config: &SubscriptionConfig) -> Self {
        let mut core = Self::default();
        if let Some(since) = &config.since {
            core.recoverable = true;
            core.need_recover = true;
            core.offset = since.offset;
            core.epoch = since.epoch.clone();
        }
        core
    }

    /// Whether the next subscribe command asks the server for missed
    /// publications.
    pub(crate) fn wants_recovery(&self) -> bool {
        self.need_recover && self.recoverable && (self.offset > 0 || !self.epoch.is_empty())
    }

    pub(crate) fn subscribe_request(
        &self,
        channel: &str,
        token: String,
        data: Value,
    ) -> SubscribeRequest {
        let recover = self.wants_recovery();
        SubscribeRequest {
            channel: channel.to_string(),
            token,
            recover,
            offset: if recover { self.offset } else { 0 },
            epoch: if recover {
                self.epoch.clone()
            } else {
                String::new()
            },
            data,
        }
    }

    /// Record a publication offset. Zero and non-increasing offsets leave
    /// the stored position untouched.
    pub(crate) fn advance(&mut self, offset: u64) -> bool {
        if offset > self.offset {
            self.offset = offset;
            true
        } else {
            false
        }
    }

    /// Move to subscribed from a successful reply. Returns whether this is
    /// a resubscribe.
    pub(crate) fn apply_subscribed(&mut self, result: &SubscribeResult) -> bool {
        self.state = SubscriptionState::Subscribed;
        self.last_error = None;
        let resubscribe = self.subscribed_before;
        self.subscribed_before = true;
        self.recoverable = result.recoverable;
        if result.recoverable {
            if result.epoch == self.epoch {
                self.advance(result.offset);
            } else {
                // New stream incarnation: the server's position wins.
                self.epoch = result.epoch.clone();
                self.offset = result.offset;
            }
            self.need_recover = true;
        }
        resubscribe
    }

    /// Drop to unsubscribed. Returns whether the state changed.
    pub(crate) fn reset(&mut self) -> bool {
        let changed = self.state != SubscriptionState::Unsubscribed;
        self.state = SubscriptionState::Unsubscribed;
        changed
    }
}

pub(crate) struct SubscriptionInner {
    pub(crate) id: u64,
    pub(crate) channel: String,
    pub(crate) config: SubscriptionConfig,
    core: Mutex<SubscriptionCore>,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    session: WeakSessionHandle,
}

impl SubscriptionInner {
    pub(crate) fn new(
        id: u64,
        channel: String,
        config: SubscriptionConfig,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
        session: WeakSessionHandle,
    ) -> Self {
        let core = SubscriptionCore::new(&config);
        Self {
            id,
            channel,
            config,
            core: Mutex::new(core),
            events,
            session,
        }
    }

    pub(crate) fn core(&self) -> MutexGuard<'_, SubscriptionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.core().state
    }

    pub(crate) fn emit(&self, event: SubscriptionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!(channel = %self.channel, "subscription event receiver dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type SubscriptionMap = HashMap<String, Arc<SubscriptionInner>>;

#[derive(Clone, Default)]
pub(crate) struct Registry {
    subs: Arc<Mutex<SubscriptionMap>>,
}

impl Registry {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SubscriptionMap> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `sub`; fails without touching the map if the channel is taken.
    pub(crate) fn insert(&self, sub: Arc<SubscriptionInner>) -> Result<(), Error> {
        match self.lock().entry(sub.channel.clone()) {
            Entry::Occupied(_) => Err(Error::DuplicateSubscription(sub.channel.clone())),
            Entry::Vacant(slot) => {
                slot.insert(sub);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, channel: &str) -> Option<Arc<SubscriptionInner>> {
        self.lock().get(channel).cloned()
    }

    /// Whether this exact subscription object is still registered.
    pub(crate) fn contains(&self, sub: &SubscriptionInner) -> bool {
        self.lock()
            .get(&sub.channel)
            .is_some_and(|registered| registered.id == sub.id)
    }

    /// Remove this exact subscription object. A newer subscription that
    /// reuses the channel name is left alone.
    pub(crate) fn remove(&self, sub: &SubscriptionInner) -> bool {
        let mut subs = self.lock();
        if subs
            .get(&sub.channel)
            .is_some_and(|registered| registered.id == sub.id)
        {
            subs.remove(&sub.channel);
            true
        } else {
            false
        }
    }

    /// All subscriptions, sorted by channel.
    pub(crate) fn snapshot(&self) -> Vec<Arc<SubscriptionInner>> {
        let mut subs: Vec<_> = self.lock().values().cloned().collect();
        subs.sort_by(|a, b| a.channel.cmp(&b.channel));
        subs
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to a channel subscription. Cheap to clone; all clones refer to
/// the same subscription.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl Subscription {
    pub(crate) fn from_inner(inner: Arc<SubscriptionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SubscriptionInner> {
        &self.inner
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    /// Last known stream position.
    pub fn stream_position(&self) -> StreamPosition {
        let core = self.inner.core();
        StreamPosition {
            offset: core.offset,
            epoch: core.epoch.clone(),
        }
    }

    /// Start subscribing. No-op unless unsubscribed; while the client is
    /// not connected the subscription is sent once it connects.
    pub fn subscribe(&self) {
        self.post(Msg::Subscribe(self.inner.clone()));
    }

    /// Unsubscribe, always ending locally unsubscribed.
    pub fn unsubscribe(&self) {
        self.post(Msg::Unsubscribe(self.inner.clone()));
    }

    pub async fn publish(&self, data: Value) -> Result<PublishResult, Error> {
        self.session()?.publish(&self.inner.channel, data).await
    }

    pub async fn history(&self, options: HistoryOptions) -> Result<HistoryResult, Error> {
        self.session()?.history(&self.inner.channel, options).await
    }

    pub async fn presence(&self) -> Result<PresenceResult, Error> {
        self.session()?.presence(&self.inner.channel).await
    }

    pub async fn presence_stats(&self) -> Result<PresenceStatsResult, Error> {
        self.session()?.presence_stats(&self.inner.channel).await
    }

    fn post(&self, msg: Msg) {
        match self.inner.session.upgrade() {
            Some(session) => session.post(msg),
            None => tracing::debug!(channel = %self.inner.channel, "client is gone"),
        }
    }

    /// Session handle for a channel-scoped call; the subscription must be
    /// subscribed.
    fn session(&self) -> Result<SessionHandle, Error> {
        {
            let core = self.inner.core();
            if core.state != SubscriptionState::Subscribed {
                return Err(match &core.last_error {
                    Some((code, message)) => Error::SubscriptionFailed {
                        code: *code,
                        message: message.clone(),
                    },
                    None => Error::SubscriptionUnsubscribed,
                });
            }
        }
        self.inner
            .session
            .upgrade()
            .ok_or(Error::ClientDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inner(id: u64, channel: &str) -> Arc<SubscriptionInner> {
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(SubscriptionInner::new(
            id,
            channel.to_string(),
            SubscriptionConfig::default(),
            tx,
            WeakSessionHandle::detached(),
        ))
    }

    #[test]
    fn duplicate_insert_leaves_registry_unchanged() {
        let registry = Registry::default();
        registry.insert(inner(1, "news")).unwrap();
        let err = registry.insert(inner(2, "news")).unwrap_err();
        assert!(matches!(err, Error::DuplicateSubscription(ref c) if c == "news"));
        assert_eq!(registry.get("news").unwrap().id, 1);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn remove_only_matches_same_object() {
        let registry = Registry::default();
        let first = inner(1, "chat");
        registry.insert(first.clone()).unwrap();
        assert!(registry.remove(&first));
        assert!(!registry.remove(&first), "unknown channel is a no-op");

        let second = inner(2, "chat");
        registry.insert(second.clone()).unwrap();
        assert!(!registry.remove(&first));
        assert!(registry.contains(&second));
        assert!(!registry.contains(&first));
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = Registry::default();
        for (id, channel) in [(1, "b"), (2, "a"), (3, "c")] {
            registry.insert(inner(id, channel)).unwrap();
        }
        let channels: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|s| s.channel.clone())
            .collect();
        assert_eq!(channels, vec!["a", "b", "c"]);
    }

    #[test]
    fn recovery_needs_position_and_recoverable() {
        let mut core = SubscriptionCore::default();
        let req = core.subscribe_request("index", String::new(), Value::Null);
        assert!(!req.recover);

        core.apply_subscribed(&SubscribeResult {
            recoverable: true,
            epoch: "e1".into(),
            ..Default::default()
        });
        core.advance(3);
        core.advance(7);
        let req = core.subscribe_request("index", String::new(), Value::Null);
        assert!(req.recover);
        assert_eq!(req.offset, 7);
        assert_eq!(req.epoch, "e1");

        core.need_recover = false;
        let req = core.subscribe_request("index", String::new(), Value::Null);
        assert!(!req.recover);
        assert_eq!(req.offset, 0);
    }

    #[test]
    fn duplicate_offset_does_not_move() {
        let mut core = SubscriptionCore::default();
        assert!(core.advance(5));
        assert!(!core.advance(5));
        assert!(!core.advance(0));
        assert_eq!(core.offset, 5);
    }

    #[test]
    fn epoch_change_resets_position() {
        let mut core = SubscriptionCore::default();
        core.apply_subscribed(&SubscribeResult {
            recoverable: true,
            epoch: "a".into(),
            offset: 10,
            ..Default::default()
        });
        assert_eq!(core.offset, 10);
        core.reset();
        let resubscribe = core.apply_subscribed(&SubscribeResult {
            recoverable: true,
            epoch: "b".into(),
            offset: 2,
            ..Default::default()
        });
        assert!(resubscribe);
        assert_eq!((core.offset, core.epoch.as_str()), (2, "b"));
    }

    #[test]
    fn initial_position_from_config() {
        let config = SubscriptionConfig {
            since: Some(StreamPosition {
                offset: 11,
                epoch: "x".into(),
            }),
            ..Default::default()
        };
        let core = SubscriptionCore::new(&config);
        assert!(core.wants_recovery());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Subscribe,
        Subscribed(u64),
        Publication(u64),
        Teardown,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Subscribe),
            (0u64..50).prop_map(Step::Subscribed),
            (0u64..50).prop_map(Step::Publication),
            Just(Step::Teardown),
        ]
    }

    proptest! {
        #[test]
        fn offsets_never_decrease_while_subscribed(steps in proptest::collection::vec(step(), 0..64)) {
            let mut core = SubscriptionCore::default();
            for s in steps {
                let before = core.offset;
                let was_subscribed = core.state == SubscriptionState::Subscribed;
                match s {
                    Step::Subscribe => {
                        if core.state == SubscriptionState::Unsubscribed {
                            core.state = SubscriptionState::Subscribing;
                        }
                    }
                    Step::Subscribed(offset) => {
                        if core.state == SubscriptionState::Subscribing {
                            core.apply_subscribed(&SubscribeResult {
                                recoverable: true,
                                epoch: "e".into(),
                                offset,
                                ..Default::default()
                            });
                        }
                    }
                    Step::Publication(offset) => {
                        if core.state == SubscriptionState::Subscribed {
                            core.advance(offset);
                        }
                    }
                    Step::Teardown => {
                        core.reset();
                    }
                }
                if was_subscribed && core.state == SubscriptionState::Subscribed {
                    prop_assert!(core.offset >= before);
                }
                prop_assert!(matches!(
                    core.state,
                    SubscriptionState::Unsubscribed
                        | SubscriptionState::Subscribing
                        | SubscriptionState::Subscribed
                ));
            }
        }
    }
}
