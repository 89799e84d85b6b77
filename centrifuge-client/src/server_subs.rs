//! Channels the server subscribed this connection to.
//!
//! Owned by the session task; never shared.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{ServerSubscribe, SubscribeRequest, SubscribeResult};
use crate::types::ClientEvent;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServerSubscription {
    pub recoverable: bool,
    pub offset: u64,
    pub epoch: String,
}

#[derive(Debug, Default)]
pub(crate) struct ServerSubscriptions {
    subs: BTreeMap<String, ServerSubscription>,
}

impl ServerSubscriptions {
    pub(crate) fn contains(&self, channel: &str) -> bool {
        self.subs.contains_key(channel)
    }

    pub(crate) fn channels(&self) -> Vec<String> {
        self.subs.keys().cloned().collect()
    }

    /// Descriptors sent with the connect command, one per tracked channel.
    /// Only recoverable channels with a non-zero offset ask for recovery.
    pub(crate) fn recovery_requests(&self) -> HashMap<String, SubscribeRequest> {
        self.subs
            .iter()
            .map(|(channel, sub)| {
                let recover = sub.recoverable && sub.offset > 0;
                let request = SubscribeRequest {
                    recover,
                    offset: if recover { sub.offset } else { 0 },
                    epoch: if recover { sub.epoch.clone() } else { String::new() },
                    ..Default::default()
                };
                (channel.clone(), request)
            })
            .collect()
    }

    /// Replace the tracked set with the one from a connect reply. Returns
    /// the events to emit: a subscribe event per channel (sorted by
    /// channel), each followed by its inlined publications.
    pub(crate) fn reconcile(&mut self, subs: HashMap<String, SubscribeResult>) -> Vec<ClientEvent> {
        let mut incoming: Vec<(String, SubscribeResult)> = subs.into_iter().collect();
        incoming.sort_by(|a, b| a.0.cmp(&b.0));

        self.subs
            .retain(|channel, _| incoming.iter().any(|(c, _)| c == channel));

        let mut events = Vec::new();
        for (channel, result) in incoming {
            let resubscribe = self.subs.contains_key(&channel);
            self.subs.insert(
                channel.clone(),
                ServerSubscription {
                    recoverable: result.recoverable,
                    offset: result.offset,
                    epoch: result.epoch,
                },
            );
            events.push(ClientEvent::ServerSubscribed {
                channel: channel.clone(),
                resubscribe,
                recovered: result.recovered,
            });
            let mut publications = result.publications;
            publications.sort_by_key(|p| p.offset);
            for publication in publications {
                events.push(ClientEvent::ServerPublication {
                    channel: channel.clone(),
                    publication,
                });
            }
        }
        events
    }

    /// Track a channel announced by a subscribe push.
    pub(crate) fn subscribe(&mut self, channel: &str, push: &ServerSubscribe) {
        self.subs.insert(
            channel.to_string(),
            ServerSubscription {
                recoverable: push.recoverable,
                offset: push.offset,
                epoch: push.epoch.clone(),
            },
        );
    }

    pub(crate) fn remove(&mut self, channel: &str) -> bool {
        self.subs.remove(channel).is_some()
    }

    /// Record a publication offset. Only recoverable channels track
    /// positions, zero is ignored, and the offset never moves backwards.
    pub(crate) fn advance(&mut self, channel: &str, offset: u64) {
        if let Some(sub) = self.subs.get_mut(channel).filter(|sub| sub.recoverable) {
            sub.offset = sub.offset.max(offset);
        }
    }

    #[cfg(test)]
    pub(crate) fn position(&self, channel: &str) -> Option<crate::protocol::StreamPosition> {
        self.subs.get(channel).map(|sub| crate::protocol::StreamPosition {
            offset: sub.offset,
            epoch: sub.epoch.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Publication;

    fn result(offset: u64, epoch: &str) -> SubscribeResult {
        SubscribeResult {
            recoverable: true,
            offset,
            epoch: epoch.into(),
            ..Default::default()
        }
    }

    #[test]
    fn reconcile_adds_drops_and_flags_resubscribe() {
        let mut tracker = ServerSubscriptions::default();
        tracker.reconcile(HashMap::from([
            ("a".to_string(), result(1, "e")),
            ("b".to_string(), result(2, "e")),
        ]));
        assert_eq!(tracker.channels(), vec!["a", "b"]);

        let events = tracker.reconcile(HashMap::from([
            ("b".to_string(), result(3, "e")),
            ("c".to_string(), result(0, "")),
        ]));
        assert_eq!(tracker.channels(), vec!["b", "c"]);
        assert!(!tracker.contains("a"));

        match &events[..] {
            [
                ClientEvent::ServerSubscribed {
                    channel: b,
                    resubscribe: true,
                    ..
                },
                ClientEvent::ServerSubscribed {
                    channel: c,
                    resubscribe: false,
                    ..
                },
            ] => {
                assert_eq!(b, "b");
                assert_eq!(c, "c");
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn reconcile_replays_publications_in_offset_order() {
        let mut tracker = ServerSubscriptions::default();
        let mut res = result(9, "e");
        res.recovered = true;
        res.publications = vec![
            Publication {
                offset: 9,
                ..Default::default()
            },
            Publication {
                offset: 8,
                ..Default::default()
            },
        ];
        let events = tracker.reconcile(HashMap::from([("news".to_string(), res)]));
        let offsets: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ClientEvent::ServerPublication { publication, .. } => Some(publication.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![8, 9]);
        assert!(matches!(
            events[0],
            ClientEvent::ServerSubscribed {
                recovered: true,
                ..
            }
        ));
    }

    #[test]
    fn advance_ignores_zero_regressions_and_non_recoverable() {
        let mut tracker = ServerSubscriptions::default();
        tracker.subscribe(
            "r",
            &ServerSubscribe {
                recoverable: true,
                offset: 5,
                epoch: "e".into(),
                ..Default::default()
            },
        );
        tracker.subscribe("n", &ServerSubscribe::default());

        tracker.advance("r", 0);
        tracker.advance("r", 3);
        assert_eq!(tracker.position("r").unwrap().offset, 5);
        tracker.advance("r", 6);
        assert_eq!(tracker.position("r").unwrap().offset, 6);

        tracker.advance("n", 10);
        assert_eq!(tracker.position("n").unwrap().offset, 0);
    }

    #[test]
    fn recovery_requests_cover_every_tracked_channel() {
        let mut tracker = ServerSubscriptions::default();
        tracker.reconcile(HashMap::from([
            ("a".to_string(), result(4, "x")),
            ("b".to_string(), result(0, "y")),
            (
                "c".to_string(),
                SubscribeResult {
                    recoverable: false,
                    offset: 7,
                    ..Default::default()
                },
            ),
        ]));
        let requests = tracker.recovery_requests();
        assert_eq!(requests.len(), 3);
        let a = &requests["a"];
        assert!(a.recover);
        assert_eq!((a.offset, a.epoch.as_str()), (4, "x"));
        let b = &requests["b"];
        assert!(!b.recover);
        let c = &requests["c"];
        assert!(!c.recover);
        assert_eq!(c.offset, 0);
    }

    #[test]
    fn remove_reports_presence() {
        let mut tracker = ServerSubscriptions::default();
        tracker.subscribe("a", &ServerSubscribe::default());
        assert!(tracker.remove("a"));
        assert!(!tracker.remove("a"));
    }
}
