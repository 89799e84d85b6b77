//! Pause/resume policy for clients driven by an application lifecycle.
//!
//! [`PausableClient`] wraps a [`Client`] and disconnects it when the
//! application goes inactive, without reporting that as a disconnect.
//! Subscriptions stay registered and resubscribe on the next connect.

use tokio::sync::{mpsc, watch};

use crate::client::Client;
use crate::types::{ClientEvent, ClientState, Events};

const PAUSE_CALLED: &str = "pause called";
const DISCONNECT_CALLED: &str = "disconnect called";

/// Policy state layered over the session state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PauseState {
    Alive,
    Disconnecting,
    #[default]
    Disconnected,
    /// Paused; the next active signal decides how to restore.
    PausedAwaitingRestore,
    /// Paused; reconnect as soon as the session finishes disconnecting.
    PausedAutoRestore,
    /// The owner asked to disconnect while paused.
    PauseDisconnectCalled,
}

impl PauseState {
    fn is_paused(self) -> bool {
        matches!(
            self,
            PauseState::PausedAwaitingRestore | PauseState::PausedAutoRestore
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Connect,
    Disconnect,
    ResetReconnect,
    Inactive,
    Active,
    /// The wrapped client reported a disconnect.
    SessionDisconnected { reconnect: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Connect,
    Disconnect,
    ResetReconnect,
    /// Pass the triggering client event through.
    Forward,
    EmitConnecting,
    EmitDisconnected,
}

/// Next policy state and the actions to run, given the current session state.
pub(crate) fn transition(
    state: PauseState,
    signal: Signal,
    session: ClientState,
) -> (PauseState, &'static [Action]) {
    use PauseState::*;

    let session_down = session == ClientState::Disconnected;
    match signal {
        Signal::Connect => match state {
            Disconnected => (Alive, &[Action::Connect]),
            s if s.is_paused() => transition(s, Signal::Active, session),
            s => (s, &[]),
        },

        Signal::Disconnect => match state {
            _ if session_down => (Disconnected, &[Action::EmitDisconnected]),
            Disconnecting | PauseDisconnectCalled => (state, &[]),
            s if s.is_paused() => (PauseDisconnectCalled, &[Action::Disconnect]),
            _ => (Disconnecting, &[Action::Disconnect]),
        },

        Signal::ResetReconnect => match state {
            Alive => (Alive, &[Action::ResetReconnect]),
            s => (s, &[]),
        },

        Signal::Inactive => match state {
            Alive => (PausedAwaitingRestore, &[Action::Disconnect]),
            s => (s, &[]),
        },

        Signal::Active => match state {
            s if s.is_paused() && session_down => (Alive, &[Action::Connect]),
            s if s.is_paused() => (PausedAutoRestore, &[]),
            PauseDisconnectCalled if session_down => (Disconnected, &[Action::EmitDisconnected]),
            s => (s, &[]),
        },

        Signal::SessionDisconnected { reconnect } => match state {
            PausedAutoRestore => (Alive, &[Action::EmitConnecting, Action::Connect]),
            PausedAwaitingRestore => (PausedAwaitingRestore, &[Action::EmitConnecting]),
            Alive if reconnect => (Alive, &[Action::Forward]),
            _ => (Disconnected, &[Action::Forward]),
        },
    }
}

/// A [`Client`] that can be paused on application lifecycle signals.
#[derive(Debug)]
pub struct PausableClient {
    client: Client,
    signals: mpsc::UnboundedSender<Signal>,
    state: watch::Receiver<PauseState>,
}

impl PausableClient {
    /// Wrap `client`, taking over its event stream. Returns the filtered
    /// stream the owner should read instead.
    pub fn new(client: Client, events: Events<ClientEvent>) -> (Self, Events<ClientEvent>) {
        let (signals, signals_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PauseState::default());
        let (out, filtered) = Events::channel();
        let policy = Policy {
            client: client.clone(),
            state: state_tx,
            out,
        };
        tokio::spawn(policy.run(signals_rx, events));
        (
            Self {
                client,
                signals,
                state,
            },
            filtered,
        )
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn state(&self) -> ClientState {
        self.client.state()
    }

    pub fn pause_state(&self) -> PauseState {
        *self.state.borrow()
    }

    pub fn connect(&self) {
        self.signal(Signal::Connect);
    }

    pub fn disconnect(&self) {
        self.signal(Signal::Disconnect);
    }

    pub fn reset_reconnect_state(&self) {
        self.signal(Signal::ResetReconnect);
    }

    /// The application moved to the background.
    pub fn on_inactive(&self) {
        self.signal(Signal::Inactive);
    }

    /// The application returned to the foreground.
    pub fn on_active(&self) {
        self.signal(Signal::Active);
    }

    fn signal(&self, signal: Signal) {
        if self.signals.send(signal).is_err() {
            tracing::debug!(?signal, "pause policy task has exited");
        }
    }
}

struct Policy {
    client: Client,
    state: watch::Sender<PauseState>,
    out: mpsc::UnboundedSender<ClientEvent>,
}

impl Policy {
    async fn run(self, mut signals: mpsc::UnboundedReceiver<Signal>, mut events: Events<ClientEvent>) {
        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(signal) => self.apply(signal, None),
                    None => break,
                },
                event = events.next() => match event {
                    Some(event) => {
                        if let ClientEvent::Disconnected { reconnect, .. } = &event {
                            let signal = Signal::SessionDisconnected { reconnect: *reconnect };
                            self.apply(signal, Some(event));
                        } else {
                            self.emit(event);
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("pause policy stopped");
    }

    fn apply(&self, signal: Signal, mut event: Option<ClientEvent>) {
        let current = *self.state.borrow();
        let (next, actions) = transition(current, signal, self.client.state());
        if next != current {
            tracing::debug!(?signal, from = ?current, to = ?next, "pause state changed");
            self.state.send_replace(next);
        }
        for action in actions {
            match action {
                Action::Connect => self.client.connect(),
                Action::Disconnect => self.client.disconnect(),
                Action::ResetReconnect => self.client.reset_reconnect_state(),
                Action::Forward => {
                    if let Some(event) = event.take() {
                        self.emit(event);
                    }
                }
                Action::EmitConnecting => self.emit(ClientEvent::Connecting {
                    code: 0,
                    reason: PAUSE_CALLED.to_string(),
                }),
                Action::EmitDisconnected => self.emit(ClientEvent::Disconnected {
                    code: 0,
                    reason: DISCONNECT_CALLED.to_string(),
                    reconnect: false,
                }),
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        if self.out.send(event).is_err() {
            tracing::trace!("pausable client event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientState as S;
    use PauseState::*;

    fn step(state: PauseState, signal: Signal, session: ClientState) -> (PauseState, Vec<Action>) {
        let (next, actions) = transition(state, signal, session);
        (next, actions.to_vec())
    }

    #[test]
    fn connect_only_from_disconnected() {
        assert_eq!(
            step(Disconnected, Signal::Connect, S::Disconnected),
            (Alive, vec![Action::Connect])
        );
        assert_eq!(step(Alive, Signal::Connect, S::Connected), (Alive, vec![]));
        assert_eq!(
            step(Disconnecting, Signal::Connect, S::Connected),
            (Disconnecting, vec![])
        );
    }

    #[test]
    fn inactive_pauses_only_when_alive() {
        assert_eq!(
            step(Alive, Signal::Inactive, S::Connected),
            (PausedAwaitingRestore, vec![Action::Disconnect])
        );
        assert_eq!(
            step(Disconnected, Signal::Inactive, S::Disconnected),
            (Disconnected, vec![])
        );
        assert_eq!(
            step(PausedAutoRestore, Signal::Inactive, S::Connected),
            (PausedAutoRestore, vec![])
        );
    }

    #[test]
    fn pause_suppresses_disconnect_notification() {
        assert_eq!(
            step(
                PausedAwaitingRestore,
                Signal::SessionDisconnected { reconnect: false },
                S::Disconnected
            ),
            (PausedAwaitingRestore, vec![Action::EmitConnecting])
        );
    }

    #[test]
    fn active_while_still_disconnecting_restores_automatically() {
        let (state, actions) = step(PausedAwaitingRestore, Signal::Active, S::Connected);
        assert_eq!((state, actions), (PausedAutoRestore, vec![]));
        assert_eq!(
            step(
                state,
                Signal::SessionDisconnected { reconnect: false },
                S::Disconnected
            ),
            (Alive, vec![Action::EmitConnecting, Action::Connect])
        );
    }

    #[test]
    fn active_after_session_dropped_reconnects() {
        assert_eq!(
            step(PausedAwaitingRestore, Signal::Active, S::Disconnected),
            (Alive, vec![Action::Connect])
        );
        assert_eq!(
            step(PausedAutoRestore, Signal::Active, S::Disconnected),
            (Alive, vec![Action::Connect])
        );
    }

    #[test]
    fn disconnect_while_paused() {
        assert_eq!(
            step(PausedAwaitingRestore, Signal::Disconnect, S::Connected),
            (PauseDisconnectCalled, vec![Action::Disconnect])
        );
        assert_eq!(
            step(PausedAwaitingRestore, Signal::Disconnect, S::Disconnected),
            (Disconnected, vec![Action::EmitDisconnected])
        );
        assert_eq!(
            step(PauseDisconnectCalled, Signal::Disconnect, S::Connected),
            (PauseDisconnectCalled, vec![])
        );
        assert_eq!(
            step(
                PauseDisconnectCalled,
                Signal::SessionDisconnected { reconnect: false },
                S::Disconnected
            ),
            (Disconnected, vec![Action::Forward])
        );
        assert_eq!(
            step(PauseDisconnectCalled, Signal::Active, S::Disconnected),
            (Disconnected, vec![Action::EmitDisconnected])
        );
    }

    #[test]
    fn common_disconnects_are_forwarded() {
        assert_eq!(
            step(Alive, Signal::Disconnect, S::Connected),
            (Disconnecting, vec![Action::Disconnect])
        );
        assert_eq!(
            step(
                Disconnecting,
                Signal::SessionDisconnected { reconnect: false },
                S::Disconnected
            ),
            (Disconnected, vec![Action::Forward])
        );
        assert_eq!(
            step(
                Alive,
                Signal::SessionDisconnected { reconnect: true },
                S::Connecting
            ),
            (Alive, vec![Action::Forward])
        );
        assert_eq!(
            step(
                Alive,
                Signal::SessionDisconnected { reconnect: false },
                S::Disconnected
            ),
            (Disconnected, vec![Action::Forward])
        );
    }

    #[test]
    fn reset_reconnect_only_when_alive() {
        assert_eq!(
            step(Alive, Signal::ResetReconnect, S::Connecting),
            (Alive, vec![Action::ResetReconnect])
        );
        assert_eq!(
            step(PausedAwaitingRestore, Signal::ResetReconnect, S::Disconnected),
            (PausedAwaitingRestore, vec![])
        );
    }
}
