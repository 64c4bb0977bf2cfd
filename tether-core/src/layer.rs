//! Connection layers and the escalation table.
//!
//! Four layers are tracked independently:
//!
//! ```text
//! Link ──────────┐
//!                ├──► Transport ──► Messaging
//! Credentials ───┘
//! ```
//!
//! Each layer moves `Down -> Acquiring -> Up`, falls back `Acquiring -> Down`
//! when an attempt fails and `Up -> Down` on loss. Losing a layer drops every
//! `Up` layer that depends on it. Credentials survive link loss. A layer in
//! `Acquiring` has an action in flight and is never reset by another layer's
//! loss; its action reports the outcome.
//!
//! Credentials alone carry an attempt budget. Exhausting it parks the layer in
//! [`LayerStatus::Exhausted`] for the rest of the boot cycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default number of credential acquisition attempts per boot.
pub const DEFAULT_MAX_CREDENTIAL_ATTEMPTS: u32 = 5;

/// One of the four connectivity stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Network association.
    Link,
    /// Device certificate and private key.
    Credentials,
    /// Mutually authenticated TLS session with the broker.
    Transport,
    /// Messaging protocol session.
    Messaging,
}

impl Layer {
    /// All layers in supervisor evaluation order.
    pub const ALL: [Layer; 4] = [
        Layer::Link,
        Layer::Credentials,
        Layer::Transport,
        Layer::Messaging,
    ];

    /// Layers that must be `Up` before this one can be `Up`.
    pub fn prerequisites(self) -> &'static [Layer] {
        match self {
            Layer::Link | Layer::Credentials => &[],
            Layer::Transport => &[Layer::Link, Layer::Credentials],
            Layer::Messaging => &[Layer::Transport],
        }
    }

    /// Layers that directly depend on this one.
    pub fn dependents(self) -> &'static [Layer] {
        match self {
            Layer::Link | Layer::Credentials => &[Layer::Transport],
            Layer::Transport => &[Layer::Messaging],
            Layer::Messaging => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Link => "link",
            Layer::Credentials => "credentials",
            Layer::Transport => "transport",
            Layer::Messaging => "messaging",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-layer lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    /// Not established and nothing in flight; the supervisor will act.
    #[default]
    Down,
    /// An acquisition action is in flight.
    Acquiring,
    /// Established.
    Up,
    /// Attempt budget spent; not retried this boot.
    Exhausted,
}

impl LayerStatus {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

/// Event posted to the shared event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", content = "layer", rename_all = "snake_case")]
pub enum LayerEvent {
    /// The supervisor started an acquisition action.
    Acquiring(Layer),
    /// An acquisition action succeeded.
    Established(Layer),
    /// An acquisition action failed.
    AttemptFailed(Layer),
    /// A previously established layer was detected as lost.
    Lost(Layer),
}

/// Process-wide connection state owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub link: LayerStatus,
    pub credentials: LayerStatus,
    pub transport: LayerStatus,
    pub messaging: LayerStatus,
    /// Failed credential attempts since the last success.
    pub credential_attempts: u32,
    pub max_credential_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CREDENTIAL_ATTEMPTS)
    }
}

impl ConnectionState {
    /// Cold state: every layer `Down`.
    pub fn new(max_credential_attempts: u32) -> Self {
        Self {
            link: LayerStatus::Down,
            credentials: LayerStatus::Down,
            transport: LayerStatus::Down,
            messaging: LayerStatus::Down,
            credential_attempts: 0,
            max_credential_attempts: max_credential_attempts.max(1),
        }
    }

    pub fn status(&self, layer: Layer) -> LayerStatus {
        match layer {
            Layer::Link => self.link,
            Layer::Credentials => self.credentials,
            Layer::Transport => self.transport,
            Layer::Messaging => self.messaging,
        }
    }

    fn status_mut(&mut self, layer: Layer) -> &mut LayerStatus {
        match layer {
            Layer::Link => &mut self.link,
            Layer::Credentials => &mut self.credentials,
            Layer::Transport => &mut self.transport,
            Layer::Messaging => &mut self.messaging,
        }
    }

    pub fn is_up(&self, layer: Layer) -> bool {
        self.status(layer).is_up()
    }

    pub fn link_up(&self) -> bool {
        self.is_up(Layer::Link)
    }

    pub fn credentials_ready(&self) -> bool {
        self.is_up(Layer::Credentials)
    }

    pub fn secure_transport_up(&self) -> bool {
        self.is_up(Layer::Transport)
    }

    pub fn messaging_up(&self) -> bool {
        self.is_up(Layer::Messaging)
    }

    /// True once credential acquisition has spent its attempt budget.
    pub fn credentials_exhausted(&self) -> bool {
        self.credentials == LayerStatus::Exhausted
    }

    /// Whether every prerequisite of `layer` is `Up`.
    pub fn prerequisites_met(&self, layer: Layer) -> bool {
        layer.prerequisites().iter().all(|p| self.is_up(*p))
    }

    /// Layers that are `Down` and need an acquisition action.
    pub fn needs(&self) -> Vec<Layer> {
        Layer::ALL
            .into_iter()
            .filter(|l| self.status(*l) == LayerStatus::Down)
            .collect()
    }

    /// Layers that are `Down` and whose prerequisites are all `Up`.
    pub fn actionable(&self) -> Vec<Layer> {
        self.needs()
            .into_iter()
            .filter(|l| self.prerequisites_met(*l))
            .collect()
    }

    /// Apply an event. Returns `true` when the state changed.
    ///
    /// Re-applying an event whose effect already holds is a no-op.
    pub fn apply(&mut self, event: LayerEvent) -> bool {
        let before = self.clone();
        match event {
            LayerEvent::Acquiring(layer) => {
                let status = self.status_mut(layer);
                if *status == LayerStatus::Down {
                    *status = LayerStatus::Acquiring;
                }
            }
            LayerEvent::Established(layer) => {
                if self.status(layer) == LayerStatus::Exhausted {
                    return false;
                }
                if self.prerequisites_met(layer) {
                    *self.status_mut(layer) = LayerStatus::Up;
                    if layer == Layer::Credentials {
                        self.credential_attempts = 0;
                    }
                } else if self.status(layer) == LayerStatus::Acquiring {
                    // A prerequisite vanished while the action was in flight.
                    *self.status_mut(layer) = LayerStatus::Down;
                }
            }
            LayerEvent::AttemptFailed(layer) => {
                if self.status(layer) == LayerStatus::Acquiring {
                    if layer == Layer::Credentials {
                        self.credential_attempts = self.credential_attempts.saturating_add(1);
                        let spent = self.credential_attempts >= self.max_credential_attempts;
                        self.credentials = if spent {
                            LayerStatus::Exhausted
                        } else {
                            LayerStatus::Down
                        };
                    } else {
                        *self.status_mut(layer) = LayerStatus::Down;
                    }
                }
            }
            LayerEvent::Lost(layer) => {
                if self.status(layer) == LayerStatus::Up {
                    *self.status_mut(layer) = LayerStatus::Down;
                    self.drop_dependents(layer);
                }
            }
        }
        *self != before
    }

    fn drop_dependents(&mut self, layer: Layer) {
        for dependent in layer.dependents() {
            if self.status(*dependent) == LayerStatus::Up {
                *self.status_mut(*dependent) = LayerStatus::Down;
                self.drop_dependents(*dependent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_up() -> ConnectionState {
        let mut state = ConnectionState::default();
        for layer in Layer::ALL {
            state.apply(LayerEvent::Acquiring(layer));
            state.apply(LayerEvent::Established(layer));
        }
        state
    }

    /// Every status combination reachable for the four layers, respecting
    /// that a layer can only be `Up` when its prerequisites are `Up`.
    fn reachable_states() -> Vec<ConnectionState> {
        let statuses = [LayerStatus::Down, LayerStatus::Acquiring, LayerStatus::Up];
        let mut states = Vec::new();
        for link in statuses {
            for credentials in statuses {
                for transport in statuses {
                    for messaging in statuses {
                        let state = ConnectionState {
                            link,
                            credentials,
                            transport,
                            messaging,
                            ..ConnectionState::default()
                        };
                        let consistent = Layer::ALL
                            .iter()
                            .all(|l| !state.is_up(*l) || state.prerequisites_met(*l));
                        if consistent {
                            states.push(state);
                        }
                    }
                }
            }
        }
        states
    }

    #[test]
    fn cold_state_needs_every_layer() {
        let state = ConnectionState::default();
        assert_eq!(state.needs(), Layer::ALL.to_vec());
    }

    #[test]
    fn actionable_respects_prerequisites() {
        let mut state = ConnectionState::default();
        assert_eq!(state.actionable(), vec![Layer::Link, Layer::Credentials]);

        state.apply(LayerEvent::Acquiring(Layer::Link));
        state.apply(LayerEvent::Established(Layer::Link));
        assert_eq!(state.actionable(), vec![Layer::Credentials]);

        state.apply(LayerEvent::Acquiring(Layer::Credentials));
        state.apply(LayerEvent::Established(Layer::Credentials));
        assert_eq!(state.actionable(), vec![Layer::Transport]);
    }

    #[test]
    fn acquiring_is_not_a_need() {
        let mut state = ConnectionState::default();
        assert!(state.apply(LayerEvent::Acquiring(Layer::Link)));
        assert!(!state.needs().contains(&Layer::Link));
        assert!(!state.apply(LayerEvent::Acquiring(Layer::Link)));
    }

    #[test]
    fn full_bring_up() {
        let state = all_up();
        assert!(state.link_up());
        assert!(state.credentials_ready());
        assert!(state.secure_transport_up());
        assert!(state.messaging_up());
        assert!(state.needs().is_empty());
    }

    #[test]
    fn link_loss_keeps_credentials_for_all_reachable_states() {
        for mut state in reachable_states() {
            let credentials_before = state.credentials;
            state.apply(LayerEvent::Lost(Layer::Link));

            assert!(!state.link_up());
            assert!(!state.secure_transport_up(), "{state:?}");
            assert!(!state.messaging_up(), "{state:?}");
            assert_eq!(state.credentials, credentials_before);
        }
    }

    #[test]
    fn transport_loss_drops_messaging_only() {
        let mut state = all_up();
        assert!(state.apply(LayerEvent::Lost(Layer::Transport)));

        assert_eq!(state.transport, LayerStatus::Down);
        assert_eq!(state.messaging, LayerStatus::Down);
        assert!(state.credentials_ready());
        assert!(state.link_up());
        assert_eq!(state.needs(), vec![Layer::Transport, Layer::Messaging]);
    }

    #[test]
    fn messaging_loss_is_isolated() {
        let mut state = all_up();
        state.apply(LayerEvent::Lost(Layer::Messaging));

        assert_eq!(state.needs(), vec![Layer::Messaging]);
        assert!(state.secure_transport_up());
    }

    #[test]
    fn loss_does_not_reset_in_flight_dependents() {
        let mut state = all_up();
        state.apply(LayerEvent::Lost(Layer::Messaging));
        state.apply(LayerEvent::Acquiring(Layer::Messaging));

        state.apply(LayerEvent::Lost(Layer::Transport));
        assert_eq!(state.messaging, LayerStatus::Acquiring);

        // The in-flight action reports failure and the layer returns to Down.
        state.apply(LayerEvent::AttemptFailed(Layer::Messaging));
        assert_eq!(state.messaging, LayerStatus::Down);
    }

    #[test]
    fn stale_establish_returns_to_down() {
        let mut state = all_up();
        state.apply(LayerEvent::Lost(Layer::Transport));
        state.apply(LayerEvent::Acquiring(Layer::Transport));
        state.apply(LayerEvent::Lost(Layer::Link));

        // Handshake completed after the link dropped.
        state.apply(LayerEvent::Established(Layer::Transport));
        assert_eq!(state.transport, LayerStatus::Down);
    }

    #[test]
    fn established_is_idempotent() {
        let mut state = all_up();
        assert!(!state.apply(LayerEvent::Established(Layer::Transport)));
        assert!(!state.apply(LayerEvent::Acquiring(Layer::Link)));
        assert_eq!(state, all_up());
    }

    #[test]
    fn lost_on_down_layer_is_noop() {
        let mut state = ConnectionState::default();
        assert!(!state.apply(LayerEvent::Lost(Layer::Transport)));
    }

    #[test]
    fn credential_attempts_are_bounded() {
        let mut state = ConnectionState::new(3);
        for attempt in 1..=3 {
            state.apply(LayerEvent::Acquiring(Layer::Credentials));
            state.apply(LayerEvent::AttemptFailed(Layer::Credentials));
            assert_eq!(state.credential_attempts, attempt);
        }

        assert!(state.credentials_exhausted());
        assert!(!state.needs().contains(&Layer::Credentials));
        assert!(!state.apply(LayerEvent::Acquiring(Layer::Credentials)));
        assert!(!state.apply(LayerEvent::Established(Layer::Credentials)));
    }

    #[test]
    fn credential_success_resets_attempts() {
        let mut state = ConnectionState::new(3);
        state.apply(LayerEvent::Acquiring(Layer::Credentials));
        state.apply(LayerEvent::AttemptFailed(Layer::Credentials));
        state.apply(LayerEvent::Acquiring(Layer::Credentials));
        state.apply(LayerEvent::Established(Layer::Credentials));

        assert_eq!(state.credential_attempts, 0);
        assert!(state.credentials_ready());
    }

    #[test]
    fn other_layers_retry_without_bound() {
        let mut state = ConnectionState::new(1);
        for _ in 0..100 {
            state.apply(LayerEvent::Acquiring(Layer::Link));
            state.apply(LayerEvent::AttemptFailed(Layer::Link));
        }
        assert_eq!(state.link, LayerStatus::Down);
        assert!(state.needs().contains(&Layer::Link));
    }

    #[test]
    fn zero_budget_is_clamped_to_one_attempt() {
        let state = ConnectionState::new(0);
        assert_eq!(state.max_credential_attempts, 1);
    }

    #[test]
    fn event_serialization_is_tagged() {
        let json = serde_json::to_string(&LayerEvent::Lost(Layer::Transport)).unwrap();
        assert_eq!(json, r#"{"event":"lost","layer":"transport"}"#);
    }
}
