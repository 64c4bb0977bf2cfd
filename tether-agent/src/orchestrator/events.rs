//! Shared event set.
//!
//! The only channel between tasks. Every transition goes through
//! [`ConnectionState::apply`] under the watch channel's lock, so concurrent
//! posters never interleave partial updates. Waiters are woken only when a
//! post actually changed the state.

use std::sync::Arc;

use tokio::sync::watch;

use tether_core::{ConnectionState, Layer, LayerEvent};

#[derive(Debug, Clone)]
pub struct EventSet {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl EventSet {
    pub fn new(max_credential_attempts: u32) -> Self {
        let (tx, _) = watch::channel(ConnectionState::new(max_credential_attempts));
        Self { tx: Arc::new(tx) }
    }

    /// Apply `event`. Returns `true` when the state changed.
    pub fn post(&self, event: LayerEvent) -> bool {
        let changed = self.tx.send_if_modified(|state| state.apply(event));
        if changed {
            tracing::debug!(event = ?event, "Layer event applied");
        } else {
            tracing::trace!(event = ?event, "Layer event had no effect");
        }
        changed
    }

    /// Post `Established(layer)`. Returns `true` only when the layer is `Up`
    /// afterwards; a stale establish leaves it `Down` and the caller must
    /// release what it acquired.
    pub fn establish(&self, layer: Layer) -> bool {
        let event = LayerEvent::Established(layer);
        let mut up = false;
        let changed = self.tx.send_if_modified(|state| {
            let changed = state.apply(event);
            up = state.is_up(layer);
            changed
        });
        if up {
            tracing::debug!(layer = %layer, "Layer established");
        } else if changed {
            tracing::debug!(layer = %layer, "Stale establish, layer back to Down");
        }
        up
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until `pred` holds. No timeout.
    pub async fn wait_for<F>(&self, mut pred: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let reached = rx.wait_for(|state| pred(state)).await.map(|state| state.clone());
        match reached {
            Ok(state) => state,
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => std::future::pending().await,
        }
    }
}
