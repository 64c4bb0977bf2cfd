//! Supervisor loop.

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};

use tether_core::{Layer, LayerEvent};

use super::{actions, AgentContext, EventSet};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// Credential acquisition spent its attempt budget for this boot.
    #[error("credential acquisition failed {attempts} times; giving up for this boot")]
    CredentialsExhausted { attempts: u32 },
}

/// Starts one action per `Down` layer whose prerequisites are `Up`.
///
/// Woken by every state change; never polls. Dropping the future returned by
/// [`Orchestrator::run`] aborts every action in flight.
pub struct Orchestrator {
    ctx: Arc<AgentContext>,
    events: EventSet,
}

impl Orchestrator {
    pub fn new(ctx: Arc<AgentContext>, events: EventSet) -> Self {
        Self { ctx, events }
    }

    /// Drive the layers until credential acquisition is exhausted.
    pub async fn run(&self) -> Result<(), OrchestratorError> {
        let mut rx = self.events.subscribe();
        let mut actions = JoinSet::new();

        loop {
            let state = rx.borrow_and_update().clone();
            if state.credentials_exhausted() {
                tracing::error!(
                    attempts = state.credential_attempts,
                    "Credential acquisition exhausted"
                );
                return Err(OrchestratorError::CredentialsExhausted {
                    attempts: state.credential_attempts,
                });
            }

            for layer in state.actionable() {
                // Acquiring is applied atomically; a second wake that sees the
                // same Down layer cannot start a duplicate.
                if self.events.post(LayerEvent::Acquiring(layer)) {
                    tracing::debug!(layer = %layer, "Starting acquisition");
                    actions.spawn(supervise(layer, Arc::clone(&self.ctx), self.events.clone()));
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                Some(joined) = actions.join_next(), if !actions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Action wrapper failed");
                    }
                }
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one action, converting a panic into a failed attempt.
async fn supervise(layer: Layer, ctx: Arc<AgentContext>, events: EventSet) {
    let mut action = AbortOnDrop(tokio::spawn(actions::run(layer, ctx, events.clone())));
    if let Err(e) = (&mut action.0).await {
        if e.is_panic() {
            tracing::error!(layer = %layer, "Acquisition action panicked");
            events.post(LayerEvent::AttemptFailed(layer));
            events.post(LayerEvent::Lost(layer));
        }
    }
}
