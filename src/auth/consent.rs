// Pairs pending consent flows with the authorization code from the callback

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Outcome delivered by the OAuth callback: authorization code or error string
pub type ConsentOutcome = Result<String, String>;

/// Registry of consent flows waiting on the browser redirect
#[derive(Clone, Default)]
pub struct ConsentBroker {
    pending: Arc<DashMap<String, oneshot::Sender<ConsentOutcome>>>,
}

impl ConsentBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new flow under its OAuth `state` value
    pub fn register(&self, state: &str) -> oneshot::Receiver<ConsentOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(state.to_string(), tx);
        rx
    }

    /// Deliver an authorization code; false if the state is unknown
    pub fn complete(&self, state: &str, code: String) -> bool {
        self.deliver(state, Ok(code))
    }

    /// Deliver a consent error (e.g. `access_denied`); false if the state is unknown
    pub fn fail(&self, state: &str, error: String) -> bool {
        self.deliver(state, Err(error))
    }

    /// Forget a flow that gave up waiting
    pub fn cancel(&self, state: &str) {
        self.pending.remove(state);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// States of flows still waiting on a callback
    pub fn pending_states(&self) -> Vec<String> {
        self.pending.iter().map(|entry| entry.key().clone()).collect()
    }

    fn deliver(&self, state: &str, outcome: ConsentOutcome) -> bool {
        match self.pending.remove(state) {
            // The waiter may have timed out between lookup and send
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => {
                tracing::warn!("Consent callback for unknown state: {}", state);
                false
            }
        }
    }
}
