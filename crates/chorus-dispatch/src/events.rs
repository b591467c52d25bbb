//! Dispatch event system for observability.
//!
//! Emits [`DispatchEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! observers (loggers, progress displays, tests) can follow a batch without
//! coupling to the dispatcher internals.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one provider task within a batch.
///
/// `Persisted` and `Errored` are terminal. `Errored` is reachable from any of
/// the first three states and is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    RequestBuilt,
    Called,
    Extracted,
    Persisted,
    Errored,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Persisted | InvocationState::Errored)
    }
}

/// Events emitted while a batch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DispatchEvent {
    BatchStarted {
        batch_id: Uuid,
        providers: Vec<String>,
    },
    StateChanged {
        batch_id: Uuid,
        provider: String,
        state: InvocationState,
    },
    SinkFailed {
        batch_id: Uuid,
        provider: String,
        error: String,
    },
    BatchCompleted {
        batch_id: Uuid,
        outcomes: usize,
        failures: usize,
        duration_ms: u64,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<DispatchEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to all current subscribers; dropped when there are none.
    pub fn emit(&self, event: DispatchEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let batch_id = Uuid::new_v4();

        emitter.emit(DispatchEvent::StateChanged {
            batch_id,
            provider: "gpt-4o".into(),
            state: InvocationState::Called,
        });

        match rx.recv().await.unwrap() {
            DispatchEvent::StateChanged {
                batch_id: id,
                provider,
                state,
            } => {
                assert_eq!(id, batch_id);
                assert_eq!(provider, "gpt-4o");
                assert_eq!(state, InvocationState::Called);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_is_noop() {
        let emitter = EventEmitter::default();
        emitter.emit(DispatchEvent::BatchCompleted {
            batch_id: Uuid::new_v4(),
            outcomes: 0,
            failures: 0,
            duration_ms: 0,
        });
    }

    #[test]
    fn terminal_states() {
        assert!(InvocationState::Persisted.is_terminal());
        assert!(InvocationState::Errored.is_terminal());
        assert!(!InvocationState::Extracted.is_terminal());
        assert_eq!(
            serde_json::to_string(&InvocationState::RequestBuilt).unwrap(),
            "\"request_built\""
        );
    }
}
